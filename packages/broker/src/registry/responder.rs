use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use meshrpc_core::{AppMetadata, AppStatus, ServiceLocator};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::transport::Connection;

/// How calls reach a responder.
#[derive(Clone)]
pub enum ResponderHandle {
    /// Connected to this broker.
    Direct(Arc<dyn Connection>),
    /// Connected to another broker; calls are relayed through it.
    Peer { broker_uri: String },
}

impl fmt::Debug for ResponderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(conn) => f
                .debug_struct("Direct")
                .field("connection_id", &conn.id())
                .field("uri", &conn.uri())
                .finish(),
            Self::Peer { broker_uri } => f
                .debug_struct("Peer")
                .field("broker_uri", broker_uri)
                .finish(),
        }
    }
}

/// One connected provider and the services it currently exposes.
pub struct ServiceResponder {
    app: AppMetadata,
    connection_id: u64,
    handle: ResponderHandle,
    status: AtomicU8,
    services: RwLock<HashSet<ServiceLocator>>,
}

impl ServiceResponder {
    /// A provider connected to this broker, in `CONNECTED` state.
    #[must_use]
    pub fn direct(app: AppMetadata, connection: Arc<dyn Connection>) -> Self {
        Self {
            app,
            connection_id: connection.id(),
            handle: ResponderHandle::Direct(connection),
            status: AtomicU8::new(AppStatus::Connected as u8),
            services: RwLock::new(HashSet::new()),
        }
    }

    /// A provider known through another broker, in `CONNECTED` state.
    #[must_use]
    pub fn remote(app: AppMetadata, broker_uri: impl Into<String>) -> Self {
        Self {
            app,
            connection_id: 0,
            handle: ResponderHandle::Peer {
                broker_uri: broker_uri.into(),
            },
            status: AtomicU8::new(AppStatus::Connected as u8),
            services: RwLock::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.app.instance_id
    }

    #[must_use]
    pub fn app(&self) -> &AppMetadata {
        &self.app
    }

    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.app.name
    }

    /// Session-scoped connection id; `0` for remote responders.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    #[must_use]
    pub fn handle(&self) -> &ResponderHandle {
        &self.handle
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self.handle, ResponderHandle::Peer { .. })
    }

    #[must_use]
    pub fn status(&self) -> AppStatus {
        AppStatus::from_u8(self.status.load(Ordering::Acquire)).unwrap_or(AppStatus::Stopped)
    }

    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.status() == AppStatus::Serving
    }

    /// Stores `status` and returns the previous one.
    pub(crate) fn swap_status(&self, status: AppStatus) -> AppStatus {
        AppStatus::from_u8(self.status.swap(status as u8, Ordering::AcqRel))
            .unwrap_or(AppStatus::Stopped)
    }

    #[must_use]
    pub fn exposes(&self, locator: &ServiceLocator) -> bool {
        self.services.read().contains(locator)
    }

    #[must_use]
    pub fn services(&self) -> Vec<ServiceLocator> {
        self.services.read().iter().cloned().collect()
    }

    /// Adds locators; returns those that were not yet exposed.
    pub(crate) fn add_services(&self, locators: &[ServiceLocator]) -> Vec<ServiceLocator> {
        let mut services = self.services.write();
        locators
            .iter()
            .filter(|l| services.insert((*l).clone()))
            .cloned()
            .collect()
    }

    /// Removes locators (all of them when `locators` is empty); returns those
    /// actually removed.
    pub(crate) fn remove_services(&self, locators: &[ServiceLocator]) -> Vec<ServiceLocator> {
        let mut services = self.services.write();
        if locators.is_empty() {
            return services.drain().collect();
        }
        locators
            .iter()
            .filter(|l| services.remove(*l))
            .cloned()
            .collect()
    }
}

impl fmt::Debug for ServiceResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceResponder")
            .field("instance_id", &self.app.instance_id)
            .field("app", &self.app.name)
            .field("status", &self.status())
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
