//! Who serves what: responders, the route table, and call routing.

mod observer;
mod responder;
mod router;
mod table;

pub use observer::{BalancerInvalidator, CompositeRouteObserver, RouteChange, RouteObserver};
pub use responder::{ResponderHandle, ServiceResponder};
pub use router::{Router, MIME_RELAY};
pub use table::RouteTable;
