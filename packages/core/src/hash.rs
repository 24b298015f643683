//! MurmurHash3 (x86, 32-bit) utilities for routing keys.
//!
//! Providers register under, and consumers look up by, the same 32-bit
//! routing hash. Both sides must embed this exact function: any divergence
//! silently splits the route table into unreachable halves.

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// Seed used for every routing hash in the mesh.
pub const ROUTING_SEED: u32 = 0;

/// Computes the 32-bit x86 variant of MurmurHash3 over `data`.
///
/// # Examples
///
/// ```
/// use meshrpc_core::hash::murmur3_32;
///
/// assert_eq!(murmur3_32(b"", 0), 0);
/// assert_eq!(murmur3_32(b"hello", 0), 613_153_351);
/// ```
#[must_use]
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();

    for chunk in chunks {
        let k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h ^= scramble(k);
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k ^= u32::from(*byte) << (8 * i);
        }
        h ^= scramble(k);
    }

    #[allow(clippy::cast_possible_truncation)]
    let len = data.len() as u32;
    fmix32(h ^ len)
}

/// Case-insensitive routing hash of a string key.
///
/// The key is lowercased before hashing so `"G!Calc:1"` and `"g!calc:1"`
/// route to the same providers.
#[must_use]
pub fn routing_hash(key: &str) -> u32 {
    murmur3_32(key.to_lowercase().as_bytes(), ROUTING_SEED)
}

#[inline]
fn scramble(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

#[inline]
fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
