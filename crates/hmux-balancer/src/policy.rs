use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::session::decode_session_index;

/// Picks the backend a request starts at.
///
/// `select` returns an index into the balancer's backend list; the balancer
/// walks on from there when the chosen backend cannot take the request.
/// `backend_count` is never zero.
pub trait SelectionPolicy: Send + Sync {
    fn select(&self, hint: Option<&str>, backend_count: usize) -> usize;

    fn name(&self) -> &'static str;
}

/// Always starts at the first backend.
#[derive(Debug, Default)]
pub struct SingleBackend;

impl SelectionPolicy for SingleBackend {
    fn select(&self, _hint: Option<&str>, _backend_count: usize) -> usize {
        0
    }

    fn name(&self) -> &'static str {
        "single"
    }
}

/// Rotates through the backends in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionPolicy for RoundRobin {
    fn select(&self, _hint: Option<&str>, backend_count: usize) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % backend_count
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

/// Sends requests carrying the same hint (a session id, say) to the same
/// backend. Requests without a hint are spread round-robin.
#[derive(Debug, Default)]
pub struct HashAffinity {
    fallback: RoundRobin,
}

impl HashAffinity {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionPolicy for HashAffinity {
    fn select(&self, hint: Option<&str>, backend_count: usize) -> usize {
        match hint {
            Some(hint) => {
                let mut hasher = DefaultHasher::new();
                hint.hash(&mut hasher);
                (hasher.finish() % backend_count as u64) as usize
            }
            None => self.fallback.select(None, backend_count),
        }
    }

    fn name(&self) -> &'static str {
        "hash"
    }
}

/// Routes a session back to the backend that owns it.
///
/// The hint is a session id (see [`session_id`](crate::session::session_id));
/// its first character decodes to the owner's index, taken modulo the
/// backend count. Requests without a session, or with an id that does not
/// decode, are spread round-robin.
#[derive(Debug, Default)]
pub struct SessionIndex {
    fallback: RoundRobin,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionPolicy for SessionIndex {
    fn select(&self, hint: Option<&str>, backend_count: usize) -> usize {
        match hint.and_then(decode_session_index) {
            Some(index) => index % backend_count,
            None => self.fallback.select(None, backend_count),
        }
    }

    fn name(&self) -> &'static str {
        "session"
    }
}
