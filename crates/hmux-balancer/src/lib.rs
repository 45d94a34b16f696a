//! HMUX Load Balancer
//!
//! Spreads requests over a set of HMUX backends with a pluggable
//! [`SelectionPolicy`], failing over when a backend is exhausted or down.
//! Backup backends take traffic only when no primary can.

pub mod load_balancer;
pub mod policy;
pub mod session;

pub use load_balancer::LoadBalancer;
pub use policy::{HashAffinity, RoundRobin, SelectionPolicy, SessionIndex, SingleBackend};
pub use session::{session_id, DEFAULT_SESSION_COOKIE, DEFAULT_SESSION_URL_PREFIX};
