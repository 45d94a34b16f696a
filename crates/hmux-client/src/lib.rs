//! HMUX Client
//!
//! Pooled connections to HMUX backends and the request relay.
//!
//! # Components
//!
//! - [`Connection`]: one socket to one backend, driving request/response
//!   cycles
//! - [`Backend`]: an endpoint with its idle ring, admission control and
//!   Active/Inactive state
//! - [`relay`]: one full request cycle on a leased connection, with failure
//!   signalling and release on every path

pub mod connection;
pub mod pool;
pub mod relay;

pub use connection::{Connection, BODY_CHUNK_SIZE, DEFAULT_ACK_SIZE};
pub use pool::{Backend, BackendConfig, BackendState, BackendStats, IdleRing, PooledConnection};
pub use relay::relay;

#[cfg(test)]
mod tests;
