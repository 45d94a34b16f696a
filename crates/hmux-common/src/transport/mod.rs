//! HMUX Transport Layer
//!
//! Buffered frame codec and TCP plumbing.
//!
//! # Components
//!
//! - **[`WireCodec`]**: buffered frame writer/reader over any async byte stream
//! - **[`TcpTransport`]**: connect helper with a connect timeout (used by the pool)
//! - **[`HmuxServer`]**: backend-side server decoding channel sessions (used by
//!   tests and the demo CLI backend)

pub mod codec;
pub mod server;
pub mod tcp;

pub use codec::{decode_frame, WireCodec};
pub use server::{HmuxServer, RESPONSE_CHUNK_SIZE};
pub use tcp::TcpTransport;
