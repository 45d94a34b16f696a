//! HMUX Common Types and Transport
//!
//! Protocol definitions and the TCP transport layer shared by the HMUX
//! connector crates.
//!
//! # Overview
//!
//! HMUX is the compact binary channel protocol spoken between a
//! load-balancing front end and its application-server backends. This crate
//! holds everything both sides of that conversation need:
//!
//! - **Protocol Layer**: opcode table, frames, request attributes, responses
//!   and the error taxonomy
//! - **Transport Layer**: the buffered wire codec, TCP connect helper and a
//!   backend-side server
//!
//! # Wire Format
//!
//! - **Frame**: `[1-byte opcode]`, then a 2-byte big-endian length and that
//!   many payload bytes for attribute and most control codes
//! - **Bare codes**: yield, quit and exit carry nothing
//! - **Channel open**: `C` followed by a 2-byte channel id
//!
//! # Example
//!
//! ```
//! use hmux_common::{Opcode, RequestAttributes};
//!
//! let request = RequestAttributes::new("GET", "/index.jsp")
//!     .with_header("Host", "example.com");
//!
//! let frames = request.to_frames();
//! assert_eq!(frames[0].opcode, Opcode::Uri);
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
