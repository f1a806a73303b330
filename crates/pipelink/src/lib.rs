//! Point-to-point messaging and RPC between two processes linked by a
//! pair of unidirectional byte streams, typically the stdin/stdout pipes
//! of a spawned worker.
//!
//! # Crate Structure
//!
//! - [`frame`] — Length-prefixed framed transport over a supplied stream
//!   pair, with a structured-value codec on top
//! - [`rpc`] — Fire-and-forget and request/response RPC with remote
//!   failure propagation, built on the framed transport

/// Re-export frame types.
pub mod frame {
    pub use pipelink_frame::*;
}

/// Re-export rpc types.
pub mod rpc {
    pub use pipelink_rpc::*;
}
