//! Length-prefixed message transport over paired byte streams.
//!
//! Every message is framed with an 8-byte little-endian payload length.
//! A [`Connection`] owns one inbound and one outbound stream (typically the
//! stdin/stdout pipe pair linking a parent and a spawned worker) behind
//! independent send and receive locks, so framing is safe to drive from
//! multiple threads.
//!
//! No partial reads, no buffer management in user code.

pub mod codec;
pub mod connection;
pub mod error;

pub use codec::{decode_header, encode_frame, FrameConfig, HEADER_SIZE};
pub use connection::Connection;
pub use error::{FrameError, Result};
