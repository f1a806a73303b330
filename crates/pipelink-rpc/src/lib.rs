//! Remote procedure calls between two processes linked by a framed stream
//! pair.
//!
//! An [`Endpoint`] owns a [`pipelink_frame::Connection`] and runs one
//! dispatch loop that decodes incoming [`Envelope`]s and routes them to
//! registered handlers:
//!
//! - **Fire-and-forget calls** ([`Endpoint::call`]) invoke a remote handler
//!   with no reply.
//! - **Func calls** ([`Endpoint::func`]) block the calling thread until the
//!   correlated response arrives, propagating remote failures as local
//!   errors carrying the remote trace text.
//!
//! Both sides of a link are symmetric: each endpoint may register handlers
//! and invoke the other's.

pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod value;

pub use endpoint::{CallErrorPolicy, CallHandler, Endpoint, FuncHandler, Responder};
pub use envelope::{Args, Envelope, Kwargs};
pub use error::{HandlerError, Result, RpcError};
pub use value::{RemoteFailure, Value};
