use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Positional arguments of a remote invocation.
pub type Args = Vec<Value>;

/// Keyword arguments as ordered name/value pairs.
pub type Kwargs = Vec<(String, Value)>;

/// The logical unit of information exchanged over the transport.
///
/// An explicit tagged union instead of reserved operation keys: the `kind`
/// tag routes dispatch, so application key namespaces cannot collide with
/// the internal request/response machinery. Payloads that do not match one
/// of these shapes are rejected at decode time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// Fire-and-forget invocation; no reply is ever sent.
    Call {
        key: String,
        args: Args,
        kwargs: Kwargs,
    },
    /// Request side of a synchronous func call.
    InvokeFunc {
        key: String,
        args: Args,
        kwargs: Kwargs,
        correlation_id: u64,
    },
    /// Response side of a synchronous func call. `result` is either the
    /// handler's value or the tagged error value.
    FuncResponse { correlation_id: u64, result: Value },
    /// Stop sentinel: the loop reading this direction ceases.
    Stop,
}
