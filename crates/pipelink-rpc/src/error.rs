use pipelink_frame::FrameError;

/// Error type handlers may return; converted to trace text when it has to
/// cross the wire.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in the RPC engine.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Transport-level error.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The dispatch loop was started twice, or restarted after it finished.
    /// Usage error; one loop per endpoint instance.
    #[error("dispatch loop was already started on this endpoint")]
    LoopAlreadyStarted,

    /// A func call was issued before the local dispatch loop was running.
    /// Usage error; the reply can only be delivered by that loop.
    #[error("dispatch loop is not running (func replies are delivered by the local loop)")]
    LoopNotRunning,

    /// A handler is already registered under this key.
    #[error("handler already registered under key '{0}'")]
    DuplicateKey(String),

    /// An incoming call named a key with no registered handler.
    #[error("no call handler registered under key '{0}'")]
    UnknownKey(String),

    /// A call handler failed while error propagation was configured.
    #[error("call handler '{key}' failed")]
    Handler {
        key: String,
        #[source]
        source: HandlerError,
    },

    /// The remote func handler failed; `trace` is the remote failure text.
    #[error("remote func call failed:\n{trace}")]
    Remote { trace: String },

    /// The response slot was torn down before a value arrived.
    #[error("response slot closed before a value was delivered")]
    SlotClosed,

    /// The dispatch thread could not be spawned.
    #[error("failed to spawn dispatch thread: {0}")]
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, RpcError>;
