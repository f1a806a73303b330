use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use pipelink_frame::{Connection, FrameError};
use tracing::{debug, warn};

use crate::envelope::{Args, Envelope, Kwargs};
use crate::error::{HandlerError, Result, RpcError};
use crate::value::{RemoteFailure, Value};

/// Handler for fire-and-forget calls. Runs inside the dispatch loop; a
/// returned error is logged or propagated per [`CallErrorPolicy`].
pub type CallHandler =
    Arc<dyn Fn(Args, Kwargs) -> std::result::Result<(), HandlerError> + Send + Sync>;

/// Handler for synchronous func calls, callback style. The handler owns
/// when and where it completes the [`Responder`]; the dispatch loop does
/// not wait for it.
pub type FuncHandler = Arc<dyn Fn(Responder, Args, Kwargs) + Send + Sync>;

/// What the dispatch loop does with a failing (or missing) call handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallErrorPolicy {
    /// Log the failure and keep dispatching. One bad handler never kills
    /// the loop.
    #[default]
    Suppress,
    /// Terminate the loop with the handler's error.
    Propagate,
}

#[derive(Default)]
struct LoopState {
    started: bool,
    running: bool,
    finished: bool,
}

/// One end of an RPC link over a framed stream pair.
///
/// Registries are keyed by operation name. The dispatch loop (one per
/// endpoint, started at most once) decodes incoming envelopes and routes
/// them; synchronous func calls block their own thread on a private
/// response slot until the loop delivers the correlated reply.
pub struct Endpoint {
    conn: Arc<Connection>,
    calls: Mutex<HashMap<String, CallHandler>>,
    funcs: Mutex<HashMap<String, FuncHandler>>,
    slots: Mutex<HashMap<u64, SyncSender<Value>>>,
    next_correlation: AtomicU64,
    state: Mutex<LoopState>,
    call_errors: CallErrorPolicy,
}

impl Endpoint {
    /// Wrap a connection. Each transport/endpoint pair is an independent
    /// unit; no shared process-wide state.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(conn),
            calls: Mutex::new(HashMap::new()),
            funcs: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            next_correlation: AtomicU64::new(1),
            state: Mutex::new(LoopState::default()),
            call_errors: CallErrorPolicy::default(),
        }
    }

    /// Override the policy for failing call handlers.
    pub fn with_call_error_policy(mut self, policy: CallErrorPolicy) -> Self {
        self.call_errors = policy;
        self
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Whether the dispatch loop is currently running.
    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Register a fire-and-forget handler under `key`.
    pub fn set_call<F>(&self, key: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Args, Kwargs) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        insert_handler(&self.calls, key.into(), Arc::new(handler))
    }

    /// Remove a fire-and-forget handler. Returns whether one was registered.
    pub fn remove_call(&self, key: &str) -> bool {
        lock(&self.calls).remove(key).is_some()
    }

    /// Register a callback-style func handler under `key`.
    ///
    /// The handler must complete the [`Responder`] exactly once, from any
    /// thread, synchronously or later. Move semantics enforce "at most
    /// once"; completing it is the handler's responsibility.
    pub fn set_func<F>(&self, key: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Responder, Args, Kwargs) + Send + Sync + 'static,
    {
        insert_handler(&self.funcs, key.into(), Arc::new(handler))
    }

    /// Register a plain func handler under `key`.
    ///
    /// The handler runs synchronously in the dispatch loop. Its error (or
    /// panic) is converted into the tagged error value, and the responder
    /// is completed exactly once either way.
    pub fn set_func_plain<F>(&self, key: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Args, Kwargs) -> std::result::Result<Value, HandlerError> + Send + Sync + 'static,
    {
        let key = key.into();
        let label = key.clone();
        self.set_func(key, move |responder, args, kwargs| {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(args, kwargs)));
            let completion = match outcome {
                Ok(Ok(value)) => responder.ok(value),
                Ok(Err(err)) => responder.fail(RemoteFailure::from_error(err.as_ref())),
                Err(panic) => responder.err(format!(
                    "func handler '{label}' panicked: {}",
                    panic_message(&*panic)
                )),
            };
            if let Err(err) = completion {
                warn!(key = %label, error = %err, "failed to deliver func response");
            }
        })
    }

    /// Remove a func handler. Returns whether one was registered.
    pub fn remove_func(&self, key: &str) -> bool {
        lock(&self.funcs).remove(key).is_some()
    }

    /// Invoke a remote fire-and-forget operation. Returns once the
    /// envelope is written; no acknowledgement is ever sent.
    pub fn call(&self, key: impl Into<String>, args: Args, kwargs: Kwargs) -> Result<()> {
        self.conn.send_value(&Envelope::Call {
            key: key.into(),
            args,
            kwargs,
        })?;
        Ok(())
    }

    /// Invoke a remote func operation and block until its reply arrives.
    ///
    /// Requires the local dispatch loop to be running, since that loop is
    /// what delivers the reply. A remote failure is raised locally as
    /// [`RpcError::Remote`] carrying the remote trace text.
    ///
    /// There is no timeout: a peer that never completes the call leaves
    /// the calling thread blocked.
    pub fn func(&self, key: impl Into<String>, args: Args, kwargs: Kwargs) -> Result<Value> {
        if !self.is_running() {
            return Err(RpcError::LoopNotRunning);
        }

        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::sync_channel(1);
        lock(&self.slots).insert(correlation_id, tx);

        let sent = self.conn.send_value(&Envelope::InvokeFunc {
            key: key.into(),
            args,
            kwargs,
            correlation_id,
        });
        if let Err(err) = sent {
            lock(&self.slots).remove(&correlation_id);
            return Err(err.into());
        }

        let value = rx.recv().map_err(|_| RpcError::SlotClosed)?;
        lock(&self.slots).remove(&correlation_id);

        match value {
            Value::Error(failure) => Err(RpcError::Remote {
                trace: failure.trace,
            }),
            value => Ok(value),
        }
    }

    /// Send the stop sentinel on the outbound direction.
    ///
    /// Asymmetric by design: this ends the loop reading that direction and
    /// nothing else. Mutual shutdown needs both sides to stop, or one side
    /// to observe end-of-stream.
    pub fn stop(&self) -> Result<()> {
        self.conn.send_value(&Envelope::Stop)?;
        Ok(())
    }

    /// Run the dispatch loop on the current thread until a stop sentinel,
    /// end-of-stream, or an unrecovered dispatch error.
    ///
    /// Callable once per endpoint; a second run fails as a usage error.
    pub fn run(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.running || state.finished {
                return Err(RpcError::LoopAlreadyStarted);
            }
            state.started = true;
            state.running = true;
        }
        debug!("dispatch loop running");

        let result = self.dispatch_loop();

        let mut state = lock(&self.state);
        state.running = false;
        state.finished = true;
        result
    }

    /// Run the dispatch loop on a dedicated thread.
    ///
    /// Fails without performing any I/O if the loop was already started.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        {
            let mut state = lock(&self.state);
            if state.started || state.finished {
                return Err(RpcError::LoopAlreadyStarted);
            }
            state.started = true;
        }

        let endpoint = Arc::clone(self);
        thread::Builder::new()
            .name("pipelink-dispatch".into())
            .spawn(move || endpoint.run())
            .map_err(RpcError::Spawn)
    }

    fn dispatch_loop(&self) -> Result<()> {
        loop {
            let envelope: Envelope = match self.conn.recv_value() {
                Ok(envelope) => envelope,
                Err(FrameError::Eof) | Err(FrameError::Closed) => {
                    debug!("stream ended, dispatch loop exiting");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            match envelope {
                Envelope::Stop => {
                    debug!("stop sentinel received");
                    return Ok(());
                }
                Envelope::Call { key, args, kwargs } => self.dispatch_call(key, args, kwargs)?,
                Envelope::InvokeFunc {
                    key,
                    args,
                    kwargs,
                    correlation_id,
                } => self.dispatch_invoke(key, args, kwargs, correlation_id),
                Envelope::FuncResponse {
                    correlation_id,
                    result,
                } => self.deliver_response(correlation_id, result),
            }
        }
    }

    fn dispatch_call(&self, key: String, args: Args, kwargs: Kwargs) -> Result<()> {
        // Clone the handler out so it runs without the registry lock held.
        let handler = lock(&self.calls).get(&key).cloned();
        let Some(handler) = handler else {
            match self.call_errors {
                CallErrorPolicy::Suppress => {
                    warn!(key = %key, "no call handler registered");
                    return Ok(());
                }
                CallErrorPolicy::Propagate => return Err(RpcError::UnknownKey(key)),
            }
        };

        if let Err(err) = handler(args, kwargs) {
            match self.call_errors {
                CallErrorPolicy::Suppress => {
                    warn!(key = %key, error = %err, "call handler failed")
                }
                CallErrorPolicy::Propagate => return Err(RpcError::Handler { key, source: err }),
            }
        }
        Ok(())
    }

    fn dispatch_invoke(&self, key: String, args: Args, kwargs: Kwargs, correlation_id: u64) {
        let handler = lock(&self.funcs).get(&key).cloned();
        let responder = Responder {
            correlation_id,
            conn: Arc::clone(&self.conn),
        };

        match handler {
            Some(handler) => handler(responder, args, kwargs),
            None => {
                // Completing with an error keeps the remote caller from
                // blocking forever on a key that was never registered.
                warn!(key = %key, correlation_id, "no func handler registered");
                let trace = format!("no func handler registered under key '{key}'");
                if let Err(err) = responder.err(trace) {
                    warn!(key = %key, error = %err, "failed to deliver unknown-func response");
                }
            }
        }
    }

    fn deliver_response(&self, correlation_id: u64, result: Value) {
        let slot = lock(&self.slots).get(&correlation_id).cloned();
        match slot {
            Some(slot) => {
                if slot.try_send(result).is_err() {
                    warn!(correlation_id, "response slot rejected value");
                }
            }
            None => warn!(correlation_id, "func response with no matching slot"),
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("call_errors", &self.call_errors)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Move-once completion handle for a func invocation, bound to its
/// correlation id. Completing it sends the response envelope that unblocks
/// the remote caller.
pub struct Responder {
    correlation_id: u64,
    conn: Arc<Connection>,
}

impl Responder {
    /// Complete with a result value.
    pub fn ok(self, value: Value) -> Result<()> {
        self.finish(value)
    }

    /// Complete with failure trace text.
    pub fn err(self, trace: impl Into<String>) -> Result<()> {
        self.finish(Value::Error(RemoteFailure::new(trace)))
    }

    /// Complete with an already-built failure.
    pub fn fail(self, failure: RemoteFailure) -> Result<()> {
        self.finish(Value::Error(failure))
    }

    /// The correlation id this responder will answer.
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    fn finish(self, result: Value) -> Result<()> {
        self.conn.send_value(&Envelope::FuncResponse {
            correlation_id: self.correlation_id,
            result,
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

fn insert_handler<H>(registry: &Mutex<HashMap<String, H>>, key: String, handler: H) -> Result<()> {
    let mut registry = lock(registry);
    if registry.contains_key(&key) {
        return Err(RpcError::DuplicateKey(key));
    }
    registry.insert(key, handler);
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "opaque panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::io::{empty, sink, Cursor, Write};

    use bytes::BytesMut;
    use pipelink_frame::{encode_frame, HEADER_SIZE};

    use super::*;

    /// Write half that exposes what was written, since the connection
    /// boxes its streams.
    #[derive(Clone, Default)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn wire_of(envelopes: &[Envelope]) -> Vec<u8> {
        let mut wire = BytesMut::new();
        for envelope in envelopes {
            let payload = serde_json::to_vec(envelope).unwrap();
            encode_frame(&payload, &mut wire);
        }
        wire.to_vec()
    }

    fn decode_frames(mut wire: &[u8]) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        while !wire.is_empty() {
            let len = u64::from_le_bytes(wire[..HEADER_SIZE].try_into().unwrap()) as usize;
            envelopes.push(serde_json::from_slice(&wire[HEADER_SIZE..HEADER_SIZE + len]).unwrap());
            wire = &wire[HEADER_SIZE + len..];
        }
        envelopes
    }

    fn endpoint_reading(wire: Vec<u8>) -> (Endpoint, SharedWriter) {
        let out = SharedWriter::default();
        let endpoint = Endpoint::new(Connection::new(Cursor::new(wire), out.clone()));
        (endpoint, out)
    }

    #[test]
    fn run_dispatches_call_then_exits_on_eof() {
        let wire = wire_of(&[Envelope::Call {
            key: "ping".into(),
            args: vec![Value::Int(1), Value::Int(2)],
            kwargs: vec![("who".into(), Value::Str("unit".into()))],
        }]);
        let (endpoint, _) = endpoint_reading(wire);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        endpoint
            .set_call("ping", move |args, kwargs| {
                sink.lock().unwrap().push((args, kwargs));
                Ok(())
            })
            .unwrap();

        endpoint.run().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(seen[0].1[0].0, "who");
    }

    #[test]
    fn run_exits_on_stop_without_dispatching_later_frames() {
        let wire = wire_of(&[
            Envelope::Stop,
            Envelope::Call {
                key: "never".into(),
                args: vec![],
                kwargs: vec![],
            },
        ]);
        let (endpoint, _) = endpoint_reading(wire);

        let hit = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&hit);
        endpoint
            .set_call("never", move |_, _| {
                *flag.lock().unwrap() = true;
                Ok(())
            })
            .unwrap();

        endpoint.run().unwrap();
        assert!(!*hit.lock().unwrap());
    }

    #[test]
    fn loop_runs_at_most_once() {
        let (endpoint, _) = endpoint_reading(Vec::new());
        endpoint.run().unwrap();

        assert!(matches!(
            endpoint.run().unwrap_err(),
            RpcError::LoopAlreadyStarted
        ));
    }

    #[test]
    fn double_start_fails_without_io() {
        let endpoint = Arc::new(Endpoint::new(Connection::new(empty(), sink())));

        let handle = endpoint.start().unwrap();
        assert!(matches!(
            endpoint.start().unwrap_err(),
            RpcError::LoopAlreadyStarted
        ));

        handle.join().unwrap().unwrap();
    }

    #[test]
    fn func_requires_running_loop() {
        let (endpoint, out) = endpoint_reading(Vec::new());

        let err = endpoint.func("sum", vec![], vec![]).unwrap_err();
        assert!(matches!(err, RpcError::LoopNotRunning));
        // Failed fast: nothing hit the wire.
        assert!(out.0.lock().unwrap().is_empty());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (endpoint, _) = endpoint_reading(Vec::new());

        endpoint.set_call("k", |_, _| Ok(())).unwrap();
        assert!(matches!(
            endpoint.set_call("k", |_, _| Ok(())).unwrap_err(),
            RpcError::DuplicateKey(_)
        ));

        assert!(endpoint.remove_call("k"));
        assert!(!endpoint.remove_call("k"));
        endpoint.set_call("k", |_, _| Ok(())).unwrap();
    }

    #[test]
    fn suppressed_handler_error_keeps_loop_alive() {
        let wire = wire_of(&[
            Envelope::Call {
                key: "bad".into(),
                args: vec![],
                kwargs: vec![],
            },
            Envelope::Call {
                key: "good".into(),
                args: vec![],
                kwargs: vec![],
            },
        ]);
        let (endpoint, _) = endpoint_reading(wire);

        endpoint
            .set_call("bad", |_, _| Err("deliberate failure".into()))
            .unwrap();
        let hit = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&hit);
        endpoint
            .set_call("good", move |_, _| {
                *flag.lock().unwrap() = true;
                Ok(())
            })
            .unwrap();

        endpoint.run().unwrap();
        assert!(*hit.lock().unwrap());
    }

    #[test]
    fn propagate_policy_terminates_loop_on_handler_error() {
        let wire = wire_of(&[Envelope::Call {
            key: "bad".into(),
            args: vec![],
            kwargs: vec![],
        }]);
        let out = SharedWriter::default();
        let endpoint = Endpoint::new(Connection::new(Cursor::new(wire), out))
            .with_call_error_policy(CallErrorPolicy::Propagate);

        endpoint
            .set_call("bad", |_, _| Err("deliberate failure".into()))
            .unwrap();

        let err = endpoint.run().unwrap_err();
        assert!(matches!(err, RpcError::Handler { key, .. } if key == "bad"));
    }

    #[test]
    fn propagate_policy_rejects_unknown_call_key() {
        let wire = wire_of(&[Envelope::Call {
            key: "ghost".into(),
            args: vec![],
            kwargs: vec![],
        }]);
        let out = SharedWriter::default();
        let endpoint = Endpoint::new(Connection::new(Cursor::new(wire), out))
            .with_call_error_policy(CallErrorPolicy::Propagate);

        let err = endpoint.run().unwrap_err();
        assert!(matches!(err, RpcError::UnknownKey(key) if key == "ghost"));
    }

    #[test]
    fn unknown_call_key_is_suppressed_by_default() {
        let wire = wire_of(&[Envelope::Call {
            key: "ghost".into(),
            args: vec![],
            kwargs: vec![],
        }]);
        let (endpoint, _) = endpoint_reading(wire);
        endpoint.run().unwrap();
    }

    #[test]
    fn invoke_func_produces_correlated_response() {
        let wire = wire_of(&[Envelope::InvokeFunc {
            key: "double".into(),
            args: vec![Value::Int(21)],
            kwargs: vec![],
            correlation_id: 9,
        }]);
        let (endpoint, out) = endpoint_reading(wire);

        endpoint
            .set_func_plain("double", |args, _| {
                let n = args[0].as_i64().ok_or("expected an integer")?;
                Ok(Value::Int(n * 2))
            })
            .unwrap();

        endpoint.run().unwrap();

        let responses = decode_frames(&out.0.lock().unwrap());
        assert_eq!(
            responses,
            vec![Envelope::FuncResponse {
                correlation_id: 9,
                result: Value::Int(42),
            }]
        );
    }

    #[test]
    fn unknown_func_key_answers_with_error_value() {
        let wire = wire_of(&[Envelope::InvokeFunc {
            key: "missing".into(),
            args: vec![],
            kwargs: vec![],
            correlation_id: 4,
        }]);
        let (endpoint, out) = endpoint_reading(wire);

        endpoint.run().unwrap();

        let responses = decode_frames(&out.0.lock().unwrap());
        let Envelope::FuncResponse {
            correlation_id,
            result,
        } = &responses[0]
        else {
            panic!("expected a func response");
        };
        assert_eq!(*correlation_id, 4);
        assert!(result.as_error().unwrap().trace.contains("missing"));
    }

    #[test]
    fn plain_handler_error_becomes_tagged_error_value() {
        let wire = wire_of(&[Envelope::InvokeFunc {
            key: "fragile".into(),
            args: vec![],
            kwargs: vec![],
            correlation_id: 7,
        }]);
        let (endpoint, out) = endpoint_reading(wire);

        endpoint
            .set_func_plain("fragile", |_, _| Err("division by zero".into()))
            .unwrap();

        endpoint.run().unwrap();

        let responses = decode_frames(&out.0.lock().unwrap());
        let Envelope::FuncResponse { result, .. } = &responses[0] else {
            panic!("expected a func response");
        };
        assert!(result.as_error().unwrap().trace.contains("division by zero"));
    }

    #[test]
    fn plain_handler_panic_becomes_tagged_error_value() {
        let wire = wire_of(&[Envelope::InvokeFunc {
            key: "reckless".into(),
            args: vec![],
            kwargs: vec![],
            correlation_id: 8,
        }]);
        let (endpoint, out) = endpoint_reading(wire);

        endpoint
            .set_func_plain("reckless", |_, _| panic!("handler bug"))
            .unwrap();

        endpoint.run().unwrap();

        let responses = decode_frames(&out.0.lock().unwrap());
        let Envelope::FuncResponse { result, .. } = &responses[0] else {
            panic!("expected a func response");
        };
        let trace = &result.as_error().unwrap().trace;
        assert!(trace.contains("panicked"));
        assert!(trace.contains("handler bug"));
    }

    #[test]
    fn unmatched_func_response_is_ignored() {
        let wire = wire_of(&[Envelope::FuncResponse {
            correlation_id: 99,
            result: Value::Null,
        }]);
        let (endpoint, _) = endpoint_reading(wire);
        endpoint.run().unwrap();
    }

    #[test]
    fn call_writes_envelope_without_waiting() {
        let (endpoint, out) = endpoint_reading(Vec::new());

        endpoint
            .call("notify", vec![Value::Str("up".into())], vec![])
            .unwrap();

        let written = decode_frames(&out.0.lock().unwrap());
        assert_eq!(
            written,
            vec![Envelope::Call {
                key: "notify".into(),
                args: vec![Value::Str("up".into())],
                kwargs: vec![],
            }]
        );
    }

    #[test]
    fn stop_writes_sentinel() {
        let (endpoint, out) = endpoint_reading(Vec::new());
        endpoint.stop().unwrap();

        let written = decode_frames(&out.0.lock().unwrap());
        assert_eq!(written, vec![Envelope::Stop]);
    }

    #[test]
    fn decode_error_terminates_loop_with_error() {
        let mut wire = BytesMut::new();
        encode_frame(b"{\"kind\":\"teleport\"}", &mut wire);
        let (endpoint, _) = endpoint_reading(wire.to_vec());

        let err = endpoint.run().unwrap_err();
        assert!(matches!(err, RpcError::Frame(FrameError::Json(_))));
    }
}
