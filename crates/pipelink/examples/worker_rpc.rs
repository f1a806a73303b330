//! Parent/worker RPC over stdin/stdout pipes.
//!
//! The parent re-spawns this binary with `--worker` and talks to it over
//! the pipe pair: one fire-and-forget call, one synchronous func call,
//! then a stop sentinel to shut the worker down.
//!
//! Run with: `cargo run --example worker-rpc`

use std::process::{Command, Stdio};
use std::sync::Arc;

use pipelink::frame::Connection;
use pipelink::rpc::{Endpoint, Value};

fn main() {
    if std::env::args().nth(1).as_deref() == Some("--worker") {
        worker();
    } else {
        parent();
    }
}

fn worker() {
    let endpoint = Endpoint::new(Connection::stdio());

    endpoint
        .set_call("log", |args, _| {
            // stdout belongs to the connection; diagnostics go to stderr.
            eprintln!("[worker] log: {args:?}");
            Ok(())
        })
        .expect("key is free");

    endpoint
        .set_func_plain("double", |args, _| {
            let n = args[0].as_i64().ok_or("expected an integer")?;
            Ok(Value::Int(n * 2))
        })
        .expect("key is free");

    // Serve until the parent sends stop or closes the pipe.
    endpoint.run().expect("worker dispatch loop failed");
}

fn parent() {
    let exe = std::env::current_exe().expect("current executable path");
    let mut child = Command::new(exe)
        .arg("--worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("worker should spawn");

    let conn = Connection::from_child(&mut child).expect("worker pipes should exist");
    let endpoint = Arc::new(Endpoint::new(conn));
    let dispatch = endpoint.start().expect("dispatch loop should start");

    endpoint
        .call("log", vec![Value::Str("hello from parent".into())], vec![])
        .expect("call should send");

    let result = endpoint
        .func("double", vec![Value::Int(21)], vec![])
        .expect("func should round-trip");
    println!("double(21) = {result:?}");

    endpoint.stop().expect("stop should send");
    let status = child.wait().expect("worker should exit");
    println!("worker exited: {status}");

    // The worker's exit closes its stdout, which ends our own loop.
    dispatch
        .join()
        .expect("dispatch thread should not panic")
        .expect("dispatch loop should exit cleanly");
}
