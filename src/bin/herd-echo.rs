//! Reference pool worker
//!
//! Serves a small set of methods over stdin/stdout so the pool can be
//! exercised end to end:
//!
//! - `init(index, params)`, `bootstrap(params)`, `destroy()`
//! - `ping()` -> `"pong"`
//! - `echo(value)` -> `value`
//! - `add(a, b)` -> `a + b`
//! - `state()` -> index, pid, lifecycle parameters and call order
//! - `sleep(ms)` -> `ms`, after sleeping
//! - `fail(message)` -> error
//! - `crash(code)` -> exits the process without replying

use anyhow::{bail, Result};
use herd::logging::{self, LogConfig};
use herd::rpc::{arg, ExposeSide, Methods};
use serde_json::{json, Value};
use std::process;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

#[derive(Debug, Default)]
struct EchoState {
    init: Option<Value>,
    bootstrap: Option<Value>,
    lifecycle: Vec<&'static str>,
}

fn methods(index: usize) -> Methods {
    let state = Arc::new(Mutex::new(EchoState::default()));
    let init_state = Arc::clone(&state);
    let bootstrap_state = Arc::clone(&state);
    let destroy_state = Arc::clone(&state);
    let query_state = Arc::clone(&state);

    Methods::new()
        .method("init", move |args| {
            let assigned: usize = arg(&args, 0)?;
            if assigned != index {
                bail!("init for worker {} delivered to worker {}", assigned, index);
            }
            let mut state = init_state.lock().unwrap_or_else(PoisonError::into_inner);
            state.init = Some(args.get(1).cloned().unwrap_or(Value::Null));
            state.lifecycle.push("init");
            Ok(Value::Null)
        })
        .method("bootstrap", move |args| {
            let mut state = bootstrap_state.lock().unwrap_or_else(PoisonError::into_inner);
            state.bootstrap = Some(args.first().cloned().unwrap_or(Value::Null));
            state.lifecycle.push("bootstrap");
            Ok(Value::Null)
        })
        .method("destroy", move |_| {
            destroy_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .lifecycle
                .push("destroy");
            // Leave time for the reply to be written before exiting
            thread::spawn(|| {
                thread::sleep(Duration::from_millis(50));
                process::exit(0);
            });
            Ok(Value::Null)
        })
        .method("ping", |_| Ok(json!("pong")))
        .method("echo", |args| Ok(args.into_iter().next().unwrap_or(Value::Null)))
        .method("add", |args| {
            let a: f64 = arg(&args, 0)?;
            let b: f64 = arg(&args, 1)?;
            let sum = a + b;
            if sum.fract() == 0.0 && sum.abs() < i64::MAX as f64 {
                Ok(json!(sum as i64))
            } else {
                Ok(json!(sum))
            }
        })
        .method("state", move |_| {
            let state = query_state.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(json!({
                "index": index,
                "pid": process::id(),
                "init": state.init,
                "bootstrap": state.bootstrap,
                "lifecycle": state.lifecycle,
            }))
        })
        .method("sleep", |args| {
            let ms: u64 = arg(&args, 0)?;
            thread::sleep(Duration::from_millis(ms));
            Ok(json!(ms))
        })
        .method("fail", |args| {
            let message: Option<String> = arg(&args, 0)?;
            bail!("{}", message.unwrap_or_else(|| "requested failure".to_string()))
        })
        .method("crash", |args| -> Result<Value> {
            let code: Option<i32> = arg(&args, 0)?;
            process::exit(code.unwrap_or(1))
        })
}

fn main() {
    logging::init(LogConfig::for_worker().with_env_overrides());

    let side = match herd::rpc::worker_index()
        .and_then(|index| ExposeSide::from_env(methods(index)))
    {
        Ok(side) => side,
        Err(e) => {
            eprintln!("herd-echo: {}", e);
            process::exit(2);
        }
    };

    if let Err(e) = side.serve_stdio() {
        tracing::error!(error = %e, "Channel failed");
        process::exit(1);
    }
}
