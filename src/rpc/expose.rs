//! Callee side of the call protocol, run inside a worker process
//!
//! A worker registers its methods in a [`Methods`] table and serves them
//! over its channel (stdin/stdout for spawned processes). Every valid
//! request gets exactly one response; anything else on the channel is
//! ignored.

use crate::error::RpcError;
use crate::rpc::protocol::{
    encode_jsonl, Incoming, LineRead, LineReader, Request, Response, MAX_LINE_BYTES,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Environment variable carrying the slot index of a spawned worker
pub const WORKER_INDEX_ENV: &str = "HERD_WORKER_INDEX";

/// Methods every pool worker must expose
pub const LIFECYCLE_METHODS: [&str; 3] = ["init", "bootstrap", "destroy"];

/// An exposed method: positional JSON arguments in, JSON value out
pub type Handler = Arc<dyn Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync>;

/// Table of methods a worker exposes
#[derive(Clone, Default)]
pub struct Methods {
    handlers: HashMap<String, Handler>,
}

impl Methods {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method, replacing any previous one with the same name
    pub fn method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered method names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run a request to completion and build its response
    pub fn invoke(&self, request: Request) -> Response {
        let Some(handler) = self.handlers.get(&request.method) else {
            return Response::method_not_found(request.id, &request.method);
        };

        let handler = Arc::clone(handler);
        let args = request.args;
        match catch_unwind(AssertUnwindSafe(move || handler(args))) {
            Ok(Ok(result)) => Response::ok(request.id, result),
            Ok(Err(e)) => Response::err(request.id, format!("{:#}", e)),
            Err(payload) => Response::err(request.id, panic_message(payload.as_ref())),
        }
    }
}

impl std::fmt::Debug for Methods {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Methods").field("names", &self.names()).finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("Method panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("Method panicked: {}", message)
    } else {
        "Method panicked".to_string()
    }
}

/// Deserialize the positional argument at `position`
///
/// A missing argument decodes from `null`, so `Option<T>` parameters may be
/// omitted by the caller.
pub fn arg<T: DeserializeOwned>(args: &[Value], position: usize) -> anyhow::Result<T> {
    let value = args.get(position).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| anyhow::anyhow!("Invalid argument {}: {}", position, e))
}

/// Read the slot index assigned by the pool
pub fn worker_index() -> Result<usize, RpcError> {
    let raw = std::env::var(WORKER_INDEX_ENV).map_err(|_| {
        RpcError::NotInWorker(format!("{} is not set", WORKER_INDEX_ENV))
    })?;
    raw.trim().parse().map_err(|_| {
        RpcError::NotInWorker(format!("{} is not a slot index: {:?}", WORKER_INDEX_ENV, raw))
    })
}

/// Serves a [`Methods`] table over a channel
#[derive(Debug, Clone)]
pub struct ExposeSide {
    index: usize,
    methods: Arc<Methods>,
}

impl ExposeSide {
    /// Expose `methods` as worker `index` without consulting the environment
    pub fn new(index: usize, methods: Methods) -> Self {
        Self {
            index,
            methods: Arc::new(methods),
        }
    }

    /// Expose `methods` from inside a spawned pool worker
    ///
    /// # Errors
    ///
    /// Returns `RpcError::NotInWorker` when the process was not started by a
    /// pool, and `RpcError::InvalidDeclaration` when a lifecycle method is
    /// missing from `methods`.
    pub fn from_env(methods: Methods) -> Result<Self, RpcError> {
        let index = worker_index()?;
        for name in LIFECYCLE_METHODS {
            if !methods.contains(name) {
                return Err(RpcError::InvalidDeclaration(format!(
                    "worker must expose '{}'",
                    name
                )));
            }
        }
        Ok(Self::new(index, methods))
    }

    /// Slot index this worker occupies
    pub fn index(&self) -> usize {
        self.index
    }

    /// Serve requests until the reader reaches end of input
    ///
    /// Each request runs on its own thread so a slow method does not hold up
    /// the others; responses are written under a lock, one line each. Returns
    /// after every in-flight request has been answered.
    pub fn serve<R, W>(&self, reader: R, writer: W) -> io::Result<()>
    where
        R: Read,
        W: Write + Send + 'static,
    {
        let writer = Arc::new(Mutex::new(writer));
        let mut reader = LineReader::new(reader);
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
        let mut buf = Vec::new();

        loop {
            match reader.read_line(&mut buf)? {
                LineRead::Eof => break,
                LineRead::Line => {}
                LineRead::Oversized(_) => {
                    tracing::warn!(worker = self.index, limit = MAX_LINE_BYTES, "Skipping oversized line");
                    continue;
                }
            }

            let line = String::from_utf8_lossy(&buf);
            let request = match Incoming::decode(&line) {
                Incoming::Request(request) => request,
                _ => {
                    tracing::trace!(worker = self.index, "Ignoring non-request line");
                    continue;
                }
            };

            tracing::debug!(worker = self.index, method = %request.method, id = %request.id, "Request");

            in_flight.retain(|handle| !handle.is_finished());
            let name = format!("worker-{}-call", self.index);
            let started = dispatch(request, &self.methods, &writer, self.index, |job| {
                thread::Builder::new().name(name).spawn(job)
            });
            in_flight.extend(started);
        }

        for handle in in_flight {
            let _ = handle.join();
        }

        Ok(())
    }

    /// Serve over this process's stdin and stdout
    pub fn serve_stdio(&self) -> io::Result<()> {
        tracing::info!(worker = self.index, methods = ?self.methods.names(), "Worker serving");
        self.serve(io::stdin(), io::stdout())
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Run one request on a thread from `start`
///
/// If no thread can be started the request is answered with an error right
/// away, so it still gets exactly one response.
fn dispatch<W, S>(
    request: Request,
    methods: &Arc<Methods>,
    writer: &Arc<Mutex<W>>,
    index: usize,
    start: S,
) -> Option<JoinHandle<()>>
where
    W: Write + Send + 'static,
    S: FnOnce(Job) -> io::Result<JoinHandle<()>>,
{
    let id = request.id.clone();
    let job_methods = Arc::clone(methods);
    let job_writer = Arc::clone(writer);
    let job: Job = Box::new(move || {
        let response = job_methods.invoke(request);
        if let Err(e) = write_response(&job_writer, &response) {
            tracing::debug!(worker = index, error = %e, "Failed to write response");
        }
    });

    match start(job) {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(worker = index, id = %id, error = %e, "Failed to start request thread");
            let response = Response::err(id, format!("Failed to start request thread: {}", e));
            if let Err(e) = write_response(writer, &response) {
                tracing::debug!(worker = index, error = %e, "Failed to write response");
            }
            None
        }
    }
}

fn write_response<W: Write>(writer: &Mutex<W>, response: &Response) -> io::Result<()> {
    let line = encode_jsonl(response)?;
    let mut writer = writer
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "response writer poisoned"))?;
    writer.write_all(line.as_bytes())?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::decode_jsonl;
    use serde_json::json;
    use std::sync::mpsc;

    /// Writer that forwards each flushed chunk to a channel
    struct ChannelWriter(mpsc::Sender<Vec<u8>>);

    impl Write for ChannelWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let _ = self.0.send(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn sample_methods() -> Methods {
        Methods::new()
            .method("add", |args| {
                let a: i64 = arg(&args, 0)?;
                let b: i64 = arg(&args, 1)?;
                Ok(json!(a + b))
            })
            .method("fail", |_| Err(anyhow::anyhow!("deliberate failure")))
            .method("panic", |_| panic!("boom"))
    }

    fn serve_lines(input: &str) -> Vec<Response> {
        let (tx, rx) = mpsc::channel();
        let side = ExposeSide::new(0, sample_methods());
        side.serve(input.as_bytes(), ChannelWriter(tx)).unwrap();

        let bytes: Vec<u8> = rx.try_iter().flatten().collect();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| decode_jsonl(line).unwrap())
            .collect()
    }

    #[test]
    fn test_invoke_success() {
        let response = sample_methods().invoke(Request {
            id: "1".to_string(),
            method: "add".to_string(),
            args: vec![json!(2), json!(3)],
        });
        assert_eq!(response, Response::ok("1", json!(5)));
    }

    #[test]
    fn test_invoke_unknown_method() {
        let response = sample_methods().invoke(Request {
            id: "2".to_string(),
            method: "missing".to_string(),
            args: vec![],
        });
        assert_eq!(response.error.as_deref(), Some("Method missing not found"));
    }

    #[test]
    fn test_invoke_error_and_panic_become_error_responses() {
        let methods = sample_methods();

        let response = methods.invoke(Request::new("fail", vec![]));
        assert_eq!(response.error.as_deref(), Some("deliberate failure"));

        let response = methods.invoke(Request::new("panic", vec![]));
        assert_eq!(response.error.as_deref(), Some("Method panicked: boom"));
    }

    #[test]
    fn test_invoke_bad_argument() {
        let response = sample_methods().invoke(Request::new("add", vec![json!("x")]));
        assert!(response.error.unwrap().contains("Invalid argument 0"));
    }

    #[test]
    fn test_serve_answers_each_valid_request_once() {
        let input = concat!(
            "{\"id\":\"a\",\"method\":\"add\",\"args\":[1,1]}\n",
            "garbage line\n",
            "{\"id\":\"b\",\"method\":\"nope\",\"args\":[]}\n",
            "{\"id\":\"c\",\"result\":1}\n",
            "{\"id\":\"d\",\"method\":\"add\",\"args\":[2,2]}",
        );

        let mut responses = serve_lines(input);
        responses.sort_by(|a, b| a.id.cmp(&b.id));

        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0], Response::ok("a", json!(2)));
        assert_eq!(responses[1].error.as_deref(), Some("Method nope not found"));
        assert_eq!(responses[2], Response::ok("d", json!(4)));
    }

    #[test]
    fn test_serve_skips_oversized_line() {
        let input = format!(
            "{}\n{}\n",
            "x".repeat(MAX_LINE_BYTES + 10),
            r#"{"id":"after","method":"add","args":[1,2]}"#
        );

        let responses = serve_lines(&input);
        assert_eq!(responses, vec![Response::ok("after", json!(3))]);
    }

    #[test]
    fn test_dispatch_answers_when_no_thread_can_start() {
        let writer = Arc::new(Mutex::new(Vec::new()));
        let methods = Arc::new(sample_methods());
        let request = Request {
            id: "r".to_string(),
            method: "add".to_string(),
            args: vec![json!(1), json!(1)],
        };

        let handle = dispatch(request, &methods, &writer, 0, |_job| {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "no threads left"))
        });
        assert!(handle.is_none());

        let written = String::from_utf8(writer.lock().unwrap().clone()).unwrap();
        let response: Response = decode_jsonl(&written).unwrap();
        assert_eq!(
            response,
            Response::err("r", "Failed to start request thread: no threads left")
        );
    }

    #[test]
    fn test_arg_missing_decodes_null() {
        let value: Option<i64> = arg(&[], 0).unwrap();
        assert_eq!(value, None);
        assert!(arg::<i64>(&[], 0).is_err());
    }

    #[test]
    fn test_from_env_requires_worker_context() {
        // The test harness is never launched as a pool worker
        if std::env::var(WORKER_INDEX_ENV).is_err() {
            let err = ExposeSide::from_env(sample_methods()).unwrap_err();
            assert!(matches!(err, RpcError::NotInWorker(_)));
        }
    }
}
