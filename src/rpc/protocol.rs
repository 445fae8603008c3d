//! Wire format for the correlated call protocol
//!
//! Newline-delimited JSON (JSONL):
//!
//! - Each message is one line, UTF-8 encoded
//! - A [`Request`] carries `id`, `method` and `args`
//! - A [`Response`] carries `id` and either `result` or `error`
//!
//! ```text
//! → {"id":"herd-4120-1718000000000-7","method":"add","args":[1,2]}
//! ← {"id":"herd-4120-1718000000000-7","result":3}
//! ← {"id":"herd-4120-1718000000000-8","error":"Method nope not found"}
//! ```
//!
//! Incoming lines are classified into [`Incoming`] before anything looks at
//! them. Lines that are neither a well-formed request nor a well-formed
//! response decode to [`Incoming::Unrecognized`] and are dropped by both
//! sides, since a channel may carry foreign traffic.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, BufReader, Read};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lines longer than this are treated as corrupted traffic (10MB)
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Global counter for generating unique correlation IDs
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a correlation ID unique across processes and calls
pub fn generate_request_id() -> String {
    let count = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("herd-{}-{}-{}", std::process::id(), timestamp, count)
}

/// Method invocation (caller → worker)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation ID, echoed back in the response
    pub id: String,
    /// Name of the exposed method
    pub method: String,
    /// Positional arguments
    pub args: Vec<Value>,
}

impl Request {
    /// Build a request with a fresh correlation ID
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id: generate_request_id(),
            method: method.into(),
            args,
        }
    }
}

/// Method outcome (worker → caller)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation ID of the request being answered
    pub id: String,
    /// Return value on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message on failure; its presence alone marks the call as failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Reply used when the requested method is not exposed
    pub fn method_not_found(id: impl Into<String>, method: &str) -> Self {
        Self::err(id, format!("Method {} not found", method))
    }

    /// Collapse into the value the caller sees
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A decoded line from the channel
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request(Request),
    Response(Response),
    /// Anything else: invalid JSON, wrong shape, empty ids or method names
    Unrecognized,
}

impl Incoming {
    /// Classify one line of channel input
    pub fn decode(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Incoming::Unrecognized;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => return Incoming::Unrecognized,
        };

        let Some(object) = value.as_object() else {
            return Incoming::Unrecognized;
        };

        let id = match object.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Incoming::Unrecognized,
        };

        if object.contains_key("method") {
            let method = match object.get("method").and_then(Value::as_str) {
                Some(method) if !method.is_empty() => method.to_string(),
                _ => return Incoming::Unrecognized,
            };
            let args = match object.get("args") {
                Some(Value::Array(args)) => args.clone(),
                _ => return Incoming::Unrecognized,
            };
            return Incoming::Request(Request { id, method, args });
        }

        let error = match object.get("error") {
            None | Some(Value::Null) => None,
            Some(Value::String(message)) => Some(message.clone()),
            // Non-string errors still mark the call as failed
            Some(other) => Some(other.to_string()),
        };

        Incoming::Response(Response {
            id,
            result: object.get("result").cloned(),
            error,
        })
    }
}

/// Encode a message to JSONL format (single line with newline)
pub fn encode_jsonl<T: Serialize>(message: &T) -> io::Result<String> {
    let json = serde_json::to_string(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(format!("{}\n", json))
}

/// Decode a message from a JSONL line
pub fn decode_jsonl<T: for<'de> Deserialize<'de>>(line: &str) -> io::Result<T> {
    serde_json::from_str(line.trim()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Outcome of [`LineReader::read_line`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRead {
    /// End of input
    Eof,
    /// One line (with its newline, if any) is in the buffer
    Line,
    /// The line grew past the limit after this many bytes; the buffer is
    /// empty and the rest of the line is skipped on the next read
    Oversized(usize),
}

/// Newline-delimited reader that never buffers more than `limit` bytes of
/// one line
#[derive(Debug)]
pub struct LineReader<R> {
    inner: BufReader<R>,
    limit: usize,
    discarding: bool,
}

impl<R: Read> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, MAX_LINE_BYTES)
    }

    pub fn with_limit(reader: R, limit: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            limit,
            discarding: false,
        }
    }

    /// Read the next line into `buf`, replacing its contents
    pub fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<LineRead> {
        buf.clear();
        if self.discarding {
            if !self.skip_line()? {
                return Ok(LineRead::Eof);
            }
            self.discarding = false;
        }

        let cap = self.limit as u64 + 1;
        let read = (&mut self.inner).take(cap).read_until(b'\n', buf)?;
        if read == 0 {
            return Ok(LineRead::Eof);
        }
        if read <= self.limit || buf.last() == Some(&b'\n') {
            return Ok(LineRead::Line);
        }

        buf.clear();
        self.discarding = true;
        Ok(LineRead::Oversized(read))
    }

    /// Consume input up to and including the next newline
    ///
    /// Returns `false` if input ended first.
    fn skip_line(&mut self) -> io::Result<bool> {
        loop {
            let available = match self.inner.fill_buf() {
                Ok(available) => available,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if available.is_empty() {
                return Ok(false);
            }
            match available.iter().position(|&byte| byte == b'\n') {
                Some(end) => {
                    self.inner.consume(end + 1);
                    return Ok(true);
                }
                None => {
                    let len = available.len();
                    self.inner.consume(len);
                }
            }
        }
    }
}
