//! Caller side of the call protocol, run in the pool's own process
//!
//! [`CallerSide`] validates a declared method set and binds it to one
//! channel, producing a [`RemoteProxy`]. Every call registers a pending
//! entry keyed by a fresh correlation ID; a reader thread settles entries
//! as responses arrive, in whatever order the worker answers.

use crate::error::RpcError;
use crate::rpc::protocol::{
    encode_jsonl, Incoming, LineRead, LineReader, Request, Response, MAX_LINE_BYTES,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Something went wrong with the channel itself, not with a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFault {
    /// The remote end closed the channel
    Closed,
    /// Reading from the channel failed
    ReadFailed(String),
    /// Writing a request to the channel failed
    WriteFailed(String),
    /// A line could not be decoded as text (invalid UTF-8 or oversized)
    Corrupted(String),
}

/// Callback notified of channel faults
pub type FaultHandler = Arc<dyn Fn(ChannelFault) + Send + Sync>;

type Reply = Result<Value, RpcError>;

#[derive(Default)]
struct PendingTable {
    closed: bool,
    calls: HashMap<String, Sender<Reply>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for a [`RemoteProxy`]
pub struct CallerSide {
    methods: Vec<String>,
    label: String,
    on_fault: Option<FaultHandler>,
}

impl CallerSide {
    /// Declare the methods the proxy will expose
    ///
    /// # Errors
    ///
    /// Returns `RpcError::InvalidDeclaration` for empty or duplicate names.
    pub fn new<I, S>(methods: I) -> Result<Self, RpcError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let methods: Vec<String> = methods.into_iter().map(Into::into).collect();
        let mut seen = HashSet::new();
        for name in &methods {
            if name.is_empty() {
                return Err(RpcError::InvalidDeclaration(
                    "method names must be non-empty".to_string(),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(RpcError::InvalidDeclaration(format!(
                    "method '{}' declared twice",
                    name
                )));
            }
        }

        Ok(Self {
            methods,
            label: "worker".to_string(),
            on_fault: None,
        })
    }

    /// Name used in logs and for the reader thread
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Be notified when the channel closes, fails or carries corrupted data
    pub fn on_fault<F>(mut self, handler: F) -> Self
    where
        F: Fn(ChannelFault) + Send + Sync + 'static,
    {
        self.on_fault = Some(Arc::new(handler));
        self
    }

    /// Bind the declared methods to a channel and start reading responses
    pub fn connect<R, W>(self, reader: R, writer: W) -> Result<RemoteProxy, RpcError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let channel = Arc::new(Channel {
            label: self.label.clone(),
            writer: Mutex::new(Box::new(writer)),
            pending: Arc::clone(&pending),
            on_fault: self.on_fault.clone(),
        });

        let bindings: HashMap<String, RemoteMethod> = self
            .methods
            .iter()
            .map(|name| {
                let method = RemoteMethod {
                    name: Arc::from(name.as_str()),
                    channel: Arc::clone(&channel),
                };
                (name.clone(), method)
            })
            .collect();

        // Every declared name must resolve to a callable binding
        if let Some(missing) = self.methods.iter().find(|name| !bindings.contains_key(*name)) {
            return Err(RpcError::InvalidDeclaration(format!(
                "proxy does not expose '{}'",
                missing
            )));
        }

        let on_fault = self.on_fault;
        let label = self.label;
        thread::Builder::new()
            .name(format!("{}-reader", label))
            .spawn(move || read_loop(reader, pending, on_fault, label))?;

        Ok(RemoteProxy {
            channel,
            bindings: Arc::new(bindings),
        })
    }
}

struct Channel {
    label: String,
    writer: Mutex<Box<dyn Write + Send>>,
    pending: Arc<Mutex<PendingTable>>,
    on_fault: Option<FaultHandler>,
}

impl Channel {
    fn send(&self, method: &str, args: Vec<Value>) -> Result<PendingReply, RpcError> {
        let request = Request::new(method, args);
        let line = encode_jsonl(&request).map_err(|e| RpcError::Protocol(e.to_string()))?;
        let (tx, rx) = mpsc::channel();

        {
            let mut table = lock(&self.pending);
            if table.closed {
                return Err(RpcError::Disconnected);
            }
            table.calls.insert(request.id.clone(), tx);
        }

        tracing::trace!(worker = %self.label, method, id = %request.id, "Sending request");

        let written = {
            let mut writer = lock(&self.writer);
            writer.write_all(line.as_bytes()).and_then(|_| writer.flush())
        };

        if let Err(e) = written {
            lock(&self.pending).calls.remove(&request.id);
            if let Some(handler) = &self.on_fault {
                handler(ChannelFault::WriteFailed(e.to_string()));
            }
            return Err(RpcError::Io(e));
        }

        Ok(PendingReply {
            id: request.id,
            rx,
            pending: Arc::clone(&self.pending),
        })
    }
}

fn read_loop<R: Read>(
    reader: R,
    pending: Arc<Mutex<PendingTable>>,
    on_fault: Option<FaultHandler>,
    label: String,
) {
    let report = |fault: ChannelFault| {
        if let Some(handler) = &on_fault {
            handler(fault);
        }
    };

    let mut reader = LineReader::new(reader);
    let mut buf = Vec::new();

    let fault = loop {
        match reader.read_line(&mut buf) {
            Ok(LineRead::Eof) => break ChannelFault::Closed,
            Ok(LineRead::Line) => {}
            Ok(LineRead::Oversized(_)) => {
                report(ChannelFault::Corrupted(format!(
                    "line longer than {} bytes",
                    MAX_LINE_BYTES
                )));
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break ChannelFault::ReadFailed(e.to_string()),
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                report(ChannelFault::Corrupted(e.to_string()));
                continue;
            }
        };

        match Incoming::decode(line) {
            Incoming::Response(response) => settle(&pending, response, &label),
            _ => tracing::trace!(worker = %label, "Ignoring non-response line"),
        }
    };

    // Nothing can answer the outstanding calls any more
    let orphaned: Vec<Sender<Reply>> = {
        let mut table = lock(&pending);
        table.closed = true;
        table.calls.drain().map(|(_, tx)| tx).collect()
    };
    if !orphaned.is_empty() {
        tracing::debug!(worker = %label, count = orphaned.len(), "Rejecting calls on closed channel");
    }
    for tx in orphaned {
        let _ = tx.send(Err(RpcError::Disconnected));
    }

    report(fault);
}

fn settle(pending: &Mutex<PendingTable>, response: Response, label: &str) {
    let Some(tx) = lock(pending).calls.remove(&response.id) else {
        tracing::trace!(worker = %label, id = %response.id, "Ignoring response for unknown id");
        return;
    };
    let _ = tx.send(response.into_result().map_err(RpcError::Remote));
}

/// Handle to one worker's exposed methods
///
/// Cloning is cheap; clones share the channel and the pending-call table.
#[derive(Clone)]
pub struct RemoteProxy {
    channel: Arc<Channel>,
    bindings: Arc<HashMap<String, RemoteMethod>>,
}

impl RemoteProxy {
    /// Bound handle for a declared method
    ///
    /// # Errors
    ///
    /// Returns `RpcError::UndeclaredMethod` if `name` was not declared when
    /// the proxy was built; nothing is sent.
    pub fn method(&self, name: &str) -> Result<RemoteMethod, RpcError> {
        self.bindings
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::UndeclaredMethod(name.to_string()))
    }

    /// Resolve a fixed set of declared methods once
    ///
    /// Calls through the returned handles never fail as undeclared, so a
    /// caller can bind everything it needs up front:
    ///
    /// ```ignore
    /// let [init, bootstrap] = proxy.bind(["init", "bootstrap"])?;
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `RpcError::UndeclaredMethod` for the first name that was not
    /// declared.
    pub fn bind<const N: usize>(&self, names: [&str; N]) -> Result<[RemoteMethod; N], RpcError> {
        let mut bound = Vec::with_capacity(N);
        for name in names {
            bound.push(self.method(name)?);
        }
        bound.try_into().map_err(|_: Vec<RemoteMethod>| {
            RpcError::InvalidDeclaration(format!("expected {} bound methods", N))
        })
    }

    /// Send a call and return its pending reply
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<PendingReply, RpcError> {
        self.method(name)?.call(args)
    }

    /// Send a call and block until it settles
    pub fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call(name, args)?.wait()
    }

    /// Declared method names, sorted
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.bindings.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Whether the channel has closed
    pub fn is_closed(&self) -> bool {
        lock(&self.channel.pending).closed
    }

    /// Number of calls still waiting for a response
    pub fn pending_calls(&self) -> usize {
        lock(&self.channel.pending).calls.len()
    }
}

impl std::fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("worker", &self.channel.label)
            .field("methods", &self.methods())
            .finish()
    }
}

/// One declared method bound to a channel
#[derive(Clone)]
pub struct RemoteMethod {
    name: Arc<str>,
    channel: Arc<Channel>,
}

impl std::fmt::Debug for RemoteMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMethod")
            .field("worker", &self.channel.label)
            .field("name", &self.name)
            .finish()
    }
}

impl RemoteMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: Vec<Value>) -> Result<PendingReply, RpcError> {
        self.channel.send(&self.name, args)
    }

    pub fn invoke(&self, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call(args)?.wait()
    }
}

/// A call that has been sent and not yet settled
#[derive(Debug)]
pub struct PendingReply {
    id: String,
    rx: Receiver<Reply>,
    pending: Arc<Mutex<PendingTable>>,
}

impl PendingReply {
    /// Correlation ID of the request
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Block until the matching response arrives or the channel closes
    pub fn wait(self) -> Result<Value, RpcError> {
        self.rx.recv().unwrap_or(Err(RpcError::Disconnected))
    }

    /// Like [`wait`](Self::wait), but give up after `timeout`
    ///
    /// On timeout the pending entry is dropped, so a late response is
    /// ignored.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Value, RpcError> {
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                lock(&self.pending).calls.remove(&self.id);
                // The response may have raced the removal
                self.rx.try_recv().unwrap_or(Err(RpcError::Timeout(timeout)))
            }
            Err(RecvTimeoutError::Disconnected) => Err(RpcError::Disconnected),
        }
    }
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("closed", &self.closed)
            .field("calls", &self.calls.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::decode_jsonl;
    use serde_json::json;
    use std::io::{BufRead, BufReader};
    use std::os::unix::net::UnixStream;

    /// Proxy wired to a raw socket the test drives by hand
    fn manual_pair(methods: &[&str]) -> (RemoteProxy, BufReader<UnixStream>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let proxy = CallerSide::new(methods.iter().copied())
            .unwrap()
            .label("test")
            .connect(ours.try_clone().unwrap(), ours)
            .unwrap();
        let reader = BufReader::new(theirs.try_clone().unwrap());
        (proxy, reader, theirs)
    }

    fn read_request(reader: &mut BufReader<UnixStream>) -> Request {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        decode_jsonl(&line).unwrap()
    }

    fn reply(stream: &mut UnixStream, response: &Response) {
        stream
            .write_all(encode_jsonl(response).unwrap().as_bytes())
            .unwrap();
    }

    #[test]
    fn test_declaration_rejects_empty_and_duplicate_names() {
        assert!(matches!(
            CallerSide::new(["ping", ""]),
            Err(RpcError::InvalidDeclaration(_))
        ));
        assert!(matches!(
            CallerSide::new(["ping", "ping"]),
            Err(RpcError::InvalidDeclaration(_))
        ));
        assert!(CallerSide::new(["ping", "pong"]).is_ok());
    }

    #[test]
    fn test_undeclared_method_rejected_without_sending() {
        let (proxy, _reader, _theirs) = manual_pair(&["ping"]);

        let err = proxy.call("pong", vec![]).unwrap_err();
        assert!(matches!(err, RpcError::UndeclaredMethod(ref name) if name == "pong"));
        assert_eq!(proxy.pending_calls(), 0);
        assert_eq!(proxy.methods(), vec!["ping"]);
    }

    #[test]
    fn test_bind_resolves_methods_up_front() {
        let (proxy, mut reader, mut theirs) = manual_pair(&["ping", "pong"]);

        let [pong, ping] = proxy.bind(["pong", "ping"]).unwrap();
        assert_eq!(ping.name(), "ping");
        assert_eq!(pong.name(), "pong");

        let pending = ping.call(vec![json!(1)]).unwrap();
        let request = read_request(&mut reader);
        assert_eq!(request.method, "ping");
        reply(&mut theirs, &Response::ok(request.id, json!("ok")));
        assert_eq!(pending.wait().unwrap(), json!("ok"));

        let err = proxy.bind(["ping", "missing"]).unwrap_err();
        assert!(matches!(err, RpcError::UndeclaredMethod(ref name) if name == "missing"));
        assert_eq!(proxy.pending_calls(), 0);
    }

    #[test]
    fn test_out_of_order_responses_settle_independently() {
        let (proxy, mut reader, mut theirs) = manual_pair(&["slow", "fast"]);

        let slow = proxy.call("slow", vec![json!(1)]).unwrap();
        let fast = proxy.call("fast", vec![json!(2)]).unwrap();
        assert_ne!(slow.id(), fast.id());

        let slow_req = read_request(&mut reader);
        let fast_req = read_request(&mut reader);
        assert_eq!(slow_req.method, "slow");
        assert_eq!(fast_req.args, vec![json!(2)]);

        // Answer the second call first, and fail it
        reply(&mut theirs, &Response::err(fast_req.id.clone(), "fast failed"));
        reply(&mut theirs, &Response::ok(slow_req.id.clone(), json!("slow done")));

        let err = fast.wait().unwrap_err();
        assert_eq!(err.remote_message(), Some("fast failed"));
        assert_eq!(slow.wait().unwrap(), json!("slow done"));
        assert_eq!(proxy.pending_calls(), 0);
    }

    #[test]
    fn test_foreign_and_duplicate_responses_ignored() {
        let (proxy, mut reader, mut theirs) = manual_pair(&["ping"]);

        let pending = proxy.call("ping", vec![]).unwrap();
        let request = read_request(&mut reader);

        theirs.write_all(b"this is not json\n").unwrap();
        reply(&mut theirs, &Response::ok("someone-else", json!(0)));
        reply(&mut theirs, &Response::ok(request.id.clone(), json!("pong")));
        reply(&mut theirs, &Response::ok(request.id.clone(), json!("again")));

        assert_eq!(pending.wait().unwrap(), json!("pong"));
        assert!(!proxy.is_closed());
    }

    #[test]
    fn test_channel_close_rejects_pending_and_reports_fault() {
        let (fault_tx, fault_rx) = mpsc::channel();
        let (ours, theirs) = UnixStream::pair().unwrap();
        let proxy = CallerSide::new(["ping"])
            .unwrap()
            .on_fault(move |fault| {
                let _ = fault_tx.send(fault);
            })
            .connect(ours.try_clone().unwrap(), ours)
            .unwrap();

        let pending = proxy.call("ping", vec![]).unwrap();
        drop(theirs);

        assert!(matches!(pending.wait(), Err(RpcError::Disconnected)));
        assert_eq!(
            fault_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ChannelFault::Closed
        );
        assert!(proxy.is_closed());
        assert!(matches!(proxy.call("ping", vec![]), Err(RpcError::Disconnected)));
    }

    #[test]
    fn test_invalid_utf8_reported_as_corruption() {
        let (fault_tx, fault_rx) = mpsc::channel();
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let _proxy = CallerSide::new(["ping"])
            .unwrap()
            .on_fault(move |fault| {
                let _ = fault_tx.send(fault);
            })
            .connect(ours.try_clone().unwrap(), ours)
            .unwrap();

        theirs.write_all(&[0xff, 0xfe, b'\n']).unwrap();

        let fault = fault_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(fault, ChannelFault::Corrupted(_)));
    }

    #[test]
    fn test_unterminated_oversized_line_reported_before_newline() {
        let (fault_tx, fault_rx) = mpsc::channel();
        let (ours, theirs) = UnixStream::pair().unwrap();
        let proxy = CallerSide::new(["ping"])
            .unwrap()
            .on_fault(move |fault| {
                let _ = fault_tx.send(fault);
            })
            .connect(ours.try_clone().unwrap(), ours)
            .unwrap();
        let pending = proxy.call("ping", vec![]).unwrap();
        let request = read_request(&mut BufReader::new(theirs.try_clone().unwrap()));

        // A stray blob with no newline, larger than the line limit
        let mut blob_writer = theirs.try_clone().unwrap();
        let writer = thread::spawn(move || {
            let chunk = vec![b'x'; 1024 * 1024];
            for _ in 0..(MAX_LINE_BYTES / chunk.len() + 2) {
                blob_writer.write_all(&chunk).unwrap();
            }
        });

        let fault = fault_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(matches!(fault, ChannelFault::Corrupted(_)));
        writer.join().unwrap();

        // The channel resyncs at the next newline
        let mut theirs = theirs;
        theirs.write_all(b"\n").unwrap();
        reply(&mut theirs, &Response::ok(request.id, json!("pong")));
        assert_eq!(pending.wait().unwrap(), json!("pong"));
        assert!(!proxy.is_closed());
    }

    #[test]
    fn test_wait_timeout_drops_pending_entry() {
        let (proxy, _reader, _theirs) = manual_pair(&["ping"]);

        let pending = proxy.call("ping", vec![]).unwrap();
        assert_eq!(proxy.pending_calls(), 1);

        let err = pending.wait_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));
        assert_eq!(proxy.pending_calls(), 0);
    }
}
