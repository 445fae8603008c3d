//! Worker process abstraction
//!
//! The cluster manager never touches `std::process` directly. It asks a
//! [`Spawner`] for a [`SpawnedWorker`] (a channel plus a [`ProcessControl`])
//! and hands the spawner a [`TerminationMonitor`] through which abnormal
//! termination is reported. [`CommandSpawner`] is the OS-process
//! implementation: JSONL over the child's stdin/stdout, slot index in
//! `HERD_WORKER_INDEX`, and a watcher thread blocked in `wait()`.
//! [`LocalSpawner`] runs workers as threads over socket pairs instead.

use crate::rpc::caller::ChannelFault;
use crate::rpc::expose::{ExposeSide, Methods, WORKER_INDEX_ENV};
use anyhow::{anyhow, Context};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

/// Why a worker is considered dead
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationKind {
    /// The process or its channel reported an error
    Error(String),
    /// Data on the channel could not be decoded
    MessageCorruption(String),
    /// The channel closed unexpectedly
    ChannelClosed,
    /// The process exited
    Exited(String),
}

impl TerminationKind {
    /// Short name for logs
    pub fn label(&self) -> &'static str {
        match self {
            TerminationKind::Error(_) => "error",
            TerminationKind::MessageCorruption(_) => "messageerror",
            TerminationKind::ChannelClosed => "close",
            TerminationKind::Exited(_) => "exit",
        }
    }

    /// Describe a process exit status
    pub fn exited(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        let detail = match (status.code(), status.signal()) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("killed by signal {}", signal),
            _ => status.to_string(),
        };
        TerminationKind::Exited(detail)
    }
}

impl fmt::Display for TerminationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationKind::Error(detail)
            | TerminationKind::MessageCorruption(detail)
            | TerminationKind::Exited(detail) => write!(f, "{}: {}", self.label(), detail),
            TerminationKind::ChannelClosed => write!(f, "{}", self.label()),
        }
    }
}

impl From<ChannelFault> for TerminationKind {
    fn from(fault: ChannelFault) -> Self {
        match fault {
            ChannelFault::Closed => TerminationKind::ChannelClosed,
            ChannelFault::ReadFailed(detail) | ChannelFault::WriteFailed(detail) => {
                TerminationKind::Error(detail)
            }
            ChannelFault::Corrupted(detail) => TerminationKind::MessageCorruption(detail),
        }
    }
}

type TerminationSink = Arc<dyn Fn(usize, u64, TerminationKind) + Send + Sync>;

/// Reporting capability for one spawned worker
///
/// Marks the worker dead before forwarding the report, so the manager can
/// tell a worker that died before it was installed.
#[derive(Clone)]
pub struct TerminationMonitor {
    index: usize,
    generation: u64,
    dead: Arc<AtomicBool>,
    sink: TerminationSink,
}

impl TerminationMonitor {
    pub fn new<F>(index: usize, generation: u64, sink: F) -> Self
    where
        F: Fn(usize, u64, TerminationKind) + Send + Sync + 'static,
    {
        Self {
            index,
            generation,
            dead: Arc::new(AtomicBool::new(false)),
            sink: Arc::new(sink),
        }
    }

    /// A monitor whose reports go nowhere
    pub fn detached(index: usize) -> Self {
        Self::new(index, 0, |_, _, _| {})
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Record an abnormal termination signal
    pub fn report(&self, kind: TerminationKind) {
        self.dead.store(true, Ordering::SeqCst);
        (self.sink)(self.index, self.generation, kind);
    }

    /// Whether any termination signal has been reported
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TerminationMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminationMonitor")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("dead", &self.is_dead())
            .finish()
    }
}

/// Forced-termination handle for a worker
pub trait ProcessControl: Send {
    /// OS process ID, if the worker is a process
    fn id(&self) -> Option<u32>;

    /// Terminate the worker immediately; calling it again is a no-op
    fn kill(&mut self) -> io::Result<()>;

    /// Whether the worker is still running; `false` once it has been reaped
    /// or stopped
    fn is_alive(&self) -> bool;
}

/// A freshly spawned worker: its channel and its control handle
pub struct SpawnedWorker {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub control: Box<dyn ProcessControl>,
}

impl fmt::Debug for SpawnedWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedWorker")
            .field("id", &self.control.id())
            .finish_non_exhaustive()
    }
}

/// Produces workers for slots
pub trait Spawner: Send + Sync {
    /// Start a worker for slot `index`
    ///
    /// Abnormal termination that the spawner itself observes (such as the
    /// process exiting) must be reported through `monitor`.
    fn spawn(&self, index: usize, monitor: TerminationMonitor) -> anyhow::Result<SpawnedWorker>;
}

impl<F> Spawner for F
where
    F: Fn(usize, TerminationMonitor) -> anyhow::Result<SpawnedWorker> + Send + Sync,
{
    fn spawn(&self, index: usize, monitor: TerminationMonitor) -> anyhow::Result<SpawnedWorker> {
        self(index, monitor)
    }
}

/// Spawns workers as child processes of a worker executable
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Spawner for CommandSpawner {
    fn spawn(&self, index: usize, monitor: TerminationMonitor) -> anyhow::Result<SpawnedWorker> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(WORKER_INDEX_ENV, index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program.display()))?;

        let pid = child.id();
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("Worker {} started without piped stdio", index));
            }
        };

        let exited = Arc::new(Mutex::new(false));
        let watcher_exited = Arc::clone(&exited);
        let watcher = thread::Builder::new()
            .name(format!("worker-{}-exit", index))
            .spawn(move || {
                wait_for_exit(pid);
                // Reap under the lock `kill` takes, so it never signals a recycled PID
                let status = {
                    let mut exited = lock(&watcher_exited);
                    *exited = true;
                    child.wait()
                };
                let kind = match status {
                    Ok(status) => TerminationKind::exited(status),
                    Err(e) => TerminationKind::Error(e.to_string()),
                };
                tracing::debug!(worker = index, pid, %kind, "Worker process ended");
                monitor.report(kind);
            });

        if let Err(e) = watcher {
            // The child moved into the failed closure and was dropped; make sure it dies
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            return Err(anyhow!("Failed to watch worker {}: {}", index, e));
        }

        tracing::debug!(worker = index, pid, program = %self.program.display(), "Spawned worker process");

        Ok(SpawnedWorker {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            control: Box::new(ChildControl { pid, exited }),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Block until child `pid` has exited, leaving it unreaped
fn wait_for_exit(pid: u32) {
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT;
    loop {
        match waitid(Id::Pid(Pid::from_raw(pid as i32)), flags) {
            Err(Errno::EINTR) => continue,
            Ok(_) => return,
            Err(e) => {
                tracing::debug!(pid, error = %e, "waitid failed, reaping directly");
                return;
            }
        }
    }
}

/// Control handle for a child process reaped by its watcher thread
///
/// `exited` is set under its lock before the child is reaped; signals are
/// only sent while holding the same lock with `exited` still false.
#[derive(Debug)]
struct ChildControl {
    pid: u32,
    exited: Arc<Mutex<bool>>,
}

impl ProcessControl for ChildControl {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn kill(&mut self) -> io::Result<()> {
        let exited = lock(&self.exited);
        if *exited {
            return Ok(());
        }
        match kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    fn is_alive(&self) -> bool {
        let exited = lock(&self.exited);
        if *exited {
            return false;
        }
        // Signal 0 only checks that the process exists; an exited but
        // unreaped child still counts until the watcher reaps it
        match kill(Pid::from_raw(self.pid as i32), None) {
            Ok(_) => true,
            Err(Errno::ESRCH) => false,
            Err(_) => true,
        }
    }
}

type MethodsFactory = Arc<dyn Fn(usize) -> Methods + Send + Sync>;

/// Runs workers as threads in the current process
///
/// Each worker serves its own [`Methods`] table over one end of a
/// `UnixStream` pair. Killing a local worker shuts the socket down, which
/// both ends observe as the channel closing.
#[derive(Clone)]
pub struct LocalSpawner {
    factory: MethodsFactory,
    /// Parent end of the latest worker spawned for each slot
    streams: Arc<Mutex<HashMap<usize, UnixStream>>>,
}

impl LocalSpawner {
    /// `factory` builds the method table for a given slot index
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(usize) -> Methods + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Kill the latest worker spawned for slot `index` from outside
    ///
    /// Returns `false` if no worker was ever spawned for the slot.
    pub fn kill(&self, index: usize) -> bool {
        let streams = lock(&self.streams);
        match streams.get(&index) {
            Some(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for LocalSpawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSpawner").finish_non_exhaustive()
    }
}

impl Spawner for LocalSpawner {
    fn spawn(&self, index: usize, _monitor: TerminationMonitor) -> anyhow::Result<SpawnedWorker> {
        let (parent, child) = UnixStream::pair().context("Failed to create socket pair")?;
        let side = ExposeSide::new(index, (self.factory)(index));
        let child_reader = child.try_clone()?;
        let alive = Arc::new(AtomicBool::new(true));

        let serve_alive = Arc::clone(&alive);
        thread::Builder::new()
            .name(format!("local-worker-{}", index))
            .spawn(move || {
                if let Err(e) = side.serve(child_reader, child) {
                    tracing::debug!(worker = index, error = %e, "Local worker stopped");
                }
                serve_alive.store(false, Ordering::SeqCst);
            })
            .context("Failed to start local worker")?;

        let reader = parent.try_clone()?;
        let control = parent.try_clone()?;
        lock(&self.streams).insert(index, parent.try_clone()?);
        Ok(SpawnedWorker {
            reader: Box::new(reader),
            writer: Box::new(parent),
            control: Box::new(LocalControl {
                stream: control,
                alive,
            }),
        })
    }
}

#[derive(Debug)]
struct LocalControl {
    stream: UnixStream,
    alive: Arc<AtomicBool>,
}

impl ProcessControl for LocalControl {
    fn id(&self) -> Option<u32> {
        None
    }

    fn kill(&mut self) -> io::Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_termination_kind_from_fault() {
        assert_eq!(
            TerminationKind::from(ChannelFault::Closed),
            TerminationKind::ChannelClosed
        );
        assert_eq!(
            TerminationKind::from(ChannelFault::Corrupted("bad".into())).label(),
            "messageerror"
        );
        assert_eq!(
            TerminationKind::from(ChannelFault::WriteFailed("pipe".into())),
            TerminationKind::Error("pipe".into())
        );
    }

    #[test]
    fn test_termination_kind_display() {
        assert_eq!(TerminationKind::ChannelClosed.to_string(), "close");
        assert_eq!(
            TerminationKind::Exited("exit code 3".into()).to_string(),
            "exit: exit code 3"
        );
    }

    #[test]
    fn test_monitor_marks_dead_before_forwarding() {
        let (tx, rx) = mpsc::channel();
        let monitor = TerminationMonitor::new(2, 7, move |index, generation, kind| {
            let _ = tx.send((index, generation, kind));
        });
        let observer = monitor.clone();

        assert!(!observer.is_dead());
        monitor.report(TerminationKind::ChannelClosed);
        assert!(observer.is_dead());
        assert_eq!(rx.recv().unwrap(), (2, 7, TerminationKind::ChannelClosed));
    }

    #[test]
    fn test_command_spawner_reports_exit() {
        let (tx, rx) = mpsc::channel();
        let monitor = TerminationMonitor::new(0, 1, move |_, _, kind| {
            let _ = tx.send(kind);
        });

        let spawner = CommandSpawner::new("sh").args(["-c", "exit 3"]);
        let worker = spawner.spawn(0, monitor).unwrap();
        assert!(worker.control.id().is_some());

        let kind = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(kind, TerminationKind::Exited("exit code 3".into()));
    }

    #[test]
    fn test_command_spawner_passes_worker_index() {
        let spawner = CommandSpawner::new("sh").args(["-c", "echo $HERD_WORKER_INDEX"]);
        let mut worker = spawner.spawn(5, TerminationMonitor::detached(5)).unwrap();

        let mut output = String::new();
        worker.reader.read_to_string(&mut output).unwrap();
        assert_eq!(output.trim(), "5");
    }

    #[test]
    fn test_command_spawner_kill_is_idempotent() {
        let (tx, rx) = mpsc::channel();
        let monitor = TerminationMonitor::new(1, 1, move |_, _, kind| {
            let _ = tx.send(kind);
        });

        let spawner = CommandSpawner::new("sleep").args(["30"]);
        let mut worker = spawner.spawn(1, monitor).unwrap();
        assert!(worker.control.is_alive());

        worker.control.kill().unwrap();
        let kind = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(kind, TerminationKind::Exited("killed by signal 9".into()));

        worker.control.kill().unwrap();
        assert!(!worker.control.is_alive());
    }

    #[test]
    fn test_wait_for_exit_leaves_child_unreaped() {
        let mut child = Command::new("sh").args(["-c", "exit 4"]).spawn().unwrap();
        wait_for_exit(child.id());

        // Still a zombie: the PID cannot be handed to another process yet
        assert!(kill(Pid::from_raw(child.id() as i32), None).is_ok());
        let status = child.try_wait().unwrap().unwrap();
        assert_eq!(status.code(), Some(4));
    }

    #[test]
    fn test_child_control_marks_exit_before_reporting() {
        let (tx, rx) = mpsc::channel();
        let monitor = TerminationMonitor::new(2, 1, move |_, _, kind| {
            let _ = tx.send(kind);
        });

        let spawner = CommandSpawner::new("sh").args(["-c", "exit 0"]);
        let mut worker = spawner.spawn(2, monitor).unwrap();

        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(!worker.control.is_alive());
        worker.control.kill().unwrap();
    }

    #[test]
    fn test_local_spawner_serves_methods() {
        use serde_json::json;
        use std::io::{BufRead, BufReader};

        let spawner = LocalSpawner::new(|index| {
            Methods::new().method("whoami", move |_| Ok(json!(index)))
        });
        let mut worker = spawner.spawn(4, TerminationMonitor::detached(4)).unwrap();
        assert!(worker.control.id().is_none());
        assert!(worker.control.is_alive());

        worker
            .writer
            .write_all(b"{\"id\":\"a\",\"method\":\"whoami\",\"args\":[]}\n")
            .unwrap();
        let mut line = String::new();
        BufReader::new(&mut worker.reader).read_line(&mut line).unwrap();
        assert_eq!(line.trim(), r#"{"id":"a","result":4}"#);

        worker.control.kill().unwrap();
        worker.control.kill().unwrap();
        assert!(!worker.control.is_alive());
    }

    #[test]
    fn test_command_spawner_missing_program() {
        let spawner = CommandSpawner::new("/nonexistent/herd-worker");
        let err = spawner.spawn(0, TerminationMonitor::detached(0)).unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
    }
}
