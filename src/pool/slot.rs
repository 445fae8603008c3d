//! Slots and the workers that occupy them

use crate::error::PoolError;
use crate::pool::process::{ProcessControl, SpawnedWorker, TerminationMonitor};
use crate::rpc::caller::{CallerSide, RemoteMethod, RemoteProxy};
use crate::rpc::expose::LIFECYCLE_METHODS;
use std::time::Duration;

/// A worker's lifecycle methods, bound when it connects
#[derive(Clone)]
pub struct Lifecycle {
    pub init: RemoteMethod,
    pub bootstrap: RemoteMethod,
    pub destroy: RemoteMethod,
}

/// A live worker: its proxy and its process
pub struct Worker {
    index: usize,
    generation: u64,
    proxy: RemoteProxy,
    lifecycle: Lifecycle,
    control: Box<dyn ProcessControl>,
    monitor: TerminationMonitor,
}

impl Worker {
    /// Bind the caller side to a spawned worker's channel
    ///
    /// Channel faults are reported through `monitor`. The lifecycle methods
    /// must be among `methods`. On failure the process is killed before the
    /// error is returned.
    pub fn connect(
        index: usize,
        spawned: SpawnedWorker,
        monitor: TerminationMonitor,
        methods: &[String],
    ) -> Result<Self, PoolError> {
        let SpawnedWorker {
            reader,
            writer,
            mut control,
        } = spawned;

        let fault_monitor = monitor.clone();
        let proxy = CallerSide::new(methods.iter().cloned())
            .map(|side| {
                side.label(format!("worker-{}", index))
                    .on_fault(move |fault| fault_monitor.report(fault.into()))
            })
            .and_then(|side| side.connect(reader, writer))
            .and_then(|proxy| {
                let [init, bootstrap, destroy] = proxy.bind(LIFECYCLE_METHODS)?;
                let lifecycle = Lifecycle {
                    init,
                    bootstrap,
                    destroy,
                };
                Ok((proxy, lifecycle))
            });

        match proxy {
            Ok((proxy, lifecycle)) => Ok(Self {
                index,
                generation: monitor.generation(),
                proxy,
                lifecycle,
                control,
                monitor,
            }),
            Err(source) => {
                let _ = control.kill();
                Err(PoolError::Connect { index, source })
            }
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn proxy(&self) -> &RemoteProxy {
        &self.proxy
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.id()
    }

    /// Whether a termination signal has been seen for this worker
    pub fn is_dead(&self) -> bool {
        self.monitor.is_dead()
    }

    /// Ask the worker to shut down, then kill it regardless
    ///
    /// The remote `destroy` is best-effort: failures and a reply slower than
    /// `grace` are ignored. It is skipped for a worker already known dead or
    /// whose process is gone.
    pub fn destroy(self, grace: Duration) {
        if !self.is_dead() && self.control.is_alive() {
            let outcome = self
                .lifecycle
                .destroy
                .call(Vec::new())
                .and_then(|pending| pending.wait_timeout(grace));
            if let Err(e) = outcome {
                tracing::debug!(worker = self.index, error = %e, "Remote destroy failed");
            }
        }
        self.kill();
    }

    /// Kill the process without asking
    pub fn kill(mut self) {
        if let Err(e) = self.control.kill() {
            tracing::debug!(worker = self.index, error = %e, "Failed to kill worker");
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("pid", &self.pid())
            .field("dead", &self.is_dead())
            .finish()
    }
}

/// One stable position in the pool
#[derive(Debug)]
pub struct Slot {
    index: usize,
    worker: Option<Worker>,
}

impl Slot {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            worker: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_empty(&self) -> bool {
        self.worker.is_none()
    }

    pub fn worker(&self) -> Option<&Worker> {
        self.worker.as_ref()
    }

    /// Generation of the current worker, if any
    pub fn generation(&self) -> Option<u64> {
        self.worker.as_ref().map(Worker::generation)
    }

    pub fn proxy(&self) -> Option<RemoteProxy> {
        self.worker.as_ref().map(|worker| worker.proxy().clone())
    }

    /// Empty the slot, handing back its worker
    pub fn take(&mut self) -> Option<Worker> {
        self.worker.take()
    }

    /// Put a worker in the slot, returning any worker it displaced
    pub fn install(&mut self, worker: Worker) -> Option<Worker> {
        self.worker.replace(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use std::io::{self, Read};
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    /// Control for a process that has already been reaped
    struct Reaped;

    impl ProcessControl for Reaped {
        fn id(&self) -> Option<u32> {
            None
        }

        fn kill(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn is_alive(&self) -> bool {
            false
        }
    }

    fn lifecycle_names() -> Vec<String> {
        LIFECYCLE_METHODS.iter().map(|name| name.to_string()).collect()
    }

    fn spawned(channel: UnixStream, control: Box<dyn ProcessControl>) -> SpawnedWorker {
        SpawnedWorker {
            reader: Box::new(channel.try_clone().unwrap()),
            writer: Box::new(channel),
            control,
        }
    }

    #[test]
    fn test_connect_requires_lifecycle_methods() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let err = Worker::connect(
            3,
            spawned(ours, Box::new(Reaped)),
            TerminationMonitor::detached(3),
            &["ping".to_string()],
        )
        .unwrap_err();

        assert!(matches!(
            err,
            PoolError::Connect {
                index: 3,
                source: RpcError::UndeclaredMethod(_)
            }
        ));
    }

    #[test]
    fn test_destroy_skips_remote_call_for_reaped_process() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let worker = Worker::connect(
            0,
            spawned(ours, Box::new(Reaped)),
            TerminationMonitor::detached(0),
            &lifecycle_names(),
        )
        .unwrap();
        assert_eq!(worker.lifecycle().destroy.name(), "destroy");

        let started = Instant::now();
        worker.destroy(Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(1));

        // Nothing was written to the channel
        theirs.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 64];
        let read = (&theirs).read(&mut buf);
        assert!(matches!(read, Err(ref e) if e.kind() == io::ErrorKind::WouldBlock));
    }
}
