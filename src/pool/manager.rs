//! Cluster manager: a fixed set of slots with supervised revival
//!
//! ## Lifecycle
//! - Spawn every slot concurrently at construction; failures surface
//!   immediately and are not retried
//! - `init` / `bootstrap` broadcast to every live worker and cache their
//!   parameters for workers spawned later
//! - A worker that dies while the pool is active is removed from its slot
//!   and revived under the backoff policy: spawn, replay `init` then
//!   `bootstrap`, install
//! - `destroy` stops revival, asks every worker to shut down and kills it
//!
//! Per slot: `Spawning → Ready → (Dead → Reviving → Spawning)* → Terminated`.
//! Pool: `Active → Destroying → Destroyed`.

use crate::error::{PoolError, RpcError};
use crate::pool::backoff::{BackoffPolicy, RetryOutcome, ShutdownSignal};
use crate::pool::process::{CommandSpawner, Spawner, TerminationKind, TerminationMonitor};
use crate::pool::slot::{Lifecycle, Slot, Worker};
use crate::rpc::caller::{CallerSide, PendingReply, RemoteMethod, RemoteProxy};
use crate::rpc::expose::LIFECYCLE_METHODS;
use anyhow::anyhow;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Default wait for a worker to answer the remote `destroy`
pub const DEFAULT_DESTROY_GRACE: Duration = Duration::from_secs(2);

/// Pool construction options
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Number of slots; defaults to the number of CPUs
    pub size: Option<usize>,
    /// Methods the per-slot proxies expose; must include the lifecycle methods
    pub methods: Vec<String>,
    /// Retry policy for revival
    pub backoff: BackoffPolicy,
    /// How long `destroy` waits for each worker's remote `destroy`
    pub destroy_grace: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: None,
            methods: LIFECYCLE_METHODS.iter().map(|m| m.to_string()).collect(),
            backoff: BackoffPolicy::default(),
            destroy_grace: DEFAULT_DESTROY_GRACE,
        }
    }
}

impl PoolOptions {
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Declare extra methods on top of the lifecycle ones
    pub fn methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for method in methods {
            let method = method.into();
            if !self.methods.contains(&method) {
                self.methods.push(method);
            }
        }
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn destroy_grace(mut self, grace: Duration) -> Self {
        self.destroy_grace = grace;
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_slots: usize,
    pub live_workers: usize,
    pub reviving: usize,
    pub crashes_observed: u64,
    pub revivals_succeeded: u64,
    pub revivals_abandoned: u64,
    pub destroyed: bool,
}

#[derive(Debug, Default)]
struct Counters {
    crashes_observed: u64,
    revivals_succeeded: u64,
    revivals_abandoned: u64,
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<Slot>,
    reviving: HashSet<usize>,
    init_params: Option<Value>,
    bootstrap_params: Option<Value>,
    /// Bumped whenever cached parameters change
    params_epoch: u64,
    counters: Counters,
}

struct Shared {
    spawner: Box<dyn Spawner>,
    methods: Vec<String>,
    backoff: BackoffPolicy,
    destroy_grace: Duration,
    destroying: ShutdownSignal,
    next_generation: AtomicU64,
    state: Mutex<PoolState>,
    /// Notified whenever a slot or the reviving set changes
    changed: Condvar,
}

/// Owns a fixed-size pool of supervised workers
///
/// Dropping the manager destroys the pool.
pub struct ClusterManager {
    shared: Arc<Shared>,
}

impl ClusterManager {
    /// Spawn a pool of `script` processes
    pub fn new(script: impl Into<PathBuf>, options: PoolOptions) -> Result<Self, PoolError> {
        Self::with_spawner(CommandSpawner::new(script), options)
    }

    /// Spawn a pool using a custom spawner
    ///
    /// # Errors
    ///
    /// Fails on an invalid size or method declaration, or when any slot's
    /// initial spawn fails. Workers that did start are killed first.
    pub fn with_spawner<S>(spawner: S, options: PoolOptions) -> Result<Self, PoolError>
    where
        S: Spawner + 'static,
    {
        let size = match options.size {
            Some(0) => return Err(PoolError::InvalidSize),
            Some(size) => size,
            None => num_cpus::get().max(1),
        };

        for name in LIFECYCLE_METHODS {
            if !options.methods.iter().any(|method| method == name) {
                return Err(PoolError::MissingLifecycleMethod(name));
            }
        }
        CallerSide::new(options.methods.iter().cloned()).map_err(PoolError::Declaration)?;

        let shared = Arc::new(Shared {
            spawner: Box::new(spawner),
            methods: options.methods,
            backoff: options.backoff,
            destroy_grace: options.destroy_grace,
            destroying: ShutdownSignal::new(),
            next_generation: AtomicU64::new(0),
            state: Mutex::new(PoolState {
                slots: (0..size).map(Slot::new).collect(),
                reviving: HashSet::new(),
                init_params: None,
                bootstrap_params: None,
                params_epoch: 0,
                counters: Counters::default(),
            }),
            changed: Condvar::new(),
        });

        let spawned: Vec<Result<Worker, PoolError>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..size)
                .map(|index| {
                    let shared = &shared;
                    (index, scope.spawn(move || shared.spawn_worker(index)))
                })
                .collect();

            handles
                .into_iter()
                .map(|(index, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(PoolError::Spawn {
                            index,
                            source: anyhow!("spawn thread panicked"),
                        })
                    })
                })
                .collect()
        });

        if spawned.iter().any(Result::is_err) {
            shared.destroying.trigger();
            let mut first_error = None;
            for result in spawned {
                match result {
                    Ok(worker) => worker.kill(),
                    Err(e) => {
                        tracing::error!(error = %e, "Initial spawn failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
            return Err(first_error.unwrap_or(PoolError::Destroyed));
        }

        let workers: Vec<Worker> = spawned.into_iter().flatten().collect();
        let mut early_deaths = Vec::new();
        {
            let mut state = shared.lock_state();
            for worker in workers {
                let index = worker.index();
                if worker.is_dead() {
                    early_deaths.push((index, worker.generation()));
                }
                state.slots[index].install(worker);
            }
        }
        shared.changed.notify_all();

        // Reports that arrived before installation were dropped as stale
        for (index, generation) in early_deaths {
            shared.on_termination(
                index,
                generation,
                TerminationKind::Error("died during startup".to_string()),
            );
        }

        tracing::info!(size, methods = ?shared.methods, "Worker pool started");
        Ok(Self { shared })
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.shared.lock_state().slots.len()
    }

    /// Initialize every live worker with `init(index, params)`
    ///
    /// `params` (or `null`) is cached before the broadcast so that revived
    /// workers receive it too, even if some workers fail here.
    pub fn init(&self, params: Option<Value>) -> Result<(), PoolError> {
        let params = params.unwrap_or(Value::Null);
        let targets = self.shared.cache_params(|state| {
            state.init_params = Some(params.clone());
        })?;
        let targets = targets.into_iter().map(|(index, lifecycle)| (index, lifecycle.init));
        broadcast("init", targets.collect(), |index| vec![json!(index), params.clone()])
    }

    /// Bootstrap every live worker with `bootstrap(params)`
    ///
    /// Callers are expected to let `init` complete first.
    pub fn bootstrap(&self, params: Option<Value>) -> Result<(), PoolError> {
        let params = params.unwrap_or(Value::Null);
        let targets = self.shared.cache_params(|state| {
            state.bootstrap_params = Some(params.clone());
        })?;
        let targets = targets
            .into_iter()
            .map(|(index, lifecycle)| (index, lifecycle.bootstrap));
        broadcast("bootstrap", targets.collect(), |_| vec![params.clone()])
    }

    /// Shut down every worker and stop all revival
    ///
    /// Safe to call more than once; later calls find every slot empty.
    pub fn destroy(&self) {
        self.shared.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroying.is_triggered()
    }

    /// Proxy for slot `index`, if it currently holds a worker
    pub fn proxy(&self, index: usize) -> Option<RemoteProxy> {
        self.shared.lock_state().slots.get(index).and_then(Slot::proxy)
    }

    /// Proxies for every slot, in slot order
    pub fn proxies(&self) -> Vec<Option<RemoteProxy>> {
        self.shared.lock_state().slots.iter().map(Slot::proxy).collect()
    }

    /// Process IDs of the current workers, in slot order
    pub fn worker_pids(&self) -> Vec<Option<u32>> {
        self.shared
            .lock_state()
            .slots
            .iter()
            .map(|slot| slot.worker().and_then(Worker::pid))
            .collect()
    }

    pub fn is_reviving(&self, index: usize) -> bool {
        self.shared.lock_state().reviving.contains(&index)
    }

    /// Start revival of an empty slot, such as one whose revival gave up
    ///
    /// Returns `Ok(false)` when the slot is occupied or already reviving.
    pub fn revive(&self, index: usize) -> Result<bool, PoolError> {
        if self.shared.destroying.is_triggered() {
            return Err(PoolError::Destroyed);
        }
        let size = self.size();
        if index >= size {
            return Err(PoolError::NoSuchSlot { index, size });
        }
        Ok(self.shared.start_revival(index))
    }

    /// Block until slot `index` holds a worker, the pool is destroyed, or
    /// `timeout` passes
    pub fn wait_for_slot(&self, index: usize, timeout: Duration) -> Option<RemoteProxy> {
        let destroying = &self.shared.destroying;
        let state = self.shared.wait_while(timeout, |state| {
            !destroying.is_triggered() && state.slots.get(index).is_some_and(Slot::is_empty)
        });
        state.slots.get(index).and_then(Slot::proxy)
    }

    /// Block until no revival is in flight or `timeout` passes
    ///
    /// Returns `true` if the reviving set is empty on return.
    pub fn wait_for_revivals(&self, timeout: Duration) -> bool {
        let state = self.shared.wait_while(timeout, |state| !state.reviving.is_empty());
        state.reviving.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock_state();
        PoolStats {
            total_slots: state.slots.len(),
            live_workers: state.slots.iter().filter(|slot| !slot.is_empty()).count(),
            reviving: state.reviving.len(),
            crashes_observed: state.counters.crashes_observed,
            revivals_succeeded: state.counters.revivals_succeeded,
            revivals_abandoned: state.counters.revivals_abandoned,
            destroyed: self.shared.destroying.is_triggered(),
        }
    }
}

impl Drop for ClusterManager {
    fn drop(&mut self) {
        self.shared.destroy();
    }
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Send `method` to every target, then wait for every reply
fn broadcast<F>(
    method: &'static str,
    targets: Vec<(usize, RemoteMethod)>,
    args: F,
) -> Result<(), PoolError>
where
    F: Fn(usize) -> Vec<Value>,
{
    let sent: Vec<(usize, Result<PendingReply, RpcError>)> = targets
        .iter()
        .map(|(index, remote)| (*index, remote.call(args(*index))))
        .collect();

    let failures: Vec<(usize, RpcError)> = sent
        .into_iter()
        .filter_map(|(index, sent)| {
            sent.and_then(PendingReply::wait)
                .err()
                .map(|e| (index, e))
        })
        .collect();

    tracing::debug!(method, workers = targets.len(), failed = failures.len(), "Broadcast settled");

    if failures.is_empty() {
        Ok(())
    } else {
        Err(PoolError::Broadcast { method, failures })
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_while<F>(&self, timeout: Duration, mut condition: F) -> MutexGuard<'_, PoolState>
    where
        F: FnMut(&PoolState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        while condition(&*state) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            state = self
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state
    }

    /// Update cached parameters and collect the live workers to broadcast to
    fn cache_params<F>(&self, update: F) -> Result<Vec<(usize, Lifecycle)>, PoolError>
    where
        F: FnOnce(&mut PoolState),
    {
        if self.destroying.is_triggered() {
            return Err(PoolError::Destroyed);
        }
        let mut state = self.lock_state();
        update(&mut state);
        state.params_epoch += 1;
        Ok(state
            .slots
            .iter()
            .filter_map(|slot| {
                slot.worker()
                    .map(|worker| (slot.index(), worker.lifecycle().clone()))
            })
            .collect())
    }

    fn spawn_worker(self: &Arc<Self>, index: usize) -> Result<Worker, PoolError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let weak = Arc::downgrade(self);
        let monitor = TerminationMonitor::new(index, generation, move |index, generation, kind| {
            if let Some(shared) = weak.upgrade() {
                shared.on_termination(index, generation, kind);
            }
        });

        let spawned = self
            .spawner
            .spawn(index, monitor.clone())
            .map_err(|source| PoolError::Spawn { index, source })?;

        Worker::connect(index, spawned, monitor, &self.methods)
    }

    /// Crash handling for an abnormal termination signal
    fn on_termination(self: &Arc<Self>, index: usize, generation: u64, kind: TerminationKind) {
        if self.destroying.is_triggered() {
            tracing::trace!(worker = index, %kind, "Ignoring termination during destroy");
            return;
        }

        let dead = {
            let mut state = self.lock_state();
            let Some(slot) = state.slots.get_mut(index) else {
                return;
            };
            if slot.generation() != Some(generation) {
                tracing::trace!(worker = index, generation, %kind, "Ignoring stale termination signal");
                return;
            }
            let dead = slot.take();
            state.counters.crashes_observed += 1;
            dead
        };
        self.changed.notify_all();

        tracing::warn!(worker = index, kind = kind.label(), detail = %kind, "Worker terminated abnormally");

        if let Some(worker) = dead {
            worker.kill();
        }
        self.start_revival(index);
    }

    /// Begin supervised revival unless one is already running for `index`
    fn start_revival(self: &Arc<Self>, index: usize) -> bool {
        {
            let mut state = self.lock_state();
            if self.destroying.is_triggered()
                || !state.slots.get(index).is_some_and(Slot::is_empty)
                || !state.reviving.insert(index)
            {
                return false;
            }
        }
        self.changed.notify_all();

        let shared = Arc::clone(self);
        let started = thread::Builder::new()
            .name(format!("revive-{}", index))
            .spawn(move || shared.revive_loop(index));

        if let Err(e) = started {
            tracing::error!(worker = index, error = %e, "Failed to start revival");
            self.lock_state().reviving.remove(&index);
            self.changed.notify_all();
            return false;
        }
        true
    }

    fn revive_loop(self: &Arc<Self>, index: usize) {
        tracing::info!(worker = index, "Reviving worker");

        let outcome = self
            .backoff
            .retry(&self.destroying, |attempt| self.revive_attempt(index, attempt));

        // A successful attempt clears the marker itself, atomically with install
        if let RetryOutcome::Succeeded { attempts, .. } = outcome {
            tracing::info!(worker = index, attempts, "Worker revived");
            return;
        }

        {
            let mut state = self.lock_state();
            state.reviving.remove(&index);
            match &outcome {
                RetryOutcome::Exhausted { .. } if !self.destroying.is_triggered() => {
                    state.counters.revivals_abandoned += 1;
                }
                _ => {}
            }
        }
        self.changed.notify_all();

        match outcome {
            RetryOutcome::Exhausted { attempts, last_error } if !self.destroying.is_triggered() => {
                tracing::error!(
                    worker = index,
                    attempts,
                    error = %last_error,
                    "Giving up on worker; slot stays empty"
                );
            }
            _ => tracing::debug!(worker = index, "Revival stopped by destroy"),
        }
    }

    /// One revival attempt: spawn, replay lifecycle parameters, install
    fn revive_attempt(self: &Arc<Self>, index: usize, attempt: u32) -> Result<(), PoolError> {
        if self.destroying.is_triggered() {
            return Err(PoolError::Destroyed);
        }

        tracing::debug!(worker = index, attempt, "Revival attempt");
        let worker = self.spawn_worker(index)?;

        loop {
            let (init, bootstrap, epoch) = {
                let state = self.lock_state();
                (
                    state.init_params.clone(),
                    state.bootstrap_params.clone(),
                    state.params_epoch,
                )
            };

            if let Err(e) = replay(&worker, index, init, bootstrap) {
                worker.kill();
                return Err(e);
            }

            let mut state = self.lock_state();
            if self.destroying.is_triggered() {
                drop(state);
                worker.kill();
                return Err(PoolError::Destroyed);
            }
            if worker.is_dead() {
                drop(state);
                worker.kill();
                return Err(PoolError::DiedBeforeReady(index));
            }
            if state.params_epoch != epoch {
                // init or bootstrap ran while replaying; catch up before installing
                continue;
            }

            let displaced = state.slots[index].install(worker);
            state.reviving.remove(&index);
            state.counters.revivals_succeeded += 1;
            drop(state);
            self.changed.notify_all();

            if let Some(old) = displaced {
                old.kill();
            }
            return Ok(());
        }
    }

    fn destroy(&self) {
        let first = self.destroying.trigger();
        let workers: Vec<Worker> = {
            let mut state = self.lock_state();
            state.slots.iter_mut().filter_map(Slot::take).collect()
        };
        self.changed.notify_all();

        if first {
            tracing::info!(workers = workers.len(), "Destroying worker pool");
        }

        let grace = self.destroy_grace;
        thread::scope(|scope| {
            for worker in workers {
                scope.spawn(move || worker.destroy(grace));
            }
        });
    }
}

/// Send the cached lifecycle calls to a freshly spawned worker
fn replay(
    worker: &Worker,
    index: usize,
    init: Option<Value>,
    bootstrap: Option<Value>,
) -> Result<(), PoolError> {
    if let Some(params) = init {
        worker
            .lifecycle()
            .init
            .invoke(vec![json!(index), params])
            .map_err(|source| PoolError::Replay {
                method: "init",
                index,
                source,
            })?;
    }
    if let Some(params) = bootstrap {
        worker
            .lifecycle()
            .bootstrap
            .invoke(vec![params])
            .map_err(|source| PoolError::Replay {
                method: "bootstrap",
                index,
                source,
            })?;
    }
    Ok(())
}
