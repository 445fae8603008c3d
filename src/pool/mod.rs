/// Supervised worker pool
///
/// - `backoff`: retry policy and the shutdown signal that cancels it
/// - `process`: spawning workers and reporting their termination
/// - `slot`: a slot and the worker currently occupying it
/// - `manager`: the cluster manager tying these together

pub mod backoff;
pub mod manager;
pub mod process;
pub mod slot;

pub use backoff::{BackoffPolicy, Jitter, RetryOutcome, ShutdownSignal};
pub use manager::{ClusterManager, PoolOptions, PoolStats, DEFAULT_DESTROY_GRACE};
pub use process::{
    CommandSpawner, LocalSpawner, ProcessControl, SpawnedWorker, Spawner, TerminationKind,
    TerminationMonitor,
};
pub use slot::{Lifecycle, Slot, Worker};
