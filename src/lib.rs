//! Supervised worker-process pool
//!
//! A [`ClusterManager`](pool::ClusterManager) runs a fixed number of worker
//! processes, talks to each over a correlated JSONL call protocol
//! ([`rpc`]), broadcasts `init` / `bootstrap`, and revives crashed workers
//! under a backoff policy, replaying the cached lifecycle parameters.

pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod rpc;
pub mod signal;

pub use error::{ConfigError, PoolError, RpcError};
pub use pool::{ClusterManager, PoolOptions, PoolStats};
pub use rpc::{ExposeSide, Methods, RemoteProxy};
