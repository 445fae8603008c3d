//! Error types for the worker pool
//!
//! Each layer has its own enum: [`RpcError`] for the call protocol,
//! [`PoolError`] for the cluster manager and [`ConfigError`] for
//! configuration loading.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the correlated call protocol
#[derive(Debug, Error)]
pub enum RpcError {
    /// The process was not launched as a pool worker
    #[error("Not running inside a worker: {0}")]
    NotInWorker(String),

    /// The declared method set is unusable (empty or duplicate names)
    #[error("Invalid method declaration: {0}")]
    InvalidDeclaration(String),

    /// The proxy was asked for a method it was not constructed with
    #[error("Method {0} was not declared on this proxy")]
    UndeclaredMethod(String),

    /// The remote method failed, or does not exist on the remote side
    #[error("{0}")]
    Remote(String),

    /// The channel closed before a response arrived
    #[error("Worker channel closed before a response arrived")]
    Disconnected,

    /// No response within the caller-imposed deadline
    #[error("No response within {0:?}")]
    Timeout(std::time::Duration),

    /// Encoding failure on the way out
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error while writing to the channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// The message carried by a remote failure, if this is one
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            RpcError::Remote(message) => Some(message),
            _ => None,
        }
    }
}

/// Errors produced by the cluster manager
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool size must be at least one
    #[error("Pool size must be a positive integer")]
    InvalidSize,

    /// The declared method set was rejected by the caller side
    #[error("Invalid method declaration: {0}")]
    Declaration(#[source] RpcError),

    /// A lifecycle method is missing from the declared method set
    #[error("Declared methods must include the lifecycle method '{0}'")]
    MissingLifecycleMethod(&'static str),

    /// Spawning the worker for a slot failed
    #[error("Failed to spawn worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    /// Building the caller side for a freshly spawned worker failed
    #[error("Failed to connect to worker {index}: {source}")]
    Connect {
        index: usize,
        #[source]
        source: RpcError,
    },

    /// One or more workers failed a pool-wide call
    #[error("{method} failed on {} worker(s): {}", .failures.len(), summarize(.failures))]
    Broadcast {
        method: &'static str,
        failures: Vec<(usize, RpcError)>,
    },

    /// A replayed lifecycle call failed on a revived worker
    #[error("Replaying {method} on worker {index} failed: {source}")]
    Replay {
        method: &'static str,
        index: usize,
        #[source]
        source: RpcError,
    },

    /// The worker died before it could be installed in its slot
    #[error("Worker {0} died before it was ready")]
    DiedBeforeReady(usize),

    /// Slot index outside the pool
    #[error("Slot {index} is out of range (pool size {size})")]
    NoSuchSlot { index: usize, size: usize },

    /// The pool is being (or has been) destroyed
    #[error("Pool is destroyed")]
    Destroyed,
}

fn summarize(failures: &[(usize, RpcError)]) -> String {
    failures
        .iter()
        .map(|(index, err)| format!("[{}] {}", index, err))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors produced while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
