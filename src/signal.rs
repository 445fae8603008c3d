//! Termination signals for long-running `herd serve`
//!
//! A background thread turns SIGINT, SIGTERM and SIGHUP into a trigger on a
//! [`ShutdownSignal`], so the serve loop can sleep between stats reports and
//! still wake as soon as a signal arrives.

use crate::pool::backoff::ShutdownSignal;
use anyhow::Result;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Forwards termination signals to a shutdown trigger
#[derive(Debug, Clone)]
pub struct SignalHandler {
    shutdown: Arc<ShutdownSignal>,
    /// Signal that triggered shutdown (0 if none)
    received: Arc<AtomicI32>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self {
            shutdown: Arc::new(ShutdownSignal::new()),
            received: Arc::new(AtomicI32::new(0)),
        }
    }

    /// Install handlers for SIGINT, SIGTERM and SIGHUP
    pub fn setup(&self) -> Result<()> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        let handler = self.clone();

        thread::Builder::new()
            .name("herd-signals".to_string())
            .spawn(move || {
                for sig in signals.forever() {
                    tracing::info!(signal = sig, "Received termination signal");
                    handler.record(sig);
                }
            })?;

        Ok(())
    }

    fn record(&self, sig: i32) {
        let _ = self
            .received
            .compare_exchange(0, sig, Ordering::SeqCst, Ordering::SeqCst);
        self.shutdown.trigger();
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Sleep for `duration`; returns `false` early once shutdown is requested
    pub fn sleep(&self, duration: Duration) -> bool {
        self.shutdown.sleep(duration)
    }

    pub fn signal_number(&self) -> i32 {
        self.received.load(Ordering::SeqCst)
    }

    /// Conventional exit code for the received signal (128 + signal)
    pub fn exit_code(&self) -> i32 {
        match self.signal_number() {
            SIGINT => 130,
            SIGTERM => 143,
            SIGHUP => 129,
            _ => 0,
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_handler_creation() {
        let handler = SignalHandler::new();
        assert!(!handler.should_shutdown());
        assert_eq!(handler.signal_number(), 0);
        assert_eq!(handler.exit_code(), 0);
    }

    #[test]
    fn test_signal_handler_setup() {
        let handler = SignalHandler::new();
        assert!(handler.setup().is_ok());
    }

    #[test]
    fn test_first_signal_wins() {
        let handler = SignalHandler::new();
        handler.record(SIGTERM);
        handler.record(SIGINT);

        assert!(handler.should_shutdown());
        assert_eq!(handler.signal_number(), SIGTERM);
        assert_eq!(handler.exit_code(), 143);
        assert!(!handler.sleep(Duration::from_secs(5)));
    }

    #[test]
    fn test_record_wakes_sleeper() {
        let handler = SignalHandler::new();
        let waker = handler.clone();
        let sleeper = thread::spawn(move || waker.sleep(Duration::from_secs(30)));

        thread::sleep(Duration::from_millis(20));
        handler.record(SIGHUP);

        assert!(!sleeper.join().unwrap());
        assert_eq!(handler.exit_code(), 129);
    }
}
