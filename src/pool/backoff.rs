//! Retry scheduling for worker revival
//!
//! Exponential backoff with full jitter: the wait before attempt `n` is drawn
//! uniformly from `[0, min(max_delay, base_delay * multiplier^n))`. The first
//! attempt is delayed too unless `delay_first_attempt` is off. Sleeps are
//! interruptible through a [`ShutdownSignal`].

use rand::Rng;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Randomization applied to each computed delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Uniform draw between zero and the computed delay
    #[default]
    Full,
    /// Use the computed delay as is
    None,
}

/// Parameters for a capped exponential retry loop
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts before giving up (at least one is always made)
    pub max_attempts: u32,
    /// Delay for the first attempt before jitter
    pub base_delay: Duration,
    /// Ceiling for the computed delay
    pub max_delay: Duration,
    /// Growth factor between attempts
    pub multiplier: f64,
    pub jitter: Jitter,
    /// Wait before the first attempt as well
    pub delay_first_attempt: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: Jitter::Full,
            delay_first_attempt: true,
        }
    }
}

/// How a retry loop ended
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Succeeded { value: T, attempts: u32 },
    Exhausted { attempts: u32, last_error: E },
    Cancelled { attempts: u32 },
}

impl BackoffPolicy {
    /// Delay before jitter for the given exponent, capped at `max_delay`
    pub fn exponential_delay(&self, exponent: u32) -> Duration {
        let ceiling = self.max_delay.as_secs_f64();
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        if !secs.is_finite() || secs >= ceiling {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Wait before attempt `attempt` (zero-based), jitter applied
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let exponent = if self.delay_first_attempt {
            attempt
        } else if attempt == 0 {
            return Duration::ZERO;
        } else {
            attempt - 1
        };

        let delay = self.exponential_delay(exponent);
        match self.jitter {
            Jitter::None => delay,
            Jitter::Full => delay.mul_f64(rand::rng().random::<f64>()),
        }
    }

    /// Run `op` until it succeeds, the attempt cap is hit, or `signal` fires
    ///
    /// `op` receives the zero-based attempt number. The signal is checked
    /// before every attempt and before deciding to retry; an attempt already
    /// running is never interrupted.
    pub fn retry<T, E, F>(&self, signal: &ShutdownSignal, mut op: F) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let delay = self.delay_before(attempt);
            if !delay.is_zero() && !signal.sleep(delay) {
                return RetryOutcome::Cancelled { attempts: attempt };
            }
            if signal.is_triggered() {
                return RetryOutcome::Cancelled { attempts: attempt };
            }

            match op(attempt) {
                Ok(value) => {
                    return RetryOutcome::Succeeded {
                        value,
                        attempts: attempt + 1,
                    }
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return RetryOutcome::Exhausted {
                            attempts: attempt,
                            last_error: e,
                        };
                    }
                    if signal.is_triggered() {
                        return RetryOutcome::Cancelled { attempts: attempt };
                    }
                    tracing::debug!(attempt, max_attempts, error = %e, "Attempt failed, retrying");
                }
            }
        }
    }
}

/// One-way flag that also wakes sleepers
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag; returns `true` only for the call that flipped it
    pub fn trigger(&self) -> bool {
        let mut triggered = self.triggered.lock().unwrap_or_else(PoisonError::into_inner);
        let first = !*triggered;
        *triggered = true;
        self.cond.notify_all();
        first
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `duration` unless triggered first
    ///
    /// Returns `true` if the full duration elapsed, `false` if the signal
    /// fired (before or during the sleep).
    pub fn sleep(&self, duration: Duration) -> bool {
        let guard = self.triggered.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, duration, |triggered| !*triggered)
            .unwrap_or_else(PoisonError::into_inner);
        !*guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            jitter: Jitter::None,
            delay_first_attempt: true,
        }
    }

    #[test]
    fn test_exponential_delay_growth_and_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.exponential_delay(0), Duration::from_millis(100));
        assert_eq!(policy.exponential_delay(1), Duration::from_millis(200));
        assert_eq!(policy.exponential_delay(3), Duration::from_millis(800));
        assert_eq!(policy.exponential_delay(20), Duration::from_secs(30));
        assert_eq!(policy.exponential_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_first_attempt_delay() {
        let mut policy = fast_policy(3);
        assert_eq!(policy.delay_before(0), Duration::from_millis(1));

        policy.delay_first_attempt = false;
        assert_eq!(policy.delay_before(0), Duration::ZERO);
        assert_eq!(policy.delay_before(1), Duration::from_millis(1));
        assert_eq!(policy.delay_before(2), Duration::from_millis(2));
    }

    #[test]
    fn test_full_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::default();
        for attempt in 0..8 {
            let ceiling = policy.exponential_delay(attempt);
            for _ in 0..50 {
                assert!(policy.delay_before(attempt) <= ceiling);
            }
        }
    }

    #[test]
    fn test_retry_succeeds_after_failures() {
        let signal = ShutdownSignal::new();
        let mut calls = 0;
        let outcome: RetryOutcome<&str, String> = fast_policy(5).retry(&signal, |attempt| {
            calls += 1;
            if attempt < 2 {
                Err(format!("attempt {} failed", attempt))
            } else {
                Ok("ready")
            }
        });

        assert!(matches!(outcome, RetryOutcome::Succeeded { value: "ready", attempts: 3 }));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_exhausts_at_cap() {
        let signal = ShutdownSignal::new();
        let mut calls = 0;
        let outcome: RetryOutcome<(), String> = fast_policy(4).retry(&signal, |_| {
            calls += 1;
            Err("spawn failed".to_string())
        });

        match outcome {
            RetryOutcome::Exhausted { attempts, last_error } => {
                assert_eq!(attempts, 4);
                assert_eq!(last_error, "spawn failed");
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_retry_cancelled_before_first_attempt() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let mut calls = 0;
        let outcome: RetryOutcome<(), String> = fast_policy(4).retry(&signal, |_| {
            calls += 1;
            Ok(())
        });

        assert!(matches!(outcome, RetryOutcome::Cancelled { attempts: 0 }));
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_retry_cancelled_between_attempts() {
        let signal = ShutdownSignal::new();
        let outcome: RetryOutcome<(), String> = fast_policy(10).retry(&signal, |_| {
            signal.trigger();
            Err("failed".to_string())
        });

        assert!(matches!(outcome, RetryOutcome::Cancelled { attempts: 1 }));
    }

    #[test]
    fn test_signal_trigger_is_one_way() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.is_triggered());
        assert!(!signal.sleep(Duration::from_secs(10)));
    }

    #[test]
    fn test_signal_wakes_sleeper() {
        let signal = Arc::new(ShutdownSignal::new());
        let sleeper = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.sleep(Duration::from_secs(30)))
        };

        let started = Instant::now();
        thread::sleep(Duration::from_millis(20));
        signal.trigger();

        assert!(!sleeper.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_sleep_completes_without_trigger() {
        let signal = ShutdownSignal::new();
        assert!(signal.sleep(Duration::from_millis(5)));
    }
}
