//! Interval primitives for bounded waits: the Fibonacci backoff schedule and
//! a cancellation signal that every timed sleep races against.

use std::time::Duration;
use tokio::sync::watch;

/// Delay schedule for empty polls, in milliseconds
pub const FIBONACCI_DELAYS_MS: [u64; 16] = [
    1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233, 377, 610, 987,
];

/// Step state for one bounded-wait call. Advances once per empty poll and
/// stays on the last delay once the schedule is exhausted.
#[derive(Debug, Clone, Default)]
pub struct FibonacciBackoff {
    step: usize,
}

impl FibonacciBackoff {
    pub fn new() -> Self {
        Self { step: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let index = self.step.min(FIBONACCI_DELAYS_MS.len() - 1);
        self.step = self.step.saturating_add(1);
        Duration::from_millis(FIBONACCI_DELAYS_MS[index])
    }

    pub fn step(&self) -> usize {
        self.step
    }
}

/// Cloneable cancellation signal. Once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: watch::Sender<bool>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has been cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Sleep for `duration` unless `signal` fires first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(duration: Duration, signal: &CancelSignal) -> bool {
    if signal.is_cancelled() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = signal.cancelled() => false,
    }
}
