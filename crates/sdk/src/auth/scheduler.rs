//! One-shot refresh timer.
//!
//! At most one timer is armed at a time; arming replaces and cancels any
//! previously armed timer. The timer task only sleeps and then invokes the
//! callback, so aborting it never interrupts a refresh already in flight.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Schedules the proactive refresh ahead of access-token expiry.
pub struct RefreshScheduler {
    armed: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
    /// Create a scheduler with no timer armed.
    #[must_use]
    pub fn new() -> Self {
        Self { armed: Mutex::new(None) }
    }

    /// Arm the timer to fire `delay` from now, replacing any armed timer.
    ///
    /// The callback runs on the runtime that called `arm`.
    pub fn arm<F, Fut>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback().await;
        });

        debug!(delay_secs = delay.as_secs(), "refresh timer armed");
        if let Some(previous) = self.armed.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Cancel the armed timer, if any.
    pub fn cancel(&self) {
        if let Some(handle) = self.armed.lock().take() {
            handle.abort();
            debug!("refresh timer cancelled");
        }
    }

    /// Whether a timer is currently armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Default for RefreshScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.armed.get_mut().take() {
            handle.abort();
        }
    }
}
