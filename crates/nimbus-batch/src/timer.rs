//! Window timers.
//!
//! The scheduler never reads the clock for grouping decisions, but it does
//! need something to fire once a batch window has elapsed. Hosts can plug in
//! their own [`Timer`]; [`TokioTimer`] is the default.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Callback run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Schedules a callback after a delay.
pub trait Timer: Send + Sync {
    /// Run `callback` once `delay` has elapsed, unless the returned handle is
    /// cancelled first.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;
}

/// Handle to a pending timer.
///
/// Cancelling is idempotent: cancelling a timer that already fired or was
/// already cancelled does nothing.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called on any clone.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Timer backed by `tokio::time::sleep`.
///
/// Must be used from within a Tokio runtime. Under a paused test clock the
/// timer follows virtual time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let handle = TimerHandle::new();
        let pending = handle.clone();
        let deadline = tokio::time::Instant::now() + delay;

        tokio::spawn(async move {
            tokio::select! {
                _ = pending.cancelled() => {
                    tracing::trace!("Timer cancelled before firing");
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if !pending.is_cancelled() {
                        callback();
                    }
                }
            }
        });

        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn settle_tasks() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let _handle = TokioTimer.schedule(Duration::from_millis(500), counting_callback(&fired));

        settle_tasks().await;
        tokio::time::advance(Duration::from_millis(499)).await;
        settle_tasks().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle_tasks().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = TokioTimer.schedule(Duration::from_millis(500), counting_callback(&fired));

        handle.cancel();
        tokio::time::advance(Duration::from_secs(2)).await;
        settle_tasks().await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = TokioTimer.schedule(Duration::from_millis(10), counting_callback(&fired));

        settle_tasks().await;
        tokio::time::advance(Duration::from_millis(10)).await;
        settle_tasks().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Cancelling after the fire and cancelling twice are both no-ops
        handle.cancel();
        handle.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_resolves_on_any_clone() {
        let handle = TimerHandle::new();
        let waiter = handle.clone();

        let waiting = tokio::spawn(async move { waiter.cancelled().await });
        settle_tasks().await;
        assert!(!waiting.is_finished());

        handle.cancel();
        waiting.await.unwrap();
        assert!(handle.is_cancelled());
    }
}
