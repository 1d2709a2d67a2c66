//! Cancellable periodic work.
//!
//! Every polling loop in the crate (relay connection checks, first-piece checks,
//! telemetry sampling, presence heartbeats) goes through these types, so that
//! tearing down the owner stops the loop instead of leaving it holding live
//! network sessions.

use std::{future::Future, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{interval, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// An interval that stops yielding once its token is cancelled.
pub struct Ticker {
    interval: Interval,
    token: CancellationToken,
}

impl Ticker {
    /// Creates a ticker whose first tick completes immediately.
    pub fn new(period: Duration, token: CancellationToken) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self { interval, token }
    }

    /// Creates a ticker whose first tick completes after one period.
    pub fn delayed(period: Duration, token: CancellationToken) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self { interval, token }
    }

    /// Waits for the next tick.
    /// Returns `None` once the ticker is cancelled.
    pub async fn tick(&mut self) -> Option<Instant> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            instant = self.interval.tick() => Some(instant),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A spawned task running a closure at a fixed interval until cancelled.
/// Dropping the task cancels it.
pub struct PeriodicTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawns a task calling `f` on every tick, starting immediately.
    pub fn spawn<F>(period: Duration, mut f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::spawn_async(period, move || {
            f();
            async {}
        })
    }

    /// Spawns a task awaiting `f` on every tick, starting immediately.
    pub fn spawn_async<F, Fut>(period: Duration, mut f: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let token = CancellationToken::new();
        let mut ticker = Ticker::new(period, token.clone());

        let handle = tokio::spawn(async move {
            while ticker.tick().await.is_some() {
                f().await;
            }
        });

        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Stops the task. The closure is not called again after this returns.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Stops the task and waits for it to wind down.
    pub async fn shutdown(mut self) {
        self.token.cancel();

        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_runs_until_cancelled() {
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();

        let task = PeriodicTask::spawn(Duration::from_secs(1), move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Ticks at 0s, 1s, 2s and 3s
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);

        task.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4, "no ticks after cancel");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_task_cancels_it() {
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();

        let task = PeriodicTask::spawn(Duration::from_secs(1), move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(task);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_yields_none_once_cancelled() {
        let token = CancellationToken::new();
        let mut ticker = Ticker::delayed(Duration::from_secs(2), token.clone());

        let start = Instant::now();
        assert!(ticker.tick().await.is_some());
        assert_eq!(start.elapsed(), Duration::from_secs(2));

        token.cancel();
        assert!(ticker.tick().await.is_none());
        assert!(ticker.is_cancelled());
    }
}
