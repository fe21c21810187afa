//! Cancellable repeating task.
//!
//! Built on `tokio::time`, so tests running with a paused clock step ticks
//! deterministically.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Shortest period accepted; `tokio::time::interval` rejects zero.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Stop,
}

#[derive(Debug)]
pub struct ScheduledTask {
    task: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Runs `tick` now and then every `period` until it returns
    /// [`TickControl::Stop`] or the task is cancelled. A slow tick delays the
    /// next one instead of bursting to catch up. Periods below [`MIN_PERIOD`]
    /// are raised to it.
    pub fn spawn_repeating<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickControl> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period.max(MIN_PERIOD));
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                if tick().await == TickControl::Stop {
                    break;
                }
            }
        });
        Self { task: Some(task) }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stops the timer and waits for an in-flight tick to unwind. Idempotent.
    pub async fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
