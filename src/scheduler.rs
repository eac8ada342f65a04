//! Owned handles for background timers
//!
//! Interval sweeps and debounce timers are spawned onto the tokio runtime and
//! owned by the component that started them. Dropping or cancelling the
//! [`ScheduledTask`] aborts the underlying task.

use std::future::Future;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Handle to a spawned background task, aborted on drop
#[derive(Debug)]
pub struct ScheduledTask {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Spawn a one-shot future
    pub fn spawn<F>(name: impl Into<String>, fut: F) -> Option<Self>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => Some(Self {
                handle: Some(rt.spawn(fut)),
                name,
            }),
            Err(_) => {
                warn!("No tokio runtime available, task '{}' not started", name);
                None
            }
        }
    }

    /// Run `tick` every `period` for as long as `owner` is alive.
    ///
    /// The first tick fires one full period after scheduling.
    pub fn every<T, F, Fut>(name: impl Into<String>, period: Duration, owner: Weak<T>, tick: F) -> Option<Self>
    where
        T: Send + Sync + 'static,
        F: Fn(std::sync::Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        Self::spawn(name, async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(owner) = owner.upgrade() else {
                    debug!("Owner of '{}' dropped, stopping", task_name);
                    break;
                };
                tick(owner).await;
            }
        })
    }

    /// Task name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task is still running
    pub fn is_active(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Abort the task
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Cancelling scheduled task '{}'", self.name);
            handle.abort();
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_every_ticks_while_owner_alive() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = ScheduledTask::every(
            "counter",
            Duration::from_secs(1),
            Arc::downgrade(&counter),
            |c: Arc<AtomicUsize>| async move {
                c.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(task.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut task = ScheduledTask::every(
            "counter",
            Duration::from_secs(1),
            Arc::downgrade(&counter),
            |c: Arc<AtomicUsize>| async move {
                c.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        task.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!task.is_active());
    }

    #[test]
    fn test_spawn_without_runtime() {
        assert!(ScheduledTask::spawn("orphan", async {}).is_none());
    }
}
