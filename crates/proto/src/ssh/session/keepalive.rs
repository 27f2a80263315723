//! Keepalive ticker for the async driver.
//!
//! The transport decides whether a keepalive is actually due (it tracks
//! outbound silence itself). This task only wakes the driver up on a fixed
//! interval so that the check happens even while the connection is idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Background ticker handle.
pub struct KeepaliveTask {
    interval: Duration,
    stop_signal: Arc<AtomicBool>,
    task_handle: Option<JoinHandle<()>>,
}

impl KeepaliveTask {
    /// Creates a ticker (but doesn't start it).
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stop_signal: Arc::new(AtomicBool::new(false)),
            task_handle: None,
        }
    }

    /// Tick interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawns the ticker; each tick arrives as `()` on the returned receiver.
    ///
    /// The task ends when stopped or when the receiver is dropped. Must be
    /// called from within a tokio runtime.
    pub fn start(&mut self) -> mpsc::Receiver<()> {
        self.stop();
        self.stop_signal = Arc::new(AtomicBool::new(false));

        let (tx, rx) = mpsc::channel(1);
        let interval = self.interval;
        let stop_signal = Arc::clone(&self.stop_signal);

        let handle = tokio::spawn(async move {
            debug!("Keep-alive task started with interval: {:?}", interval);
            loop {
                tokio::time::sleep(interval).await;
                if stop_signal.load(Ordering::Relaxed) {
                    break;
                }
                // a full queue means the driver has not caught up; skip
                match tx.try_send(()) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
                    Err(mpsc::error::TrySendError::Closed(())) => break,
                }
            }
            debug!("Keep-alive task stopped");
        });

        self.task_handle = Some(handle);
        rx
    }

    /// Stops the ticker.
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }

    /// Returns whether the task is running.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for KeepaliveTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepaliveTask")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_task_creation() {
        let task = KeepaliveTask::new(Duration::from_secs(60));
        assert!(!task.is_running());
        assert_eq!(task.interval(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_keepalive_ticks_then_stops() {
        let mut task = KeepaliveTask::new(Duration::from_millis(20));
        let mut ticks = task.start();
        assert!(task.is_running());

        let tick = tokio::time::timeout(Duration::from_secs(2), ticks.recv()).await;
        assert_eq!(tick.ok().flatten(), Some(()));

        task.stop();
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_keepalive_ends_when_receiver_dropped() {
        let mut task = KeepaliveTask::new(Duration::from_millis(10));
        let ticks = task.start();
        drop(ticks);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_running());
    }
}
