//! Connection draining.
//!
//! Every connection task runs inside a [`DrainGroup`]. The group counts
//! outstanding connection tasks and joins them when a generation stops:
//! - the count is incremented before a task is scheduled and decremented
//!   after it finishes, so a finished drain means no handler is running
//! - the accept loop holds a [`ServeGuard`] while it runs, so a drain also
//!   waits for the loop to stop spawning
//!
//! Draining is unbounded by default. A timeout can be configured, in which
//! case tasks still running at the deadline are abandoned to the process exit.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::task::{task_tracker::TaskTrackerToken, TaskTracker};
use tracing::{info, warn};

/// Result of a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection task finished.
    Complete,
    /// The drain timeout expired with tasks still running.
    TimedOut {
        /// Connection tasks still outstanding at the deadline.
        remaining: usize,
    },
}

impl DrainOutcome {
    /// Whether all connection tasks finished.
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainOutcome::Complete)
    }
}

/// Counts one live connection task; decrements on drop.
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Held by an accept loop for as long as it may spawn connection tasks.
pub struct ServeGuard {
    _token: TaskTrackerToken,
}

/// Scope that owns every connection task of one generation.
#[derive(Clone, Default)]
pub struct DrainGroup {
    tracker: TaskTracker,
    outstanding: Arc<AtomicUsize>,
}

impl DrainGroup {
    /// Create an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a connection task in the group.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let guard = ConnectionGuard {
            counter: Arc::clone(&self.outstanding),
        };
        self.tracker.spawn(async move {
            let _guard = guard;
            task.await;
        })
    }

    /// Register an accept loop with the group.
    pub fn serve_guard(&self) -> ServeGuard {
        ServeGuard {
            _token: self.tracker.token(),
        }
    }

    /// Number of connection tasks not yet completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Wait for all connection tasks (and registered accept loops) to finish.
    ///
    /// With `timeout` set, gives up at the deadline and reports how many
    /// connection tasks were abandoned. Safe to call repeatedly; once the
    /// group is empty further calls return immediately.
    pub async fn drain(&self, timeout: Option<Duration>) -> DrainOutcome {
        self.tracker.close();

        let active = self.outstanding();
        if active == 0 && self.tracker.is_empty() {
            info!("No active connections, drain complete");
            return DrainOutcome::Complete;
        }

        info!(
            active_connections = active,
            timeout_secs = timeout.map(|t| t.as_secs()),
            "Draining active connections"
        );

        match timeout {
            None => {
                self.tracker.wait().await;
                info!("All connections drained cleanly");
                DrainOutcome::Complete
            }
            Some(limit) => match tokio::time::timeout(limit, self.tracker.wait()).await {
                Ok(()) => {
                    info!("All connections drained cleanly");
                    DrainOutcome::Complete
                }
                Err(_) => {
                    let remaining = self.outstanding();
                    warn!(
                        remaining_connections = remaining,
                        timeout_secs = limit.as_secs(),
                        "Drain timeout expired, abandoning remaining connections"
                    );
                    DrainOutcome::TimedOut { remaining }
                }
            },
        }
    }
}
