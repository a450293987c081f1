//! Periodic auto-resume of transiently failed subtasks.

use super::{TaskOp, Worker};
use crate::config::CheckerConfig;
use crate::stage::Stage;
use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

struct Backoff {
    wait: Duration,
    next_at: Instant,
}

/// Scans the worker's subtasks on an interval and resumes every task parked
/// in `Paused` by a resumable failure, under a per-task exponential backoff.
///
/// The checker holds a weak handle to its worker: it reads through the
/// worker's public operations and becomes a no-op once the worker is closed
/// or dropped.
pub struct TaskStatusChecker {
    cfg: CheckerConfig,
    worker: Weak<Worker>,
    backoffs: Mutex<HashMap<String, Backoff>>,
    shutdown: CancellationToken,
}

impl TaskStatusChecker {
    /// Builds a checker over a validated config; see
    /// [`CheckerConfig::validate`].
    pub(crate) fn new(cfg: CheckerConfig, worker: Weak<Worker>) -> Self {
        Self {
            cfg,
            worker,
            backoffs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawns the check loop onto the worker's tracker.
    pub(crate) fn start(self: &std::sync::Arc<Self>, tracker: &TaskTracker, parent: &CancellationToken) {
        let checker = std::sync::Arc::clone(self);
        let parent = parent.clone();
        tracker.spawn(async move { checker.run(parent).await });
    }

    /// Stops the loop; the worker joins it through its tracker.
    pub(crate) fn close(&self) {
        self.shutdown.cancel();
    }

    async fn run(&self, parent: CancellationToken) {
        info!(
            interval_secs = self.cfg.check_interval.as_secs(),
            "task status checker starting"
        );
        let mut interval = tokio::time::interval(self.cfg.check_interval);
        // Skip the immediate first tick.
        interval.tick().await;
        loop {
            tokio::select! {
                biased;

                _ = parent.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.check().await,
            }
        }
        info!("task status checker stopped");
    }

    async fn check(&self) {
        let Some(worker) = self.worker.upgrade() else {
            return;
        };
        if worker.is_closed() {
            return;
        }

        let now = Instant::now();
        let tasks = worker.subtasks().all();
        let mut due = Vec::new();
        {
            let mut backoffs = self.backoffs.lock().unwrap();
            backoffs.retain(|name, _| tasks.iter().any(|t| t.name() == name));
            for task in &tasks {
                match task.stage() {
                    // A task seen running again earns a fresh backoff.
                    Stage::Running => {
                        backoffs.remove(task.name());
                    }
                    Stage::Paused => {
                        let Some(result) = task.result() else { continue };
                        if !result.can_auto_resume() {
                            continue;
                        }
                        let entry =
                            backoffs
                                .entry(task.name().to_string())
                                .or_insert_with(|| Backoff {
                                    wait: self.cfg.backoff_min,
                                    next_at: now,
                                });
                        if now >= entry.next_at {
                            entry.next_at = now + entry.wait;
                            entry.wait = (entry.wait * 2).min(self.cfg.backoff_max);
                            due.push(task.name().to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        for name in due {
            info!(task = %name, "auto resuming failed sub task");
            if let Err(err) = worker.operate_sub_task(&name, TaskOp::AutoResume).await {
                warn!(task = %name, error = %err, "auto resume failed");
            }
        }
    }
}
