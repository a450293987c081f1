//! Expected-stage follower loop.
//!
//! One follower instance watches the subtask stages, another the relay
//! stage. Each round opens a watch on a child cancellation scope, dispatches
//! events until the watch dies, then either exits cleanly or resynchronizes
//! from a full read and re-watches. The watch producer owns its channels;
//! the child scope is cancelled strictly after the dispatcher returns and
//! the producer is joined before the next round opens, so a stale watcher
//! never races a fresh one.

use super::WorkerError;
use crate::metrics::WorkerMetrics;
use crate::store::{ExpectedStage, Revision, StoreError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Delay between resynchronization attempts after a retryable watch failure.
pub(crate) const RESYNC_INTERVAL: Duration = Duration::from_millis(500);

const WATCH_CHANNEL_CAPACITY: usize = 16;

/// Subject-specific half of a follower: how to watch, how to apply one
/// record, and how to resynchronize from a full read.
pub(crate) trait StageHandler: Send + Sync + 'static {
    /// Subject name for logs.
    fn kind(&self) -> &'static str;

    /// Spawns the watch producer streaming records from `from_revision`.
    /// The producer owns the senders and drops them on exit.
    fn spawn_watch(
        &self,
        from_revision: Revision,
        stage_tx: mpsc::Sender<ExpectedStage>,
        err_tx: mpsc::Sender<StoreError>,
        cancel: CancellationToken,
    ) -> JoinHandle<()>;

    /// Translates one record into the matching operation and applies it.
    /// Returns the operation label for metrics alongside the outcome.
    fn apply(
        &self,
        stage: ExpectedStage,
    ) -> impl Future<Output = (&'static str, Result<(), WorkerError>)> + Send;

    /// Reads the authoritative state, applies it, and returns its revision.
    fn resync(&self) -> impl Future<Output = Result<Revision, WorkerError>> + Send;
}

enum DispatchExit {
    /// The follower's cancellation scope fired.
    Cancelled,
    /// The watch producer went away without a classified error.
    Closed,
    /// A retryable store error calls for a resync.
    Retryable(StoreError),
}

/// Drives one subject's expected stage from the store.
pub(crate) struct StageFollower<H> {
    handler: H,
    metrics: Arc<WorkerMetrics>,
    cancel: CancellationToken,
}

impl<H: StageHandler> StageFollower<H> {
    pub(crate) fn new(handler: H, metrics: Arc<WorkerMetrics>, cancel: CancellationToken) -> Self {
        Self {
            handler,
            metrics,
            cancel,
        }
    }

    /// Runs until cancellation or a clean watch shutdown. `revision` is the
    /// revision the initial state was read at; watching starts just past it.
    pub(crate) async fn run(self, mut revision: Revision) {
        let kind = self.handler.kind();
        info!(kind, from_revision = revision + 1, "stage follower starting");
        loop {
            let (stage_tx, stage_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
            let (err_tx, err_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
            let watch_cancel = self.cancel.child_token();
            let producer =
                self.handler
                    .spawn_watch(revision + 1, stage_tx, err_tx, watch_cancel.clone());

            let exit = self.dispatch(stage_rx, err_rx).await;

            // Release the watcher only after the dispatcher has returned,
            // and join it before opening the next one.
            watch_cancel.cancel();
            if let Err(err) = producer.await {
                error!(kind, error = %err, "watch producer panicked");
            }

            match exit {
                DispatchExit::Cancelled => {
                    info!(kind, "stage follower exiting");
                    return;
                }
                DispatchExit::Closed => {
                    info!(kind, "watch closed, stage follower exiting");
                    return;
                }
                DispatchExit::Retryable(err) => {
                    warn!(kind, error = %err, "watch interrupted, resynchronizing");
                    match self.resync_until_ok().await {
                        Some(fresh) => revision = fresh,
                        None => {
                            info!(kind, "stage follower exiting during resync");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Consumes the watch channels until one closes, the scope is cancelled,
    /// or a retryable error arrives. Translation failures are logged and
    /// metered; only retryable store errors tear the watch down, so one bad
    /// record cannot stall every other subject.
    async fn dispatch(
        &self,
        mut stage_rx: mpsc::Receiver<ExpectedStage>,
        mut err_rx: mpsc::Receiver<StoreError>,
    ) -> DispatchExit {
        let kind = self.handler.kind();
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return DispatchExit::Cancelled,

                event = stage_rx.recv() => match event {
                    None => return DispatchExit::Closed,
                    Some(stage) => {
                        info!(
                            kind,
                            task = %stage.task,
                            expect = %stage.expect,
                            deleted = stage.is_deleted,
                            revision = stage.revision,
                            "expected stage received"
                        );
                        let (op, result) = self.handler.apply(stage).await;
                        if let Err(err) = result {
                            self.metrics.record_op_error(op);
                            error!(kind, op, error = %err, "failed to apply expected stage");
                            if let WorkerError::Store(store_err) = &err {
                                if store_err.is_retryable() {
                                    return DispatchExit::Retryable(store_err.clone());
                                }
                            }
                        }
                    }
                },

                event = err_rx.recv() => match event {
                    None => return DispatchExit::Closed,
                    Some(err) => {
                        error!(kind, error = %err, "watch delivered an error");
                        if err.is_retryable() {
                            return DispatchExit::Retryable(err);
                        }
                    }
                },
            }
        }
    }

    /// Repeats the full-state resync every [`RESYNC_INTERVAL`] until it
    /// succeeds, yielding the fresh revision. `None` when cancelled.
    async fn resync_until_ok(&self) -> Option<Revision> {
        let kind = self.handler.kind();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(RESYNC_INTERVAL) => {
                    match self.handler.resync().await {
                        Ok(revision) => {
                            self.metrics.record_resync();
                            info!(kind, revision, "resynchronized with the store");
                            return Some(revision);
                        }
                        Err(err) => {
                            warn!(kind, attempt, error = %err, "resync failed, will retry");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Stage;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Item {
        Stage(ExpectedStage),
        Error(StoreError),
    }

    /// One scripted watch round: items to emit, then either hold the watch
    /// open until cancelled or drop the channels.
    struct Round {
        items: Vec<Item>,
        hold_open: bool,
    }

    struct ScriptedHandler {
        rounds: Mutex<VecDeque<Round>>,
        watched_from: Arc<Mutex<Vec<Revision>>>,
        applied: Arc<Mutex<Vec<ExpectedStage>>>,
        apply_result: fn(&ExpectedStage) -> Result<(), WorkerError>,
        resync_revision: Revision,
    }

    impl StageHandler for Arc<ScriptedHandler> {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        fn spawn_watch(
            &self,
            from_revision: Revision,
            stage_tx: mpsc::Sender<ExpectedStage>,
            err_tx: mpsc::Sender<StoreError>,
            cancel: CancellationToken,
        ) -> JoinHandle<()> {
            self.watched_from.lock().unwrap().push(from_revision);
            let round = self
                .rounds
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Round { items: Vec::new(), hold_open: true });
            tokio::spawn(async move {
                for item in round.items {
                    let sent = match item {
                        Item::Stage(stage) => stage_tx.send(stage).await.is_ok(),
                        Item::Error(err) => err_tx.send(err).await.is_ok(),
                    };
                    if !sent {
                        return;
                    }
                }
                if round.hold_open {
                    cancel.cancelled().await;
                }
            })
        }

        fn apply(
            &self,
            stage: ExpectedStage,
        ) -> impl Future<Output = (&'static str, Result<(), WorkerError>)> + Send {
            let result = (self.apply_result)(&stage);
            self.applied.lock().unwrap().push(stage);
            async move { ("apply", result) }
        }

        fn resync(&self) -> impl Future<Output = Result<Revision, WorkerError>> + Send {
            let revision = self.resync_revision;
            async move { Ok(revision) }
        }
    }

    fn handler(rounds: Vec<Round>, resync_revision: Revision) -> Arc<ScriptedHandler> {
        Arc::new(ScriptedHandler {
            rounds: Mutex::new(rounds.into()),
            watched_from: Arc::new(Mutex::new(Vec::new())),
            applied: Arc::new(Mutex::new(Vec::new())),
            apply_result: |_| Ok(()),
            resync_revision,
        })
    }

    fn stage(task: &str, expect: Stage, revision: Revision) -> ExpectedStage {
        ExpectedStage::subtask("s1", task, expect, revision)
    }

    #[tokio::test]
    async fn applies_events_in_order_until_watch_closes() {
        let h = handler(
            vec![Round {
                items: vec![
                    Item::Stage(stage("t1", Stage::Running, 2)),
                    Item::Stage(stage("t1", Stage::Paused, 3)),
                ],
                hold_open: false,
            }],
            0,
        );
        let metrics = Arc::new(WorkerMetrics::new());
        let follower = StageFollower::new(Arc::clone(&h), metrics, CancellationToken::new());

        tokio::time::timeout(Duration::from_secs(2), follower.run(1))
            .await
            .unwrap();

        let applied = h.applied.lock().unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].revision, 2);
        assert_eq!(applied[1].revision, 3);
        assert_eq!(*h.watched_from.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn retryable_error_resyncs_and_rewatches() {
        let h = handler(
            vec![
                Round {
                    items: vec![
                        Item::Stage(stage("t1", Stage::Running, 2)),
                        Item::Error(StoreError::Compacted(5)),
                    ],
                    hold_open: true,
                },
                Round {
                    items: vec![Item::Stage(stage("t1", Stage::Running, 8))],
                    hold_open: false,
                },
            ],
            7,
        );
        let metrics = Arc::new(WorkerMetrics::new());
        let follower = StageFollower::new(
            Arc::clone(&h),
            Arc::clone(&metrics),
            CancellationToken::new(),
        );

        tokio::time::timeout(Duration::from_secs(5), follower.run(1))
            .await
            .unwrap();

        // Watched from the initial revision, then from the resync revision.
        assert_eq!(*h.watched_from.lock().unwrap(), vec![2, 8]);
        assert_eq!(metrics.resync_count(), 1);
        assert_eq!(h.applied.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn nonretryable_watch_errors_do_not_tear_down_the_loop() {
        let h = handler(
            vec![Round {
                items: vec![
                    Item::Error(StoreError::Fatal("one bad record".into())),
                    Item::Stage(stage("t1", Stage::Paused, 4)),
                ],
                hold_open: false,
            }],
            0,
        );
        let metrics = Arc::new(WorkerMetrics::new());
        let follower = StageFollower::new(Arc::clone(&h), metrics, CancellationToken::new());

        tokio::time::timeout(Duration::from_secs(2), follower.run(1))
            .await
            .unwrap();

        // The event after the fatal error was still applied.
        assert_eq!(h.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_translations_are_metered_but_swallowed() {
        let mut h = handler(
            vec![Round {
                items: vec![
                    Item::Stage(stage("t1", Stage::Running, 2)),
                    Item::Stage(stage("t2", Stage::Running, 3)),
                ],
                hold_open: false,
            }],
            0,
        );
        Arc::get_mut(&mut h).unwrap().apply_result =
            |stage| match stage.task.as_str() {
                "t1" => Err(WorkerError::SubTaskNotFound("t1".into())),
                _ => Ok(()),
            };
        let metrics = Arc::new(WorkerMetrics::new());
        let follower = StageFollower::new(
            Arc::clone(&h),
            Arc::clone(&metrics),
            CancellationToken::new(),
        );

        tokio::time::timeout(Duration::from_secs(2), follower.run(1))
            .await
            .unwrap();

        assert_eq!(h.applied.lock().unwrap().len(), 2);
        assert_eq!(metrics.op_error_count("apply"), 1);
    }

    #[tokio::test]
    async fn cancellation_exits_promptly_and_joins_the_watch() {
        let h = handler(
            vec![Round {
                items: Vec::new(),
                hold_open: true,
            }],
            0,
        );
        let metrics = Arc::new(WorkerMetrics::new());
        let cancel = CancellationToken::new();
        let follower = StageFollower::new(Arc::clone(&h), metrics, cancel.clone());

        let run = tokio::spawn(follower.run(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap();
    }
}
