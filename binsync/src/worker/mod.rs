//! Worker controller.
//!
//! A worker is bound to one upstream source. It composes the subtask
//! holder, the optional relay subsystem, the auto-resume checker and two
//! expected-stage followers, and drives everything it owns toward the state
//! recorded in the coordination store.
//!
//! Locking: a single reader/writer lock serializes every mutating operation
//! for its whole duration; status queries take the read side. Follower
//! dispatchers never hold the lock themselves, they call the mutating
//! operations which do. The purge interceptor reads entirely lock-free so
//! it can never deadlock against a close in progress.

mod checker;
mod error;
mod follower;
mod status;

pub use checker::TaskStatusChecker;
pub use error::WorkerError;
pub use status::WorkerStatus;

use crate::binlog::{self, BinlogLocation};
use crate::config::{
    copy_config_from_source, copy_config_from_source_for_each, SourceConfig, SubTaskConfig,
};
use crate::factory::UnitFactory;
use crate::metrics::WorkerMetrics;
use crate::relay::{PurgeInterceptor, PurgeRequest, RelayHolder, RelayOp, RelayPurger};
use crate::stage::Stage;
use crate::store::{ExpectedStage, Revision, StoreClient, StoreError};
use crate::subtask::{
    HandleErrorRequest, PipelineError, SchemaRequest, SubTask, SubTaskHolder, SubTaskStatus,
};
use follower::{StageFollower, StageHandler};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Upper bound on local status collection, matching the per-call timeout of
/// pipeline-side queries.
pub const DEFAULT_DB_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-subtask budget for reading checkpoints when relay is enabled.
const CHECKPOINT_TIMEOUT_PER_TASK: Duration = Duration::from_secs(3);

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Polling cadence and bound for a subtask start deferred by a purge pass.
const PURGE_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const PURGE_RETRY_ATTEMPTS: u32 = 20;

/// Operations on one subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOp {
    Stop,
    Pause,
    Resume,
    /// Same transition as `Resume`; kept separate so metrics can tell the
    /// checker's retries apart from operator actions.
    AutoResume,
}

impl TaskOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOp::Stop => "stop",
            TaskOp::Pause => "pause",
            TaskOp::Resume => "resume",
            TaskOp::AutoResume => "auto-resume",
        }
    }
}

/// The per-source worker agent.
pub struct Worker {
    name: String,
    cfg: RwLock<SourceConfig>,
    closed: AtomicBool,
    /// Serializes mutating operations; see the module docs.
    op_lock: tokio::sync::RwLock<()>,
    subtasks: SubTaskHolder,
    relay: RwLock<Option<Arc<RelayHolder>>>,
    purger: RwLock<Option<Arc<RelayPurger>>>,
    checker: Option<Arc<TaskStatusChecker>>,
    store: Arc<dyn StoreClient>,
    units: Arc<dyn UnitFactory>,
    metrics: Arc<WorkerMetrics>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Worker {
    /// Builds a worker bound to `cfg.source_id`. Nothing runs until
    /// [`start`](Self::start); relay and subtask handling each need their
    /// own enable call. Fails only when the checker policy is invalid.
    pub fn create(
        cfg: SourceConfig,
        store: Arc<dyn StoreClient>,
        units: Arc<dyn UnitFactory>,
        name: impl Into<String>,
    ) -> Result<Arc<Self>, WorkerError> {
        cfg.checker.validate()?;
        let name = name.into();
        let worker = Arc::new_cyclic(|weak: &Weak<Worker>| {
            let checker = cfg
                .checker
                .check_enable
                .then(|| Arc::new(TaskStatusChecker::new(cfg.checker.clone(), weak.clone())));
            Worker {
                name,
                cfg: RwLock::new(cfg),
                closed: AtomicBool::new(true),
                op_lock: tokio::sync::RwLock::new(()),
                subtasks: SubTaskHolder::new(),
                relay: RwLock::new(None),
                purger: RwLock::new(None),
                checker,
                store,
                units,
                metrics: Arc::new(WorkerMetrics::new()),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }
        });
        info!(worker = %worker.name, source = %worker.source_id(), "worker initialized");
        Ok(worker)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current source binding, relay position fields included.
    pub fn source_config(&self) -> SourceConfig {
        self.cfg.read().unwrap().clone()
    }

    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Current relay stage; `None` while relay is not enabled.
    pub fn relay_stage(&self) -> Option<Stage> {
        self.relay.read().unwrap().as_ref().map(|h| h.stage())
    }

    pub(crate) fn subtasks(&self) -> &SubTaskHolder {
        &self.subtasks
    }

    fn source_id(&self) -> String {
        self.cfg.read().unwrap().source_id.clone()
    }

    fn check_open(&self) -> Result<(), WorkerError> {
        if self.is_closed() {
            return Err(WorkerError::AlreadyClosed);
        }
        Ok(())
    }

    /// Starts the worker: checker (when configured) plus the periodic
    /// status log. Call exactly once per [`create`](Self::create).
    pub fn start(self: &Arc<Self>) {
        debug_assert!(self.is_closed(), "start called twice");
        self.closed.store(false, Ordering::Release);
        if let Some(checker) = &self.checker {
            checker.start(&self.tracker, &self.shutdown);
        }
        let worker = Arc::clone(self);
        self.tracker.spawn(async move { worker.status_loop().await });
        info!(worker = %self.name, "worker started");
    }

    async fn status_loop(&self) {
        let mut interval = tokio::time::interval(STATUS_LOG_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("status loop exiting");
                    break;
                }

                _ = interval.tick() => {
                    debug!(status = %self.status_json(), "runtime status");
                }
            }
        }
    }

    /// Serialized snapshot of the worker, relay and subtasks.
    pub fn status_json(&self) -> String {
        WorkerStatus {
            name: self.name.clone(),
            source: self.source_id(),
            closed: self.is_closed(),
            taken_at: chrono::Utc::now(),
            relay_stage: self.relay_stage(),
            subtasks: self.collect_status(""),
        }
        .to_json()
    }

    // ------------------------------------------------------------------
    // Relay
    // ------------------------------------------------------------------

    /// Enables the relay subsystem: pins the relay start position to the
    /// earliest subtask checkpoint, builds the holder and purger, applies
    /// the stored relay stage, and spawns the relay follower.
    pub async fn enable_relay(self: &Arc<Self>) -> Result<(), WorkerError> {
        if self.relay.read().unwrap().is_some() {
            return Err(WorkerError::RelayEnabled);
        }

        // 1. The relay must start no later than any subtask will read.
        let (_stages, cfgs, _rev) = self.fetch_subtasks_and_project()?;
        let deadline = CHECKPOINT_TIMEOUT_PER_TASK * cfgs.len().max(1) as u32;
        let min_loc = tokio::time::timeout(deadline, self.min_checkpoint_location(&cfgs))
            .await
            .map_err(|_| WorkerError::CheckpointTimeout(deadline))??;

        {
            let mut cfg = self.cfg.write().unwrap();
            match &min_loc {
                Some(loc) => {
                    info!(location = %loc, "earliest checkpoint across sub tasks");
                    cfg.relay_binlog_name = binlog::adjust_position(&loc.position).name;
                    cfg.relay_binlog_gtid = loc.gtid_set.clone();
                    cfg.uuid_suffix = binlog::extract_suffix(&loc.position.name)?;
                }
                // Still pin a suffix so stale relay directories get removed.
                None => cfg.uuid_suffix = binlog::MIN_UUID_SUFFIX,
            }
        }

        // 2. Holder and purger, with this worker as the purge veto.
        let source_cfg = self.source_config();
        let holder = Arc::new(RelayHolder::new(
            source_cfg.clone(),
            self.units.create_relay(&source_cfg),
        ));
        let interceptor: Arc<dyn PurgeInterceptor> = Arc::clone(self) as Arc<dyn PurgeInterceptor>;
        let purger = holder.init(vec![interceptor])?;
        *self.relay.write().unwrap() = Some(Arc::clone(&holder));
        *self.purger.write().unwrap() = Some(Arc::clone(&purger));

        // 3. Apply the newest stored stage directly; the follower below
        // picks up from the revision just past it.
        let (stage, revision) = self.store.get_relay_stage(&source_cfg.source_id)?;
        if let Some(stage) = &stage {
            if !stage.is_deleted && stage.expect == Stage::Running {
                info!("relay expected running, starting");
                holder.start();
                purger.start();
            }
        }

        self.spawn_relay_follower(revision);
        Ok(())
    }

    async fn min_checkpoint_location(
        &self,
        cfgs: &HashMap<String, SubTaskConfig>,
    ) -> Result<Option<BinlogLocation>, WorkerError> {
        let mut min = None;
        for cfg in cfgs.values() {
            let loc = self
                .units
                .checkpoint_location(cfg)
                .await
                .map_err(WorkerError::Pipeline)?;
            min = binlog::min_location(min, loc);
        }
        Ok(min)
    }

    async fn operate_relay(&self, op: RelayOp) -> Result<(), WorkerError> {
        self.check_open()?;
        let holder = self.relay.read().unwrap().clone();
        match holder {
            Some(holder) => holder.operate(op).await,
            None => {
                warn!(op = op.as_str(), "relay not enabled, ignoring relay operation");
                Ok(())
            }
        }
    }

    /// Runs an on-demand purge of relay log files.
    pub async fn purge_relay(&self, req: PurgeRequest) -> Result<(), WorkerError> {
        self.check_open()?;
        let purger = self.purger.read().unwrap().clone();
        match purger {
            Some(purger) => purger.do_purge(req),
            None => {
                warn!("relay not enabled, ignoring purge request");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Subtasks
    // ------------------------------------------------------------------

    /// Enables subtask handling: creates every stored non-deleted subtask in
    /// its expected stage, then spawns the subtask follower.
    pub async fn enable_handle_subtasks(self: &Arc<Self>) -> Result<(), WorkerError> {
        let (stages, cfgs, revision) = self.fetch_subtasks_and_project()?;
        info!(tasks = cfgs.len(), "starting to handle source subtasks");
        for (name, cfg) in cfgs {
            let Some(stage) = stages.get(&name) else {
                continue;
            };
            if stage.is_deleted {
                continue;
            }
            info!(task = %name, expect = %stage.expect, "creating subtask from stored state");
            self.start_sub_task(cfg, stage.expect).await?;
        }
        self.spawn_subtask_follower(revision);
        Ok(())
    }

    /// Reads all subtask stages and configs and projects the source binding
    /// onto every config.
    #[allow(clippy::type_complexity)]
    fn fetch_subtasks_and_project(
        &self,
    ) -> Result<
        (
            HashMap<String, ExpectedStage>,
            HashMap<String, SubTaskConfig>,
            Revision,
        ),
        WorkerError,
    > {
        let source_cfg = self.source_config();
        let (stages, mut cfgs, revision) = self
            .store
            .get_subtask_stages_and_configs(&source_cfg.source_id)?;
        copy_config_from_source_for_each(&mut cfgs, &source_cfg)?;
        Ok((stages, cfgs, revision))
    }

    /// Creates a subtask and drives it to `expect`.
    ///
    /// Per-subtask problems (closed worker, decrypt failure, purge in
    /// progress) never fail the call: the task is recorded with the failure
    /// attached, so a stored expected stage always produces an observable
    /// local subtask.
    pub async fn start_sub_task(
        self: &Arc<Self>,
        cfg: SubTaskConfig,
        expect: Stage,
    ) -> Result<(), WorkerError> {
        let _guard = self.op_lock.write().await;
        self.start_sub_task_locked(cfg, expect).await
    }

    async fn start_sub_task_locked(
        self: &Arc<Self>,
        mut cfg: SubTaskConfig,
        expect: Stage,
    ) -> Result<(), WorkerError> {
        let source_cfg = self.source_config();
        copy_config_from_source(&mut cfg, &source_cfg)?;
        let task_name = cfg.name.clone();

        let st = Arc::new(SubTask::new(cfg.clone(), Arc::clone(&self.units)));
        // Recorded before the closed check: a racing close is then
        // guaranteed to observe and reap this task.
        self.subtasks.record(Arc::clone(&st)).await;
        if self.is_closed() {
            st.fail(PipelineError::fatal("worker already closed"));
            return Ok(());
        }

        match cfg.decrypt_password() {
            Ok(decrypted) => st.set_config(decrypted),
            Err(err) => {
                st.fail(PipelineError::fatal(format!("start sub task: {err}")));
                return Ok(());
            }
        }

        let purging = self
            .purger
            .read()
            .unwrap()
            .as_ref()
            .map(|p| p.purging())
            .unwrap_or(false);
        if purging {
            st.fail(PipelineError::fatal(
                WorkerError::RelayPurging(task_name.clone()).to_string(),
            ));
            self.spawn_purge_retry(task_name, expect);
            return Ok(());
        }

        info!(task = %task_name, "subtask created");
        st.run(expect);
        Ok(())
    }

    /// Retries a subtask start that was deferred by a running purge pass.
    /// Bounded; a resync picks the task up if the purge outlives the bound.
    fn spawn_purge_retry(self: &Arc<Self>, task: String, expect: Stage) {
        let worker = Arc::clone(self);
        self.tracker.spawn(async move {
            for _ in 0..PURGE_RETRY_ATTEMPTS {
                tokio::select! {
                    _ = worker.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(PURGE_RETRY_INTERVAL) => {}
                }
                let purging = worker
                    .purger
                    .read()
                    .unwrap()
                    .as_ref()
                    .map(|p| p.purging())
                    .unwrap_or(false);
                if purging {
                    continue;
                }
                if let Err(err) = worker.retry_after_purge(&task, expect).await {
                    warn!(task = %task, error = %err, "deferred subtask start failed");
                }
                return;
            }
            warn!(task = %task, "relay purge still running, deferred start abandoned");
        });
    }

    async fn retry_after_purge(&self, task: &str, expect: Stage) -> Result<(), WorkerError> {
        let _guard = self.op_lock.write().await;
        self.check_open()?;
        let st = self
            .subtasks
            .find(task)
            .ok_or_else(|| WorkerError::SubTaskNotFound(task.to_string()))?;
        // Anything but the parked failure means the state moved on.
        if st.stage() != Stage::Paused {
            return Ok(());
        }
        match expect {
            Stage::Running => {
                info!(task, "purge finished, starting deferred subtask");
                st.resume()
            }
            // The task already sits in its expected stage.
            _ => Ok(()),
        }
    }

    /// Replaces the config of a paused subtask.
    pub async fn update_sub_task(&self, cfg: SubTaskConfig) -> Result<(), WorkerError> {
        let _guard = self.op_lock.write().await;
        self.check_open()?;
        let st = self
            .subtasks
            .find(&cfg.name)
            .ok_or_else(|| WorkerError::SubTaskNotFound(cfg.name.clone()))?;
        info!(task = %cfg.name, "updating sub task config");
        st.update(cfg)
    }

    /// Applies one task operation. `Stop` also removes the task.
    pub async fn operate_sub_task(&self, name: &str, op: TaskOp) -> Result<(), WorkerError> {
        let _guard = self.op_lock.write().await;
        self.operate_sub_task_locked(name, op).await
    }

    async fn operate_sub_task_locked(&self, name: &str, op: TaskOp) -> Result<(), WorkerError> {
        self.check_open()?;
        let st = self
            .subtasks
            .find(name)
            .ok_or_else(|| WorkerError::SubTaskNotFound(name.to_string()))?;
        info!(task = %name, op = op.as_str(), "operating sub task");
        match op {
            TaskOp::Stop => {
                st.close().await;
                self.subtasks.remove(name);
                Ok(())
            }
            TaskOp::Pause => st.pause().await,
            TaskOp::Resume | TaskOp::AutoResume => st.resume(),
        }
    }

    /// Forwards a schema operation to a subtask's pipeline.
    pub async fn operate_schema(&self, req: &SchemaRequest) -> Result<String, WorkerError> {
        let _guard = self.op_lock.write().await;
        self.check_open()?;
        let st = self
            .subtasks
            .find(&req.task)
            .ok_or_else(|| WorkerError::SubTaskNotFound(req.task.clone()))?;
        st.operate_schema(req)
    }

    /// Forwards an error intervention to a subtask's pipeline.
    pub async fn handle_error(&self, req: &HandleErrorRequest) -> Result<(), WorkerError> {
        let _guard = self.op_lock.write().await;
        self.check_open()?;
        let st = self
            .subtasks
            .find(&req.task)
            .ok_or_else(|| WorkerError::SubTaskNotFound(req.task.clone()))?;
        st.handle_error(req)
    }

    /// Snapshot of subtask statuses; every task when `name` is empty.
    /// Returns empty on a closed worker.
    pub async fn query_status(&self, name: &str) -> Vec<SubTaskStatus> {
        let _guard = self.op_lock.read().await;
        if self.is_closed() {
            warn!("querying status from a closed worker");
            return Vec::new();
        }
        let collect = async { self.collect_status(name) };
        match tokio::time::timeout(DEFAULT_DB_TIMEOUT, collect).await {
            Ok(statuses) => statuses,
            Err(_) => {
                warn!("status query timed out");
                Vec::new()
            }
        }
    }

    fn collect_status(&self, name: &str) -> Vec<SubTaskStatus> {
        if name.is_empty() {
            let mut statuses: Vec<SubTaskStatus> =
                self.subtasks.all().iter().map(|t| t.status()).collect();
            statuses.sort_by(|a, b| a.name.cmp(&b.name));
            statuses
        } else {
            self.subtasks
                .find(name)
                .map(|t| vec![t.status()])
                .unwrap_or_default()
        }
    }

    // ------------------------------------------------------------------
    // Stage translation
    // ------------------------------------------------------------------

    /// Translates one expected-stage record into the matching operation.
    /// Deletion tombstones always stop the task, whatever they carry in
    /// `expect`.
    async fn operate_subtask_stage(
        self: &Arc<Self>,
        stage: ExpectedStage,
        cfg: SubTaskConfig,
    ) -> (&'static str, Result<(), WorkerError>) {
        if !stage.is_deleted
            && matches!(stage.expect, Stage::Running | Stage::Paused)
            && self.subtasks.find(&stage.task).is_none()
        {
            info!(task = %stage.task, expect = %stage.expect, "creating subtask from stage change");
            return ("create", self.start_sub_task(cfg, stage.expect).await);
        }
        let op = if stage.is_deleted {
            TaskOp::Stop
        } else {
            match stage.expect {
                Stage::Running => TaskOp::Resume,
                Stage::Paused => TaskOp::Pause,
                _ => {
                    return (
                        "invalid",
                        Err(WorkerError::InvalidTaskOp {
                            task: stage.task.clone(),
                            op: format!("expect {}", stage.expect),
                        }),
                    )
                }
            }
        };
        (op.as_str(), self.operate_sub_task(&stage.task, op).await)
    }

    /// Event-path translation: the watch only delivers the stage, so a
    /// create fetches the config from the store at the event's revision.
    async fn operate_subtask_stage_from_event(
        self: &Arc<Self>,
        stage: ExpectedStage,
    ) -> (&'static str, Result<(), WorkerError>) {
        let mut cfg = SubTaskConfig::default();
        if !stage.is_deleted
            && matches!(stage.expect, Stage::Running | Stage::Paused)
            && self.subtasks.find(&stage.task).is_none()
        {
            match self
                .store
                .get_subtask_config(&stage.source, &stage.task, stage.revision)
            {
                Err(err) => return ("create", Err(err.into())),
                Ok(None) => {
                    return (
                        "create",
                        Err(WorkerError::SubTaskConfigMissing(stage.task.clone())),
                    )
                }
                Ok(Some(stored)) => cfg = stored,
            }
        }
        self.operate_subtask_stage(stage, cfg).await
    }

    /// Full subtask resync: applies every stored stage and stops local
    /// tasks the store no longer knows.
    async fn reset_subtask_stages(self: &Arc<Self>) -> Result<Revision, WorkerError> {
        let (stages, cfgs, revision) = self.fetch_subtasks_and_project()?;
        let mut orphans: HashSet<String> = self.subtasks.names().into_iter().collect();
        for (name, cfg) in cfgs {
            let Some(stage) = stages.get(&name) else {
                continue;
            };
            orphans.remove(&name);
            let (op, result) = self.operate_subtask_stage(stage.clone(), cfg).await;
            if let Err(err) = result {
                self.metrics.record_op_error(op);
                error!(task = %name, op, error = %err, "failed to apply stored stage during resync");
            }
        }
        for name in orphans {
            info!(task = %name, "stopping subtask absent from the store");
            if let Err(err) = self.operate_sub_task(&name, TaskOp::Stop).await {
                self.metrics.record_op_error(TaskOp::Stop.as_str());
                error!(task = %name, error = %err, "failed to stop orphaned subtask during resync");
            }
        }
        Ok(revision)
    }

    /// Translates one relay expected-stage record. The first `Running`
    /// record starts the holder and purger; later ones resume.
    async fn operate_relay_stage(
        self: &Arc<Self>,
        stage: ExpectedStage,
    ) -> (&'static str, Result<(), WorkerError>) {
        if stage.is_deleted {
            return (
                RelayOp::Stop.as_str(),
                self.operate_relay(RelayOp::Stop).await,
            );
        }
        match stage.expect {
            Stage::Running => {
                let holder = self.relay.read().unwrap().clone();
                if let Some(holder) = holder {
                    if holder.stage() == Stage::New {
                        info!("relay expected running, starting");
                        holder.start();
                        if let Some(purger) = self.purger.read().unwrap().clone() {
                            purger.start();
                        }
                        return ("start-relay", Ok(()));
                    }
                }
                (
                    RelayOp::Resume.as_str(),
                    self.operate_relay(RelayOp::Resume).await,
                )
            }
            Stage::Paused => (
                RelayOp::Pause.as_str(),
                self.operate_relay(RelayOp::Pause).await,
            ),
            other => (
                "invalid",
                Err(WorkerError::InvalidRelayOp {
                    op: "expect",
                    stage: other,
                }),
            ),
        }
    }

    /// Relay resync: an absent stored record counts as deleted.
    async fn reset_relay_stage(self: &Arc<Self>) -> Result<Revision, WorkerError> {
        let source = self.source_id();
        let (stage, revision) = self.store.get_relay_stage(&source)?;
        let stage =
            stage.unwrap_or_else(|| ExpectedStage::relay(source, Stage::Stopped, revision).deleted());
        let (op, result) = self.operate_relay_stage(stage).await;
        if let Err(err) = result {
            self.metrics.record_op_error(op);
            error!(op, error = %err, "failed to operate relay during resync");
        }
        Ok(revision)
    }

    fn spawn_subtask_follower(self: &Arc<Self>, revision: Revision) {
        let follower = StageFollower::new(
            SubtaskStageHandler {
                worker: Arc::clone(self),
            },
            Arc::clone(&self.metrics),
            self.shutdown.clone(),
        );
        self.tracker.spawn(async move { follower.run(revision).await });
    }

    fn spawn_relay_follower(self: &Arc<Self>, revision: Revision) {
        let follower = StageFollower::new(
            RelayStageHandler {
                worker: Arc::clone(self),
            },
            Arc::clone(&self.metrics),
            self.shutdown.clone(),
        );
        self.tracker.spawn(async move { follower.run(revision).await });
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Closes the worker: cancels and joins every background loop, then
    /// closes subtasks, relay, purger and checker under the writer lock.
    /// Idempotent; never fails.
    pub async fn close(&self) {
        if self.is_closed() {
            warn!(worker = %self.name, "already closed");
            return;
        }
        info!(worker = %self.name, "closing worker");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let _guard = self.op_lock.write().await;
        self.subtasks.close_all().await;
        if let Some(holder) = self.relay.read().unwrap().clone() {
            holder.close().await;
        }
        if let Some(purger) = self.purger.read().unwrap().clone() {
            purger.close().await;
        }
        if let Some(checker) = &self.checker {
            checker.close();
        }
        self.closed.store(true, Ordering::Release);
        info!(worker = %self.name, "worker closed");
    }
}

/// Purge veto: relay files stay while any subtask might still need to
/// re-read them for debugging.
///
/// Deliberately lock-free: the purger may call this while the worker is
/// mid-close and holding the writer lock, and a stale answer here is
/// harmless (the next pass re-checks) while a deadlock is not.
impl PurgeInterceptor for Worker {
    fn forbid_purge(&self) -> Option<String> {
        if self.is_closed() {
            return None;
        }
        for task in self.subtasks.all() {
            let stage = task.stage();
            if matches!(stage, Stage::New | Stage::Paused) {
                return Some(format!(
                    "sub task {} current stage is {}",
                    task.name(),
                    stage
                ));
            }
        }
        None
    }
}

struct SubtaskStageHandler {
    worker: Arc<Worker>,
}

impl StageHandler for SubtaskStageHandler {
    fn kind(&self) -> &'static str {
        "subtask"
    }

    fn spawn_watch(
        &self,
        from_revision: Revision,
        stage_tx: mpsc::Sender<ExpectedStage>,
        err_tx: mpsc::Sender<StoreError>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.worker.store);
        let source = self.worker.source_id();
        tokio::spawn(async move {
            store
                .watch_subtask_stage(&source, from_revision, stage_tx, err_tx, cancel)
                .await;
        })
    }

    fn apply(
        &self,
        stage: ExpectedStage,
    ) -> impl std::future::Future<Output = (&'static str, Result<(), WorkerError>)> + Send {
        async move { self.worker.operate_subtask_stage_from_event(stage).await }
    }

    fn resync(&self) -> impl std::future::Future<Output = Result<Revision, WorkerError>> + Send {
        async move { self.worker.reset_subtask_stages().await }
    }
}

struct RelayStageHandler {
    worker: Arc<Worker>,
}

impl StageHandler for RelayStageHandler {
    fn kind(&self) -> &'static str {
        "relay"
    }

    fn spawn_watch(
        &self,
        from_revision: Revision,
        stage_tx: mpsc::Sender<ExpectedStage>,
        err_tx: mpsc::Sender<StoreError>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.worker.store);
        let source = self.worker.source_id();
        tokio::spawn(async move {
            store
                .watch_relay_stage(&source, from_revision, stage_tx, err_tx, cancel)
                .await;
        })
    }

    fn apply(
        &self,
        stage: ExpectedStage,
    ) -> impl std::future::Future<Output = (&'static str, Result<(), WorkerError>)> + Send {
        async move { self.worker.operate_relay_stage(stage).await }
    }

    fn resync(&self) -> impl std::future::Future<Output = Result<Revision, WorkerError>> + Send {
        async move { self.worker.reset_relay_stage().await }
    }
}
