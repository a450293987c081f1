//! Per-task state machine and pipeline ownership.

mod holder;
mod pipeline;

pub use holder::SubTaskHolder;
pub use pipeline::{
    ErrorOp, HandleErrorRequest, Pipeline, PipelineError, ProcessResult, SchemaOp, SchemaRequest,
};

use crate::config::SubTaskConfig;
use crate::factory::UnitFactory;
use crate::stage::Stage;
use crate::worker::WorkerError;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Point-in-time status of one subtask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskStatus {
    pub name: String,
    pub stage: Stage,
    pub result: Option<ProcessResult>,
}

struct TaskState {
    stage: Stage,
    result: Option<ProcessResult>,
}

#[derive(Default)]
struct RunState {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// One migration subtask: a state machine over
/// `{New, Running, Paused, Stopped, Finished}` owning its pipeline runs.
///
/// Stage transitions are driven by the worker under its writer lock, plus
/// one internal transition when a pipeline run ends on its own. A failed run
/// parks the task in `Paused` with the failure recorded, so the checker and
/// the control plane can observe and retry it.
pub struct SubTask {
    name: String,
    factory: Arc<dyn UnitFactory>,
    cfg: RwLock<SubTaskConfig>,
    pipeline: RwLock<Arc<dyn Pipeline>>,
    state: RwLock<TaskState>,
    run_state: Mutex<RunState>,
}

impl SubTask {
    pub fn new(cfg: SubTaskConfig, factory: Arc<dyn UnitFactory>) -> Self {
        let pipeline: Arc<dyn Pipeline> = Arc::from(factory.create_pipeline(&cfg));
        Self {
            name: cfg.name.clone(),
            factory,
            cfg: RwLock::new(cfg),
            pipeline: RwLock::new(pipeline),
            state: RwLock::new(TaskState {
                stage: Stage::New,
                result: None,
            }),
            run_state: Mutex::new(RunState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> Stage {
        self.state.read().unwrap().stage
    }

    pub fn result(&self) -> Option<ProcessResult> {
        self.state.read().unwrap().result.clone()
    }

    pub fn config(&self) -> SubTaskConfig {
        self.cfg.read().unwrap().clone()
    }

    pub fn status(&self) -> SubTaskStatus {
        let state = self.state.read().unwrap();
        SubTaskStatus {
            name: self.name.clone(),
            stage: state.stage,
            result: state.result.clone(),
        }
    }

    /// Replaces the effective config and rebuilds the pipeline from it.
    pub(crate) fn set_config(&self, cfg: SubTaskConfig) {
        let pipeline: Arc<dyn Pipeline> = Arc::from(self.factory.create_pipeline(&cfg));
        *self.pipeline.write().unwrap() = pipeline;
        *self.cfg.write().unwrap() = cfg;
    }

    /// Drives a fresh subtask to its expected stage.
    ///
    /// Only `Running` and `Paused` are valid targets for a new task; any
    /// other expectation is a configuration error and parks the task failed.
    pub fn run(self: &Arc<Self>, expect: Stage) {
        if self.stage() != Stage::New {
            warn!(task = %self.name, stage = %self.stage(), "run called on a task that already ran");
            return;
        }
        match expect {
            Stage::Running => self.spawn_pipeline(),
            Stage::Paused => {
                self.state.write().unwrap().stage = Stage::Paused;
                info!(task = %self.name, "subtask created paused");
            }
            other => self.fail(PipelineError::fatal(format!(
                "invalid expected stage {other} for a new sub task"
            ))),
        }
    }

    /// Suspends a running task, cancelling its pipeline run.
    pub async fn pause(&self) -> Result<(), WorkerError> {
        {
            let mut state = self.state.write().unwrap();
            if state.stage != Stage::Running {
                return Err(WorkerError::InvalidTaskOp {
                    task: self.name.clone(),
                    op: "pause".to_string(),
                });
            }
            state.stage = Stage::Paused;
            state.result = Some(ProcessResult::canceled());
        }
        self.stop_pipeline().await;
        info!(task = %self.name, "subtask paused");
        Ok(())
    }

    /// Restarts the pipeline of a paused task.
    pub fn resume(self: &Arc<Self>) -> Result<(), WorkerError> {
        if self.stage() != Stage::Paused {
            return Err(WorkerError::InvalidTaskOp {
                task: self.name.clone(),
                op: "resume".to_string(),
            });
        }
        self.spawn_pipeline();
        info!(task = %self.name, "subtask resumed");
        Ok(())
    }

    /// Replaces the config of a paused task.
    pub fn update(&self, cfg: SubTaskConfig) -> Result<(), WorkerError> {
        if self.stage() != Stage::Paused {
            return Err(WorkerError::InvalidTaskOp {
                task: self.name.clone(),
                op: "update".to_string(),
            });
        }
        self.set_config(cfg);
        info!(task = %self.name, "subtask config updated");
        Ok(())
    }

    /// Stops the task permanently. Legal from any stage; idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.write().unwrap();
            if state.stage == Stage::Stopped {
                return;
            }
            state.stage = Stage::Stopped;
        }
        self.stop_pipeline().await;
        info!(task = %self.name, "subtask closed");
    }

    /// Records a failure and parks the task paused so that the checker may
    /// retry it later.
    pub(crate) fn fail(&self, err: PipelineError) {
        error!(task = %self.name, error = %err, "subtask failed");
        let mut state = self.state.write().unwrap();
        state.stage = Stage::Paused;
        state.result = Some(ProcessResult::failed(err));
    }

    /// Forwards a schema operation to the pipeline. Legal while running or
    /// paused.
    pub fn operate_schema(&self, req: &SchemaRequest) -> Result<String, WorkerError> {
        self.check_operable("operate-schema")?;
        let pipeline = Arc::clone(&*self.pipeline.read().unwrap());
        pipeline.operate_schema(req).map_err(WorkerError::Pipeline)
    }

    /// Forwards an error intervention to the pipeline. Legal while running
    /// or paused.
    pub fn handle_error(&self, req: &HandleErrorRequest) -> Result<(), WorkerError> {
        self.check_operable("handle-error")?;
        let pipeline = Arc::clone(&*self.pipeline.read().unwrap());
        pipeline.handle_error(req).map_err(WorkerError::Pipeline)
    }

    fn check_operable(&self, op: &str) -> Result<(), WorkerError> {
        match self.stage() {
            Stage::Running | Stage::Paused => Ok(()),
            _ => Err(WorkerError::InvalidTaskOp {
                task: self.name.clone(),
                op: op.to_string(),
            }),
        }
    }

    fn spawn_pipeline(self: &Arc<Self>) {
        let pipeline = Arc::clone(&*self.pipeline.read().unwrap());
        let cancel = CancellationToken::new();
        {
            let mut state = self.state.write().unwrap();
            state.stage = Stage::Running;
            state.result = None;
        }
        let task = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let outcome = pipeline.run(token.clone()).await;
            task.on_pipeline_exit(outcome, &token);
        });
        let mut run = self.run_state.lock().unwrap();
        run.cancel = Some(cancel);
        run.handle = Some(handle);
    }

    /// Cancels the current pipeline run and waits for it to settle.
    async fn stop_pipeline(&self) {
        let (cancel, handle) = {
            let mut run = self.run_state.lock().unwrap();
            (run.cancel.take(), run.handle.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(task = %self.name, error = %err, "pipeline task panicked");
            }
        }
    }

    /// Applies the outcome of a pipeline run that ended on its own.
    ///
    /// Cancelled runs are ignored: the operation that cancelled them owns
    /// the stage transition.
    fn on_pipeline_exit(&self, outcome: Result<(), PipelineError>, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        let mut state = self.state.write().unwrap();
        if state.stage == Stage::Stopped {
            return;
        }
        match outcome {
            Ok(()) => {
                state.stage = Stage::Finished;
                state.result = Some(ProcessResult::success());
                info!(task = %self.name, "pipeline finished");
            }
            Err(err) => {
                state.stage = Stage::Paused;
                state.result = Some(ProcessResult::failed(err.clone()));
                error!(task = %self.name, error = %err, "pipeline failed, task paused");
            }
        }
    }
}

impl std::fmt::Debug for SubTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubTask")
            .field("name", &self.name)
            .field("stage", &self.stage())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::BinlogLocation;
    use crate::config::SourceConfig;
    use crate::relay::RelayUnit;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Pipeline that runs until cancelled, optionally failing first.
    struct ScriptedPipeline {
        fail_with: Option<PipelineError>,
        runs: Arc<AtomicUsize>,
    }

    impl Pipeline for ScriptedPipeline {
        fn run(
            &self,
            cancel: CancellationToken,
        ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let fail_with = self.fail_with.clone();
            Box::pin(async move {
                match fail_with {
                    Some(err) => Err(err),
                    None => {
                        cancel.cancelled().await;
                        Ok(())
                    }
                }
            })
        }

        fn operate_schema(&self, req: &SchemaRequest) -> Result<String, PipelineError> {
            Ok(format!("CREATE TABLE `{}`.`{}`", req.database, req.table))
        }

        fn handle_error(&self, _req: &HandleErrorRequest) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    struct ScriptedFactory {
        fail_with: Option<PipelineError>,
        runs: Arc<AtomicUsize>,
    }

    impl ScriptedFactory {
        fn ok() -> Self {
            Self {
                fail_with: None,
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing(err: PipelineError) -> Self {
            Self {
                fail_with: Some(err),
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl UnitFactory for ScriptedFactory {
        fn create_pipeline(&self, _cfg: &SubTaskConfig) -> Box<dyn Pipeline> {
            Box::new(ScriptedPipeline {
                fail_with: self.fail_with.clone(),
                runs: Arc::clone(&self.runs),
            })
        }

        fn create_relay(&self, _cfg: &SourceConfig) -> Box<dyn RelayUnit> {
            unimplemented!("subtask tests never build a relay")
        }

        fn checkpoint_location<'a>(
            &'a self,
            _cfg: &'a SubTaskConfig,
        ) -> Pin<Box<dyn Future<Output = Result<Option<BinlogLocation>, PipelineError>> + Send + 'a>>
        {
            Box::pin(async { Ok(None) })
        }
    }

    fn subtask(factory: ScriptedFactory) -> Arc<SubTask> {
        Arc::new(SubTask::new(
            SubTaskConfig::new("t1", "s1"),
            Arc::new(factory),
        ))
    }

    async fn wait_for_stage(st: &SubTask, want: Stage) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while st.stage() != want {
            assert!(
                tokio::time::Instant::now() < deadline,
                "stage stuck at {} waiting for {want}",
                st.stage()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn run_to_running_then_pause_and_resume() {
        let st = subtask(ScriptedFactory::ok());
        assert_eq!(st.stage(), Stage::New);

        st.run(Stage::Running);
        assert_eq!(st.stage(), Stage::Running);

        st.pause().await.unwrap();
        assert_eq!(st.stage(), Stage::Paused);
        assert!(st.result().unwrap().is_canceled);

        st.resume().unwrap();
        assert_eq!(st.stage(), Stage::Running);
        assert_eq!(st.result(), None);

        st.close().await;
        assert_eq!(st.stage(), Stage::Stopped);
    }

    #[tokio::test]
    async fn run_to_paused_creates_without_pipeline() {
        let factory = ScriptedFactory::ok();
        let runs = Arc::clone(&factory.runs);
        let st = subtask(factory);
        st.run(Stage::Paused);
        assert_eq!(st.stage(), Stage::Paused);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        st.resume().unwrap();
        assert_eq!(st.stage(), Stage::Running);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        st.close().await;
    }

    #[tokio::test]
    async fn invalid_expect_parks_the_task_failed() {
        let st = subtask(ScriptedFactory::ok());
        st.run(Stage::Stopped);
        assert_eq!(st.stage(), Stage::Paused);
        let result = st.result().unwrap();
        assert!(result.is_failure());
        assert!(!result.can_auto_resume());
    }

    #[tokio::test]
    async fn pipeline_failure_parks_the_task_paused() {
        let st = subtask(ScriptedFactory::failing(PipelineError::resumable(
            "lost connection",
        )));
        st.run(Stage::Running);
        wait_for_stage(&st, Stage::Paused).await;
        let result = st.result().unwrap();
        assert!(result.can_auto_resume());
        assert_eq!(result.error.unwrap().message, "lost connection");
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let st = subtask(ScriptedFactory::ok());
        assert!(st.pause().await.is_err());
        assert!(st.resume().is_err());
        assert!(st.update(SubTaskConfig::new("t1", "s1")).is_err());

        st.run(Stage::Running);
        assert!(st.resume().is_err());
        assert!(st.update(SubTaskConfig::new("t1", "s1")).is_err());
        st.close().await;
        assert!(st.pause().await.is_err());
    }

    #[tokio::test]
    async fn update_only_while_paused() {
        let st = subtask(ScriptedFactory::ok());
        st.run(Stage::Running);
        st.pause().await.unwrap();

        let mut cfg = SubTaskConfig::new("t1", "s1");
        cfg.server_id = 7;
        st.update(cfg).unwrap();
        assert_eq!(st.config().server_id, 7);
    }

    #[tokio::test]
    async fn schema_and_error_ops_require_running_or_paused() {
        let st = subtask(ScriptedFactory::ok());
        let req = SchemaRequest {
            task: "t1".to_string(),
            database: "shop".to_string(),
            table: "orders".to_string(),
            op: SchemaOp::Get,
            schema: None,
        };
        assert!(st.operate_schema(&req).is_err());

        st.run(Stage::Running);
        let schema = st.operate_schema(&req).unwrap();
        assert!(schema.contains("orders"));

        st.pause().await.unwrap();
        st.operate_schema(&req).unwrap();

        st.close().await;
        assert!(st.operate_schema(&req).is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let st = subtask(ScriptedFactory::ok());
        st.run(Stage::Running);
        st.close().await;
        st.close().await;
        assert_eq!(st.stage(), Stage::Stopped);
    }
}
