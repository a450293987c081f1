//! Relay subsystem: lifecycle of the binlog streaming process and eviction
//! of the log files it writes.

mod purger;

pub use purger::{PurgeInterceptor, PurgeRequest, RelayPurger};

use crate::config::SourceConfig;
use crate::stage::Stage;
use crate::subtask::{PipelineError, ProcessResult};
use crate::worker::WorkerError;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Operations on the relay stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOp {
    Pause,
    Resume,
    Stop,
}

impl RelayOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayOp::Pause => "pause-relay",
            RelayOp::Resume => "resume-relay",
            RelayOp::Stop => "stop-relay",
        }
    }
}

/// The external binlog streaming process.
///
/// Same contract as a subtask pipeline: `run` executes until completion,
/// failure, or cancellation, and may be called again after a cancelled or
/// failed run.
pub trait RelayUnit: Send + Sync + 'static {
    fn run(
        &self,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>>;
}

struct HolderState {
    stage: Stage,
    result: Option<ProcessResult>,
}

#[derive(Default)]
struct RunState {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Owns the relay stream's lifecycle.
///
/// Stage transitions mirror a subtask's. The holder is safe to close without
/// ever having started.
pub struct RelayHolder {
    cfg: SourceConfig,
    unit: Arc<dyn RelayUnit>,
    state: RwLock<HolderState>,
    run_state: Mutex<RunState>,
}

impl RelayHolder {
    pub fn new(cfg: SourceConfig, unit: Box<dyn RelayUnit>) -> Self {
        Self {
            cfg,
            unit: Arc::from(unit),
            state: RwLock::new(HolderState {
                stage: Stage::New,
                result: None,
            }),
            run_state: Mutex::new(RunState::default()),
        }
    }

    /// Builds the purger over the relay directory, wiring in the given
    /// interceptors.
    pub fn init(
        &self,
        interceptors: Vec<Arc<dyn PurgeInterceptor>>,
    ) -> Result<Arc<RelayPurger>, WorkerError> {
        let purger = RelayPurger::new(
            self.cfg.relay_dir.clone(),
            self.cfg.purge.clone(),
            interceptors,
        )?;
        Ok(Arc::new(purger))
    }

    pub fn stage(&self) -> Stage {
        self.state.read().unwrap().stage
    }

    pub fn result(&self) -> Option<ProcessResult> {
        self.state.read().unwrap().result.clone()
    }

    /// Starts the relay stream. Only meaningful on a fresh holder.
    pub fn start(self: &Arc<Self>) {
        if self.stage() != Stage::New {
            warn!(stage = %self.stage(), "relay start ignored, holder already ran");
            return;
        }
        self.spawn_unit();
        info!(source = %self.cfg.source_id, "relay started");
    }

    /// Applies one relay operation.
    pub async fn operate(self: &Arc<Self>, op: RelayOp) -> Result<(), WorkerError> {
        match op {
            RelayOp::Pause => {
                {
                    let mut state = self.state.write().unwrap();
                    if state.stage != Stage::Running {
                        return Err(WorkerError::InvalidRelayOp {
                            op: op.as_str(),
                            stage: state.stage,
                        });
                    }
                    state.stage = Stage::Paused;
                    state.result = Some(ProcessResult::canceled());
                }
                self.stop_unit().await;
                info!("relay paused");
                Ok(())
            }
            RelayOp::Resume => {
                if self.stage() != Stage::Paused {
                    return Err(WorkerError::InvalidRelayOp {
                        op: op.as_str(),
                        stage: self.stage(),
                    });
                }
                self.spawn_unit();
                info!("relay resumed");
                Ok(())
            }
            RelayOp::Stop => {
                self.close().await;
                Ok(())
            }
        }
    }

    /// Stops the relay permanently. Safe without a prior start; idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.write().unwrap();
            if state.stage == Stage::Stopped {
                return;
            }
            state.stage = Stage::Stopped;
        }
        self.stop_unit().await;
        info!(source = %self.cfg.source_id, "relay closed");
    }

    fn spawn_unit(self: &Arc<Self>) {
        let unit = Arc::clone(&self.unit);
        let cancel = CancellationToken::new();
        {
            let mut state = self.state.write().unwrap();
            state.stage = Stage::Running;
            state.result = None;
        }
        let holder = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let outcome = unit.run(token.clone()).await;
            holder.on_unit_exit(outcome, &token);
        });
        let mut run = self.run_state.lock().unwrap();
        run.cancel = Some(cancel);
        run.handle = Some(handle);
    }

    async fn stop_unit(&self) {
        let (cancel, handle) = {
            let mut run = self.run_state.lock().unwrap();
            (run.cancel.take(), run.handle.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "relay unit task panicked");
            }
        }
    }

    /// Applies the outcome of a relay run that ended on its own. Cancelled
    /// runs are owned by the operation that cancelled them.
    fn on_unit_exit(&self, outcome: Result<(), PipelineError>, token: &CancellationToken) {
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
                info!("relay finished");
            }
            Err(err) => {
                state.stage = Stage::Paused;
                state.result = Some(ProcessResult::failed(err.clone()));
                error!(error = %err, "relay failed, stream paused");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedRelay {
        fail_with: Option<PipelineError>,
        runs: Arc<AtomicUsize>,
    }

    impl RelayUnit for ScriptedRelay {
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
    }

    fn holder(fail_with: Option<PipelineError>) -> (Arc<RelayHolder>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut cfg = SourceConfig::new("s1");
        cfg.relay_dir = std::env::temp_dir();
        let holder = Arc::new(RelayHolder::new(
            cfg,
            Box::new(ScriptedRelay {
                fail_with,
                runs: Arc::clone(&runs),
            }),
        ));
        (holder, runs)
    }

    #[tokio::test]
    async fn start_pause_resume_stop() {
        let (holder, runs) = holder(None);
        assert_eq!(holder.stage(), Stage::New);

        holder.start();
        assert_eq!(holder.stage(), Stage::Running);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        holder.operate(RelayOp::Pause).await.unwrap();
        assert_eq!(holder.stage(), Stage::Paused);
        assert!(holder.result().unwrap().is_canceled);

        holder.operate(RelayOp::Resume).await.unwrap();
        assert_eq!(holder.stage(), Stage::Running);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        holder.operate(RelayOp::Stop).await.unwrap();
        assert_eq!(holder.stage(), Stage::Stopped);
    }

    #[tokio::test]
    async fn close_without_start_is_safe() {
        let (holder, runs) = holder(None);
        holder.close().await;
        holder.close().await;
        assert_eq!(holder.stage(), Stage::Stopped);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_operations_are_rejected() {
        let (holder, _) = holder(None);
        assert!(holder.operate(RelayOp::Pause).await.is_err());
        assert!(holder.operate(RelayOp::Resume).await.is_err());

        holder.start();
        assert!(holder.operate(RelayOp::Resume).await.is_err());
        holder.close().await;
    }

    #[tokio::test]
    async fn unit_failure_pauses_the_stream() {
        let (holder, _) = holder(Some(PipelineError::resumable("disk full")));
        holder.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while holder.stage() != Stage::Paused {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(holder.result().unwrap().is_failure());
    }

    #[tokio::test]
    async fn second_start_is_ignored() {
        let (holder, runs) = holder(None);
        holder.start();
        holder.start();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        holder.close().await;
    }
}
