//! Background eviction of relay log files.
//!
//! The purger deletes relay files that no consumer will read again, either
//! on a periodic expiration sweep or on demand. Before any pass it consults
//! every registered interceptor; a single veto aborts the pass. Eviction is
//! monotonic per relay subdirectory: files are removed in sequence order and
//! the high-water mark never moves backwards.

use crate::config::PurgeConfig;
use crate::worker::WorkerError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Veto point consulted before every purge pass.
pub trait PurgeInterceptor: Send + Sync + 'static {
    /// Returns the veto reason when purging must not run right now.
    fn forbid_purge(&self) -> Option<String>;
}

/// An on-demand purge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurgeRequest {
    /// Evict files last modified before the given time.
    Time { before: SystemTime },
    /// Evict files ordered before the named file in one relay subdirectory.
    Filename { subdir: String, filename: String },
}

/// Evicts relay log files no longer needed.
pub struct RelayPurger {
    relay_dir: PathBuf,
    cfg: PurgeConfig,
    interceptors: Vec<Arc<dyn PurgeInterceptor>>,
    purging: AtomicBool,
    /// Highest evicted file sequence per relay subdirectory.
    high_water: DashMap<String, u64>,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RelayPurger {
    pub fn new(
        relay_dir: PathBuf,
        cfg: PurgeConfig,
        interceptors: Vec<Arc<dyn PurgeInterceptor>>,
    ) -> Result<Self, WorkerError> {
        if relay_dir.as_os_str().is_empty() {
            return Err(WorkerError::RelayDirNotSet);
        }
        Ok(Self {
            relay_dir,
            cfg,
            interceptors,
            purging: AtomicBool::new(false),
            high_water: DashMap::new(),
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    /// Starts the periodic expiration sweep.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            warn!("relay purger already started");
            return;
        }
        let purger = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { purger.run().await }));
    }

    /// Stops the sweep loop and waits for it.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// True while an eviction pass is in progress.
    pub fn purging(&self) -> bool {
        self.purging.load(Ordering::Acquire)
    }

    /// Runs one on-demand purge pass.
    ///
    /// Fails when an interceptor vetoes or another pass is already running.
    pub fn do_purge(&self, req: PurgeRequest) -> Result<(), WorkerError> {
        if let Some(reason) = self.check_interceptors() {
            return Err(WorkerError::PurgeForbidden(reason));
        }
        self.purge(req)
    }

    async fn run(&self) {
        info!(
            relay_dir = %self.relay_dir.display(),
            interval_secs = self.cfg.interval.as_secs(),
            expires_hours = self.cfg.expires_hours,
            "relay purger starting"
        );
        let mut interval = tokio::time::interval(self.cfg.interval);
        // Skip the immediate first tick.
        interval.tick().await;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("relay purger shutting down");
                    break;
                }

                _ = interval.tick() => {
                    self.auto_pass();
                }
            }
        }
    }

    /// One background expiration sweep; vetoes only log here.
    fn auto_pass(&self) {
        if self.cfg.expires_hours == 0 {
            return;
        }
        if let Some(reason) = self.check_interceptors() {
            debug!(reason = %reason, "skipping purge pass");
            return;
        }
        let before = SystemTime::now() - Duration::from_secs(self.cfg.expires_hours * 3600);
        match self.purge(PurgeRequest::Time { before }) {
            Ok(()) => {}
            Err(WorkerError::PurgeInProgress) => {}
            Err(err) => warn!(error = %err, "automatic purge pass failed"),
        }
    }

    fn check_interceptors(&self) -> Option<String> {
        self.interceptors
            .iter()
            .find_map(|interceptor| interceptor.forbid_purge())
    }

    fn purge(&self, req: PurgeRequest) -> Result<(), WorkerError> {
        if self
            .purging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WorkerError::PurgeInProgress);
        }
        let result = self.purge_pass(&req);
        self.purging.store(false, Ordering::Release);
        result
    }

    fn purge_pass(&self, req: &PurgeRequest) -> Result<(), WorkerError> {
        let mut evicted = 0usize;
        for entry in fs::read_dir(&self.relay_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let subdir_name = entry.file_name().to_string_lossy().into_owned();
            evicted += self.purge_subdir(&entry.path(), &subdir_name, req)?;
        }
        info!(evicted, request = ?req, "purge pass done");
        Ok(())
    }

    fn purge_subdir(
        &self,
        dir: &Path,
        subdir: &str,
        req: &PurgeRequest,
    ) -> Result<usize, WorkerError> {
        let mut files: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(seq) = file_sequence(&entry.file_name().to_string_lossy()) {
                files.push((seq, entry.path()));
            }
        }
        files.sort();
        if files.len() <= 1 {
            // The newest file is the relay's active write target.
            return Ok(0);
        }
        let keep_from = files.len() - 1;

        let watermark = self.high_water.get(subdir).map(|e| *e.value()).unwrap_or(0);
        let mut evicted = 0usize;
        for (seq, path) in files.into_iter().take(keep_from) {
            let evict = match req {
                PurgeRequest::Time { before } => {
                    let modified = fs::metadata(&path)?.modified()?;
                    modified < *before
                }
                PurgeRequest::Filename {
                    subdir: want_dir,
                    filename,
                } => {
                    want_dir == subdir
                        && file_sequence(filename).map_or(false, |limit| seq < limit)
                }
            };
            if !evict {
                // Sequences are evicted in order; the first kept file ends
                // the pass for this subdirectory.
                break;
            }
            if seq <= watermark {
                continue;
            }
            fs::remove_file(&path)?;
            debug!(file = %path.display(), "relay file evicted");
            self.high_water
                .entry(subdir.to_string())
                .and_modify(|w| *w = (*w).max(seq))
                .or_insert(seq);
            evicted += 1;
        }
        Ok(evicted)
    }
}

/// Numeric sequence of a binlog file name, e.g. 5 for `mysql-bin.000005`.
fn file_sequence(name: &str) -> Option<u64> {
    name.rsplit_once('.')
        .and_then(|(_, seq)| seq.parse::<u64>().ok())
}
