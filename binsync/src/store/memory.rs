//! In-process coordination store.
//!
//! [`MemStore`] implements [`StoreClient`] against process-local state with
//! real revision numbers, watch fan-out and history compaction. It backs the
//! integration tests and doubles as an embedded store for single-process
//! deployments; the networked store transport lives outside this crate.

use super::{ExpectedStage, Revision, StoreClient, StoreError};
use crate::config::SubTaskConfig;
use crate::stage::Stage;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
enum WatchItem {
    Stage(ExpectedStage),
    Error(StoreError),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    Relay,
    Subtask,
}

struct Watcher {
    id: u64,
    source: String,
    kind: WatchKind,
    tx: mpsc::UnboundedSender<WatchItem>,
}

#[derive(Default)]
struct Inner {
    revision: Revision,
    /// Compact revision: history strictly below it is gone.
    compacted: Revision,
    next_watcher_id: u64,
    relay_stages: HashMap<String, ExpectedStage>,
    /// source -> task -> current expected stage.
    subtask_stages: HashMap<String, HashMap<String, ExpectedStage>>,
    /// source -> task -> config history in revision order; `None` = deleted.
    #[allow(clippy::type_complexity)]
    subtask_configs: HashMap<String, HashMap<String, Vec<(Revision, Option<SubTaskConfig>)>>>,
    /// Committed stage events, pruned by compaction.
    events: Vec<ExpectedStage>,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn next_revision(&mut self) -> Revision {
        self.revision += 1;
        self.revision
    }

    fn commit(&mut self, event: ExpectedStage) {
        let kind = if event.task.is_empty() {
            WatchKind::Relay
        } else {
            WatchKind::Subtask
        };
        for watcher in &self.watchers {
            if watcher.kind == kind && watcher.source == event.source {
                let _ = watcher.tx.send(WatchItem::Stage(event.clone()));
            }
        }
        self.events.push(event);
    }
}

/// Process-local [`StoreClient`] implementation.
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Latest committed revision.
    pub fn revision(&self) -> Revision {
        self.inner.lock().unwrap().revision
    }

    /// Records the relay expected stage for a source.
    pub fn put_relay_stage(&self, source: &str, expect: Stage) -> Revision {
        let mut inner = self.inner.lock().unwrap();
        let rev = inner.next_revision();
        let stage = ExpectedStage::relay(source, expect, rev);
        inner.relay_stages.insert(source.to_string(), stage.clone());
        inner.commit(stage);
        rev
    }

    /// Deletes the relay record, emitting a tombstone event.
    pub fn delete_relay_stage(&self, source: &str) -> Revision {
        let mut inner = self.inner.lock().unwrap();
        let rev = inner.next_revision();
        inner.relay_stages.remove(source);
        inner.commit(ExpectedStage::relay(source, Stage::Stopped, rev).deleted());
        rev
    }

    /// Records a subtask config and expected stage under one revision, the
    /// way the control plane commits both keys atomically.
    pub fn put_subtask(
        &self,
        source: &str,
        task: &str,
        cfg: SubTaskConfig,
        expect: Stage,
    ) -> Revision {
        let mut inner = self.inner.lock().unwrap();
        let rev = inner.next_revision();
        inner
            .subtask_configs
            .entry(source.to_string())
            .or_default()
            .entry(task.to_string())
            .or_default()
            .push((rev, Some(cfg)));
        let stage = ExpectedStage::subtask(source, task, expect, rev);
        inner
            .subtask_stages
            .entry(source.to_string())
            .or_default()
            .insert(task.to_string(), stage.clone());
        inner.commit(stage);
        rev
    }

    /// Updates only the expected stage of an existing subtask.
    pub fn put_subtask_stage(&self, source: &str, task: &str, expect: Stage) -> Revision {
        let mut inner = self.inner.lock().unwrap();
        let rev = inner.next_revision();
        let stage = ExpectedStage::subtask(source, task, expect, rev);
        inner
            .subtask_stages
            .entry(source.to_string())
            .or_default()
            .insert(task.to_string(), stage.clone());
        inner.commit(stage);
        rev
    }

    /// Removes a subtask's stage and config, emitting a tombstone event.
    pub fn delete_subtask(&self, source: &str, task: &str) -> Revision {
        let mut inner = self.inner.lock().unwrap();
        let rev = inner.next_revision();
        if let Some(stages) = inner.subtask_stages.get_mut(source) {
            stages.remove(task);
        }
        if let Some(configs) = inner.subtask_configs.get_mut(source) {
            configs.entry(task.to_string()).or_default().push((rev, None));
        }
        inner.commit(ExpectedStage::subtask(source, task, Stage::Stopped, rev).deleted());
        rev
    }

    /// Compacts history strictly below `revision`. Watches that start below
    /// the compact revision observe [`StoreError::Compacted`].
    pub fn compact(&self, revision: Revision) {
        let mut inner = self.inner.lock().unwrap();
        inner.compacted = inner.compacted.max(revision);
        let compacted = inner.compacted;
        inner.events.retain(|e| e.revision >= compacted);
    }

    /// Pushes an error to every open watch, emulating a transport failure.
    pub fn inject_watch_error(&self, err: StoreError) {
        let inner = self.inner.lock().unwrap();
        for watcher in &inner.watchers {
            let _ = watcher.tx.send(WatchItem::Error(err.clone()));
        }
    }

    /// Number of currently open watches.
    pub fn open_watches(&self) -> usize {
        self.inner.lock().unwrap().watchers.len()
    }

    fn watch(
        &self,
        kind: WatchKind,
        source: &str,
        from_revision: Revision,
        stage_tx: mpsc::Sender<ExpectedStage>,
        err_tx: mpsc::Sender<StoreError>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let source = source.to_string();
        let (id, rx, compact_err, backlog) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.compacted > 0 && from_revision < inner.compacted {
                (0, None, Some(StoreError::Compacted(inner.compacted)), Vec::new())
            } else {
                let backlog: Vec<ExpectedStage> = inner
                    .events
                    .iter()
                    .filter(|e| {
                        e.revision >= from_revision
                            && e.source == source
                            && (e.task.is_empty()) == (kind == WatchKind::Relay)
                    })
                    .cloned()
                    .collect();
                let (tx, rx) = mpsc::unbounded_channel();
                let id = inner.next_watcher_id;
                inner.next_watcher_id += 1;
                inner.watchers.push(Watcher {
                    id,
                    source: source.clone(),
                    kind,
                    tx,
                });
                (id, Some(rx), None, backlog)
            }
        };

        Box::pin(async move {
            if let Some(err) = compact_err {
                let _ = err_tx.send(err).await;
                return;
            }
            let mut rx = match rx {
                Some(rx) => rx,
                None => return,
            };

            'stream: {
                for event in backlog {
                    if stage_tx.send(event).await.is_err() {
                        break 'stream;
                    }
                }
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        item = rx.recv() => match item {
                            None => break,
                            Some(WatchItem::Stage(event)) => {
                                if stage_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Some(WatchItem::Error(err)) => {
                                if err_tx.send(err).await.is_err() {
                                    break;
                                }
                            }
                        },
                    }
                }
            }

            let mut inner = self.inner.lock().unwrap();
            inner.watchers.retain(|w| w.id != id);
        })
    }
}

impl StoreClient for MemStore {
    fn get_relay_stage(
        &self,
        source: &str,
    ) -> Result<(Option<ExpectedStage>, Revision), StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok((inner.relay_stages.get(source).cloned(), inner.revision))
    }

    fn get_subtask_stages_and_configs(
        &self,
        source: &str,
    ) -> Result<
        (
            HashMap<String, ExpectedStage>,
            HashMap<String, SubTaskConfig>,
            Revision,
        ),
        StoreError,
    > {
        let inner = self.inner.lock().unwrap();
        let stages = inner.subtask_stages.get(source).cloned().unwrap_or_default();
        let mut configs = HashMap::new();
        if let Some(tasks) = inner.subtask_configs.get(source) {
            for (task, history) in tasks {
                if let Some((_, Some(cfg))) = history.last() {
                    configs.insert(task.clone(), cfg.clone());
                }
            }
        }
        Ok((stages, configs, inner.revision))
    }

    fn get_subtask_config(
        &self,
        source: &str,
        task: &str,
        revision: Revision,
    ) -> Result<Option<SubTaskConfig>, StoreError> {
        let inner = self.inner.lock().unwrap();
        if inner.compacted > 0 && revision < inner.compacted {
            return Err(StoreError::Compacted(inner.compacted));
        }
        let cfg = inner
            .subtask_configs
            .get(source)
            .and_then(|tasks| tasks.get(task))
            .and_then(|history| {
                history
                    .iter()
                    .rev()
                    .find(|(rev, _)| *rev <= revision)
                    .and_then(|(_, cfg)| cfg.clone())
            });
        Ok(cfg)
    }

    fn watch_relay_stage(
        &self,
        source: &str,
        from_revision: Revision,
        stage_tx: mpsc::Sender<ExpectedStage>,
        err_tx: mpsc::Sender<StoreError>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.watch(WatchKind::Relay, source, from_revision, stage_tx, err_tx, cancel)
    }

    fn watch_subtask_stage(
        &self,
        source: &str,
        from_revision: Revision,
        stage_tx: mpsc::Sender<ExpectedStage>,
        err_tx: mpsc::Sender<StoreError>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.watch(WatchKind::Subtask, source, from_revision, stage_tx, err_tx, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn cfg(name: &str) -> SubTaskConfig {
        SubTaskConfig {
            name: name.to_string(),
            ..SubTaskConfig::default()
        }
    }

    #[test]
    fn revisions_increase_per_commit() {
        let store = MemStore::new();
        let r1 = store.put_relay_stage("s1", Stage::Running);
        let r2 = store.put_subtask("s1", "t1", cfg("t1"), Stage::Running);
        assert!(r2 > r1);
        assert_eq!(store.revision(), r2);
    }

    #[test]
    fn historical_config_read() {
        let store = MemStore::new();
        let mut c1 = cfg("t1");
        c1.server_id = 1;
        let r1 = store.put_subtask("s1", "t1", c1, Stage::Running);
        let mut c2 = cfg("t1");
        c2.server_id = 2;
        let r2 = store.put_subtask("s1", "t1", c2, Stage::Running);

        let at_r1 = store.get_subtask_config("s1", "t1", r1).unwrap().unwrap();
        assert_eq!(at_r1.server_id, 1);
        let at_r2 = store.get_subtask_config("s1", "t1", r2).unwrap().unwrap();
        assert_eq!(at_r2.server_id, 2);
        assert_eq!(store.get_subtask_config("s1", "t1", 0).unwrap(), None);
    }

    #[test]
    fn compaction_rejects_historical_reads() {
        let store = MemStore::new();
        let r1 = store.put_subtask("s1", "t1", cfg("t1"), Stage::Running);
        let r2 = store.put_subtask_stage("s1", "t1", Stage::Paused);
        store.compact(r2);
        assert!(matches!(
            store.get_subtask_config("s1", "t1", r1),
            Err(StoreError::Compacted(_))
        ));
    }

    #[tokio::test]
    async fn watch_replays_backlog_and_streams_new_events() {
        let store = Arc::new(MemStore::new());
        let r1 = store.put_subtask("s1", "t1", cfg("t1"), Stage::Running);

        let (stage_tx, mut stage_rx) = mpsc::channel(16);
        let (err_tx, _err_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let watcher = {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                store
                    .watch_subtask_stage("s1", r1, stage_tx, err_tx, cancel)
                    .await;
            })
        };

        let backlog = stage_rx.recv().await.unwrap();
        assert_eq!(backlog.expect, Stage::Running);

        store.put_subtask_stage("s1", "t1", Stage::Paused);
        let live = stage_rx.recv().await.unwrap();
        assert_eq!(live.expect, Stage::Paused);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.open_watches(), 0);
    }

    #[tokio::test]
    async fn watch_from_compacted_revision_errors() {
        let store = Arc::new(MemStore::new());
        store.put_subtask("s1", "t1", cfg("t1"), Stage::Running);
        let r2 = store.put_subtask_stage("s1", "t1", Stage::Paused);
        store.compact(r2);

        let (stage_tx, _stage_rx) = mpsc::channel(16);
        let (err_tx, mut err_rx) = mpsc::channel(16);
        store
            .watch_subtask_stage("s1", 1, stage_tx, err_tx, CancellationToken::new())
            .await;
        let err = err_rx.recv().await.unwrap();
        assert!(matches!(err, StoreError::Compacted(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn injected_errors_reach_watchers() {
        let store = Arc::new(MemStore::new());
        let (stage_tx, _stage_rx) = mpsc::channel(16);
        let (err_tx, mut err_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let watcher = {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                store
                    .watch_relay_stage("s1", 1, stage_tx, err_tx, cancel)
                    .await;
            })
        };

        // Give the watcher time to register before injecting.
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.inject_watch_error(StoreError::ConnectionReset);
        let err = err_rx.recv().await.unwrap();
        assert!(matches!(err, StoreError::ConnectionReset));

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), watcher).await;
    }

    #[test]
    fn delete_subtask_clears_stage_and_config() {
        let store = MemStore::new();
        store.put_subtask("s1", "t1", cfg("t1"), Stage::Running);
        let r = store.delete_subtask("s1", "t1");
        let (stages, configs, rev) = store.get_subtask_stages_and_configs("s1").unwrap();
        assert!(stages.is_empty());
        assert!(configs.is_empty());
        assert_eq!(rev, r);
    }
}
