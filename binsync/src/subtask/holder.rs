//! Thread-safe collection of the worker's subtasks.

use super::SubTask;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

/// Maps task name to its [`SubTask`] handle.
///
/// Task-name uniqueness is enforced by the coordination store; the holder
/// only defends against a duplicate slipping through by closing the stale
/// entry it replaces.
#[derive(Default)]
pub struct SubTaskHolder {
    tasks: DashMap<String, Arc<SubTask>>,
}

impl SubTaskHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a subtask, closing any stale entry under the same name.
    pub async fn record(&self, task: Arc<SubTask>) {
        if let Some(stale) = self.tasks.insert(task.name().to_string(), task) {
            warn!(task = %stale.name(), "replacing a sub task already recorded under this name");
            stale.close().await;
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<SubTask>> {
        self.tasks.remove(name).map(|(_, task)| task)
    }

    pub fn find(&self, name: &str) -> Option<Arc<SubTask>> {
        self.tasks.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every recorded subtask.
    pub fn all(&self) -> Vec<Arc<SubTask>> {
        self.tasks
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tasks.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Closes every subtask and drops the collection.
    pub async fn close_all(&self) {
        let tasks = self.all();
        for task in tasks {
            task.close().await;
        }
        self.tasks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubTaskConfig;
    use crate::stage::Stage;
    use crate::subtask::tests_support::NoopFactory;

    fn task(name: &str) -> Arc<SubTask> {
        Arc::new(SubTask::new(
            SubTaskConfig::new(name, "s1"),
            Arc::new(NoopFactory),
        ))
    }

    #[tokio::test]
    async fn record_find_remove() {
        let holder = SubTaskHolder::new();
        assert!(holder.is_empty());

        holder.record(task("t1")).await;
        holder.record(task("t2")).await;
        assert_eq!(holder.len(), 2);
        assert!(holder.find("t1").is_some());
        assert!(holder.find("missing").is_none());

        holder.remove("t1");
        assert!(holder.find("t1").is_none());
        assert_eq!(holder.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_record_closes_stale_entry() {
        let holder = SubTaskHolder::new();
        let stale = task("t1");
        holder.record(Arc::clone(&stale)).await;
        holder.record(task("t1")).await;

        assert_eq!(holder.len(), 1);
        assert_eq!(stale.stage(), Stage::Stopped);
    }

    #[tokio::test]
    async fn close_all_stops_every_task() {
        let holder = SubTaskHolder::new();
        let t1 = task("t1");
        let t2 = task("t2");
        holder.record(Arc::clone(&t1)).await;
        holder.record(Arc::clone(&t2)).await;
        t1.run(Stage::Running);

        holder.close_all().await;
        assert!(holder.is_empty());
        assert_eq!(t1.stage(), Stage::Stopped);
        assert_eq!(t2.stage(), Stage::Stopped);
    }
}
