use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::*;

use crate::Job;

/// JSON snapshot of the whole job list.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot, `None` when there is none yet.
    #[instrument(name = "snapshot.load", skip(self), fields(path = %self.path.display()))]
    pub async fn load(&self) -> Result<Option<Vec<Job>>, Error> {
        if !tokio::fs::try_exists(&self.path).await? {
            debug!("No queue snapshot found");
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&self.path)
            .await
            .context("Failed to read queue snapshot")?;
        let jobs: Vec<Job> =
            serde_json::from_str(&json).context("Failed to parse queue snapshot")?;
        debug!(jobs = jobs.len(), "Loaded queue snapshot");
        Ok(Some(jobs))
    }

    /// Write through a temp file and rename it over the snapshot, so readers
    /// never see a partial file.
    #[instrument(name = "snapshot.save", skip_all, fields(path = %self.path.display(), jobs = jobs.len()))]
    pub async fn save(&self, jobs: &[Job]) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(jobs).context("Failed to serialize jobs")?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create snapshot directory")?;
        }

        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &json)
            .await
            .context("Failed to write snapshot file")?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .context("Failed to rename snapshot file")?;

        debug!("Queue snapshot written");
        Ok(())
    }

    /// Start the single writer task. Snapshots are written in the order they
    /// are sent; write errors are logged and dropped.
    pub fn spawn_writer(self) -> (UnboundedSender<Vec<Job>>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Job>>();
        let handle = tokio::spawn(
            async move {
                while let Some(mut jobs) = rx.recv().await {
                    // Only the newest queued snapshot matters.
                    while let Ok(newer) = rx.try_recv() {
                        jobs = newer;
                    }
                    if let Err(err) = self.save(&jobs).await {
                        error!(message = "Failed to persist job queue", error = ?err);
                    }
                }
                debug!("Snapshot writer stopped");
            }
            .instrument(info_span!("snapshot_writer")),
        );
        (tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Status;
    use serde_json::json;

    #[tokio::test]
    async fn missing_snapshot_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("queue.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_keeps_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("nested").join("queue.json"));

        let mut done = Job::new("conversion", json!({"input_path": "a.jar"}), 4);
        done.status = Status::Completed;
        done.result = Some(json!({"files": 3}));
        let pending = Job::new("analysis", json!(null), 1);

        store.save(&[done.clone(), pending.clone()]).await.unwrap();
        assert!(!dir.path().join("nested").join("queue.tmp").exists());

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, vec![done, pending]);
    }

    #[tokio::test]
    async fn snapshot_uses_documented_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("queue.json"));
        let mut job = Job::new("conversion", json!({"x": 1}), 2);
        job.status = Status::Failed;
        job.error = Some("bad archive".into());
        store.save(&[job]).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        let record = &raw[0];
        assert_eq!(record["type"], "conversion");
        assert_eq!(record["status"], "failed");
        assert_eq!(record["error"], "bad archive");
        assert!(record.get("createdAt").is_some());
        assert!(record.get("result").is_none());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(SnapshotStore::new(path).load().await.is_err());
    }
}
