//! Checkpoint storage
//!
//! Checkpoints form a monotonic log per thread id. Writing an id that is
//! already stored is a no-op; writing an id lower than the latest is rejected.

use async_trait::async_trait;
use schemaflow_core::{Checkpoint, FlowError, Result};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Durable, thread-scoped snapshots of run state
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save_checkpoint(&self, thread_id: &str, checkpoint: &Checkpoint) -> Result<()>;

    /// Checkpoint with the greatest id for the thread
    async fn load_latest_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// Every stored id for the thread, ascending
    async fn checkpoint_ids(&self, thread_id: &str) -> Result<Vec<u64>>;
}

/// Decide whether `attempted` may be appended after `latest`
///
/// `Ok(true)` means write, `Ok(false)` means already stored.
fn check_order(thread_id: &str, latest: Option<u64>, attempted: u64) -> Result<bool> {
    match latest {
        Some(latest) if attempted < latest => Err(FlowError::CheckpointOutOfOrder {
            thread_id: thread_id.to_string(),
            latest,
            attempted,
        }),
        Some(latest) if attempted == latest => Ok(false),
        _ => Ok(true),
    }
}

/// In-process checkpoint store
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    threads: RwLock<HashMap<String, BTreeMap<u64, Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save_checkpoint(&self, thread_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        let mut threads = self.threads.write().await;
        let log = threads.entry(thread_id.to_string()).or_default();
        let latest = log.keys().next_back().copied();

        if check_order(thread_id, latest, checkpoint.checkpoint_id)? {
            log.insert(checkpoint.checkpoint_id, checkpoint.clone());
            debug!(
                "Stored checkpoint {} for thread {}",
                checkpoint.checkpoint_id, thread_id
            );
        }
        Ok(())
    }

    async fn load_latest_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .and_then(|log| log.values().next_back().cloned()))
    }

    async fn checkpoint_ids(&self, thread_id: &str) -> Result<Vec<u64>> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .map(|log| log.keys().copied().collect())
            .unwrap_or_default())
    }
}

fn storage_error(action: &str, path: &Path, err: std::io::Error) -> FlowError {
    FlowError::Checkpoint(format!("Failed to {} {:?}: {}", action, path, err))
}

/// Append-only JSON-lines file per thread
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn thread_path(&self, thread_id: &str) -> PathBuf {
        let safe: String = thread_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.jsonl", safe))
    }

    async fn read_log(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let path = self.thread_path(thread_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_error("read", &path, e)),
        };
        let mut checkpoints = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Checkpoint>(line) {
                Ok(cp) if cp.thread_id == thread_id => checkpoints.push(cp),
                Ok(_) => {}
                Err(e) => {
                    // A torn final write must not hide earlier checkpoints
                    warn!(
                        "Skipping unreadable checkpoint line {} in {:?}: {}",
                        lineno + 1,
                        path,
                        e
                    );
                }
            }
        }
        Ok(checkpoints)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save_checkpoint(&self, thread_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let latest = self
            .read_log(thread_id)
            .await?
            .iter()
            .map(|cp| cp.checkpoint_id)
            .max();
        if !check_order(thread_id, latest, checkpoint.checkpoint_id)? {
            return Ok(());
        }

        let mut line = serde_json::to_string(checkpoint)?;
        line.push('\n');
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| storage_error("create", &self.dir, e))?;

        let path = self.thread_path(thread_id);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| storage_error("open", &path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| storage_error("append to", &path, e))?;
        file.flush()
            .await
            .map_err(|e| storage_error("flush", &path, e))?;

        debug!(
            "Appended checkpoint {} for thread {} to {:?}",
            checkpoint.checkpoint_id, thread_id, path
        );
        Ok(())
    }

    async fn load_latest_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .read_log(thread_id)
            .await?
            .into_iter()
            .max_by_key(|cp| cp.checkpoint_id))
    }

    async fn checkpoint_ids(&self, thread_id: &str) -> Result<Vec<u64>> {
        let mut ids: Vec<u64> = self
            .read_log(thread_id)
            .await?
            .iter()
            .map(|cp| cp.checkpoint_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemaflow_core::{RunRequest, RunState, StageCursor, StageName};
    use tempfile::TempDir;

    fn checkpoint(thread: &str, id: u64) -> Checkpoint {
        let state = RunState::new(
            &RunRequest {
                thread_id: thread.to_string(),
                organization_id: "o".to_string(),
                user_id: "u".to_string(),
                message: "m".to_string(),
            },
            serde_json::Value::Null,
        );
        Checkpoint::new(
            id,
            StageCursor::Pending {
                stage: StageName::GenerateTestcases,
            },
            state,
        )
    }

    async fn exercise_ordering(store: &dyn CheckpointStore) {
        assert!(store.load_latest_checkpoint("t1").await.unwrap().is_none());

        store.save_checkpoint("t1", &checkpoint("t1", 1)).await.unwrap();
        store.save_checkpoint("t1", &checkpoint("t1", 2)).await.unwrap();
        // Same id again is harmless
        store.save_checkpoint("t1", &checkpoint("t1", 2)).await.unwrap();

        let err = store
            .save_checkpoint("t1", &checkpoint("t1", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::CheckpointOutOfOrder { latest: 2, attempted: 1, .. }));

        let latest = store.load_latest_checkpoint("t1").await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, 2);
        assert_eq!(store.checkpoint_ids("t1").await.unwrap(), vec![1, 2]);

        // Threads are independent
        store.save_checkpoint("t2", &checkpoint("t2", 1)).await.unwrap();
        assert_eq!(store.checkpoint_ids("t2").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_memory_store_ordering() {
        exercise_ordering(&MemoryCheckpointStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store_ordering() {
        let dir = TempDir::new().unwrap();
        exercise_ordering(&FileCheckpointStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileCheckpointStore::new(dir.path());
            store.save_checkpoint("t/1", &checkpoint("t/1", 3)).await.unwrap();
        }

        let store = FileCheckpointStore::new(dir.path());
        let latest = store.load_latest_checkpoint("t/1").await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, 3);
        assert_eq!(latest.run_state.thread_id, "t/1");
        assert!(dir.path().join("t_1.jsonl").exists());
    }

    #[tokio::test]
    async fn test_file_store_reports_unusable_dir() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let store = FileCheckpointStore::new(blocker.join("checkpoints"));

        let err = store
            .save_checkpoint("t1", &checkpoint("t1", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Checkpoint(_)), "{:?}", err);
        assert_eq!(err.user_message(), "Internal storage error");
    }

    #[tokio::test]
    async fn test_file_store_skips_torn_line() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save_checkpoint("t1", &checkpoint("t1", 1)).await.unwrap();

        let path = dir.path().join("t1.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"threadId\": \"t1\", \"checkp");
        std::fs::write(&path, content).unwrap();

        let latest = store.load_latest_checkpoint("t1").await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, 1);
    }
}
