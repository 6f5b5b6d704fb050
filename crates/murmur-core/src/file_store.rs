//! Append-only JSON lines store.

use async_trait::async_trait;
use murmur_protocol::EventKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::store::{PersistenceStore, StoreError, StoredEvent};

/// Persists one JSON record per line.
///
/// The file is created on first append. Reading history scans the whole file,
/// which is fine for the modest volumes a single hub produces.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create a store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PersistenceStore for FileStore {
    async fn append(&self, event: &StoredEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn recent_history(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "History file not created yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut history = Vec::with_capacity(limit);
        for line in contents.lines().rev() {
            if history.len() == limit {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredEvent>(line) {
                Ok(event) if event.kind == EventKind::Message => history.push(event),
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Skipping unreadable history line");
                }
            }
        }

        Ok(history)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
