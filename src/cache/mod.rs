//! Local per-service message logs.
//!
//! Each service's thread is an append-only list of messages under the key
//! `"{namespace}:messages:{service_id}"`. A session writes under its own
//! namespace and clears the whole namespace on logout.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::model::{ServiceId, ThreadMessage};

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache entry could not be encoded or decoded: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),
}

/// Key of one service's message log.
pub fn message_key(namespace: &str, service: ServiceId) -> String {
    format!("{namespace}:messages:{service}")
}

fn check_namespace(namespace: &str) -> Result<()> {
    let valid = !namespace.is_empty()
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(format!(
            "namespace {namespace:?} must be non-empty ASCII alphanumerics, '-' or '.'"
        )))
    }
}

/// Append-only message log storage.
#[async_trait]
pub trait MessageCache: Send + Sync {
    /// Append `message` to its service's log. A message already in the log
    /// (same id) is not stored twice.
    async fn append(&self, namespace: &str, message: &ThreadMessage) -> Result<()>;

    /// The service's log in append order.
    async fn load(&self, namespace: &str, service: ServiceId) -> Result<Vec<ThreadMessage>>;

    /// Remove every log under `namespace`.
    async fn clear_namespace(&self, namespace: &str) -> Result<()>;
}

/// In-process cache, for tests and the standalone binary.
#[derive(Default)]
pub struct MemoryMessageCache {
    logs: Mutex<HashMap<String, Vec<ThreadMessage>>>,
}

impl MemoryMessageCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageCache for MemoryMessageCache {
    async fn append(&self, namespace: &str, message: &ThreadMessage) -> Result<()> {
        check_namespace(namespace)?;
        let mut logs = self.logs.lock().await;
        let log = logs
            .entry(message_key(namespace, message.service_ref))
            .or_default();
        if !log.iter().any(|existing| existing.id == message.id) {
            log.push(message.clone());
        }
        Ok(())
    }

    async fn load(&self, namespace: &str, service: ServiceId) -> Result<Vec<ThreadMessage>> {
        check_namespace(namespace)?;
        let logs = self.logs.lock().await;
        Ok(logs
            .get(&message_key(namespace, service))
            .cloned()
            .unwrap_or_default())
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<()> {
        check_namespace(namespace)?;
        let prefix = format!("{namespace}:");
        let mut logs = self.logs.lock().await;
        logs.retain(|key, _| !key.starts_with(&prefix));
        debug!(namespace, "Message cache namespace cleared");
        Ok(())
    }
}

/// One JSON-lines file per key inside a directory.
///
/// File names are the key with `:` replaced by `_`. Writes are serialized
/// through one lock; duplicates are skipped on load.
pub struct FileMessageCache {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileMessageCache {
    /// Use `dir`, creating it if missing.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        info!(path = %dir.display(), "File message cache opened");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, namespace: &str, service: ServiceId) -> PathBuf {
        let name = message_key(namespace, service).replace(':', "_");
        self.dir.join(format!("{name}.jsonl"))
    }

    async fn read_log(path: &Path) -> Result<Vec<ThreadMessage>> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut seen = HashSet::new();
        let mut messages = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ThreadMessage>(line) {
                Ok(message) => {
                    if seen.insert(message.id) {
                        messages.push(message);
                    }
                }
                // A torn final line from an interrupted write is skipped.
                Err(e) => warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping unreadable message log line"
                ),
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl MessageCache for FileMessageCache {
    async fn append(&self, namespace: &str, message: &ThreadMessage) -> Result<()> {
        check_namespace(namespace)?;
        let path = self.file_for(namespace, message.service_ref);
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if Self::read_log(&path)
            .await?
            .iter()
            .any(|existing| existing.id == message.id)
        {
            return Ok(());
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load(&self, namespace: &str, service: ServiceId) -> Result<Vec<ThreadMessage>> {
        check_namespace(namespace)?;
        Self::read_log(&self.file_for(namespace, service)).await
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<()> {
        check_namespace(namespace)?;
        let prefix = format!("{namespace}_");
        let _guard = self.write_lock.lock().await;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let matches = name
                .to_str()
                .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".jsonl"));
            if matches {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        info!(namespace, removed, "Message cache namespace cleared");
        Ok(())
    }
}
