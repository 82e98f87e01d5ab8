//! Durable checkpoint persistence.
//!
//! A checkpoint records the last source position whose events are known to
//! be durable at the target, so replication can resume from that position
//! after a restart or crash. The store contract is deliberately narrow so
//! alternate backends (key-value store, object store) can substitute for
//! the filesystem reference implementation.
//!
//! # Example
//!
//! ```rust,no_run
//! use librarian::checkpoint::{Checkpoint, Checkpointer, FilesystemCheckpointer};
//!
//! #[tokio::main]
//! async fn main() -> librarian::Result<()> {
//!     let store = FilesystemCheckpointer::new("./checkpoints");
//!
//!     if let Some(checkpoint) = store.load("r1").await? {
//!         println!("resuming from {}", checkpoint.position_str());
//!     }
//!
//!     let checkpoint = Checkpoint::new("r1", b"0/16B3748".to_vec());
//!     store.save(&checkpoint).await?;
//!     Ok(())
//! }
//! ```

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{Error, Result};

/// The current stream position of one replicator.
///
/// `position` is opaque: an LSN string for PostgreSQL, a base64 resume
/// token for MongoDB. It round-trips through the store byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub replicator_id: String,
    #[serde(with = "base64_bytes")]
    pub position: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(replicator_id: impl Into<String>, position: Vec<u8>) -> Self {
        Self {
            replicator_id: replicator_id.into(),
            position,
            timestamp: Utc::now(),
        }
    }

    pub fn position_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.position)
    }
}

#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Returns the current checkpoint for a replicator, or `None` when no
    /// checkpoint exists. Absence is not an error.
    async fn load(&self, replicator_id: &str) -> Result<Option<Checkpoint>>;

    /// Persists a checkpoint durably and atomically: a concurrent reader
    /// or a crash sees either the prior value or the new one, never a
    /// partial write.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Removes a replicator's checkpoint. Idempotent; deleting a
    /// non-existent checkpoint is not an error.
    async fn delete(&self, replicator_id: &str) -> Result<()>;
}

/// Checkpointer that persists nothing, for embedding a replicator without
/// durability.
pub struct NoopCheckpointer;

#[async_trait]
impl Checkpointer for NoopCheckpointer {
    async fn load(&self, _replicator_id: &str) -> Result<Option<Checkpoint>> {
        Ok(None)
    }

    async fn save(&self, _checkpoint: &Checkpoint) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _replicator_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Filesystem-backed checkpoint store.
///
/// Each replicator gets one JSON file, `<base>/<id>.checkpoint`. Saves
/// write to `<base>/<id>.checkpoint.tmp`, fsync, then rename over the
/// final path, so the file is never partially written. All operations
/// serialise on a per-store mutex.
pub struct FilesystemCheckpointer {
    base_dir: PathBuf,
    lock: Mutex<()>,
}

impl FilesystemCheckpointer {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn path_for(&self, replicator_id: &str) -> PathBuf {
        self.base_dir.join(format!("{replicator_id}.checkpoint"))
    }
}

#[async_trait]
impl Checkpointer for FilesystemCheckpointer {
    async fn load(&self, replicator_id: &str) -> Result<Option<Checkpoint>> {
        let _guard = self.lock.lock().await;

        let path = self.path_for(replicator_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(replicator_id, "no checkpoint found");
                return Ok(None);
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let checkpoint: Checkpoint = serde_json::from_str(&content).map_err(|e| {
            Error::Checkpoint(format!("invalid checkpoint file {}: {e}", path.display()))
        })?;

        info!(
            replicator_id,
            timestamp = %checkpoint.timestamp,
            "checkpoint loaded"
        );
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let _guard = self.lock.lock().await;

        fs::create_dir_all(&self.base_dir).await?;

        let path = self.path_for(&checkpoint.replicator_id);
        let temp_path = path.with_extension("checkpoint.tmp");

        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;

        debug!(
            replicator_id = %checkpoint.replicator_id,
            timestamp = %checkpoint.timestamp,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn delete(&self, replicator_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        match fs::remove_file(self.path_for(replicator_id)).await {
            Ok(()) => {
                info!(replicator_id, "checkpoint deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
