//! Content-addressed payload store.
//!
//! Oversized tool results are staged here so that only a reference travels
//! through the rest of the pipeline. Records live on disk under
//! `<root>/<first two key chars>/<key>` and never change once written.
//!
//! Writes go through a temp file and an atomic rename, so concurrent puts of
//! identical bytes collapse into one record. Reads need no locking.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{ErrorKind, PayloadRecord, PayloadRef};

/// Payload store errors
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Payload not found: {key}")]
    NotFound { key: String },

    #[error("Payload store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PayloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Io { .. } => ErrorKind::Storage,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Whether a result of `size` bytes must be staged instead of returned inline
///
/// A result exactly at the threshold stays inline.
pub fn should_stage(size: u64, threshold: u64) -> bool {
    size > threshold
}

/// Derive the content key for a byte slice (SHA-256, hex)
pub fn content_key(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn is_valid_key(key: &str) -> bool {
    key.len() == 64 && key.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Summary of a garbage collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub removed: usize,
    pub retained: usize,
    pub bytes_freed: u64,
}

/// File-based payload store
#[derive(Debug, Clone)]
pub struct PayloadStore {
    root: PathBuf,
}

impl PayloadStore {
    /// Create or open a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, PayloadError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| PayloadError::io(&root, e))?;
        Ok(Self { root })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(&key[..2]).join(key)
    }

    /// Stage bytes and return the record. Identical bytes yield the same record.
    pub async fn put(&self, bytes: &[u8]) -> Result<PayloadRecord, PayloadError> {
        let key = content_key(bytes);
        let path = self.path_for(&key);

        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!(key = %key, "Payload already staged");
            return self.record(&key).await;
        }

        let shard = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(shard)
            .await
            .map_err(|e| PayloadError::io(shard, e))?;

        let tmp_path = shard.join(format!(".{}.{}.tmp", key, Uuid::new_v4()));
        fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| PayloadError::io(&tmp_path, e))?;

        // Same key means same bytes, so losing a rename race is harmless
        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(PayloadError::io(&path, e));
        }

        info!(key = %key, size_bytes = bytes.len(), "Payload staged");
        self.record(&key).await
    }

    /// Fetch the bytes behind a reference
    pub async fn get(&self, reference: &PayloadRef) -> Result<Vec<u8>, PayloadError> {
        self.get_by_key(&reference.key).await
    }

    /// Fetch the bytes stored under `key`
    pub async fn get_by_key(&self, key: &str) -> Result<Vec<u8>, PayloadError> {
        if !is_valid_key(key) {
            return Err(PayloadError::NotFound {
                key: key.to_string(),
            });
        }

        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PayloadError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(PayloadError::io(&path, e)),
        }
    }

    /// Remove a payload. Removing an absent payload is not an error.
    pub async fn delete(&self, reference: &PayloadRef) -> Result<(), PayloadError> {
        if !is_valid_key(&reference.key) {
            return Ok(());
        }

        let path = self.path_for(&reference.key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %reference.key, "Payload deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PayloadError::io(&path, e)),
        }
    }

    /// Check whether a key is present
    pub async fn contains(&self, key: &str) -> bool {
        is_valid_key(key) && fs::try_exists(self.path_for(key)).await.unwrap_or(false)
    }

    /// Load the record for a key
    pub async fn record(&self, key: &str) -> Result<PayloadRecord, PayloadError> {
        if !is_valid_key(key) {
            return Err(PayloadError::NotFound {
                key: key.to_string(),
            });
        }

        let path = self.path_for(key);
        let metadata = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PayloadError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(PayloadError::io(&path, e)),
        };

        let created_at: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(PayloadRecord {
            reference: PayloadRef::new(key, metadata.len()),
            path,
            created_at,
        })
    }

    /// List every record in the store, oldest first
    pub async fn list(&self) -> Result<Vec<PayloadRecord>, PayloadError> {
        let mut records = Vec::new();

        let mut shards = fs::read_dir(&self.root)
            .await
            .map_err(|e| PayloadError::io(&self.root, e))?;

        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(|e| PayloadError::io(&self.root, e))?
        {
            let shard_path = shard.path();
            if !shard_path.is_dir() {
                continue;
            }

            let mut entries = fs::read_dir(&shard_path)
                .await
                .map_err(|e| PayloadError::io(&shard_path, e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| PayloadError::io(&shard_path, e))?
            {
                if let Some(name) = entry.file_name().to_str() {
                    if is_valid_key(name) {
                        records.push(self.record(name).await?);
                    }
                }
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Evict records older than the retention window
    pub async fn gc(&self, retention: Duration) -> Result<GcReport, PayloadError> {
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let cutoff: DateTime<Utc> = cutoff.into();

        let mut report = GcReport::default();
        for record in self.list().await? {
            if record.created_at < cutoff {
                self.delete(&record.reference).await?;
                report.removed += 1;
                report.bytes_freed += record.reference.size_bytes;
            } else {
                report.retained += 1;
            }
        }

        info!(
            removed = report.removed,
            retained = report.retained,
            bytes_freed = report.bytes_freed,
            "Payload gc finished"
        );
        Ok(report)
    }
}
