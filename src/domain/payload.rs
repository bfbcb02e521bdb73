//! Staged payloads.
//!
//! A payload is an immutable blob moved out of the reasoning context. Only a
//! [`PayloadRef`] travels between steps; the bytes stay in the store.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference to a staged payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadRef {
    /// Content-derived key (SHA-256 hex of the bytes)
    pub key: String,

    /// Size of the payload in bytes
    pub size_bytes: u64,

    /// Content hash in `algo:hex` form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl PayloadRef {
    pub fn new(key: impl Into<String>, size_bytes: u64) -> Self {
        let key = key.into();
        let content_hash = Some(format!("sha256:{}", key));
        Self {
            key,
            size_bytes,
            content_hash,
        }
    }

    /// Short form of the key for display
    pub fn short_key(&self) -> &str {
        &self.key[..self.key.len().min(12)]
    }
}

impl fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "payload:{} ({} bytes)", self.short_key(), self.size_bytes)
    }
}

/// A payload as held by the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadRecord {
    /// Reference handed out to callers
    pub reference: PayloadRef,

    /// Retrieval handle (location in the store)
    pub path: PathBuf,

    /// When the record was written
    pub created_at: DateTime<Utc>,
}

/// Manifest entry linking a staged payload to the call that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Ordinal of the producing step
    pub step: usize,

    /// Call that produced the payload
    pub call_id: String,

    pub payload: PayloadRef,
}
