//! Secondary persistent tier.
//!
//! The cache talks to a backing store only through `get`, `set` and
//! `delete`. Records carry their tags so a fallback hit can be re-indexed
//! when it is promoted back into memory.

use std::collections::BTreeSet;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::debug;

use crate::error::BackingStoreError;

use super::keys::Tag;

/// A cache entry as the backing tier sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    pub key: String,
    pub value: Bytes,
    pub expires_at: OffsetDateTime,
    pub tags: BTreeSet<Tag>,
}

impl PersistedRecord {
    pub fn is_live(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }
}

/// Persistent fallback behind the in-memory store.
///
/// Implementations must make each operation atomic for a single key.
/// Deleting a missing key succeeds.
pub trait BackingStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<PersistedRecord>, BackingStoreError>;
    fn set(&self, record: &PersistedRecord) -> Result<(), BackingStoreError>;
    fn delete(&self, key: &str) -> Result<(), BackingStoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    key: String,
    expires_at_unix_nanos: i128,
    tags: BTreeSet<Tag>,
    value: String,
}

impl FileRecord {
    fn encode(record: &PersistedRecord) -> Self {
        Self {
            key: record.key.clone(),
            expires_at_unix_nanos: record.expires_at.unix_timestamp_nanos(),
            tags: record.tags.clone(),
            value: STANDARD.encode(&record.value),
        }
    }

    fn decode(self) -> Result<PersistedRecord, BackingStoreError> {
        let expires_at = OffsetDateTime::from_unix_timestamp_nanos(self.expires_at_unix_nanos)
            .map_err(|err| BackingStoreError::corrupt(format!("invalid expiry: {err}")))?;
        let value = STANDARD
            .decode(self.value.as_bytes())
            .map_err(|err| BackingStoreError::corrupt(format!("invalid payload: {err}")))?;

        Ok(PersistedRecord {
            key: self.key,
            value: Bytes::from(value),
            expires_at,
            tags: self.tags,
        })
    }
}

/// One JSON file per key inside a directory.
///
/// File names are the SHA-256 of the key, so arbitrary keys are safe on any
/// file system. Writes go through a temp file and a rename.
#[derive(Debug)]
pub struct FsBackingStore {
    root: PathBuf,
}

impl FsBackingStore {
    /// Open the store, creating the directory if necessary.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BackingStoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn path_for(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        self.root.join(format!("{}.json", hex::encode(hasher.finalize())))
    }
}

impl BackingStore for FsBackingStore {
    fn get(&self, key: &str) -> Result<Option<PersistedRecord>, BackingStoreError> {
        let path = self.path_for(key);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let record: FileRecord = serde_json::from_slice(&raw)?;
        if record.key != key {
            debug!(key, path = %path.display(), "Backing record belongs to another key");
            return Ok(None);
        }
        record.decode().map(Some)
    }

    fn set(&self, record: &PersistedRecord) -> Result<(), BackingStoreError> {
        let path = self.path_for(&record.key);
        let encoded = serde_json::to_vec(&FileRecord::encode(record))?;

        let mut file = NamedTempFile::new_in(&self.root)?;
        file.write_all(&encoded)?;
        file.flush()?;
        file.persist(&path).map_err(|err| err.error)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), BackingStoreError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
