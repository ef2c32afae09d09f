//! Allowlist persistence
//!
//! Entries are stored per owning entity and always replaced as a whole. The
//! store knows nothing about validation or the firewall; callers only write
//! after the firewall accepted the same list.
//!
//! [`FileStore`] keeps one JSON document per entity under
//! `<data dir>/allowlists/`, named `<kind>-<name>.json`, with a SHA-256
//! sidecar checksum. [`MemoryStore`] is used by tests and dry runs.

use crate::core::error::StoreError;
use crate::core::identity::OwningEntity;
use crate::utils::{create_private_dir, get_data_dir, sha256_hex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Read/write/clear access to persisted allowlists
pub trait AllowlistStore: Send + Sync {
    /// Returns the stored list, or `None` when the entity has no entry
    fn get(
        &self,
        entity: &OwningEntity,
    ) -> impl Future<Output = Result<Option<Vec<String>>, StoreError>> + Send;

    /// Replaces the entity's list
    fn put(
        &self,
        entity: &OwningEntity,
        ips: &[String],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Removes the entity's entry; clearing a missing entry is not an error
    fn clear(&self, entity: &OwningEntity) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// On-disk document for one owning entity
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredAllowlist {
    entity: OwningEntity,
    ips: Vec<String>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

/// File-backed store with atomic replace semantics
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at `<data dir>/allowlists`
    pub fn in_data_dir() -> Result<Self, StoreError> {
        let mut path = get_data_dir().ok_or(StoreError::DataDirUnavailable)?;
        path.push("allowlists");
        Ok(Self::new(path))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of an entity's file.
    /// Validates the name first so no path is ever built from unchecked input.
    fn entry_path(&self, entity: &OwningEntity) -> Result<PathBuf, StoreError> {
        crate::validators::validate_entity_name(entity.name()).map_err(StoreError::InvalidName)?;
        Ok(self
            .dir
            .join(format!("{}-{}.json", entity.kind(), entity.name())))
    }

    fn checksum_path(path: &Path) -> PathBuf {
        let mut checksum_path = path.to_path_buf();
        checksum_path.set_extension("json.sha256");
        checksum_path
    }
}

impl AllowlistStore for FileStore {
    async fn get(&self, entity: &OwningEntity) -> Result<Option<Vec<String>>, StoreError> {
        let path = self.entry_path(entity)?;

        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Checksum mismatch only warns: the file may have been edited by hand
        if let Ok(expected) = tokio::fs::read_to_string(Self::checksum_path(&path)).await {
            let actual = sha256_hex(json.as_bytes());
            if expected.trim() != actual {
                warn!(
                    "Allowlist for {} checksum mismatch (expected: {}, got: {})",
                    entity,
                    expected.trim(),
                    actual
                );
            }
        }

        let stored: StoredAllowlist =
            serde_json::from_str(&json).map_err(|e| StoreError::Corrupted {
                entity: entity.to_string(),
                reason: e.to_string(),
            })?;

        if stored.entity != *entity {
            return Err(StoreError::Corrupted {
                entity: entity.to_string(),
                reason: format!("file belongs to {}", stored.entity),
            });
        }

        Ok(Some(stored.ips))
    }

    /// Writes through a temporary file and renames it into place so a crash
    /// or full disk never leaves a half-written allowlist behind.
    async fn put(&self, entity: &OwningEntity, ips: &[String]) -> Result<(), StoreError> {
        let path = self.entry_path(entity)?;
        create_private_dir(&self.dir)?;

        let document = StoredAllowlist {
            entity: entity.clone(),
            ips: ips.to_vec(),
            updated_at: chrono::Utc::now(),
        };
        let json = serde_json::to_string_pretty(&document)?;

        let mut temp_path = path.clone();
        temp_path.set_extension("json.tmp");

        #[cfg(unix)]
        {
            use tokio::fs::OpenOptions;
            use tokio::io::AsyncWriteExt;

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(&temp_path)
                .await?;

            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
        }

        #[cfg(not(unix))]
        {
            tokio::fs::write(&temp_path, &json).await?;
        }

        tokio::fs::rename(&temp_path, &path).await?;
        tokio::fs::write(Self::checksum_path(&path), sha256_hex(json.as_bytes())).await?;

        debug!("Stored {} entries for {}", ips.len(), entity);
        Ok(())
    }

    async fn clear(&self, entity: &OwningEntity) -> Result<(), StoreError> {
        let path = self.entry_path(entity)?;
        for target in [Self::checksum_path(&path), path] {
            match tokio::fs::remove_file(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!("Cleared allowlist for {}", entity);
        Ok(())
    }
}

/// In-memory store. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<OwningEntity, Vec<String>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AllowlistStore for MemoryStore {
    async fn get(&self, entity: &OwningEntity) -> Result<Option<Vec<String>>, StoreError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
            .cloned())
    }

    async fn put(&self, entity: &OwningEntity, ips: &[String]) -> Result<(), StoreError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity.clone(), ips.to_vec());
        Ok(())
    }

    async fn clear(&self, entity: &OwningEntity) -> Result<(), StoreError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(entity);
        Ok(())
    }
}
