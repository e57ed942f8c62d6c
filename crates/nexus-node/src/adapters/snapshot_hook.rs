//! # File Snapshot Hook
//!
//! Persists each entity as `{data_dir}/{entity_id}.json`.
//!
//! Writes merge the incoming patch over the stored document and replace the
//! file through a temporary sibling, so a crash leaves either the old or the
//! new document. Keys removed by a whole-state replace are not removed from
//! the file; the next reconciliation pass rewrites it in full.

use async_trait::async_trait;
use nexus_state::{PersistHook, PersistenceError};
use nexus_types::StateMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// [`PersistHook`] backed by one JSON file per entity.
#[derive(Debug, Clone)]
pub struct FileSnapshotHook {
    dir: PathBuf,
}

impl FileSnapshotHook {
    /// Use `dir`, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, entity_id: &str) -> Result<PathBuf, PersistenceError> {
        let unsafe_id = entity_id.is_empty()
            || entity_id.starts_with('.')
            || entity_id.contains(['/', '\\', '\0']);
        if unsafe_id {
            return Err(PersistenceError::Unavailable(format!(
                "entity id '{entity_id}' cannot be used as a file name"
            )));
        }
        Ok(self.dir.join(format!("{entity_id}.json")))
    }

    async fn read(&self, path: &Path) -> Result<Option<StateMap>, PersistenceError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl PersistHook for FileSnapshotHook {
    async fn persist(&self, entity_id: &str, patch: &StateMap) -> Result<(), PersistenceError> {
        let path = self.path_for(entity_id)?;
        let mut document = self.read(&path).await?.unwrap_or_default();
        for (key, value) in patch {
            document.insert(key.clone(), value.clone());
        }

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&document)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(entity_id, keys = document.len(), path = %path.display(), "Entity snapshot written");
        Ok(())
    }

    async fn load(&self, entity_id: &str) -> Result<Option<StateMap>, PersistenceError> {
        let path = self.path_for(entity_id)?;
        self.read(&path).await
    }
}
