//! Retention of uploaded archives for reprocessing.

use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where uploaded archives are kept between runs
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// Retain the archive for a dataset, replacing any previous one
    async fn put(&self, dataset_id: &str, bytes: Bytes) -> Result<(), StoreError>;

    /// Fetch the retained archive, if any
    async fn get(&self, dataset_id: &str) -> Result<Option<Bytes>, StoreError>;

    /// Forget the retained archive
    async fn remove(&self, dataset_id: &str) -> Result<(), StoreError>;
}

/// Archives stored as `<root>/<dataset_id>.zip`
#[derive(Debug, Clone)]
pub struct FsArchiveStore {
    root: PathBuf,
}

impl FsArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, dataset_id: &str) -> Result<PathBuf, StoreError> {
        let safe = !dataset_id.is_empty()
            && dataset_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(StoreError::InvalidRecord(format!(
                "dataset id not usable as a file name: {}",
                dataset_id
            )));
        }
        Ok(self.root.join(format!("{}.zip", dataset_id)))
    }
}

#[async_trait]
impl ArchiveSource for FsArchiveStore {
    async fn put(&self, dataset_id: &str, bytes: Bytes) -> Result<(), StoreError> {
        let path = self.path_for(dataset_id)?;
        tokio::fs::create_dir_all(&self.root).await?;

        // Write then rename so a reader never sees a partial archive
        let partial = path.with_extension("zip.partial");
        tokio::fs::write(&partial, &bytes).await?;
        tokio::fs::rename(&partial, &path).await?;

        debug!(dataset_id, size = bytes.len(), "Archive retained");
        Ok(())
    }

    async fn get(&self, dataset_id: &str) -> Result<Option<Bytes>, StoreError> {
        let path = self.path_for(dataset_id)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, dataset_id: &str) -> Result<(), StoreError> {
        let path = self.path_for(dataset_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArchiveStore::new(dir.path().join("archives"));

        assert_eq!(store.get("abc-1").await.unwrap(), None);

        store.put("abc-1", Bytes::from_static(b"first")).await.unwrap();
        store.put("abc-1", Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(
            store.get("abc-1").await.unwrap(),
            Some(Bytes::from_static(b"second"))
        );
        assert!(dir.path().join("archives/abc-1.zip").exists());
        assert!(!dir.path().join("archives/abc-1.zip.partial").exists());

        store.remove("abc-1").await.unwrap();
        store.remove("abc-1").await.unwrap();
        assert_eq!(store.get("abc-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unsafe_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArchiveStore::new(dir.path());
        tokio_test::assert_err!(store.put("../escape", Bytes::new()).await);
        tokio_test::assert_err!(store.get("").await);
    }
}
