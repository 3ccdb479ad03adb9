//! Compile-artifact store
//!
//! Artifacts are keyed by id: submission artifacts live at `<dir>/<id>.bin`,
//! checker artifacts (negative ids) at `<dir>/checkers/<-id>.bin`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::fs;

use super::StoreResult;
use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub async fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("checkers")).await?;
        Ok(Self { root })
    }

    pub fn path(&self, id: i64) -> PathBuf {
        if id < 0 {
            self.root.join("checkers").join(format!("{}.bin", -id))
        } else {
            self.root.join(format!("{}.bin", id))
        }
    }

    pub async fn save(&self, id: i64, data: &[u8]) -> StoreResult<()> {
        let path = self.path(id);
        fs::write(&path, data).await?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
        Ok(())
    }

    pub async fn load(&self, id: i64) -> StoreResult<Vec<u8>> {
        match fs::read(self.path(id)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::not_found("compile artifact", id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an artifact; returns whether one existed
    pub async fn remove(&self, id: i64) -> StoreResult<bool> {
        match fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_checker_namespace_is_separate() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).await.unwrap();

        store.save(12, b"submission").await.unwrap();
        store.save(-12, b"checker").await.unwrap();

        assert_eq!(store.load(12).await.unwrap(), b"submission");
        assert_eq!(store.load(-12).await.unwrap(), b"checker");
        assert!(dir.path().join("checkers/12.bin").exists());

        assert!(store.remove(12).await.unwrap());
        assert!(!store.remove(12).await.unwrap());
        assert_eq!(store.load(-12).await.unwrap(), b"checker");
    }
}
