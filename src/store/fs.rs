//! Filesystem-backed blob store
//!
//! Layout under the root directory:
//! - `tests/<id>.in`, `tests/<id>.out`
//! - `subtests/<id>`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::{DataStore, StoreResult};
use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct FsDataStore {
    root: PathBuf,
}

impl FsDataStore {
    /// Open (and create if needed) the bucket directories under `root`
    pub async fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("tests")).await?;
        fs::create_dir_all(root.join("subtests")).await?;
        Ok(Self { root })
    }

    fn test_path(&self, test_id: i64, ext: &str) -> PathBuf {
        self.root.join("tests").join(format!("{}.{}", test_id, ext))
    }

    fn subtest_path(&self, subtest_id: i64) -> PathBuf {
        self.root.join("subtests").join(subtest_id.to_string())
    }
}

async fn read(path: PathBuf, kind: &'static str, id: i64) -> StoreResult<Vec<u8>> {
    match fs::read(&path).await {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::not_found(kind, id)),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl DataStore for FsDataStore {
    async fn test_input(&self, test_id: i64) -> StoreResult<Vec<u8>> {
        read(self.test_path(test_id, "in"), "test input", test_id).await
    }

    async fn test_output(&self, test_id: i64) -> StoreResult<Vec<u8>> {
        read(self.test_path(test_id, "out"), "test output", test_id).await
    }

    async fn subtest_output(&self, subtest_id: i64) -> StoreResult<Vec<u8>> {
        read(self.subtest_path(subtest_id), "subtest output", subtest_id).await
    }

    async fn save_subtest_output(&self, subtest_id: i64, data: &[u8]) -> StoreResult<()> {
        fs::write(self.subtest_path(subtest_id), data).await?;
        Ok(())
    }

    async fn save_test(&self, test_id: i64, input: &[u8], output: &[u8]) -> StoreResult<()> {
        fs::write(self.test_path(test_id, "in"), input).await?;
        fs::write(self.test_path(test_id, "out"), output).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_store_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDataStore::new(dir.path()).await.unwrap();

        store.save_test(3, b"1 2\n", b"3\n").await.unwrap();
        assert_eq!(store.test_input(3).await.unwrap(), b"1 2\n");
        assert_eq!(store.test_output(3).await.unwrap(), b"3\n");
        assert!(dir.path().join("tests/3.in").exists());

        store.save_subtest_output(9, b"3\n").await.unwrap();
        assert_eq!(store.subtest_output(9).await.unwrap(), b"3\n");

        match store.subtest_output(10).await {
            Err(StoreError::NotFound { id, .. }) => assert_eq!(id, 10),
            other => panic!("expected not found, got {:?}", other),
        }
    }
}
