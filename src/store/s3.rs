//! MinIO/S3 blob store for test data and SubTest outputs

use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::info;

use super::{DataStore, StoreResult};
use crate::error::StoreError;

/// S3/MinIO backed `DataStore`
///
/// Keys mirror the filesystem layout: `tests/<id>.in`, `tests/<id>.out`,
/// `subtests/<id>`.
#[derive(Clone)]
pub struct S3DataStore {
    client: Client,
    bucket: String,
}

impl S3DataStore {
    /// Create a new store from environment variables
    pub async fn from_env() -> Result<Self> {
        let endpoint = std::env::var("MINIO_ENDPOINT").unwrap_or_else(|_| "localhost".into());
        let port = std::env::var("MINIO_PORT").unwrap_or_else(|_| "9000".into());
        let access_key = std::env::var("MINIO_ACCESS_KEY").unwrap_or_else(|_| "minioadmin".into());
        let secret_key = std::env::var("MINIO_SECRET_KEY").unwrap_or_else(|_| "minioadmin".into());
        let bucket = std::env::var("MINIO_BUCKET").unwrap_or_else(|_| "grading".into());
        let use_ssl = std::env::var("MINIO_USE_SSL")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let protocol = if use_ssl { "https" } else { "http" };
        let endpoint_url = format!("{}://{}:{}", protocol, endpoint, port);

        info!("Connecting to MinIO at {} (bucket {})", endpoint_url, bucket);

        let credentials = Credentials::new(access_key, secret_key, None, None, "minio");

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(&endpoint_url)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(config),
            bucket,
        })
    }

    async fn download(&self, key: &str, kind: &'static str, id: i64) -> StoreResult<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map_or(false, |se| se.is_no_such_key()) {
                    StoreError::not_found(kind, id)
                } else {
                    StoreError::Backend(format!("Failed to download {}: {}", key, e))
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to read body of {}: {}", key, e)))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn upload(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to upload {}: {}", key, e)))?;
        Ok(())
    }
}

#[async_trait]
impl DataStore for S3DataStore {
    async fn test_input(&self, test_id: i64) -> StoreResult<Vec<u8>> {
        self.download(&format!("tests/{}.in", test_id), "test input", test_id)
            .await
    }

    async fn test_output(&self, test_id: i64) -> StoreResult<Vec<u8>> {
        self.download(&format!("tests/{}.out", test_id), "test output", test_id)
            .await
    }

    async fn subtest_output(&self, subtest_id: i64) -> StoreResult<Vec<u8>> {
        self.download(&format!("subtests/{}", subtest_id), "subtest output", subtest_id)
            .await
    }

    async fn save_subtest_output(&self, subtest_id: i64, data: &[u8]) -> StoreResult<()> {
        self.upload(&format!("subtests/{}", subtest_id), data).await
    }

    async fn save_test(&self, test_id: i64, input: &[u8], output: &[u8]) -> StoreResult<()> {
        self.upload(&format!("tests/{}.in", test_id), input).await?;
        self.upload(&format!("tests/{}.out", test_id), output).await
    }
}
