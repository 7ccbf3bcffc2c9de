//! S3-compatible blob store client (MinIO, R2).

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::store::BlobStore;

/// Objects above this size are uploaded in parts.
const DEFAULT_MULTIPART_THRESHOLD: u64 = 20 * 1024 * 1024;
/// Part size for multipart uploads.
const DEFAULT_MULTIPART_PART_SIZE: u64 = 20 * 1024 * 1024;

/// Configuration for the S3-compatible client.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 API endpoint URL
    pub endpoint_url: String,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Bucket name
    pub bucket: String,
    /// Region
    pub region: String,
    /// Multipart threshold in bytes
    pub multipart_threshold: u64,
    /// Multipart part size in bytes
    pub multipart_part_size: u64,
}

impl S3Config {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self {
            endpoint_url: std::env::var("S3_ENDPOINT")
                .map_err(|_| StorageError::config_error("S3_ENDPOINT not set"))?,
            access_key_id: std::env::var("S3_ACCESS_KEY")
                .map_err(|_| StorageError::config_error("S3_ACCESS_KEY not set"))?,
            secret_access_key: std::env::var("S3_SECRET_KEY")
                .map_err(|_| StorageError::config_error("S3_SECRET_KEY not set"))?,
            bucket: std::env::var("S3_BUCKET").unwrap_or_else(|_| "videos".to_string()),
            region: std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            multipart_threshold: std::env::var("S3_MULTIPART_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MULTIPART_THRESHOLD),
            multipart_part_size: std::env::var("S3_MULTIPART_PART_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MULTIPART_PART_SIZE),
        })
    }
}

/// S3-compatible blob store.
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    multipart_threshold: u64,
    multipart_part_size: u64,
}

impl S3BlobStore {
    /// Create a new client from configuration.
    pub fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "encq",
        );

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(sdk_config),
            bucket: config.bucket,
            multipart_threshold: config.multipart_threshold.max(1),
            multipart_part_size: config.multipart_part_size.max(5 * 1024 * 1024),
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self::new(S3Config::from_env()?))
    }

    /// Create the bucket if it does not exist yet.
    pub async fn ensure_bucket(&self) -> StorageResult<()> {
        match self
            .client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
        {
            Ok(_) => {
                info!("Created bucket {}", self.bucket);
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("BucketAlreadyOwnedByYou") || msg.contains("BucketAlreadyExists") {
                    debug!("Bucket {} already exists", self.bucket);
                    Ok(())
                } else {
                    Err(StorageError::AwsSdk(msg))
                }
            }
        }
    }

    async fn put_single(&self, key: &str, body: ByteStream) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;
        Ok(())
    }

    /// Multipart upload: read the source in parts of the configured size
    /// and abort the upload if any part fails.
    async fn put_multipart<R>(&self, key: &str, mut reader: R) -> StorageResult<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| StorageError::upload_failed("missing multipart upload id"))?
            .to_string();

        match self.upload_parts(key, &upload_id, &mut reader).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| StorageError::upload_failed(e.to_string()))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("Failed to abort multipart upload for {}: {}", key, abort_err);
                }
                Err(e)
            }
        }
    }

    async fn upload_parts<R>(
        &self,
        key: &str,
        upload_id: &str,
        reader: &mut R,
    ) -> StorageResult<Vec<CompletedPart>>
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        let part_size = self.multipart_part_size as usize;
        let mut parts = Vec::new();
        let mut part_number = 1i32;

        loop {
            let mut buf = Vec::with_capacity(part_size);
            while buf.len() < part_size {
                let mut chunk = vec![0u8; (part_size - buf.len()).min(1024 * 1024)];
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            if buf.is_empty() {
                break;
            }
            let last = buf.len() < part_size;

            debug!(
                "Uploading part {} ({} bytes) of {}",
                part_number,
                buf.len(),
                key
            );
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(|e| StorageError::upload_failed(e.to_string()))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .build(),
            );
            part_number += 1;
            if last {
                break;
            }
        }
        Ok(parts)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        debug!("Uploading {} bytes to {}", data.len(), key);
        if (data.len() as u64) > self.multipart_threshold {
            self.put_multipart(key, std::io::Cursor::new(data)).await
        } else {
            self.put_single(key, ByteStream::from(data)).await
        }
    }

    async fn get_bytes(&self, key: &str) -> StorageResult<Vec<u8>> {
        debug!("Downloading {}", key);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.to_string().contains("NoSuchKey") {
                    StorageError::not_found(key)
                } else {
                    StorageError::download_failed(e.to_string())
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::download_failed(e.to_string()))?
            .into_bytes()
            .to_vec();
        Ok(bytes)
    }

    async fn upload_file(&self, path: &Path, key: &str) -> StorageResult<()> {
        let size = tokio::fs::metadata(path).await?.len();
        debug!("Uploading {} ({} bytes) to {}", path.display(), size, key);

        if size > self.multipart_threshold {
            let file = tokio::fs::File::open(path).await?;
            self.put_multipart(key, file).await?;
        } else {
            let body = ByteStream::from_path(path)
                .await
                .map_err(|e| StorageError::upload_failed(e.to_string()))?;
            self.put_single(key, body).await?;
        }

        info!("Uploaded {} to {}", path.display(), key);
        Ok(())
    }

    async fn download_file(&self, key: &str, path: &Path) -> StorageResult<()> {
        let bytes = self.get_bytes(key).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        info!("Downloaded {} to {}", key, path.display());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        debug!("Deleting {}", key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::delete_failed(e.to_string()))?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| StorageError::ListFailed(e.to_string()))?;

            if let Some(contents) = &response.contents {
                keys.extend(contents.iter().filter_map(|o| o.key.clone()));
            }

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("NotFound") || msg.contains("NoSuchKey") {
                    Ok(false)
                } else {
                    Err(StorageError::AwsSdk(msg))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> S3BlobStore {
        S3BlobStore::from_env().expect("S3 config")
    }

    #[tokio::test]
    #[ignore = "requires S3/MinIO"]
    async fn bytes_roundtrip() {
        dotenvy::dotenv().ok();
        let store = store();
        store.ensure_bucket().await.expect("bucket");

        store
            .put_bytes("test/roundtrip.bin", vec![7u8; 128])
            .await
            .expect("put");
        let got = store.get_bytes("test/roundtrip.bin").await.expect("get");
        assert_eq!(got, vec![7u8; 128]);

        store.delete("test/roundtrip.bin").await.expect("delete");
        assert!(!store.exists("test/roundtrip.bin").await.expect("exists"));
    }

    #[tokio::test]
    #[ignore = "requires S3/MinIO"]
    async fn multipart_upload_large_object() {
        dotenvy::dotenv().ok();
        let store = store();
        store.ensure_bucket().await.expect("bucket");

        // Past the default threshold so the multipart path is exercised.
        let data = vec![42u8; 21 * 1024 * 1024];
        store
            .put_bytes("test/multipart.bin", data.clone())
            .await
            .expect("put multipart");
        let got = store.get_bytes("test/multipart.bin").await.expect("get");
        assert_eq!(got.len(), data.len());

        store.delete("test/multipart.bin").await.expect("delete");
    }
}
