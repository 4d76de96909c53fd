//! Upload-and-verify against the archive bucket.
//!
//! Exports land in S3 under the Glacier Instant Retrieval storage class.
//! After every upload the object's existence is confirmed with a
//! `HeadObject` call; the reconciler only deletes a source record after
//! that read-back succeeds.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, StorageClass};
use aws_sdk_s3::Client as S3Client;
use futures::stream::{self, StreamExt, TryStreamExt};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::config::S3Config;
use crate::retry::{with_retry, RetryPolicy};

/// Errors from the archive storage layer.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The local artifact could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The upload itself failed.
    #[error("upload of {key} failed: {reason}")]
    Upload { key: String, reason: String },

    /// The upload completed but the object could not be confirmed.
    #[error("verification of {key} failed: {reason}")]
    Verify { key: String, reason: String },
}

/// Durable sink for finished exports.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `local_path` under `key` and confirm the object exists.
    ///
    /// Deleting the source record is only safe after this returns `Ok`.
    async fn upload_and_verify(&self, local_path: &Path, key: &str) -> Result<(), UploadError>;
}

/// S3 client configured for cold-tier archival.
pub struct S3Archiver {
    client: S3Client,
    bucket: String,
    multipart_threshold: u64,
    part_size: u64,
    part_concurrency: usize,
    policy: RetryPolicy,
}

impl S3Archiver {
    /// Create a new archiver from the shared AWS environment
    /// (credentials, etc.) plus the service's S3 settings.
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = S3Client::from_conf(builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 archiver initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            multipart_threshold: config.multipart_threshold_bytes,
            part_size: config.part_size_bytes,
            part_concurrency: config.part_concurrency,
            policy: RetryPolicy::upload(),
        }
    }

    /// One upload attempt: put or multipart depending on size, then the
    /// existence check.
    async fn upload_once(&self, local_path: &Path, key: &str) -> Result<(), UploadError> {
        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| io_err(local_path, e))?
            .len();

        if size > self.multipart_threshold {
            debug!(key, size_bytes = size, "uploading via multipart");
            self.multipart_upload(local_path, key, size).await?;
        } else {
            debug!(key, size_bytes = size, "uploading via single put");
            self.simple_upload(local_path, key).await?;
        }

        self.verify(key).await
    }

    /// Single-part upload for files under the multipart threshold.
    async fn simple_upload(&self, local_path: &Path, key: &str) -> Result<(), UploadError> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| io_err(local_path, std::io::Error::other(e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type("video/mp4")
            .storage_class(StorageClass::GlacierIr)
            .send()
            .await
            .map_err(|e| upload_err(key, &e))?;

        Ok(())
    }

    /// Multipart upload for large files, with a bounded number of parts
    /// in flight.
    async fn multipart_upload(
        &self,
        local_path: &Path,
        key: &str,
        size: u64,
    ) -> Result<(), UploadError> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type("video/mp4")
            .storage_class(StorageClass::GlacierIr)
            .send()
            .await
            .map_err(|e| upload_err(key, &e))?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| UploadError::Upload {
                key: key.to_string(),
                reason: "no upload ID in response".to_string(),
            })?
            .to_string();

        match self.upload_parts(local_path, key, &upload_id, size).await {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| upload_err(key, &e))?;

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
                    warn!(
                        key,
                        error = %DisplayErrorContext(&abort_err),
                        "failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    /// Upload every part, `part_concurrency` at a time, preserving part
    /// order for the completion call.
    async fn upload_parts(
        &self,
        local_path: &Path,
        key: &str,
        upload_id: &str,
        size: u64,
    ) -> Result<Vec<CompletedPart>, UploadError> {
        stream::iter(part_spans(size, self.part_size))
            .map(|(part_number, offset, len)| async move {
                let data = read_chunk(local_path, offset, len as usize).await?;

                let response = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(data))
                    .send()
                    .await
                    .map_err(|e| upload_err(key, &e))?;

                Ok(CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build())
            })
            .buffered(self.part_concurrency)
            .try_collect()
            .await
    }

    /// Existence check against the uploaded key. Absence or any error
    /// counts as a failed upload.
    async fn verify(&self, key: &str) -> Result<(), UploadError> {
        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| UploadError::Verify {
                key: key.to_string(),
                reason: DisplayErrorContext(&e).to_string(),
            })
    }
}

#[async_trait]
impl ObjectStore for S3Archiver {
    async fn upload_and_verify(&self, local_path: &Path, key: &str) -> Result<(), UploadError> {
        with_retry(self.policy, "upload_and_verify", || {
            self.upload_once(local_path, key)
        })
        .await?;

        info!(key, path = %local_path.display(), "uploaded and verified");
        Ok(())
    }
}

/// `(part_number, offset, len)` for each multipart chunk of a file.
fn part_spans(size: u64, part_size: u64) -> Vec<(i32, u64, u64)> {
    (0..size.div_ceil(part_size))
        .map(|i| {
            let offset = i * part_size;
            (i as i32 + 1, offset, part_size.min(size - offset))
        })
        .collect()
}

async fn read_chunk(path: &Path, offset: u64, len: usize) -> Result<Vec<u8>, UploadError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| io_err(path, e))?;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(|e| io_err(path, e))?;

    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)
        .await
        .map_err(|e| io_err(path, e))?;
    Ok(buf)
}

fn io_err(path: &Path, source: std::io::Error) -> UploadError {
    UploadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn upload_err(key: &str, error: &dyn std::error::Error) -> UploadError {
    UploadError::Upload {
        key: key.to_string(),
        reason: DisplayErrorContext(error).to_string(),
    }
}
