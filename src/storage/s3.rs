//! S3-compatible storage driver.
//!
//! Credentials are static; an optional endpoint override supports
//! compatible services (MinIO, Storj, a local object store in tests).
//! "Not found" is detected structurally from the service error.

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Builder as S3ConfigBuilder, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{run_cancellable, DriverKind, StorageDriver};
use crate::core::models::S3Config;
use crate::error::{Result, SyncError};

pub struct S3Driver {
    name: String,
    bucket: String,
    client: Client,
}

impl S3Driver {
    pub fn new(name: String, config: S3Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "vwsyncd",
        );

        let mut builder = S3ConfigBuilder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        Self {
            name,
            bucket: config.bucket,
            client,
        }
    }
}

#[async_trait]
impl StorageDriver for S3Driver {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DriverKind {
        DriverKind::S3
    }

    async fn upload(&self, path: &str, data: Bytes, cancel: &CancellationToken) -> Result<()> {
        run_cancellable(cancel, async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(path)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| {
                    SyncError::Storage(format!("s3 upload {path}: {}", DisplayErrorContext(e)))
                })?;
            Ok(())
        })
        .await
    }

    async fn download(&self, path: &str, cancel: &CancellationToken) -> Result<Bytes> {
        run_cancellable(cancel, async {
            let output = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(path)
                .send()
                .await
                .map_err(|e| {
                    let service = e.into_service_error();
                    if service.is_no_such_key() {
                        SyncError::NotFound(path.to_string())
                    } else {
                        SyncError::Storage(format!("s3 download {path}: {service}"))
                    }
                })?;

            let data = output
                .body
                .collect()
                .await
                .map_err(|e| SyncError::Storage(format!("s3 download {path}: {e}")))?;
            Ok(data.into_bytes())
        })
        .await
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        run_cancellable(cancel, async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(path)
                .send()
                .await
                .map_err(|e| {
                    SyncError::Storage(format!("s3 delete {path}: {}", DisplayErrorContext(e)))
                })?;
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        run_cancellable(cancel, async {
            let mut keys = Vec::new();
            let mut continuation_token: Option<String> = None;

            loop {
                let mut request = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(prefix);

                if let Some(token) = &continuation_token {
                    request = request.continuation_token(token);
                }

                let output = request.send().await.map_err(|e| {
                    SyncError::Storage(format!("s3 list {prefix}: {}", DisplayErrorContext(e)))
                })?;

                if let Some(contents) = output.contents {
                    for object in contents {
                        // Directory placeholder keys end with a slash.
                        if let Some(key) = object.key {
                            if !key.ends_with('/') {
                                keys.push(key);
                            }
                        }
                    }
                }

                match output.next_continuation_token {
                    Some(token) => continuation_token = Some(token),
                    None => break,
                }
            }

            Ok(keys)
        })
        .await
    }

    async fn exists(&self, path: &str, cancel: &CancellationToken) -> Result<bool> {
        run_cancellable(cancel, async {
            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(path)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) => {
                    let service = e.into_service_error();
                    if service.is_not_found() {
                        Ok(false)
                    } else {
                        Err(SyncError::Storage(format!("s3 stat {path}: {service}")))
                    }
                }
            }
        })
        .await
    }

    async fn size(&self, path: &str, cancel: &CancellationToken) -> Result<u64> {
        run_cancellable(cancel, async {
            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(path)
                .send()
                .await
            {
                Ok(output) => Ok(output.content_length().unwrap_or(0).max(0) as u64),
                Err(e) => {
                    let service = e.into_service_error();
                    if service.is_not_found() {
                        Ok(0)
                    } else {
                        Err(SyncError::Storage(format!("s3 stat {path}: {service}")))
                    }
                }
            }
        })
        .await
    }

    async fn range_read(
        &self,
        path: &str,
        offset: u64,
        length: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }

        // Clamp client-side so an offset past the object end reads as empty
        // instead of an InvalidRange error.
        let total = self.size(path, cancel).await?;
        if offset >= total {
            return Ok(Bytes::new());
        }
        let end = (offset + length).min(total) - 1;

        run_cancellable(cancel, async {
            let output = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(path)
                .range(format!("bytes={offset}-{end}"))
                .send()
                .await
                .map_err(|e| {
                    let service = e.into_service_error();
                    if service.is_no_such_key() {
                        SyncError::NotFound(path.to_string())
                    } else {
                        SyncError::Storage(format!("s3 range read {path}: {service}"))
                    }
                })?;

            let data = output
                .body
                .collect()
                .await
                .map_err(|e| SyncError::Storage(format!("s3 range read {path}: {e}")))?;
            Ok(data.into_bytes())
        })
        .await
    }
}
