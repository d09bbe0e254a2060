//! Remote storage drivers.
//!
//! Each backend realizes the same narrow capability set; construction is
//! infallible once the config has been validated and every network call is
//! lazy, per operation.

pub mod memory;
pub mod s3;
pub mod webdav;

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::core::models::{Target, TargetConfig};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Webdav,
    S3,
    /// In-memory driver, used by tests.
    Memory,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverKind::Webdav => "webdav",
            DriverKind::S3 => "s3",
            DriverKind::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Capability set every remote store must provide.
///
/// All operations take a cancellation token and abort promptly when it
/// fires. "Not found" is only an error where the caller required the object:
/// `exists` returns false and `size` returns 0 for missing objects.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> DriverKind;

    /// Atomically replace the object at `path`.
    async fn upload(&self, path: &str, data: Bytes, cancel: &CancellationToken) -> Result<()>;

    async fn download(&self, path: &str, cancel: &CancellationToken) -> Result<Bytes>;

    /// Best-effort removal; removing a missing object is not an error.
    async fn delete(&self, path: &str, cancel: &CancellationToken) -> Result<()>;

    /// Object names under `prefix`, files only.
    async fn list(&self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<String>>;

    async fn exists(&self, path: &str, cancel: &CancellationToken) -> Result<bool>;

    /// Object size in bytes; 0 when the object does not exist.
    async fn size(&self, path: &str, cancel: &CancellationToken) -> Result<u64>;

    /// Read `length` bytes starting at `offset`, clamped to the object end.
    async fn range_read(
        &self,
        path: &str,
        offset: u64,
        length: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes>;
}

/// Build a driver from a target's typed config.
pub fn create_driver(target: &Target) -> Result<Box<dyn StorageDriver>> {
    target.config.validate()?;
    match &target.config {
        TargetConfig::Webdav(config) => Ok(Box::new(webdav::WebDavDriver::new(
            target.name.clone(),
            config.clone(),
        ))),
        TargetConfig::S3(config) => Ok(Box::new(s3::S3Driver::new(
            target.name.clone(),
            config.clone(),
        ))),
    }
}

/// Seam for substituting drivers in tests.
pub trait DriverFactory: Send + Sync {
    fn create(&self, target: &Target) -> Result<Box<dyn StorageDriver>>;
}

/// Production factory: dispatch on the target's kind.
pub struct ConfigDriverFactory;

impl DriverFactory for ConfigDriverFactory {
    fn create(&self, target: &Target) -> Result<Box<dyn StorageDriver>> {
        create_driver(target)
    }
}

/// Race a storage operation against cancellation.
pub(crate) async fn run_cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = fut => result,
    }
}
