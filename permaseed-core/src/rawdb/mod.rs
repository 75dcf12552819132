//! Pluggable bucketed byte store. Backends normalize "object absent" to
//! `SeedError::NotExist`; everything else propagates verbatim.

pub mod local;
pub mod s3;

use crate::error::{Result, SeedError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

pub use local::LocalDb;
pub use s3::S3Db;

/// Fixed bucket enumeration. Backends may prefix the wire names for
/// tenancy; the prefix is invisible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Chunks,
    TxMeta,
    TxEndOffset,
    Constants,
    Task,
    PendingPool,
    BundleItemBinary,
    BundleItemMeta,
    BundleWaitParse,
    BundleArToItems,
}

impl Bucket {
    pub const ALL: [Bucket; 10] = [
        Bucket::Chunks,
        Bucket::TxMeta,
        Bucket::TxEndOffset,
        Bucket::Constants,
        Bucket::Task,
        Bucket::PendingPool,
        Bucket::BundleItemBinary,
        Bucket::BundleItemMeta,
        Bucket::BundleWaitParse,
        Bucket::BundleArToItems,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Bucket::Chunks => "chunks",
            Bucket::TxMeta => "tx-meta",
            Bucket::TxEndOffset => "tx-end-offset",
            Bucket::Constants => "constants",
            Bucket::Task => "task",
            Bucket::PendingPool => "pending-pool",
            Bucket::BundleItemBinary => "bundle-item-binary",
            Bucket::BundleItemMeta => "bundle-item-meta",
            Bucket::BundleWaitParse => "bundle-wait-parse",
            Bucket::BundleArToItems => "bundle-ar-to-items",
        }
    }
}

/// One write of an atomic batch.
#[derive(Debug, Clone)]
pub struct BatchWrite {
    pub bucket: Bucket,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl BatchWrite {
    pub fn new(bucket: Bucket, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            bucket,
            key: key.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
pub trait RawDb: Send + Sync {
    async fn put(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()>;

    /// Missing keys surface as `SeedError::NotExist`.
    async fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Vec<u8>>;

    async fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<()>;

    async fn list_keys(&self, bucket: Bucket) -> Result<Vec<Vec<u8>>>;

    /// Applies all writes, atomically where the backend supports it.
    /// Object stores fall back to sequential puts; the correlated-write
    /// paths recover from a torn batch by reconciling on read.
    async fn put_batch(&self, writes: Vec<BatchWrite>) -> Result<()> {
        for write in writes {
            self.put(write.bucket, &write.key, &write.value).await?;
        }
        Ok(())
    }

    async fn exists(&self, bucket: Bucket, key: &[u8]) -> Result<bool> {
        match self.get(bucket, key).await {
            Ok(_) => Ok(true),
            Err(SeedError::NotExist) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Selects and constructs a backend, mirroring how the process inputs
/// describe it.
#[derive(Debug, Clone, Default)]
pub struct RawDbBuilder {
    backend: Option<String>,
    dir: Option<PathBuf>,
    bucket_prefix: Option<String>,
    region: Option<String>,
    endpoint: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
}

impl RawDbBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn bucket_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.bucket_prefix = Some(prefix.into());
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn credentials(mut self, access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        self.access_key = Some(access_key.into());
        self.secret_key = Some(secret_key.into());
        self
    }

    pub async fn build(&self) -> Result<Arc<dyn RawDb>> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or("local")
            .trim()
            .to_ascii_lowercase();

        match backend.as_str() {
            "local" => {
                let dir = self
                    .dir
                    .clone()
                    .ok_or_else(|| SeedError::Config("local backend requires a db dir".to_string()))?;
                Ok(Arc::new(LocalDb::open(&dir)?))
            }
            "s3" | "oss" => {
                let access_key = self.access_key.as_deref().unwrap_or_default();
                let secret_key = self.secret_key.as_deref().unwrap_or_default();
                if access_key.is_empty() || secret_key.is_empty() {
                    return Err(SeedError::Config(format!(
                        "{backend} backend requires credentials"
                    )));
                }
                let prefix = self.bucket_prefix.as_deref().unwrap_or("permaseed");
                let region = self.region.as_deref().unwrap_or("us-east-1");
                if backend == "oss" && self.endpoint.is_none() {
                    return Err(SeedError::Config(
                        "oss backend requires an endpoint".to_string(),
                    ));
                }
                let db = S3Db::connect(
                    region,
                    self.endpoint.clone(),
                    access_key,
                    secret_key,
                    prefix,
                )
                .await?;
                Ok(Arc::new(db))
            }
            other => Err(SeedError::Config(format!(
                "unsupported store backend: {other}"
            ))),
        }
    }
}
