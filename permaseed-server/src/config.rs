use clap::Parser;
use permaseed_core::types::Tag;
use permaseed_core::{Result, SeedError};
use std::path::PathBuf;

/// Process inputs: every knob is a flag with an environment fallback.
#[derive(Parser, Debug, Clone)]
#[command(name = "permaseed")]
#[command(about = "Caching and seeding node for the permaweb")]
pub struct Settings {
    /// Blob store directory (local backend)
    #[arg(long, default_value = "./data/store", env = "DB_DIR")]
    pub db_dir: PathBuf,

    /// Relational store directory
    #[arg(long, default_value = "./data/sqlite", env = "SQLITE_DIR")]
    pub sqlite_dir: PathBuf,

    /// Bundler keyfile (JWK)
    #[arg(long, default_value = "./data/bundler-keyfile.json", env = "KEY_PATH")]
    pub key_path: PathBuf,

    /// Upstream chain gateway base URL
    #[arg(long, default_value = "https://arweave.net", env = "AR_NODE")]
    pub ar_node: String,

    /// Payment oracle base URL
    #[arg(long, default_value = "https://api.everpay.io", env = "PAY")]
    pub pay_url: String,

    /// Accept items without charging; orders are born paid
    #[arg(long, env = "NO_FEE")]
    pub no_fee: bool,

    /// Record path manifests submitted as bundle items
    #[arg(long, env = "MANIFEST")]
    pub manifest: bool,

    /// Seconds between bundle assembly ticks
    #[arg(long, default_value_t = 120, env = "BUNDLE_INTERVAL")]
    pub bundle_interval: u64,

    /// Flat service surcharge per order, smallest currency unit
    #[arg(long, default_value_t = 0, env = "SERVE_FEE")]
    pub serve_fee: u64,

    /// Blob backend: local, s3 or oss
    #[arg(long, default_value = "local", env = "STORE_BACKEND")]
    pub store_backend: String,

    /// Tenancy prefix for object-store bucket names
    #[arg(long, default_value = "permaseed", env = "STORE_PREFIX")]
    pub store_prefix: String,

    #[arg(long, default_value = "ap-northeast-1", env = "S3_REGION")]
    pub s3_region: String,

    /// Custom endpoint; required for oss
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, default_value = "", env = "S3_ACC_KEY")]
    pub s3_acc_key: String,

    #[arg(long, default_value = "", env = "S3_SECRET_KEY")]
    pub s3_secret_key: String,

    /// Listen address
    #[arg(long, default_value = "0.0.0.0:8080", env = "PORT")]
    pub listen: String,

    /// Custom tags stamped on every bundle tx, as a JSON object
    #[arg(long, default_value = "{}", env = "TAGS")]
    pub tags: String,
}

impl Settings {
    pub fn custom_tags(&self) -> Result<Vec<Tag>> {
        let map: std::collections::BTreeMap<String, String> =
            serde_json::from_str(&self.tags)
                .map_err(|e| SeedError::Config(format!("invalid --tags JSON: {e}")))?;
        Ok(map
            .into_iter()
            .map(|(name, value)| Tag { name, value })
            .collect())
    }
}
