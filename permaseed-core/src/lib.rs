//! Permaseed Core - Core library for a permaweb caching/seeding node
//!
//! A content-addressed seeding gateway providing:
//! - offset-indexed chunk/transaction storage over a pluggable blob store
//! - a durable, deduplicating task dispatcher for peer broadcast/sync
//! - ANS-104 bundle aggregation with fee quoting and payment matching

pub mod aggregator;
pub mod bundle;
pub mod cache;
pub mod crypto;
pub mod error;
pub mod fee;
pub mod gateway;
pub mod rawdb;
pub mod schema;
pub mod store;
pub mod taskmgr;
pub mod types;
pub mod wdb;

pub use aggregator::Bundler;
pub use cache::{NetCache, Snapshot};
pub use crypto::wallet::Wallet;
pub use error::{Result, SeedError};
pub use fee::FeeOracle;
pub use gateway::{Gateway, PayClient};
pub use rawdb::{Bucket, RawDb, RawDbBuilder};
pub use store::Store;
pub use taskmgr::TaskManager;
pub use wdb::Wdb;
