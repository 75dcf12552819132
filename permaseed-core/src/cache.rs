//! Process-wide snapshot cache of upstream network state. Written rarely
//! by the refresher, read hot everywhere else: readers clone an Arc to
//! the last complete snapshot, never a torn one.

use crate::error::Result;
use crate::gateway::Gateway;
use crate::types::{ArFee, MAX_CHUNK_SIZE};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Opaque upstream node info, served back verbatim.
    pub info: serde_json::Value,
    pub anchor: String,
    pub fee: ArFee,
    pub peers: Vec<String>,
    pub height: i64,
}

#[derive(Default)]
pub struct NetCache {
    inner: RwLock<Arc<Snapshot>>,
}

impl NetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.read().clone()
    }

    pub fn store(&self, snapshot: Snapshot) {
        *self.inner.write() = Arc::new(snapshot);
    }

    pub fn anchor(&self) -> String {
        self.snapshot().anchor.clone()
    }

    pub fn fee(&self) -> ArFee {
        self.snapshot().fee
    }

    pub fn peers(&self) -> Vec<String> {
        self.snapshot().peers.clone()
    }

    pub fn height(&self) -> i64 {
        self.snapshot().height
    }
}

/// One full refresh from the upstream gateway. The per-chunk increment
/// is the price delta between a zero-byte and a max-chunk payload.
pub async fn refresh_once(cache: &NetCache, gateway: &Gateway) -> Result<()> {
    let info = gateway.info().await?;
    let height = info.get("height").and_then(|h| h.as_i64()).unwrap_or(0);
    let anchor = gateway.anchor().await?;
    let base = gateway.price(0).await?;
    let max = gateway.price(MAX_CHUNK_SIZE).await?;
    let peers = gateway.peers().await?;

    cache.store(Snapshot {
        info,
        anchor,
        fee: ArFee {
            base,
            per_chunk: max.saturating_sub(base),
        },
        peers,
        height,
    });
    Ok(())
}

pub async fn run_refresher(
    cache: Arc<NetCache>,
    gateway: Arc<Gateway>,
    interval_secs: u64,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        ticker.tick().await;
        if let Err(e) = refresh_once(&cache, &gateway).await {
            tracing::warn!("network cache refresh failed: {e}");
        }
    }
}
