//! HTTP clients for the upstream chain gateway, federation peers, and
//! the payment oracle. Every call carries a bounded per-attempt deadline.

use crate::error::{Result, SeedError};
use crate::schema::TokenPrice;
use crate::types::{Chunk, TxMeta, TxOffset};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct TxStatus {
    pub block_height: i64,
    pub number_of_confirmations: i64,
}

/// Confirmation state of a transaction as reported by a gateway.
#[derive(Debug, Clone)]
pub enum ChainStatus {
    Confirmed(TxStatus),
    Pending,
}

#[derive(Clone)]
pub struct Gateway {
    client: reqwest::Client,
    base: String,
}

impl Gateway {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SeedError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    /// Same client pointed at another host; peers come as `host:port`.
    pub fn for_peer(&self, peer: &str) -> Gateway {
        let base = if peer.starts_with("http://") || peer.starts_with("https://") {
            peer.trim_end_matches('/').to_string()
        } else {
            format!("http://{peer}")
        };
        Gateway {
            client: self.client.clone(),
            base,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_checked(&self, path: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| SeedError::Http(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SeedError::NotExist);
        }
        if !response.status().is_success() {
            return Err(SeedError::Http(format!(
                "GET {path}: status {}",
                response.status()
            )));
        }
        Ok(response)
    }

    pub async fn info(&self) -> Result<serde_json::Value> {
        self.get_checked("/info")
            .await?
            .json()
            .await
            .map_err(|e| SeedError::Http(e.to_string()))
    }

    pub async fn anchor(&self) -> Result<String> {
        self.get_checked("/tx_anchor")
            .await?
            .text()
            .await
            .map_err(|e| SeedError::Http(e.to_string()))
    }

    pub async fn price(&self, size: usize) -> Result<u64> {
        let text = self
            .get_checked(&format!("/price/{size}"))
            .await?
            .text()
            .await
            .map_err(|e| SeedError::Http(e.to_string()))?;
        text.trim()
            .parse()
            .map_err(|_| SeedError::Http(format!("unparsable price: {text}")))
    }

    pub async fn peers(&self) -> Result<Vec<String>> {
        self.get_checked("/peers")
            .await?
            .json()
            .await
            .map_err(|e| SeedError::Http(e.to_string()))
    }

    pub async fn tx(&self, ar_id: &str) -> Result<TxMeta> {
        self.get_checked(&format!("/tx/{ar_id}"))
            .await?
            .json()
            .await
            .map_err(|e| SeedError::Http(e.to_string()))
    }

    pub async fn tx_offset(&self, ar_id: &str) -> Result<TxOffset> {
        self.get_checked(&format!("/tx/{ar_id}/offset"))
            .await?
            .json()
            .await
            .map_err(|e| SeedError::Http(e.to_string()))
    }

    pub async fn chunk(&self, offset: u64) -> Result<Chunk> {
        self.get_checked(&format!("/chunk/{offset}"))
            .await?
            .json()
            .await
            .map_err(|e| SeedError::Http(e.to_string()))
    }

    pub async fn tx_status(&self, ar_id: &str) -> Result<ChainStatus> {
        let response = self
            .client
            .get(self.url(&format!("/tx/{ar_id}/status")))
            .send()
            .await
            .map_err(|e| SeedError::Http(e.to_string()))?;
        match response.status() {
            reqwest::StatusCode::OK => {
                let status = response
                    .json()
                    .await
                    .map_err(|e| SeedError::Http(e.to_string()))?;
                Ok(ChainStatus::Confirmed(status))
            }
            reqwest::StatusCode::ACCEPTED => Ok(ChainStatus::Pending),
            reqwest::StatusCode::NOT_FOUND => Err(SeedError::NotExist),
            other => Err(SeedError::Http(format!("tx status: {other}"))),
        }
    }

    pub async fn post_tx(&self, tx: &TxMeta) -> Result<()> {
        let response = self
            .client
            .post(self.url("/tx"))
            .json(tx)
            .send()
            .await
            .map_err(|e| SeedError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SeedError::Http(format!("POST /tx: {}", response.status())));
        }
        Ok(())
    }

    pub async fn post_chunk(&self, chunk: &Chunk) -> Result<()> {
        let response = self
            .client
            .post(self.url("/chunk"))
            .json(chunk)
            .send()
            .await
            .map_err(|e| SeedError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SeedError::Http(format!(
                "POST /chunk: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// One settlement event from the payment oracle feed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayReceipt {
    pub raw_id: u64,
    pub ever_hash: String,
    pub from: String,
    pub symbol: String,
    pub amount: String,
    pub item_id: String,
}

#[derive(Clone)]
pub struct PayClient {
    client: reqwest::Client,
    base: String,
}

impl PayClient {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SeedError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    pub async fn prices(&self) -> Result<Vec<TokenPrice>> {
        let response = self
            .client
            .get(format!("{}/prices", self.base))
            .send()
            .await
            .map_err(|e| SeedError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SeedError::Unavailable(format!(
                "oracle prices: {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| SeedError::Http(e.to_string()))
    }

    /// Settlement events strictly after the given cursor, oldest first.
    pub async fn receipts(&self, cursor: u64) -> Result<Vec<PayReceipt>> {
        let response = self
            .client
            .get(format!("{}/receipts?cursor={cursor}", self.base))
            .send()
            .await
            .map_err(|e| SeedError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SeedError::Unavailable(format!(
                "oracle receipts: {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| SeedError::Http(e.to_string()))
    }
}
