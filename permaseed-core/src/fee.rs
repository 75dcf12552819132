//! Fee oracle: per-byte quotes in any accepted currency, pivoted
//! through the AR price, plus the periodic price refresher.

use crate::cache::NetCache;
use crate::error::{Result, SeedError};
use crate::gateway::PayClient;
use crate::schema::RespFee;
use crate::types::MAX_CHUNK_SIZE;
use crate::wdb::Wdb;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const WINSTON_PER_AR: f64 = 1e12;

pub struct FeeOracle {
    wdb: Arc<Wdb>,
    cache: Arc<NetCache>,
    /// Flat service surcharge in the quoted currency's smallest unit.
    serve_fee: u64,
    no_fee: bool,
    /// Reference quote per accepted currency, rebuilt on each price tick.
    per_fee: RwLock<HashMap<String, RespFee>>,
}

impl FeeOracle {
    pub fn new(wdb: Arc<Wdb>, cache: Arc<NetCache>, serve_fee: u64, no_fee: bool) -> Self {
        Self {
            wdb,
            cache,
            serve_fee,
            no_fee,
            per_fee: RwLock::new(HashMap::new()),
        }
    }

    /// Quotes `size` bytes in `currency`'s smallest unit, as decimal
    /// text: ceil(network fee in AR × ar_price / token_price ×
    /// 10^decimals) plus the service fee.
    pub fn quote(&self, currency: &str, size: u64) -> Result<RespFee> {
        let symbol = currency.to_uppercase();
        if self.no_fee {
            let decimals = self
                .wdb
                .get_token_price(&symbol)
                .ok()
                .flatten()
                .map(|t| t.decimals)
                .unwrap_or(0);
            return Ok(RespFee {
                currency: symbol,
                decimals,
                final_fee: "0".to_string(),
            });
        }

        let token = self
            .wdb
            .get_token_price(&symbol)?
            .ok_or_else(|| SeedError::UnsupportedCurrency(symbol.clone()))?;
        if token.price <= 0.0 {
            return Err(SeedError::Unavailable(format!(
                "no usable price for {symbol}"
            )));
        }
        let ar_price = self.wdb.get_ar_price()?;
        let winston = self.cache.fee().price(size);

        let amount_ar = winston as f64 / WINSTON_PER_AR;
        let units =
            (amount_ar * ar_price / token.price * 10f64.powi(token.decimals)).ceil() as u128;
        Ok(RespFee {
            currency: token.symbol,
            decimals: token.decimals,
            final_fee: (units + self.serve_fee as u128).to_string(),
        })
    }

    pub fn is_accepted(&self, currency: &str) -> bool {
        if self.no_fee {
            return true;
        }
        matches!(
            self.wdb.get_token_price(&currency.to_uppercase()),
            Ok(Some(_))
        )
    }

    /// Last rebuilt per-currency reference quotes (one max-size chunk).
    pub fn fees(&self) -> HashMap<String, RespFee> {
        self.per_fee.read().clone()
    }

    pub async fn refresh_prices(&self, pay: &PayClient) -> Result<()> {
        let prices = pay.prices().await?;
        for token in &prices {
            self.wdb.upsert_token(token)?;
        }
        let mut rebuilt = HashMap::new();
        for token in &prices {
            match self.quote(&token.symbol, MAX_CHUNK_SIZE as u64) {
                Ok(fee) => {
                    rebuilt.insert(token.symbol.clone(), fee);
                }
                Err(e) => tracing::debug!("skip fee map entry for {}: {e}", token.symbol),
            }
        }
        *self.per_fee.write() = rebuilt;
        Ok(())
    }

    pub async fn run_refresher(self: Arc<Self>, pay: PayClient, interval_secs: u64) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh_prices(&pay).await {
                tracing::warn!("token price refresh failed: {e}");
            }
        }
    }
}
