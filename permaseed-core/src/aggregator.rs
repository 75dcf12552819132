//! Bundle aggregation pipeline: item ingress with fee quoting, payment
//! matching against the settlement oracle, periodic bundle assembly and
//! on-chain submission, and status reconciliation.

use crate::bundle::{assemble_bundle, decode_data_item, parse_bundle, verify_data_item, DataItem};
use crate::cache::NetCache;
use crate::crypto::deep_hash::{deep_hash, DeepHashItem};
use crate::crypto::merkle;
use crate::crypto::wallet::Wallet;
use crate::error::{Result, SeedError};
use crate::fee::FeeOracle;
use crate::gateway::{ChainStatus, Gateway, PayClient};
use crate::schema::{
    Manifest, OnChainStatus, OnChainTx, Order, PaymentStatus, Receipt, TaskType,
    RECEIPT_SPENT, RECEIPT_UNREFUND, RECEIPT_UNSPENT,
};
use crate::store::{build_chunks, Store};
use crate::taskmgr::TaskManager;
use crate::types::{b64_decode, b64_encode, sha256, Tag, TxMeta, ALLOW_MAX_ITEM_SIZE};
use crate::wdb::Wdb;
use std::sync::Arc;
use std::time::Duration;

const MANIFEST_CONTENT_TYPE: &str = "application/x.arweave-manifest+json";
const MIN_CONFIRMATIONS: i64 = 3;

#[derive(Debug, Clone)]
pub struct BundlerConfig {
    /// Seconds an order stays payable.
    pub payment_window_secs: i64,
    /// Blocks from now a submitted bundle is expected to land in.
    pub expected_block_delay: i64,
    /// Blocks past `cur_height` after which an unseen tx counts as dropped.
    pub drop_horizon_blocks: i64,
    pub no_fee: bool,
    pub enable_manifest: bool,
    /// Extra tags stamped on every bundle transaction.
    pub custom_tags: Vec<Tag>,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            payment_window_secs: 30 * 60,
            expected_block_delay: 50,
            drop_horizon_blocks: 50,
            no_fee: false,
            enable_manifest: false,
            custom_tags: Vec::new(),
        }
    }
}

pub struct Bundler {
    store: Arc<Store>,
    wdb: Arc<Wdb>,
    cache: Arc<NetCache>,
    fee: Arc<FeeOracle>,
    wallet: Arc<Wallet>,
    tasks: Arc<TaskManager>,
    gateway: Arc<Gateway>,
    pay: PayClient,
    cfg: BundlerConfig,
}

impl Bundler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        wdb: Arc<Wdb>,
        cache: Arc<NetCache>,
        fee: Arc<FeeOracle>,
        wallet: Arc<Wallet>,
        tasks: Arc<TaskManager>,
        gateway: Arc<Gateway>,
        pay: PayClient,
        cfg: BundlerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            wdb,
            cache,
            fee,
            wallet,
            tasks,
            gateway,
            pay,
            cfg,
        })
    }

    pub fn bundler_address(&self) -> &str {
        &self.wallet.address
    }

    /// Item ingress: decode and verify, gate on currency and duplicate
    /// payment, quote idempotently, then persist item and order.
    pub async fn process_submit(
        &self,
        item_binary: Vec<u8>,
        currency: &str,
        api_key: &str,
        sort: bool,
    ) -> Result<Order> {
        if item_binary.len() > ALLOW_MAX_ITEM_SIZE {
            return Err(SeedError::ItemTooLarge);
        }
        let item = verify_data_item(&item_binary)?;
        let symbol = currency.to_uppercase();
        if !self.fee.is_accepted(&symbol) {
            return Err(SeedError::UnsupportedCurrency(symbol));
        }
        if self.wdb.exist_paid_order(&item.id)? {
            return Err(SeedError::OrderAlreadyPaid(item.id));
        }

        let now = chrono::Utc::now().timestamp();
        if let Some(existing) = self.wdb.get_unpaid_order(&item.id)? {
            if existing.payment_expired_time > now && existing.currency == symbol {
                return Ok(existing);
            }
        }

        let quote = self.fee.quote(&symbol, item_binary.len() as u64)?;
        let owner_raw = b64_decode(&item.owner)?;
        let order = Order {
            id: 0,
            item_id: item.id.clone(),
            signer: b64_encode(&sha256(&owner_raw)),
            signer_owner: item.owner.clone(),
            size: item_binary.len() as u64,
            currency: quote.currency,
            decimals: quote.decimals,
            fee: quote.final_fee,
            payment_expired_time: now + self.cfg.payment_window_secs,
            payment_status: if self.cfg.no_fee {
                PaymentStatus::Paid
            } else {
                PaymentStatus::Unpaid
            },
            payment_id: String::new(),
            on_chain_status: OnChainStatus::Waiting,
            expected_block: self.cache.height() + self.cfg.expected_block_delay,
            sort,
            api_key: api_key.to_string(),
        };

        self.store.save_item_binary(&item.id, &item_binary).await?;
        self.store.save_item_meta(&item).await?;
        let id = self.wdb.insert_order(&order)?;

        if self.cfg.enable_manifest {
            self.record_manifest(&item)?;
        }

        Ok(Order { id, ..order })
    }

    fn record_manifest(&self, item: &DataItem) -> Result<()> {
        if item.tag_value("Content-Type") != Some(MANIFEST_CONTENT_TYPE) {
            return Ok(());
        }
        let url = item
            .tag_value("Manifest-Url")
            .unwrap_or(&item.id)
            .to_string();
        self.wdb.insert_manifest(&Manifest {
            manifest_url: url,
            manifest_id: item.id.clone(),
        })
    }

    /// Drains new settlement events from the oracle, matching each to
    /// its unpaid order. Idempotent on re-delivered events.
    pub async fn watch_payments_once(&self) -> Result<()> {
        let cursor = self.wdb.get_last_raw_id()?;
        let events = self.pay.receipts(cursor).await?;
        let now = chrono::Utc::now().timestamp();
        for event in events {
            let receipt = Receipt {
                raw_id: event.raw_id,
                ever_hash: event.ever_hash.clone(),
                from_addr: event.from.clone(),
                symbol: event.symbol.clone(),
                amount: event.amount.clone(),
                item_id: event.item_id.clone(),
                status: RECEIPT_UNSPENT.to_string(),
            };
            if !self.wdb.insert_receipt(&receipt)? {
                continue;
            }

            let matched = match self.wdb.get_unpaid_order(&event.item_id)? {
                Some(order)
                    if order.payment_expired_time >= now
                        && order.currency == event.symbol.to_uppercase()
                        && order.fee == event.amount =>
                {
                    self.wdb.update_order_paid(order.id, &event.ever_hash)?
                }
                _ => false,
            };
            if matched {
                self.wdb.update_receipt_status(event.raw_id, RECEIPT_SPENT)?;
            } else {
                tracing::warn!(
                    "settlement {} for item {} has no matching order",
                    event.ever_hash,
                    event.item_id
                );
                self.wdb
                    .update_receipt_status(event.raw_id, RECEIPT_UNREFUND)?;
            }
        }
        Ok(())
    }

    pub fn sweep_expired_once(&self) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        for order in self.wdb.get_expired_orders(now)? {
            if self.wdb.update_order_expired(order.id)? {
                tracing::info!("order {} for item {} expired", order.id, order.item_id);
            }
        }
        Ok(())
    }

    /// One bundling tick: paid-and-waiting orders become one on-chain
    /// bundle transaction per sort class, seeded locally and handed to
    /// the broadcast task.
    pub async fn bundle_once(&self) -> Result<()> {
        for sorted in [false, true] {
            let orders = self.wdb.get_need_on_chain_orders(sorted)?;
            if orders.is_empty() {
                continue;
            }
            if let Err(e) = self.bundle_orders(&orders).await {
                // orders stay `waiting`, next tick retries
                tracing::warn!("bundling {} orders (sort={sorted}) failed: {e}", orders.len());
            }
        }
        Ok(())
    }

    async fn bundle_orders(&self, orders: &[Order]) -> Result<()> {
        let mut item_ids = Vec::with_capacity(orders.len());
        let mut binaries = Vec::with_capacity(orders.len());
        for order in orders {
            if item_ids.contains(&order.item_id) {
                continue;
            }
            match self.store.load_item_binary(&order.item_id).await {
                Ok(binary) => {
                    item_ids.push(order.item_id.clone());
                    binaries.push(binary);
                }
                Err(e) => tracing::warn!("item {} unreadable, skipping: {e}", order.item_id),
            }
        }
        if binaries.is_empty() {
            return Ok(());
        }

        let bundle = assemble_bundle(&binaries)?;
        let (tx, chunks) = self.build_bundle_tx(&bundle)?;

        // On-chain submission runs through the local seeding path plus a
        // broadcast task; the chunk insert is the commit point.
        self.store.save_tx_meta(&tx).await?;
        for chunk in &chunks {
            self.store.save_chunk(chunk).await?;
        }
        self.tasks.register(&tx.id, TaskType::Broadcast).await?;
        self.store.save_ar_items(&tx.id, &item_ids).await?;

        self.wdb.insert_on_chain_tx(&OnChainTx {
            id: 0,
            ar_id: tx.id.clone(),
            item_ids: item_ids.clone(),
            cur_height: self.cache.height(),
            data_size: tx.data_size.clone(),
            reward: tx.reward.clone(),
            status: OnChainStatus::Pending,
        })?;
        for item_id in &item_ids {
            self.wdb
                .update_orders_on_chain_status(item_id, OnChainStatus::Pending)?;
        }
        tracing::info!("bundled {} items into tx {}", item_ids.len(), tx.id);
        Ok(())
    }

    fn build_bundle_tx(&self, data: &[u8]) -> Result<(TxMeta, Vec<crate::types::Chunk>)> {
        let snapshot = self.cache.snapshot();
        if snapshot.anchor.is_empty() {
            return Err(SeedError::Unavailable("anchor not refreshed yet".to_string()));
        }
        let anchor_raw = b64_decode(snapshot.anchor.trim())?;

        let root = merkle::generate_data_root(data);
        let root_b64 = b64_encode(&root);
        let data_size = data.len().to_string();
        let reward = snapshot.fee.price(data.len() as u64).to_string();

        let mut tags = vec![
            Tag {
                name: "Bundle-Format".to_string(),
                value: "binary".to_string(),
            },
            Tag {
                name: "Bundle-Version".to_string(),
                value: "2.0.0".to_string(),
            },
        ];
        tags.extend(self.cfg.custom_tags.iter().cloned());

        let owner_raw = b64_decode(&self.wallet.owner)?;
        let tag_items = tags
            .iter()
            .map(|tag| {
                DeepHashItem::List(vec![
                    DeepHashItem::blob(tag.name.as_bytes()),
                    DeepHashItem::blob(tag.value.as_bytes()),
                ])
            })
            .collect();
        let payload = deep_hash(&DeepHashItem::List(vec![
            DeepHashItem::text("2"),
            DeepHashItem::blob(&owner_raw),
            DeepHashItem::blob(&[]),
            DeepHashItem::text("0"),
            DeepHashItem::text(&reward),
            DeepHashItem::blob(&anchor_raw),
            DeepHashItem::List(tag_items),
            DeepHashItem::text(&data_size),
            DeepHashItem::blob(&root),
        ]));
        let signature = self.wallet.sign(&payload)?;

        let tx = TxMeta {
            format: 2,
            id: b64_encode(&sha256(&signature)),
            last_tx: snapshot.anchor.trim().to_string(),
            owner: self.wallet.owner.clone(),
            tags: tags
                .iter()
                .map(|tag| Tag {
                    name: b64_encode(tag.name.as_bytes()),
                    value: b64_encode(tag.value.as_bytes()),
                })
                .collect(),
            target: String::new(),
            quantity: "0".to_string(),
            data: String::new(),
            data_root: root_b64.clone(),
            data_size,
            reward,
            signature: b64_encode(&signature),
        };
        let chunks = build_chunks(&root_b64, data);
        Ok((tx, chunks))
    }

    /// Advances pending on-chain bundles from gateway confirmations;
    /// contributing orders inherit terminal states.
    pub async fn poll_on_chain_once(&self) -> Result<()> {
        let pending = self.wdb.get_on_chain_txs_by_status(OnChainStatus::Pending)?;
        let height = self.cache.height();
        for tx in pending {
            let terminal = match self.gateway.tx_status(&tx.ar_id).await {
                Ok(ChainStatus::Confirmed(status))
                    if status.number_of_confirmations >= MIN_CONFIRMATIONS =>
                {
                    Some(OnChainStatus::Success)
                }
                Ok(_) => None,
                Err(SeedError::NotExist) => {
                    if height > tx.cur_height + self.cfg.drop_horizon_blocks {
                        Some(OnChainStatus::Failed)
                    } else {
                        None
                    }
                }
                Err(e) => {
                    tracing::warn!("status poll for {} failed: {e}", tx.ar_id);
                    None
                }
            };
            if let Some(status) = terminal {
                self.wdb.update_on_chain_status(&tx.ar_id, status)?;
                for item_id in &tx.item_ids {
                    self.wdb.update_orders_on_chain_status(item_id, status)?;
                }
                tracing::info!("bundle tx {} is {}", tx.ar_id, status.as_str());
            }
        }
        Ok(())
    }

    /// Extracts items out of synced bundle transactions queued by the
    /// sync task.
    pub async fn parse_bundles_once(&self) -> Result<()> {
        for ar_id in self.store.wait_parse_ids().await? {
            let tx = match self.store.load_tx_meta(&ar_id).await {
                Ok(tx) => tx,
                Err(SeedError::NotExist) => {
                    self.store.del_wait_parse(&ar_id).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let size = tx.data_size_bytes()?;
            let data = self.store.read_tx_data(&tx.data_root, &tx.data_size, size).await?;
            let binaries = match parse_bundle(&data) {
                Ok(binaries) => binaries,
                Err(e) => {
                    tracing::warn!("tx {ar_id} is not a parsable bundle: {e}");
                    self.store.del_wait_parse(&ar_id).await?;
                    continue;
                }
            };

            let mut item_ids = Vec::with_capacity(binaries.len());
            for binary in &binaries {
                match decode_data_item(binary) {
                    Ok(item) => {
                        self.store.save_item_binary(&item.id, binary).await?;
                        self.store.save_item_meta(&item).await?;
                        item_ids.push(item.id);
                    }
                    Err(e) => tracing::warn!("undecodable item inside {ar_id}: {e}"),
                }
            }
            self.store.save_ar_items(&ar_id, &item_ids).await?;
            self.store.del_wait_parse(&ar_id).await?;
            tracing::info!("parsed {} items out of bundle {ar_id}", item_ids.len());
        }
        Ok(())
    }

    pub fn spawn_loops(self: &Arc<Self>, bundle_interval_secs: u64) {
        let watcher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                if !watcher.cfg.no_fee {
                    if let Err(e) = watcher.watch_payments_once().await {
                        tracing::warn!("payment watch failed: {e}");
                    }
                    if let Err(e) = watcher.sweep_expired_once() {
                        tracing::warn!("expiry sweep failed: {e}");
                    }
                }
            }
        });

        let bundler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(bundle_interval_secs));
            loop {
                ticker.tick().await;
                if let Err(e) = bundler.bundle_once().await {
                    tracing::warn!("bundle tick failed: {e}");
                }
            }
        });

        let poller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                if let Err(e) = poller.poll_on_chain_once().await {
                    tracing::warn!("on-chain poll failed: {e}");
                }
            }
        });

        let parser = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                if let Err(e) = parser.parse_bundles_once().await {
                    tracing::warn!("bundle parse tick failed: {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::sign_data_item;
    use crate::cache::Snapshot;
    use crate::crypto::wallet::test_support::TEST_WALLET;
    use crate::rawdb::LocalDb;
    use crate::schema::TokenPrice;
    use crate::types::ArFee;
    use axum::routing::get;
    use axum::{Json, Router};

    struct Env {
        _dir: tempfile::TempDir,
        bundler: Arc<Bundler>,
        wdb: Arc<Wdb>,
        store: Arc<Store>,
        cache: Arc<NetCache>,
        fee: Arc<FeeOracle>,
        tasks: Arc<TaskManager>,
        gateway: Arc<Gateway>,
        cfg: BundlerConfig,
    }

    impl Env {
        /// Same stores and caches, different payment oracle.
        fn bundler_with_pay(&self, pay: PayClient) -> Arc<Bundler> {
            Bundler::new(
                self.store.clone(),
                self.wdb.clone(),
                self.cache.clone(),
                self.fee.clone(),
                TEST_WALLET.clone(),
                self.tasks.clone(),
                self.gateway.clone(),
                pay,
                self.cfg.clone(),
            )
        }
    }

    async fn build_env(cfg: BundlerConfig, pay_base: &str) -> Env {
        let dir = tempfile::tempdir().unwrap();
        let db = LocalDb::open(&dir.path().join("blob")).unwrap();
        let store = Arc::new(Store::new(Arc::new(db)));
        let wdb = Arc::new(Wdb::open(&dir.path().join("sql")).unwrap());
        wdb.migrate(false, cfg.enable_manifest).unwrap();
        wdb.upsert_token(&TokenPrice {
            symbol: "AR".to_string(),
            decimals: 12,
            price: 2.0,
        })
        .unwrap();
        wdb.upsert_token(&TokenPrice {
            symbol: "USDC".to_string(),
            decimals: 6,
            price: 1.0,
        })
        .unwrap();

        let cache = Arc::new(NetCache::new());
        cache.store(Snapshot {
            info: serde_json::Value::Null,
            anchor: b64_encode(&[3u8; 32]),
            fee: ArFee {
                base: 100,
                per_chunk: 1000,
            },
            peers: Vec::new(),
            height: 500,
        });

        let fee = Arc::new(FeeOracle::new(wdb.clone(), cache.clone(), 0, cfg.no_fee));
        let gateway =
            Arc::new(Gateway::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap());
        let tasks = TaskManager::new(store.clone(), cache.clone(), gateway.clone());
        let pay = PayClient::new(pay_base, Duration::from_secs(2)).unwrap();
        let bundler = Bundler::new(
            store.clone(),
            wdb.clone(),
            cache.clone(),
            fee.clone(),
            TEST_WALLET.clone(),
            tasks.clone(),
            gateway.clone(),
            pay,
            cfg.clone(),
        );
        Env {
            _dir: dir,
            bundler,
            wdb,
            store,
            cache,
            fee,
            tasks,
            gateway,
            cfg,
        }
    }

    fn make_item(data: &[u8]) -> (DataItem, Vec<u8>) {
        sign_data_item(&TEST_WALLET, &[], &[], Vec::new(), data).unwrap()
    }

    #[tokio::test]
    async fn submit_quotes_idempotently() {
        let env = build_env(BundlerConfig::default(), "http://127.0.0.1:1").await;
        let (item, binary) = make_item(b"hello item");

        let first = env
            .bundler
            .process_submit(binary.clone(), "usdc", "", false)
            .await
            .unwrap();
        assert_eq!(first.item_id, item.id);
        assert_eq!(first.payment_status, PaymentStatus::Unpaid);
        assert_eq!(first.on_chain_status, OnChainStatus::Waiting);

        let second = env
            .bundler
            .process_submit(binary, "USDC", "", false)
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.fee, first.fee);
        assert_eq!(second.payment_expired_time, first.payment_expired_time);

        // The item itself is persisted and queryable.
        assert!(env.store.load_item_binary(&item.id).await.is_ok());
        assert_eq!(env.store.load_item_meta(&item.id).await.unwrap().id, item.id);
    }

    #[tokio::test]
    async fn duplicate_paid_order_conflicts() {
        let env = build_env(BundlerConfig::default(), "http://127.0.0.1:1").await;
        let (_, binary) = make_item(b"paid once");

        let order = env
            .bundler
            .process_submit(binary.clone(), "usdc", "", false)
            .await
            .unwrap();
        assert!(env.wdb.update_order_paid(order.id, "0xhash").unwrap());

        assert!(matches!(
            env.bundler.process_submit(binary, "usdc", "", false).await,
            Err(SeedError::OrderAlreadyPaid(_))
        ));
    }

    #[tokio::test]
    async fn unsupported_currency_rejected() {
        let env = build_env(BundlerConfig::default(), "http://127.0.0.1:1").await;
        let (_, binary) = make_item(b"no such token");
        assert!(matches!(
            env.bundler.process_submit(binary, "DOGE", "", false).await,
            Err(SeedError::UnsupportedCurrency(_))
        ));
    }

    #[tokio::test]
    async fn expiry_sweep_fails_unpaid_orders() {
        let cfg = BundlerConfig {
            payment_window_secs: -5,
            ..Default::default()
        };
        let env = build_env(cfg, "http://127.0.0.1:1").await;
        let (_, binary) = make_item(b"never paid");
        let order = env
            .bundler
            .process_submit(binary, "usdc", "", false)
            .await
            .unwrap();

        env.bundler.sweep_expired_once().unwrap();
        let after = env.wdb.get_order(order.id).unwrap();
        assert_eq!(after.payment_status, PaymentStatus::Expired);
        assert_eq!(after.on_chain_status, OnChainStatus::Failed);

        // Expired orders never reach a bundle.
        env.bundler.bundle_once().await.unwrap();
        assert!(env
            .wdb
            .get_on_chain_txs_by_status(OnChainStatus::Pending)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn bundle_tick_packs_paid_orders() {
        let env = build_env(BundlerConfig::default(), "http://127.0.0.1:1").await;

        let mut orders = Vec::new();
        let mut items = Vec::new();
        for payload in [&b"one"[..], b"two", b"three"] {
            let (item, binary) = make_item(payload);
            let order = env
                .bundler
                .process_submit(binary, "usdc", "", false)
                .await
                .unwrap();
            orders.push(order);
            items.push(item);
        }
        // Pay for the first two only.
        for order in &orders[..2] {
            assert!(env.wdb.update_order_paid(order.id, "0xsettled").unwrap());
        }

        env.bundler.bundle_once().await.unwrap();

        let pending = env
            .wdb
            .get_on_chain_txs_by_status(OnChainStatus::Pending)
            .unwrap();
        assert_eq!(pending.len(), 1);
        let bundle_tx = &pending[0];
        assert_eq!(
            bundle_tx.item_ids,
            vec![items[0].id.clone(), items[1].id.clone()]
        );

        for order in &orders[..2] {
            let row = env.wdb.get_order(order.id).unwrap();
            assert_eq!(row.on_chain_status, OnChainStatus::Pending);
        }
        let third = env.wdb.get_order(orders[2].id).unwrap();
        assert_eq!(third.on_chain_status, OnChainStatus::Waiting);

        // The bundle tx is seeded locally and mapped back to its items.
        assert!(env.store.is_exist_tx_meta(&bundle_tx.ar_id).await);
        assert_eq!(
            env.store.load_ar_items(&bundle_tx.ar_id).await.unwrap(),
            bundle_tx.item_ids
        );
        assert!(env
            .store
            .is_pending(&crate::schema::task_id(&bundle_tx.ar_id, TaskType::Broadcast))
            .await
            .unwrap());

        // The stored data parses back into the contributed items.
        let tx = env.store.load_tx_meta(&bundle_tx.ar_id).await.unwrap();
        let data = env
            .store
            .load_tx_data(&tx.data_root, &tx.data_size)
            .await
            .unwrap();
        let parsed = parse_bundle(&data).unwrap();
        assert_eq!(parsed.len(), 2);

        // A second tick with nothing new to pack is a no-op.
        env.bundler.bundle_once().await.unwrap();
        assert_eq!(
            env.wdb
                .get_on_chain_txs_by_status(OnChainStatus::Pending)
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn payment_watcher_matches_exact_amounts() {
        // Stub oracle replaying one mismatched and one matching event.
        let env = build_env(BundlerConfig::default(), "http://127.0.0.1:1").await;
        let (item, binary) = make_item(b"watched");
        let order = env
            .bundler
            .process_submit(binary, "usdc", "", false)
            .await
            .unwrap();

        let fee = order.fee.clone();
        let wrong_amount = format!("{}9", fee);
        let item_id = item.id.clone();
        let app = Router::new().route(
            "/receipts",
            get(move || {
                let fee = fee.clone();
                let wrong_amount = wrong_amount.clone();
                let item_id = item_id.clone();
                async move {
                    Json(serde_json::json!([
                        {
                            "rawId": 1,
                            "everHash": "0xwrong",
                            "from": "0xpayer",
                            "symbol": "USDC",
                            "amount": wrong_amount,
                            "itemId": item_id,
                        },
                        {
                            "rawId": 2,
                            "everHash": "0xright",
                            "from": "0xpayer",
                            "symbol": "USDC",
                            "amount": fee,
                            "itemId": item_id,
                        },
                    ]))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let watcher = env.bundler_with_pay(PayClient::new(&base, Duration::from_secs(2)).unwrap());
        watcher.watch_payments_once().await.unwrap();

        let paid = env.wdb.get_order(order.id).unwrap();
        assert_eq!(paid.payment_status, PaymentStatus::Paid);
        assert_eq!(paid.payment_id, "0xright");

        // Re-delivery of the same events is a no-op.
        watcher.watch_payments_once().await.unwrap();
        assert_eq!(env.wdb.get_last_raw_id().unwrap(), 2);
    }
}
