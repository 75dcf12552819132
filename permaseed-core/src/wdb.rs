//! Relational store for orders, on-chain bundle transactions, token
//! prices, payment receipts, and manifests.

use crate::error::{Result, SeedError};
use crate::schema::{
    Manifest, OnChainStatus, OnChainTx, Order, PaymentStatus, Receipt, TokenPrice,
    RECEIPT_UNSPENT,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

const DB_NAME: &str = "seed.sqlite";
const ON_CHAIN_BATCH_LIMIT: usize = 2000;

pub struct Wdb {
    conn: Mutex<Connection>,
}

impl Wdb {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join(DB_NAME))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| {
            row.get::<_, String>(0)
        })?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self, no_fee: bool, enable_manifest: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                item_id TEXT NOT NULL,
                signer TEXT NOT NULL,
                signer_owner TEXT NOT NULL,
                size INTEGER NOT NULL,
                currency TEXT NOT NULL,
                decimals INTEGER NOT NULL,
                fee TEXT NOT NULL,
                payment_expired_time INTEGER NOT NULL,
                payment_status TEXT NOT NULL,
                payment_id TEXT NOT NULL DEFAULT '',
                on_chain_status TEXT NOT NULL,
                expected_block INTEGER NOT NULL,
                sort INTEGER NOT NULL DEFAULT 0,
                api_key TEXT NOT NULL DEFAULT ''
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_item_id ON orders(item_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_status
             ON orders(payment_status, on_chain_status, sort)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS on_chain_txs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                ar_id TEXT NOT NULL,
                item_ids TEXT NOT NULL,
                cur_height INTEGER NOT NULL,
                data_size TEXT NOT NULL,
                reward TEXT NOT NULL,
                status TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_on_chain_txs_ar_id ON on_chain_txs(ar_id)",
            [],
        )?;

        if !no_fee {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS token_prices (
                    symbol TEXT PRIMARY KEY,
                    decimals INTEGER NOT NULL,
                    price REAL NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS receipt_ever_txs (
                    raw_id INTEGER PRIMARY KEY,
                    created_at TEXT NOT NULL,
                    ever_hash TEXT NOT NULL UNIQUE,
                    from_addr TEXT NOT NULL,
                    symbol TEXT NOT NULL,
                    amount TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    status TEXT NOT NULL
                )",
                [],
            )?;
        }

        if enable_manifest {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS manifests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    created_at TEXT NOT NULL,
                    manifest_url TEXT NOT NULL,
                    manifest_id TEXT NOT NULL
                )",
                [],
            )?;
        }
        Ok(())
    }

    fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }

    // --- orders ---

    fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
        let payment_status: String = row.get(9)?;
        let on_chain_status: String = row.get(11)?;
        Ok(Order {
            id: row.get(0)?,
            item_id: row.get(1)?,
            signer: row.get(2)?,
            signer_owner: row.get(3)?,
            size: row.get::<_, i64>(4)? as u64,
            currency: row.get(5)?,
            decimals: row.get(6)?,
            fee: row.get(7)?,
            payment_expired_time: row.get(8)?,
            payment_status: PaymentStatus::parse(&payment_status)
                .unwrap_or(PaymentStatus::Expired),
            payment_id: row.get(10)?,
            on_chain_status: OnChainStatus::parse(&on_chain_status)
                .unwrap_or(OnChainStatus::Failed),
            expected_block: row.get(12)?,
            sort: row.get::<_, i64>(13)? != 0,
            api_key: row.get(14)?,
        })
    }

    const ORDER_COLUMNS: &'static str = "id, item_id, signer, signer_owner, size, currency, \
         decimals, fee, payment_expired_time, payment_status, payment_id, on_chain_status, \
         expected_block, sort, api_key";

    pub fn insert_order(&self, order: &Order) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO orders (created_at, item_id, signer, signer_owner, size, currency,
                decimals, fee, payment_expired_time, payment_status, payment_id,
                on_chain_status, expected_block, sort, api_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                Self::now(),
                order.item_id,
                order.signer,
                order.signer_owner,
                order.size as i64,
                order.currency,
                order.decimals,
                order.fee,
                order.payment_expired_time,
                order.payment_status.as_str(),
                order.payment_id,
                order.on_chain_status.as_str(),
                order.expected_block,
                order.sort as i64,
                order.api_key,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Latest unpaid order for an item, if any.
    pub fn get_unpaid_order(&self, item_id: &str) -> Result<Option<Order>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM orders WHERE item_id = ?1 AND payment_status = 'unpaid'
             ORDER BY id DESC LIMIT 1",
            Self::ORDER_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![item_id], Self::order_from_row)
            .optional()?)
    }

    pub fn get_order(&self, id: i64) -> Result<Order> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM orders WHERE id = ?1", Self::ORDER_COLUMNS);
        conn.query_row(&sql, params![id], Self::order_from_row)
            .optional()?
            .ok_or(SeedError::NotExist)
    }

    pub fn exist_paid_order(&self, item_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE item_id = ?1 AND payment_status = 'paid'",
            params![item_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_expired_orders(&self, now: i64) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM orders
             WHERE payment_status = 'unpaid' AND payment_expired_time < ?1",
            Self::ORDER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![now], Self::order_from_row)?;
        collect_rows(rows)
    }

    /// `unpaid → expired` is final; the on-chain side fails with it.
    pub fn update_order_expired(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE orders SET payment_status = 'expired', on_chain_status = 'failed'
             WHERE id = ?1 AND payment_status = 'unpaid'",
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// `unpaid → paid`, at most once; returns whether the transition
    /// applied. Any other source state is left untouched.
    pub fn update_order_paid(&self, id: i64, payment_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE orders SET payment_status = 'paid', payment_id = ?2
             WHERE id = ?1 AND payment_status = 'unpaid'",
            params![id, payment_id],
        )?;
        Ok(affected > 0)
    }

    /// Paid orders still waiting to go on chain, one `sort` class at a
    /// time. Ascending id keeps the sorted class in ingress order.
    pub fn get_need_on_chain_orders(&self, sorted: bool) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM orders
             WHERE payment_status = 'paid' AND on_chain_status = 'waiting' AND sort = ?1
             ORDER BY id ASC LIMIT {}",
            Self::ORDER_COLUMNS,
            ON_CHAIN_BATCH_LIMIT
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![sorted as i64], Self::order_from_row)?;
        collect_rows(rows)
    }

    pub fn update_orders_on_chain_status(
        &self,
        item_id: &str,
        status: OnChainStatus,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET on_chain_status = ?2 WHERE item_id = ?1",
            params![item_id, status.as_str()],
        )?;
        Ok(())
    }

    // --- on-chain bundle transactions ---

    pub fn insert_on_chain_tx(&self, tx: &OnChainTx) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO on_chain_txs (created_at, ar_id, item_ids, cur_height, data_size,
                reward, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Self::now(),
                tx.ar_id,
                serde_json::to_string(&tx.item_ids)?,
                tx.cur_height,
                tx.data_size,
                tx.reward,
                tx.status.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn on_chain_tx_from_row(row: &Row<'_>) -> rusqlite::Result<OnChainTx> {
        let item_ids: String = row.get(2)?;
        let status: String = row.get(6)?;
        Ok(OnChainTx {
            id: row.get(0)?,
            ar_id: row.get(1)?,
            item_ids: serde_json::from_str(&item_ids).unwrap_or_default(),
            cur_height: row.get(3)?,
            data_size: row.get(4)?,
            reward: row.get(5)?,
            status: OnChainStatus::parse(&status).unwrap_or(OnChainStatus::Failed),
        })
    }

    const ON_CHAIN_COLUMNS: &'static str =
        "id, ar_id, item_ids, cur_height, data_size, reward, status";

    pub fn get_on_chain_txs_by_status(&self, status: OnChainStatus) -> Result<Vec<OnChainTx>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM on_chain_txs WHERE status = ?1 ORDER BY id ASC",
            Self::ON_CHAIN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status.as_str()], Self::on_chain_tx_from_row)?;
        collect_rows(rows)
    }

    pub fn get_on_chain_tx_by_ar_id(&self, ar_id: &str) -> Result<Option<OnChainTx>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM on_chain_txs WHERE ar_id = ?1 ORDER BY id DESC LIMIT 1",
            Self::ON_CHAIN_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![ar_id], Self::on_chain_tx_from_row)
            .optional()?)
    }

    pub fn update_on_chain_status(&self, ar_id: &str, status: OnChainStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE on_chain_txs SET status = ?2 WHERE ar_id = ?1",
            params![ar_id, status.as_str()],
        )?;
        Ok(())
    }

    // --- token prices ---

    pub fn upsert_token(&self, price: &TokenPrice) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO token_prices (symbol, decimals, price, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(symbol) DO UPDATE SET price = ?3, updated_at = ?4",
            params![price.symbol, price.decimals, price.price, Self::now()],
        )?;
        Ok(())
    }

    pub fn get_token_price(&self, symbol: &str) -> Result<Option<TokenPrice>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT symbol, decimals, price FROM token_prices WHERE symbol = ?1",
                params![symbol],
                |row| {
                    Ok(TokenPrice {
                        symbol: row.get(0)?,
                        decimals: row.get(1)?,
                        price: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn get_prices(&self) -> Result<Vec<TokenPrice>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT symbol, decimals, price FROM token_prices ORDER BY symbol")?;
        let rows = stmt.query_map([], |row| {
            Ok(TokenPrice {
                symbol: row.get(0)?,
                decimals: row.get(1)?,
                price: row.get(2)?,
            })
        })?;
        collect_rows(rows)
    }

    /// AR is the pivot for every quote.
    pub fn get_ar_price(&self) -> Result<f64> {
        self.get_token_price("AR")?
            .map(|t| t.price)
            .ok_or_else(|| SeedError::Unavailable("AR price not refreshed yet".to_string()))
    }

    // --- payment receipts ---

    /// Idempotent on re-delivery: returns false when the raw id (or the
    /// settlement hash) was already recorded.
    pub fn insert_receipt(&self, receipt: &Receipt) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "INSERT OR IGNORE INTO receipt_ever_txs
                (raw_id, created_at, ever_hash, from_addr, symbol, amount, item_id, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                receipt.raw_id as i64,
                Self::now(),
                receipt.ever_hash,
                receipt.from_addr,
                receipt.symbol,
                receipt.amount,
                receipt.item_id,
                RECEIPT_UNSPENT,
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn get_last_raw_id(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let raw_id: Option<i64> = conn
            .query_row(
                "SELECT raw_id FROM receipt_ever_txs ORDER BY raw_id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw_id.unwrap_or(0) as u64)
    }

    pub fn update_receipt_status(&self, raw_id: u64, status: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE receipt_ever_txs SET status = ?2 WHERE raw_id = ?1",
            params![raw_id as i64, status],
        )?;
        Ok(())
    }

    // --- manifests ---

    pub fn insert_manifest(&self, manifest: &Manifest) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO manifests (created_at, manifest_url, manifest_id) VALUES (?1, ?2, ?3)",
            params![Self::now(), manifest.manifest_url, manifest.manifest_id],
        )?;
        Ok(())
    }

    pub fn get_manifest_id(&self, manifest_url: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT manifest_id FROM manifests WHERE manifest_url = ?1
                 ORDER BY id DESC LIMIT 1",
                params![manifest_url],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn del_manifest(&self, manifest_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM manifests WHERE manifest_id = ?1",
            params![manifest_id],
        )?;
        Ok(())
    }
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
