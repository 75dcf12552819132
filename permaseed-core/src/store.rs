//! Content-addressed chunk/transaction index plus the durable task and
//! bundle-item records, all over the pluggable blob store.

use crate::bundle::DataItem;
use crate::crypto::merkle;
use crate::error::{Result, SeedError};
use crate::rawdb::{BatchWrite, Bucket, RawDb};
use crate::schema::Task;
use crate::types::{
    b64_decode, end_offset_key, offset_from_key, offset_to_key, Chunk, TxMeta, TxOffset,
    MAX_CHUNK_SIZE, MAX_SINGLE_SHOT_SIZE,
};
use std::sync::Arc;

const ALL_DATA_END_OFFSET_KEY: &[u8] = b"allDataEndOffset";

pub struct Store {
    db: Arc<dyn RawDb>,
    /// Serializes the read-allocate-write chunk insert sequence.
    chunk_lock: tokio::sync::Mutex<()>,
}

impl Store {
    pub fn new(db: Arc<dyn RawDb>) -> Self {
        Self {
            db,
            chunk_lock: tokio::sync::Mutex::new(()),
        }
    }

    // --- transaction metadata ---

    pub async fn save_tx_meta(&self, tx: &TxMeta) -> Result<()> {
        let mut tx = tx.clone();
        // only the metadata is stored here, never the payload
        tx.data = String::new();
        let value = serde_json::to_vec(&tx)?;
        self.db.put(Bucket::TxMeta, tx.id.as_bytes(), &value).await
    }

    pub async fn load_tx_meta(&self, ar_id: &str) -> Result<TxMeta> {
        let raw = self.db.get(Bucket::TxMeta, ar_id.as_bytes()).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub async fn is_exist_tx_meta(&self, ar_id: &str) -> bool {
        self.load_tx_meta(ar_id).await.is_ok()
    }

    // --- chunk index ---

    pub async fn all_data_end_offset(&self) -> Result<u64> {
        match self.db.get(Bucket::Constants, ALL_DATA_END_OFFSET_KEY).await {
            Ok(raw) => offset_from_key(&raw),
            Err(SeedError::NotExist) => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub async fn load_tx_end_offset(&self, data_root: &str, data_size: &str) -> Result<u64> {
        let raw = self
            .db
            .get(Bucket::TxEndOffset, &end_offset_key(data_root, data_size))
            .await?;
        offset_from_key(&raw)
    }

    /// Validates the chunk against its Merkle proof, then allocates the
    /// next global offset and lands all three correlated writes in one
    /// batch. Returns the chunk's global start offset.
    pub async fn save_chunk(&self, chunk: &Chunk) -> Result<u64> {
        let data = b64_decode(&chunk.chunk)?;
        if data.is_empty() {
            return Err(SeedError::BadRequest("chunk data can not be null".to_string()));
        }
        if data.len() > MAX_CHUNK_SIZE {
            return Err(SeedError::BadRequest(format!(
                "chunk exceeds {MAX_CHUNK_SIZE} bytes"
            )));
        }
        let data_size: u64 = chunk
            .data_size
            .parse()
            .map_err(|_| SeedError::BadRequest("invalid data_size".to_string()))?;
        let rel_offset: u64 = chunk
            .offset
            .parse()
            .map_err(|_| SeedError::BadRequest("invalid offset".to_string()))?;
        let root: [u8; 32] = b64_decode(&chunk.data_root)?
            .try_into()
            .map_err(|_| SeedError::BadRequest("data_root must be 32 bytes".to_string()))?;
        let path = b64_decode(&chunk.data_path)?;

        let validated =
            merkle::validate_path(&root, rel_offset as usize, data_size as usize, &path)
                .ok_or_else(|| SeedError::BadRequest("invalid chunk proof".to_string()))?;
        if validated.chunk_size != data.len() {
            return Err(SeedError::BadRequest(format!(
                "chunk length {} does not match proof range {}",
                data.len(),
                validated.chunk_size
            )));
        }

        let _guard = self.chunk_lock.lock().await;
        let start = self.all_data_end_offset().await? + 1;
        let end = start + data.len() as u64 - 1;
        let tx_end = match self.load_tx_end_offset(&chunk.data_root, &chunk.data_size).await {
            Ok(current) => current.max(end),
            Err(SeedError::NotExist) => end,
            Err(e) => return Err(e),
        };

        self.db
            .put_batch(vec![
                BatchWrite::new(
                    Bucket::Chunks,
                    &offset_to_key(start)[..],
                    serde_json::to_vec(chunk)?,
                ),
                BatchWrite::new(
                    Bucket::TxEndOffset,
                    &end_offset_key(&chunk.data_root, &chunk.data_size)[..],
                    &offset_to_key(tx_end)[..],
                ),
                BatchWrite::new(
                    Bucket::Constants,
                    ALL_DATA_END_OFFSET_KEY,
                    &offset_to_key(end)[..],
                ),
            ])
            .await?;
        Ok(start)
    }

    pub async fn load_chunk(&self, chunk_start_offset: u64) -> Result<Chunk> {
        let raw = self
            .db
            .get(Bucket::Chunks, &offset_to_key(chunk_start_offset))
            .await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub async fn load_tx_offset(&self, ar_id: &str) -> Result<TxOffset> {
        let tx = self.load_tx_meta(ar_id).await?;
        let end = self.load_tx_end_offset(&tx.data_root, &tx.data_size).await?;
        Ok(TxOffset {
            size: tx.data_size,
            offset: end.to_string(),
        })
    }

    /// Single-shot data read for clients; large payloads must go through
    /// chunked retrieval instead.
    pub async fn load_tx_data(&self, data_root: &str, data_size: &str) -> Result<Vec<u8>> {
        let size: u64 = data_size
            .parse()
            .map_err(|_| SeedError::BadRequest("invalid data_size".to_string()))?;
        if size > MAX_SINGLE_SHOT_SIZE {
            return Err(SeedError::DataTooBig);
        }
        self.read_tx_data(data_root, data_size, size).await
    }

    /// Unbounded walk used by internal consumers (bundle import, peer
    /// broadcast).
    pub(crate) async fn read_tx_data(
        &self,
        data_root: &str,
        data_size: &str,
        size: u64,
    ) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let end = self.load_tx_end_offset(data_root, data_size).await?;
        let start = end + 1 - size;
        let mut data = Vec::with_capacity(size as usize);
        let mut cursor = start;
        while cursor <= end {
            let chunk = self.load_chunk(cursor).await?;
            let chunk_data = b64_decode(&chunk.chunk)?;
            if chunk_data.is_empty() {
                return Err(SeedError::Internal(format!(
                    "empty chunk at offset {cursor}"
                )));
            }
            cursor += chunk_data.len() as u64;
            data.extend_from_slice(&chunk_data);
        }
        Ok(data)
    }

    /// Loads every stored chunk of a transaction in ascending offset
    /// order, for re-broadcast to peers.
    pub async fn load_tx_chunks(&self, data_root: &str, data_size: &str) -> Result<Vec<Chunk>> {
        let size: u64 = data_size
            .parse()
            .map_err(|_| SeedError::BadRequest("invalid data_size".to_string()))?;
        if size == 0 {
            return Ok(Vec::new());
        }
        let end = self.load_tx_end_offset(data_root, data_size).await?;
        let start = end + 1 - size;
        let mut chunks = Vec::new();
        let mut cursor = start;
        while cursor <= end {
            let chunk = self.load_chunk(cursor).await?;
            let len = b64_decode(&chunk.chunk)?.len() as u64;
            if len == 0 {
                return Err(SeedError::Internal(format!(
                    "empty chunk at offset {cursor}"
                )));
            }
            chunks.push(chunk);
            cursor += len;
        }
        Ok(chunks)
    }

    // --- task records ---

    pub async fn save_task(&self, task: &Task) -> Result<()> {
        let value = serde_json::to_vec(task)?;
        self.db
            .put(Bucket::Task, task.task_id().as_bytes(), &value)
            .await
    }

    pub async fn load_task(&self, task_id: &str) -> Result<Task> {
        let raw = self.db.get(Bucket::Task, task_id.as_bytes()).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub async fn put_pending_pool(&self, task_id: &str) -> Result<()> {
        self.db
            .put(Bucket::PendingPool, task_id.as_bytes(), &[])
            .await
    }

    pub async fn del_pending_pool(&self, task_id: &str) -> Result<()> {
        self.db.delete(Bucket::PendingPool, task_id.as_bytes()).await
    }

    pub async fn pending_task_ids(&self) -> Result<Vec<String>> {
        let keys = self.db.list_keys(Bucket::PendingPool).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| String::from_utf8(key).ok())
            .collect())
    }

    pub async fn is_pending(&self, task_id: &str) -> Result<bool> {
        self.db.exists(Bucket::PendingPool, task_id.as_bytes()).await
    }

    // --- bundle items ---

    pub async fn save_item_binary(&self, item_id: &str, binary: &[u8]) -> Result<()> {
        self.db
            .put(Bucket::BundleItemBinary, item_id.as_bytes(), binary)
            .await
    }

    pub async fn load_item_binary(&self, item_id: &str) -> Result<Vec<u8>> {
        self.db
            .get(Bucket::BundleItemBinary, item_id.as_bytes())
            .await
    }

    pub async fn save_item_meta(&self, item: &DataItem) -> Result<()> {
        let mut meta = item.clone();
        meta.data = String::new();
        let value = serde_json::to_vec(&meta)?;
        self.db
            .put(Bucket::BundleItemMeta, item.id.as_bytes(), &value)
            .await
    }

    pub async fn load_item_meta(&self, item_id: &str) -> Result<DataItem> {
        let raw = self
            .db
            .get(Bucket::BundleItemMeta, item_id.as_bytes())
            .await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    // --- bundle bookkeeping ---

    pub async fn put_wait_parse(&self, ar_id: &str) -> Result<()> {
        self.db
            .put(Bucket::BundleWaitParse, ar_id.as_bytes(), &[])
            .await
    }

    pub async fn del_wait_parse(&self, ar_id: &str) -> Result<()> {
        self.db
            .delete(Bucket::BundleWaitParse, ar_id.as_bytes())
            .await
    }

    pub async fn wait_parse_ids(&self) -> Result<Vec<String>> {
        let keys = self.db.list_keys(Bucket::BundleWaitParse).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| String::from_utf8(key).ok())
            .collect())
    }

    pub async fn save_ar_items(&self, ar_id: &str, item_ids: &[String]) -> Result<()> {
        let value = serde_json::to_vec(item_ids)?;
        self.db
            .put(Bucket::BundleArToItems, ar_id.as_bytes(), &value)
            .await
    }

    pub async fn load_ar_items(&self, ar_id: &str) -> Result<Vec<String>> {
        let raw = self.db.get(Bucket::BundleArToItems, ar_id.as_bytes()).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Turns raw data into wire chunks with freshly generated proofs, ready
/// for `save_chunk`.
pub fn build_chunks(data_root: &str, data: &[u8]) -> Vec<Chunk> {
    let (_, proofs) = merkle::generate_chunk_proofs(data);
    proofs
        .into_iter()
        .map(|proof| Chunk {
            data_root: data_root.to_string(),
            data_size: data.len().to_string(),
            data_path: crate::types::b64_encode(&proof.proof),
            offset: proof.offset.to_string(),
            chunk: crate::types::b64_encode(&data[proof.min_byte_range..proof.max_byte_range]),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rawdb::LocalDb;
    use crate::types::b64_encode;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let db = LocalDb::open(dir.path()).unwrap();
        (dir, Store::new(Arc::new(db)))
    }

    fn tx_for(data: &[u8], id: &str) -> TxMeta {
        TxMeta {
            format: 2,
            id: id.to_string(),
            data_root: b64_encode(&merkle::generate_data_root(data)),
            data_size: data.len().to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn tx_meta_strips_data() {
        let (_dir, store) = open_store();
        let mut tx = tx_for(b"xyz", "tx1");
        tx.data = b64_encode(b"xyz");
        store.save_tx_meta(&tx).await.unwrap();

        let loaded = store.load_tx_meta("tx1").await.unwrap();
        assert!(loaded.data.is_empty());
        assert_eq!(loaded.data_size, "3");
        assert!(store.is_exist_tx_meta("tx1").await);
        assert!(!store.is_exist_tx_meta("nope").await);
    }

    #[tokio::test]
    async fn chunk_offsets_are_monotonic() {
        let (_dir, store) = open_store();
        assert_eq!(store.all_data_end_offset().await.unwrap(), 0);

        let data = b"abc";
        let root = b64_encode(&merkle::generate_data_root(data));
        let chunks = build_chunks(&root, data);
        assert_eq!(chunks.len(), 1);

        let start = store.save_chunk(&chunks[0]).await.unwrap();
        assert_eq!(start, 1);
        assert_eq!(store.all_data_end_offset().await.unwrap(), 3);

        let other = b"defg";
        let other_root = b64_encode(&merkle::generate_data_root(other));
        let other_chunks = build_chunks(&other_root, other);
        let start2 = store.save_chunk(&other_chunks[0]).await.unwrap();
        assert_eq!(start2, 4);
        assert_eq!(store.all_data_end_offset().await.unwrap(), 7);
        assert_eq!(store.load_tx_end_offset(&other_root, "4").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn load_tx_data_round_trip() {
        let (_dir, store) = open_store();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let root = b64_encode(&merkle::generate_data_root(&data));
        for chunk in build_chunks(&root, &data) {
            store.save_chunk(&chunk).await.unwrap();
        }
        let loaded = store.load_tx_data(&root, "1000").await.unwrap();
        assert_eq!(loaded, data);
    }

    #[tokio::test]
    async fn single_byte_tx() {
        let (_dir, store) = open_store();
        let data = [0x5au8];
        let root = b64_encode(&merkle::generate_data_root(&data));
        let chunks = build_chunks(&root, &data);
        store.save_chunk(&chunks[0]).await.unwrap();
        assert_eq!(store.load_tx_data(&root, "1").await.unwrap(), data);
        assert_eq!(store.load_tx_end_offset(&root, "1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn zero_size_returns_empty() {
        let (_dir, store) = open_store();
        assert!(store.load_tx_data("whatever", "0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversize_single_shot_rejected() {
        let (_dir, store) = open_store();
        let size = (MAX_SINGLE_SHOT_SIZE + 1).to_string();
        assert!(matches!(
            store.load_tx_data("root", &size).await,
            Err(SeedError::DataTooBig)
        ));
    }

    #[tokio::test]
    async fn invalid_chunk_proof_rejected() {
        let (_dir, store) = open_store();
        let data = b"hello world";
        let root = b64_encode(&merkle::generate_data_root(data));
        let mut chunk = build_chunks(&root, data).remove(0);
        chunk.chunk = b64_encode(b"tampered data");
        assert!(store.save_chunk(&chunk).await.is_err());

        chunk.chunk = String::new();
        assert!(store.save_chunk(&chunk).await.is_err());
    }

    #[tokio::test]
    async fn tx_offset_endpoint_shape() {
        let (_dir, store) = open_store();
        let data = b"abc";
        let root = b64_encode(&merkle::generate_data_root(data));
        let tx = tx_for(data, "txo");
        store.save_tx_meta(&tx).await.unwrap();
        for chunk in build_chunks(&root, data) {
            store.save_chunk(&chunk).await.unwrap();
        }
        let offset = store.load_tx_offset("txo").await.unwrap();
        assert_eq!(offset.size, "3");
        assert_eq!(offset.offset, "3");
    }

    #[tokio::test]
    async fn pending_pool_round_trip() {
        let (_dir, store) = open_store();
        store.put_pending_pool("sync-abc").await.unwrap();
        store.put_pending_pool("broadcast-def").await.unwrap();
        assert!(store.is_pending("sync-abc").await.unwrap());

        let ids = store.pending_task_ids().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"sync-abc".to_string()));

        store.del_pending_pool("sync-abc").await.unwrap();
        assert!(!store.is_pending("sync-abc").await.unwrap());
        assert_eq!(store.pending_task_ids().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn multi_chunk_round_trip() {
        let (_dir, store) = open_store();
        let data: Vec<u8> = (0..MAX_CHUNK_SIZE + 100).map(|i| (i % 251) as u8).collect();
        let root = b64_encode(&merkle::generate_data_root(&data));
        let chunks = build_chunks(&root, &data);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            store.save_chunk(chunk).await.unwrap();
        }
        let size = data.len().to_string();
        assert_eq!(store.load_tx_data(&root, &size).await.unwrap(), data);
        let stored = store.load_tx_chunks(&root, &size).await.unwrap();
        assert_eq!(stored.len(), chunks.len());
    }
}
