//! Durable, deduplicating, concurrency-bounded dispatcher for
//! broadcast-meta / broadcast / sync jobs against the peer set.
//!
//! The in-memory table and the pending-pool bucket together give
//! at-least-once dispatch: registration is durable before a token is
//! queued, and on startup the pool is re-enqueued wholesale.

use crate::cache::NetCache;
use crate::crypto::merkle;
use crate::error::{Result, SeedError};
use crate::gateway::Gateway;
use crate::schema::{parse_task_id, task_id, Task, TaskStatus, TaskType};
use crate::store::{build_chunks, Store};
use crate::types::{b64_decode, b64_encode, sha256, TxMeta};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const DEFAULT_WORKERS: usize = 20;

pub struct TaskManager {
    store: Arc<Store>,
    cache: Arc<NetCache>,
    gateway: Arc<Gateway>,
    tasks: Mutex<HashMap<String, Task>>,
    queue_tx: mpsc::UnboundedSender<String>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl TaskManager {
    pub fn new(store: Arc<Store>, cache: Arc<NetCache>, gateway: Arc<Gateway>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            cache,
            gateway,
            tasks: Mutex::new(HashMap::new()),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
        })
    }

    /// Idempotent registration: durable pending-pool write first, token
    /// enqueue after. A failed write rolls the cache entry back.
    pub async fn register(&self, ar_id: &str, tk_type: TaskType) -> Result<()> {
        let id = task_id(ar_id, tk_type);
        {
            let mut tasks = self.tasks.lock();
            if tasks.contains_key(&id) {
                return Ok(());
            }
            tasks.insert(
                id.clone(),
                Task::new(ar_id, tk_type, chrono::Utc::now().timestamp()),
            );
        }

        if let Err(e) = self.store.put_pending_pool(&id).await {
            self.tasks.lock().remove(&id);
            tracing::error!("pending pool write failed for {id}: {e}");
            return Err(e);
        }

        let _ = self.queue_tx.send(id);
        Ok(())
    }

    /// Terminal failure with no further retries; a worker already running
    /// this task will have its result discarded.
    pub async fn kill(&self, ar_id: &str, tk_type: TaskType) -> Result<()> {
        let id = task_id(ar_id, tk_type);
        let task = {
            let mut tasks = self.tasks.lock();
            let Some(mut task) = tasks.remove(&id) else {
                return Err(SeedError::NotExist);
            };
            task.status = TaskStatus::Failed;
            task
        };
        self.store.save_task(&task).await?;
        self.store.del_pending_pool(&id).await?;
        Ok(())
    }

    /// In-memory record first, durable record second.
    pub async fn get(&self, ar_id: &str, tk_type: TaskType) -> Result<Task> {
        let id = task_id(ar_id, tk_type);
        if let Some(task) = self.tasks.lock().get(&id).cloned() {
            return Ok(task);
        }
        self.store.load_task(&id).await
    }

    pub fn cached_tasks(&self) -> Vec<Task> {
        self.tasks.lock().values().cloned().collect()
    }

    /// Re-enqueues every pending-pool entry. Call before the HTTP
    /// listener starts accepting requests.
    pub async fn recover(&self) -> Result<usize> {
        let ids = self.store.pending_task_ids().await?;
        let mut recovered = 0usize;
        for id in ids {
            let Some((ar_id, tk_type)) = parse_task_id(&id) else {
                tracing::warn!("dropping unparsable pending task id {id}");
                continue;
            };
            let mut tasks = self.tasks.lock();
            if tasks.contains_key(&id) {
                continue;
            }
            tasks.insert(
                id.clone(),
                Task::new(&ar_id, tk_type, chrono::Utc::now().timestamp()),
            );
            drop(tasks);
            let _ = self.queue_tx.send(id);
            recovered += 1;
        }
        if recovered > 0 {
            tracing::info!("recovered {recovered} pending tasks");
        }
        Ok(recovered)
    }

    pub fn spawn_workers(self: &Arc<Self>, count: usize) {
        for _ in 0..count {
            let mgr = self.clone();
            tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = mgr.queue_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(id) = next else { break };
                    mgr.run_task(&id).await;
                }
            });
        }
    }

    async fn run_task(&self, id: &str) {
        let Some((ar_id, tk_type)) = parse_task_id(id) else {
            return;
        };
        let peers = self.cache.peers();

        // Claim: at most one active worker per task id.
        {
            let mut tasks = self.tasks.lock();
            let Some(task) = tasks.get_mut(id) else {
                // killed before dispatch
                return;
            };
            if task.status != TaskStatus::Pending {
                return;
            }
            task.status = TaskStatus::Running;
            task.total_nodes = peers.len() as u32;
        }
        let running = self.tasks.lock().get(id).cloned();
        if let Some(running) = running {
            if let Err(e) = self.store.save_task(&running).await {
                tracing::warn!("persist running task {id}: {e}");
            }
        }

        let outcome = match tk_type {
            TaskType::BroadcastMeta => self.broadcast_meta(&ar_id, &peers).await,
            TaskType::Broadcast => self.broadcast(&ar_id, &peers).await,
            TaskType::Sync => self.sync(&ar_id, &peers).await,
        };

        let finished = {
            let mut tasks = self.tasks.lock();
            let Some(mut task) = tasks.remove(id) else {
                // killed mid-flight, result discarded
                return;
            };
            match outcome {
                Ok((succeeded, failed)) => {
                    task.count_successed = succeeded;
                    task.count_failed = failed;
                    task.status = if succeeded >= 1 {
                        TaskStatus::Success
                    } else {
                        TaskStatus::Failed
                    };
                }
                Err(ref e) => {
                    tracing::warn!("task {id} failed: {e}");
                    task.status = TaskStatus::Failed;
                }
            }
            task
        };

        if let Err(e) = self.store.save_task(&finished).await {
            tracing::error!("persist finished task {id}: {e}");
        }
        if let Err(e) = self.store.del_pending_pool(id).await {
            tracing::error!("drop pending pool entry {id}: {e}");
        }
    }

    async fn broadcast_meta(&self, ar_id: &str, peers: &[String]) -> Result<(u32, u32)> {
        let tx = self.store.load_tx_meta(ar_id).await?;
        let mut succeeded = 0u32;
        let mut failed = 0u32;
        for peer in peers {
            match self.gateway.for_peer(peer).post_tx(&tx).await {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    tracing::debug!("broadcast-meta {ar_id} to {peer}: {e}");
                    failed += 1;
                }
            }
        }
        Ok((succeeded, failed))
    }

    /// A peer counts as reached only when the meta and every chunk land.
    async fn broadcast(&self, ar_id: &str, peers: &[String]) -> Result<(u32, u32)> {
        let tx = self.store.load_tx_meta(ar_id).await?;
        let chunks = self.store.load_tx_chunks(&tx.data_root, &tx.data_size).await?;
        let mut succeeded = 0u32;
        let mut failed = 0u32;
        'peers: for peer in peers {
            let client = self.gateway.for_peer(peer);
            if let Err(e) = client.post_tx(&tx).await {
                tracing::debug!("broadcast {ar_id} meta to {peer}: {e}");
                failed += 1;
                continue;
            }
            for chunk in &chunks {
                if let Err(e) = client.post_chunk(chunk).await {
                    tracing::debug!("broadcast {ar_id} chunk to {peer}: {e}");
                    failed += 1;
                    continue 'peers;
                }
            }
            succeeded += 1;
        }
        Ok((succeeded, failed))
    }

    /// First peer whose complete fetch verifies the data root wins.
    async fn sync(&self, ar_id: &str, peers: &[String]) -> Result<(u32, u32)> {
        let mut failed = 0u32;
        for peer in peers {
            match self.fetch_verified(peer, ar_id).await {
                Ok((tx, data)) => {
                    self.persist_synced(&tx, &data).await?;
                    return Ok((1, failed));
                }
                Err(e) => {
                    tracing::debug!("sync {ar_id} from {peer}: {e}");
                    failed += 1;
                }
            }
        }
        Ok((0, failed))
    }

    async fn fetch_verified(&self, peer: &str, ar_id: &str) -> Result<(TxMeta, Vec<u8>)> {
        let client = self.gateway.for_peer(peer);
        let tx = client.tx(ar_id).await?;

        let signature = b64_decode(&tx.signature)?;
        if b64_encode(&sha256(&signature)) != tx.id || tx.id != ar_id {
            return Err(SeedError::BadRequest("tx id mismatch".to_string()));
        }

        let size = tx.data_size_bytes()?;
        if size == 0 {
            return Ok((tx, Vec::new()));
        }

        let offset = client.tx_offset(ar_id).await?;
        let end: u64 = offset
            .offset
            .parse()
            .map_err(|_| SeedError::Http(format!("bad offset: {}", offset.offset)))?;
        let start = end + 1 - size;

        let mut data = Vec::with_capacity(size as usize);
        let mut cursor = start;
        while cursor <= end {
            let chunk = client.chunk(cursor).await?;
            let chunk_data = b64_decode(&chunk.chunk)?;
            if chunk_data.is_empty() {
                return Err(SeedError::Http(format!("empty chunk at {cursor}")));
            }
            cursor += chunk_data.len() as u64;
            data.extend_from_slice(&chunk_data);
        }
        if data.len() as u64 != size {
            return Err(SeedError::Http("fetched size mismatch".to_string()));
        }

        if b64_encode(&merkle::generate_data_root(&data)) != tx.data_root {
            return Err(SeedError::BadRequest("data root mismatch".to_string()));
        }
        Ok((tx, data))
    }

    async fn persist_synced(&self, tx: &TxMeta, data: &[u8]) -> Result<()> {
        self.store.save_tx_meta(tx).await?;
        for chunk in build_chunks(&tx.data_root, data) {
            self.store.save_chunk(&chunk).await?;
        }
        // Synced bundles get queued for item extraction.
        if tx.decoded_tag("Bundle-Format").as_deref() == Some("binary") {
            self.store.put_wait_parse(&tx.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Snapshot;
    use crate::rawdb::LocalDb;
    use crate::store::build_chunks;
    use crate::types::ArFee;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::time::Duration;

    fn test_env(peers: Vec<String>) -> (tempfile::TempDir, Arc<TaskManager>, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let db = LocalDb::open(dir.path()).unwrap();
        let store = Arc::new(Store::new(Arc::new(db)));
        let cache = Arc::new(NetCache::new());
        cache.store(Snapshot {
            info: serde_json::Value::Null,
            anchor: "anchor".to_string(),
            fee: ArFee::default(),
            peers,
            height: 100,
        });
        let gateway =
            Arc::new(Gateway::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap());
        let mgr = TaskManager::new(store.clone(), cache, gateway);
        (dir, mgr, store)
    }

    async fn spawn_stub_peer(accept: bool) -> String {
        let status = if accept {
            StatusCode::OK
        } else {
            StatusCode::BAD_REQUEST
        };
        let app = Router::new()
            .route("/tx", post(move || async move { status }))
            .route("/chunk", post(move || async move { status }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("127.0.0.1:{}", addr.port())
    }

    fn sample_tx(id: &str, data: &[u8]) -> TxMeta {
        TxMeta {
            format: 2,
            id: id.to_string(),
            data_root: b64_encode(&merkle::generate_data_root(data)),
            data_size: data.len().to_string(),
            ..Default::default()
        }
    }

    async fn wait_terminal(mgr: &TaskManager, store: &Store, id: &str) -> Task {
        for _ in 0..200 {
            if let Ok(task) = store.load_task(id).await {
                if task.status.is_terminal() && mgr.tasks.lock().get(id).is_none() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn register_is_idempotent_and_durable() {
        let (_dir, mgr, store) = test_env(Vec::new());
        mgr.register("arid", TaskType::Sync).await.unwrap();
        mgr.register("arid", TaskType::Sync).await.unwrap();

        assert!(store.is_pending("sync-arid").await.unwrap());
        let task = mgr.get("arid", TaskType::Sync).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(mgr.cached_tasks().len(), 1);
    }

    #[tokio::test]
    async fn kill_drops_pending_and_survives_restart() {
        let (dir, mgr, store) = test_env(Vec::new());
        mgr.register("victim", TaskType::Broadcast).await.unwrap();
        mgr.kill("victim", TaskType::Broadcast).await.unwrap();

        assert!(!store.is_pending("broadcast-victim").await.unwrap());
        let task = mgr.get("victim", TaskType::Broadcast).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(matches!(
            mgr.kill("victim", TaskType::Broadcast).await,
            Err(SeedError::NotExist)
        ));

        // A fresh manager over the same store must not re-enqueue it.
        let db = LocalDb::open(dir.path()).unwrap();
        let store2 = Arc::new(Store::new(Arc::new(db)));
        let cache = Arc::new(NetCache::new());
        let gateway =
            Arc::new(Gateway::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap());
        let mgr2 = TaskManager::new(store2, cache, gateway);
        assert_eq!(mgr2.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn broadcast_meta_tallies_peers() {
        let mut peers = Vec::new();
        for accept in [true, true, true, false] {
            peers.push(spawn_stub_peer(accept).await);
        }
        let (_dir, mgr, store) = test_env(peers);

        let tx = sample_tx("bm-tx", b"abc");
        store.save_tx_meta(&tx).await.unwrap();

        mgr.register("bm-tx", TaskType::BroadcastMeta).await.unwrap();
        mgr.spawn_workers(2);

        let task = wait_terminal(&mgr, &store, "broadcast-meta-bm-tx").await;
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.count_successed, 3);
        assert_eq!(task.count_failed, 1);
        assert_eq!(task.total_nodes, 4);
        assert!(!store.is_pending("broadcast-meta-bm-tx").await.unwrap());
    }

    #[tokio::test]
    async fn broadcast_with_no_reachable_peer_fails() {
        let peers = vec![spawn_stub_peer(false).await];
        let (_dir, mgr, store) = test_env(peers);

        let data = b"payload";
        let tx = sample_tx("b-tx", data);
        store.save_tx_meta(&tx).await.unwrap();
        for chunk in build_chunks(&tx.data_root, data) {
            store.save_chunk(&chunk).await.unwrap();
        }

        mgr.register("b-tx", TaskType::Broadcast).await.unwrap();
        mgr.spawn_workers(1);

        let task = wait_terminal(&mgr, &store, "broadcast-b-tx").await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.count_successed, 0);
        assert_eq!(task.count_failed, 1);
    }

    #[tokio::test]
    async fn sync_pulls_and_verifies_from_first_good_peer() {
        // Stub peer serving one complete single-chunk transaction.
        let wallet = crate::crypto::wallet::test_support::TEST_WALLET.clone();
        let data = b"synced bytes".to_vec();
        let signature = wallet.sign(b"placeholder payload").unwrap();
        let ar_id = b64_encode(&sha256(&signature));
        let mut tx = sample_tx(&ar_id, &data);
        tx.signature = b64_encode(&signature);
        tx.owner = wallet.owner.clone();

        let chunks = build_chunks(&tx.data_root, &data);
        let end = data.len() as u64;
        let offset = crate::types::TxOffset {
            size: tx.data_size.clone(),
            offset: end.to_string(),
        };
        let chunk_for_stub = chunks[0].clone();
        let tx_for_stub = tx.clone();
        let app = Router::new()
            .route(
                "/tx/:id",
                get(move || {
                    let tx = tx_for_stub.clone();
                    async move { Json(tx) }
                }),
            )
            .route(
                "/tx/:id/offset",
                get(move || {
                    let offset = offset.clone();
                    async move { Json(offset) }
                }),
            )
            .route(
                "/chunk/:offset",
                get(move || {
                    let chunk = chunk_for_stub.clone();
                    async move { Json(chunk) }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // A dead peer first: the dispatcher must move past it.
        let peers = vec!["127.0.0.1:9".to_string(), peer];
        let (_dir, mgr, store) = test_env(peers);

        mgr.register(&ar_id, TaskType::Sync).await.unwrap();
        mgr.spawn_workers(1);

        let task = wait_terminal(&mgr, &store, &task_id(&ar_id, TaskType::Sync)).await;
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.count_successed, 1);
        assert_eq!(task.count_failed, 1);

        // The transaction is now served locally.
        let loaded = store.load_tx_data(&tx.data_root, &tx.data_size).await.unwrap();
        assert_eq!(loaded, data);
        assert!(store.is_exist_tx_meta(&ar_id).await);
    }
}
