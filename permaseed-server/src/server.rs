//! HTTP surface: the chain-gateway-compatible read/write API, task
//! administration, bundle submission, and the upstream reverse proxy
//! fallback for public read misses.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use permaseed_core::aggregator::Bundler;
use permaseed_core::cache::NetCache;
use permaseed_core::fee::FeeOracle;
use permaseed_core::schema::{RespOrder, TaskType};
use permaseed_core::store::{build_chunks, Store};
use permaseed_core::taskmgr::TaskManager;
use permaseed_core::types::{
    b64_decode, b64_encode, is_ar_id, Chunk, TxMeta, ALLOW_MAX_ITEM_SIZE,
};
use permaseed_core::wdb::Wdb;
use permaseed_core::SeedError;
use serde::Deserialize;
use std::sync::Arc;

const TEXT_HTML: &str = "text/html; charset=utf-8";

pub struct AppState {
    pub store: Arc<Store>,
    pub wdb: Arc<Wdb>,
    pub cache: Arc<NetCache>,
    pub tasks: Arc<TaskManager>,
    pub bundler: Arc<Bundler>,
    pub fee: Arc<FeeOracle>,
    pub proxy_client: reqwest::Client,
    pub upstream: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // chain-gateway compatible surface
        .route("/tx", post(submit_tx))
        .route("/chunk", post(submit_chunk))
        .route("/tx/:arid", get(get_tx))
        .route("/tx/:arid/offset", get(get_tx_offset))
        .route("/tx/:arid/:field", get(get_tx_field))
        .route("/chunk/:offset", get(get_chunk))
        .route("/info", get(get_info))
        .route("/tx_anchor", get(get_anchor))
        .route("/price/:size", get(get_price))
        .route("/peers", get(get_peers))
        // passthrough to the upstream gateway
        .route("/price/:size/:target", get(proxy_upstream))
        .route("/block/hash/:hash", get(proxy_upstream))
        .route("/block/height/:height", get(proxy_upstream))
        .route("/current_block", get(proxy_upstream))
        .route("/wallet/:address/balance", get(proxy_upstream))
        .route("/wallet/:address/last_tx", get(proxy_upstream))
        .route("/arql", post(proxy_upstream))
        .route("/graphql", get(proxy_upstream).post(proxy_upstream))
        .route("/tx/pending", get(proxy_upstream))
        .route("/unconfirmed_tx/:arid", get(proxy_upstream))
        // broadcast / sync task administration
        .route("/task/:tktype/:arid", post(post_task).get(get_task))
        .route("/task/kill/:tktype/:arid", post(kill_task))
        .route("/task/cache", get(get_cache_tasks))
        // bundle aggregation
        .route("/bundle/tx/:key", post(submit_item).get(get_item_meta))
        .route("/bundle/fees", get(bundle_fees))
        .route("/bundle/fee/:size/:currency", get(bundle_fee))
        // catch-all data read
        .route("/:id", get(get_data_by_id))
        .layer(DefaultBodyLimit::max(ALLOW_MAX_ITEM_SIZE + 4096))
        .with_state(state)
}

fn error_response(e: SeedError) -> Response {
    let status = match &e {
        SeedError::NotExist => StatusCode::NOT_FOUND,
        SeedError::BadRequest(_)
        | SeedError::DataTooBig
        | SeedError::ItemTooLarge
        | SeedError::UnsupportedCurrency(_)
        | SeedError::OrderAlreadyPaid(_)
        | SeedError::Json(_) => StatusCode::BAD_REQUEST,
        SeedError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => {
            tracing::error!("request failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(e.to_string())).into_response()
}

fn html_text(body: impl Into<String>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, TEXT_HTML)],
        body.into(),
    )
        .into_response()
}

fn not_found_page() -> Response {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, TEXT_HTML)],
        "Not Found",
    )
        .into_response()
}

async fn submit_tx(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    if body.is_empty() {
        return error_response(SeedError::BadRequest("tx data can not be null".to_string()));
    }
    let tx: TxMeta = match serde_json::from_slice(&body) {
        Ok(tx) => tx,
        Err(e) => return error_response(SeedError::Json(e)),
    };
    if let Err(e) = save_submitted_tx(&state, &tx).await {
        return error_response(e);
    }
    // freshly accepted metadata is pushed to the federation
    if let Err(e) = state.tasks.register(&tx.id, TaskType::BroadcastMeta).await {
        return error_response(e);
    }
    StatusCode::OK.into_response()
}

/// Persists the metadata; an embedded data payload is chunked and
/// seeded in the same request.
async fn save_submitted_tx(state: &AppState, tx: &TxMeta) -> Result<(), SeedError> {
    state.store.save_tx_meta(tx).await?;
    if tx.data.is_empty() {
        return Ok(());
    }
    let data = b64_decode(&tx.data)?;
    if data.len().to_string() != tx.data_size {
        return Err(SeedError::BadRequest("data_size mismatch".to_string()));
    }
    let root = b64_encode(&permaseed_core::crypto::merkle::generate_data_root(&data));
    if root != tx.data_root {
        return Err(SeedError::BadRequest("data_root mismatch".to_string()));
    }
    for chunk in build_chunks(&tx.data_root, &data) {
        state.store.save_chunk(&chunk).await?;
    }
    Ok(())
}

async fn submit_chunk(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    if body.is_empty() {
        return error_response(SeedError::BadRequest(
            "chunk data can not be null".to_string(),
        ));
    }
    let chunk: Chunk = match serde_json::from_slice(&body) {
        Ok(chunk) => chunk,
        Err(e) => return error_response(SeedError::Json(e)),
    };
    match state.store.save_chunk(&chunk).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_tx(
    State(state): State<Arc<AppState>>,
    Path(arid): Path<String>,
    req: Request,
) -> Response {
    match state.store.load_tx_meta(&arid).await {
        Ok(tx) => Json(tx).into_response(),
        Err(SeedError::NotExist) => proxy_request(&state, req).await,
        Err(e) => error_response(e),
    }
}

async fn get_tx_offset(State(state): State<Arc<AppState>>, Path(arid): Path<String>) -> Response {
    match state.store.load_tx_offset(&arid).await {
        Ok(offset) => Json(offset).into_response(),
        Err(SeedError::NotExist) => not_found_page(),
        Err(e) => error_response(e),
    }
}

async fn get_tx_field(
    State(state): State<Arc<AppState>>,
    Path((arid, field)): Path<(String, String)>,
) -> Response {
    let tx = match state.store.load_tx_meta(&arid).await {
        Ok(tx) => tx,
        Err(SeedError::NotExist) => {
            return (StatusCode::NOT_FOUND, Json("not found")).into_response()
        }
        Err(e) => return error_response(e),
    };

    match field.as_str() {
        "id" => html_text(tx.id),
        "last_tx" => html_text(tx.last_tx),
        "owner" => html_text(tx.owner),
        "tags" => Json(tx.tags).into_response(),
        "target" => html_text(tx.target),
        "quantity" => html_text(tx.quantity),
        "data_root" => html_text(tx.data_root),
        "data_size" => html_text(tx.data_size),
        "reward" => html_text(tx.reward),
        "signature" => html_text(tx.signature),
        "data" => match state.store.load_tx_data(&tx.data_root, &tx.data_size).await {
            Ok(data) => html_text(b64_encode(&data)),
            Err(e) => error_response(e),
        },
        "data.json" | "data.txt" | "data.pdf" | "data.png" | "data.jpeg" | "data.gif"
        | "data.mp4" => {
            let data = match state.store.load_tx_data(&tx.data_root, &tx.data_size).await {
                Ok(data) => data,
                Err(e) => return error_response(e),
            };
            let ext = field.split('.').nth(1).unwrap_or_default();
            let content_type = match field.as_str() {
                "data.json" | "data.txt" | "data.pdf" => format!("application/{ext}; charset=utf-8"),
                "data.png" | "data.jpeg" | "data.gif" => format!("image/{ext}; charset=utf-8"),
                // legacy MIME kept bit-exact for downstream compatibility
                _ => "video/mpeg4; charset=utf-8".to_string(),
            };
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, content_type)],
                data,
            )
                .into_response()
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "invalid_field"})),
        )
            .into_response(),
    }
}

async fn get_chunk(State(state): State<Arc<AppState>>, Path(offset): Path<String>) -> Response {
    let offset: u64 = match offset.parse() {
        Ok(offset) => offset,
        Err(_) => return error_response(SeedError::BadRequest("invalid offset".to_string())),
    };
    match state.store.load_chunk(offset).await {
        Ok(chunk) => Json(chunk).into_response(),
        Err(SeedError::NotExist) => not_found_page(),
        Err(e) => error_response(e),
    }
}

async fn get_info(State(state): State<Arc<AppState>>) -> Response {
    Json(state.cache.snapshot().info.clone()).into_response()
}

async fn get_anchor(State(state): State<Arc<AppState>>) -> Response {
    html_text(state.cache.anchor())
}

async fn get_price(State(state): State<Arc<AppState>>, Path(size): Path<String>) -> Response {
    let size: u64 = match size.parse() {
        Ok(size) => size,
        Err(_) => return error_response(SeedError::BadRequest("invalid size".to_string())),
    };
    // plain decimal text, no units
    html_text(state.cache.fee().price(size).to_string())
}

async fn get_peers(State(state): State<Arc<AppState>>) -> Response {
    Json(state.cache.peers()).into_response()
}

fn parse_task_params(tktype: &str, arid: &str) -> Result<TaskType, SeedError> {
    let tk_type = TaskType::parse(tktype)
        .ok_or_else(|| SeedError::BadRequest("tktype not exist".to_string()))?;
    if !is_ar_id(arid) {
        return Err(SeedError::BadRequest("arId incorrect".to_string()));
    }
    Ok(tk_type)
}

async fn post_task(
    State(state): State<Arc<AppState>>,
    Path((tktype, arid)): Path<(String, String)>,
) -> Response {
    let tk_type = match parse_task_params(&tktype, &arid) {
        Ok(tk_type) => tk_type,
        Err(e) => return error_response(e),
    };
    match state.tasks.register(&arid, tk_type).await {
        Ok(()) => Json("ok").into_response(),
        Err(e) => error_response(e),
    }
}

async fn kill_task(
    State(state): State<Arc<AppState>>,
    Path((tktype, arid)): Path<(String, String)>,
) -> Response {
    let tk_type = match parse_task_params(&tktype, &arid) {
        Ok(tk_type) => tk_type,
        Err(e) => return error_response(e),
    };
    match state.tasks.kill(&arid, tk_type).await {
        Ok(()) => Json("ok").into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path((tktype, arid)): Path<(String, String)>,
) -> Response {
    let tk_type = match parse_task_params(&tktype, &arid) {
        Ok(tk_type) => tk_type,
        Err(e) => return error_response(e),
    };
    match state.tasks.get(&arid, tk_type).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_cache_tasks(State(state): State<Arc<AppState>>) -> Response {
    let tasks = state.tasks.cached_tasks();
    Json(serde_json::json!({
        "total": tasks.len(),
        "tasks": tasks,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct SubmitItemQuery {
    #[serde(default)]
    sort: bool,
}

async fn submit_item(
    State(state): State<Arc<AppState>>,
    Path(currency): Path<String>,
    Query(query): Query<SubmitItemQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != "application/octet-stream" {
        return error_response(SeedError::BadRequest("Wrong body type".to_string()));
    }
    if body.is_empty() {
        return error_response(SeedError::BadRequest(
            "can not submit null bundle item".to_string(),
        ));
    }
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match state
        .bundler
        .process_submit(body.to_vec(), &currency, api_key, query.sort)
        .await
    {
        Ok(order) => Json(RespOrder {
            item_id: order.item_id,
            bundler: state.bundler.bundler_address().to_string(),
            currency: order.currency,
            decimals: order.decimals,
            fee: order.fee,
            payment_expired_time: order.payment_expired_time,
            expected_block: order.expected_block,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_item_meta(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.load_item_meta(&id).await {
        Ok(meta) => Json(meta).into_response(),
        Err(e) => error_response(e),
    }
}

async fn bundle_fee(
    State(state): State<Arc<AppState>>,
    Path((size, currency)): Path<(String, String)>,
) -> Response {
    let size: u64 = match size.parse() {
        Ok(size) => size,
        Err(_) => return error_response(SeedError::BadRequest("invalid size".to_string())),
    };
    match state.fee.quote(&currency, size) {
        Ok(fee) => Json(fee).into_response(),
        Err(e) => error_response(e),
    }
}

async fn bundle_fees(State(state): State<Arc<AppState>>) -> Response {
    Json(state.fee.fees()).into_response()
}

/// Catch-all read: arId data, else bundle item data, else upstream.
async fn get_data_by_id(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    req: Request,
) -> Response {
    match state.store.load_tx_meta(&id).await {
        Ok(tx) => {
            let data = match state.store.load_tx_data(&tx.data_root, &tx.data_size).await {
                Ok(data) => data,
                Err(e) => return error_response(e),
            };
            let content_type = tx
                .decoded_tag("Content-Type")
                .unwrap_or_else(|| "text/html".to_string());
            return (
                StatusCode::OK,
                [(header::CONTENT_TYPE, format!("{content_type}; charset=utf-8"))],
                data,
            )
                .into_response();
        }
        Err(SeedError::NotExist) => {}
        Err(e) => return error_response(e),
    }

    match state.store.load_item_binary(&id).await {
        Ok(binary) => {
            let item = match permaseed_core::bundle::decode_data_item(&binary) {
                Ok(item) => item,
                Err(e) => return error_response(e),
            };
            let data = match b64_decode(&item.data) {
                Ok(data) => data,
                Err(e) => return error_response(e),
            };
            let content_type = item
                .tag_value("Content-Type")
                .unwrap_or("text/html")
                .to_string();
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, format!("{content_type}; charset=utf-8"))],
                data,
            )
                .into_response()
        }
        Err(SeedError::NotExist) => proxy_request(&state, req).await,
        Err(e) => error_response(e),
    }
}

async fn proxy_upstream(State(state): State<Arc<AppState>>, req: Request) -> Response {
    proxy_request(&state, req).await
}

/// Forwards the request verbatim to the upstream gateway, preserving
/// method, path, query, status and content type.
async fn proxy_request(state: &AppState, req: Request) -> Response {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let url = format!("{}{}", state.upstream, path_and_query);
    let method = match reqwest::Method::from_bytes(req.method().as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return StatusCode::BAD_GATEWAY.into_response(),
    };
    let body = match axum::body::to_bytes(req.into_body(), ALLOW_MAX_ITEM_SIZE + 4096).await {
        Ok(body) => body,
        Err(_) => return StatusCode::BAD_GATEWAY.into_response(),
    };

    let upstream_response = match state
        .proxy_client
        .request(method, &url)
        .body(body.to_vec())
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("upstream proxy to {url} failed: {e}");
            return (StatusCode::BAD_GATEWAY, "upstream unreachable").into_response();
        }
    };

    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream_response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = match upstream_response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => return (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    };

    match content_type {
        Some(content_type) => (
            status,
            [(header::CONTENT_TYPE, content_type)],
            bytes.to_vec(),
        )
            .into_response(),
        None => (status, bytes.to_vec()).into_response(),
    }
}
