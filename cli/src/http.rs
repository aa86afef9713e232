//! HTTP read path: blocks and transactions as stored by the writer.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use chainsync_core::{BlockNumber, SyncConfig, SyncError};
use chainsync_pipeline::{BlockList, BlockQuery, BlockView, TransactionView};

use crate::bootstrap;

static REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

pub fn router(query: BlockQuery) -> Router {
    Router::new()
        .route("/api/v1/blocks", get(list_blocks))
        .route("/api/v1/blocks/:id", get(get_block))
        .route("/api/v1/transaction/:txhash", get(get_transaction))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id))
        .with_state(query)
}

pub async fn bind(config: &SyncConfig) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http.port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}

/// Serve `query` on `listener` until `shutdown` resolves.
pub async fn serve_on<F>(listener: TcpListener, query: BlockQuery, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, router(query))
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server exited unexpectedly")
}

/// Serve until a shutdown signal, then release storage and broker within `grace`.
pub async fn serve(config: &SyncConfig, grace: Duration) -> anyhow::Result<()> {
    let read_path = bootstrap::read_path(config).await?;
    let listener = bind(config).await?;
    serve_on(listener, read_path.query, crate::shutdown_signal()).await?;

    let released = tokio::time::timeout(grace, async {
        read_path.store.close().await?;
        read_path.broker.close().await
    })
    .await;
    match released {
        Ok(result) => result.context("failed to release resources")?,
        Err(_) => warn!(grace_secs = grace.as_secs(), "resources not released in time"),
    }
    info!("http server stopped");
    Ok(())
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{what} not found"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NotFound(what) => ApiError::not_found(what),
            other => {
                error!(error = %other, "read path failed");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

// ─── Middleware ───────────────────────────────────────────────────────────────

/// Echo the caller's `X-Request-Id`, or assign one.
async fn request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(&REQUEST_ID)
        .filter(|v| !v.is_empty())
        .cloned()
        .or_else(|| HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()).ok());

    if let Some(id) = &id {
        req.headers_mut().insert(REQUEST_ID.clone(), id.clone());
    }
    let mut response = next.run(req).await;
    if let Some(id) = id {
        response.headers_mut().insert(REQUEST_ID.clone(), id);
    }
    response
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<String>,
}

impl ListParams {
    /// A limit that is not a positive integer falls back to the default.
    fn limit(&self) -> Option<usize> {
        let raw = self.limit.as_deref()?;
        match raw.trim().parse::<usize>() {
            Ok(limit) if limit > 0 => Some(limit),
            _ => {
                warn!(limit = raw, "invalid limit, using default");
                None
            }
        }
    }
}

async fn list_blocks(
    State(query): State<BlockQuery>,
    Query(params): Query<ListParams>,
) -> Result<Json<BlockList>, ApiError> {
    let blocks = query.list_blocks(params.limit()).await?;
    Ok(Json(BlockList::from(blocks.as_slice())))
}

async fn get_block(
    State(query): State<BlockQuery>,
    Path(id): Path<String>,
) -> Result<Json<BlockView>, ApiError> {
    let number: BlockNumber = id.parse().map_err(|e: SyncError| {
        ApiError::new(StatusCode::BAD_REQUEST, format!("invalid block number {id}: {e}"))
    })?;
    let block = query
        .get_block(number)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("block {number}")))?;
    Ok(Json(BlockView::from(&block)))
}

async fn get_transaction(
    State(query): State<BlockQuery>,
    Path(tx_hash): Path<String>,
) -> Result<Json<TransactionView>, ApiError> {
    let tx = query
        .get_transaction(&tx_hash)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("transaction {tx_hash}")))?;
    Ok(Json(TransactionView::from(&tx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use serde_json::Value;
    use tower::ServiceExt;

    use chainsync_broker::MemoryBroker;
    use chainsync_core::{Block, BlockStore, MessageBroker, Reconciler, Transaction, TransactionLog};
    use chainsync_storage::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        broker: MemoryBroker,
        app: Router,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::with_schema());
        let broker = MemoryBroker::new();
        let shared: Arc<dyn MessageBroker> = Arc::new(broker.clone());
        let reconciler = Reconciler::new(shared, store.clone(), "requests", 20);
        let app = router(BlockQuery::new(store.clone(), reconciler, 10));
        Fixture { store, broker, app }
    }

    fn block(n: u64, is_stable: bool) -> Block {
        Block {
            block_number: BlockNumber::from(n),
            block_hash: format!("0xb{n}"),
            block_time: 1_600_000_000 + n,
            parent_hash: format!("0xb{}", n - 1),
            is_stable,
            transactions: vec![Transaction {
                tx_hash: format!("0xt{n}"),
                block_number: BlockNumber::from(n),
                from: "0xfrom".into(),
                to: Some("0xto".into()),
                nonce: 2,
                value: BlockNumber::from(1_000u64),
                data: vec![0xde, 0xad].into(),
                logs: vec![TransactionLog {
                    id: None,
                    tx_hash: format!("0xt{n}"),
                    index: 0,
                    data: vec![0x01].into(),
                }],
            }],
        }
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, Option<String>, Value) {
        let response = app
            .clone()
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let id = response
            .headers()
            .get("x-request-id")
            .map(|v| v.to_str().unwrap().to_string());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        // axum's own rejections are plain text
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, id, value)
    }

    #[tokio::test]
    async fn block_by_number() {
        let f = fixture();
        f.store.upsert_block(&block(7, true)).await.unwrap();

        let (status, _, body) = get(&f.app, "/api/v1/blocks/7").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["block_num"], 7);
        assert_eq!(body["block_hash"], "0xb7");
        assert_eq!(body["is_stable"], true);
        assert_eq!(body["transactions"], serde_json::json!(["0xt7"]));

        let (status, _, _) = get(&f.app, "/api/v1/blocks/0x7").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn bad_and_missing_block() {
        let f = fixture();
        let (status, _, body) = get(&f.app, "/api/v1/blocks/seven").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("seven"));

        let (status, _, _) = get(&f.app, "/api/v1/blocks/8").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_is_newest_first_and_limited() {
        let f = fixture();
        for n in 1..=3 {
            f.store.upsert_block(&block(n, false)).await.unwrap();
        }

        let (status, _, body) = get(&f.app, "/api/v1/blocks").await;
        assert_eq!(status, StatusCode::OK);
        let blocks = body["block"].as_array().unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0]["block_num"], 3);
        assert!(blocks[0].get("transactions").is_none());

        let (_, _, body) = get(&f.app, "/api/v1/blocks?limit=1").await;
        assert_eq!(body["block"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_limit_uses_default() {
        let f = fixture();
        for n in 1..=12 {
            f.store.upsert_block(&block(n, false)).await.unwrap();
        }

        for uri in [
            "/api/v1/blocks?limit=many",
            "/api/v1/blocks?limit=-3",
            "/api/v1/blocks?limit=0",
            "/api/v1/blocks?limit=",
        ] {
            let (status, _, body) = get(&f.app, uri).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(body["block"].as_array().unwrap().len(), 10, "{uri}");
        }

        let (_, _, body) = get(&f.app, "/api/v1/blocks?limit=12").await;
        assert_eq!(body["block"].as_array().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn transaction_with_logs() {
        let f = fixture();
        f.store.upsert_block(&block(4, true)).await.unwrap();

        let (status, _, body) = get(&f.app, "/api/v1/transaction/0xt4").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tx_hash"], "0xt4");
        assert_eq!(body["from"], "0xfrom");
        assert_eq!(body["nonce"], 2);
        assert_eq!(body["data"], "0xdead");
        assert_eq!(body["logs"][0]["index"], 0);
        assert_eq!(body["logs"][0]["data"], "0x01");

        let (status, _, _) = get(&f.app, "/api/v1/transaction/0xnone").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn old_unstable_block_is_recrawled_on_read() {
        let f = fixture();
        f.store
            .update_current_block_number(BlockNumber::from(1000u64), BlockNumber::from(1000u64))
            .await
            .unwrap();
        f.store.upsert_block(&block(975, false)).await.unwrap();

        let (status, _, body) = get(&f.app, "/api/v1/blocks/975").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_stable"], false);
        assert_eq!(f.broker.published("requests").len(), 1);
    }

    #[tokio::test]
    async fn request_id_is_echoed_or_assigned() {
        let f = fixture();
        let response = f
            .app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/blocks")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["x-request-id"], "abc-123");

        let (_, id, _) = get(&f.app, "/api/v1/blocks").await;
        assert_eq!(id.unwrap().len(), 36);
    }

    #[tokio::test]
    async fn storage_failure_is_internal_error() {
        let f = fixture();
        f.store.close().await.unwrap();
        let (status, _, body) = get(&f.app, "/api/v1/blocks/1").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "internal server error");
    }
}
