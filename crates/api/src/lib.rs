//! HTTP admin surface.
//!
//! Maps the orchestrator's request/response types 1:1 to JSON:
//! `POST /keygen`, `POST /keysign`, plus `GET /p2pid` and `GET /status` for
//! operators. A session that fails with blame is still a successful HTTP
//! exchange; only storage failures and invariant violations become error
//! statuses.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{error, info};

use tss_engine::{
    EngineError, KeygenRequest, KeygenResponse, KeysignRequest, KeysignResponse, TssServer,
};
use tss_network::Messenger;

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidRequest(_)
            | EngineError::NotEnoughSigners { .. }
            | EngineError::NotInParty => StatusCode::BAD_REQUEST,
            EngineError::SignatureNotObtained(_) => StatusCode::REQUEST_TIMEOUT,
            EngineError::Storage(_)
            | EngineError::Cancelled
            | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!("request failed: {}", self.0);
        (status, self.0.to_string()).into_response()
    }
}

pub fn router<M: Messenger>(server: Arc<TssServer<M>>) -> Router {
    Router::new()
        .route("/keygen", post(keygen::<M>))
        .route("/keysign", post(keysign::<M>))
        .route("/p2pid", get(p2pid::<M>))
        .route("/status", get(status::<M>))
        .with_state(server)
}

async fn keygen<M: Messenger>(
    State(server): State<Arc<TssServer<M>>>,
    Json(req): Json<KeygenRequest>,
) -> Result<Json<KeygenResponse>, ApiError> {
    let resp = server.keygen(req).await?;
    Ok(Json(resp))
}

async fn keysign<M: Messenger>(
    State(server): State<Arc<TssServer<M>>>,
    Json(req): Json<KeysignRequest>,
) -> Result<Json<KeysignResponse>, ApiError> {
    let resp = server.keysign(req).await?;
    Ok(Json(resp))
}

async fn p2pid<M: Messenger>(State(server): State<Arc<TssServer<M>>>) -> String {
    server.local_peer_id().to_base58()
}

async fn status<M: Messenger>(
    State(server): State<Arc<TssServer<M>>>,
) -> Json<tss_engine::server::StatusSnapshot> {
    Json(server.status())
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve<M: Messenger>(
    addr: String,
    server: Arc<TssServer<M>>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("http admin listening on {}", addr);
    axum::serve(listener, router(server))
        .with_graceful_shutdown(shutdown)
        .await
}
