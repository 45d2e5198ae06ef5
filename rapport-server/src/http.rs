//! Rapport HTTP REST API
//!
//! Axum-based HTTP server exposing event ingestion, relationship queries and
//! batch triggers. Runs alongside the Unix socket IPC server on port 8767
//! (configurable).
//!
//! Each endpoint has a thin axum handler that builds an IPC request and hands
//! it to an inner function, so the same dispatch path serves both surfaces.
//!
//! Endpoints:
//! - GET  /health
//! - GET  /version
//! - POST /events/message
//! - POST /events/reaction
//! - POST /members
//! - GET  /guilds/:guild/members/:user/relationships?limit=
//! - GET  /guilds/:guild/members/:user/context?limit=
//! - POST /guilds/:guild/members/:user/rollup
//! - GET  /guilds/:guild/pairs/:a/:b
//! - GET  /guilds/:guild/pairs/:a/:b/mutual
//! - GET  /guilds/:guild/pairs/:a/:b/analysis
//! - POST /guilds/:guild/rollup
//! - POST /guilds/:guild/backfill
//! - POST /guilds/:guild/maintain

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use rapport_core::ipc::RapportRequest;
use rapport_core::models::{IncomingMessage, IncomingReaction, Member};
use rapport_core::RapportError;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::engine::Engine;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub engine: Arc<Engine>,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/events/message", post(message_handler))
        .route("/events/reaction", post(reaction_handler))
        .route("/members", post(member_handler))
        .route(
            "/guilds/:guild/members/:user/relationships",
            get(relationships_handler),
        )
        .route("/guilds/:guild/members/:user/context", get(context_handler))
        .route(
            "/guilds/:guild/members/:user/rollup",
            post(member_rollup_handler),
        )
        .route("/guilds/:guild/pairs/:a/:b", get(pair_handler))
        .route("/guilds/:guild/pairs/:a/:b/mutual", get(mutual_handler))
        .route("/guilds/:guild/pairs/:a/:b/analysis", get(analysis_handler))
        .route("/guilds/:guild/rollup", post(guild_rollup_handler))
        .route("/guilds/:guild/backfill", post(backfill_handler))
        .route("/guilds/:guild/maintain", post(maintain_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    engine: Arc<Engine>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!(
        "{}:{}",
        engine.config().http.host,
        engine.config().http.port
    );
    let state = Arc::new(HttpState { engine });

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Rapport HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct LimitParams {
    pub limit: Option<u32>,
}

// ============================================================================
// Inner (directly testable) functions
// ============================================================================

/// Inner health check: store health plus socket path.
pub async fn health_inner(engine: &Engine) -> (StatusCode, serde_json::Value) {
    match engine.store().health().await {
        Ok(backend) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "postgresql": backend,
                "socket": engine.config().service.socket_path,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

/// Inner version (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "rapport/1",
    })
}

/// Dispatch an IPC request and translate the result into an HTTP reply.
pub async fn dispatch_inner(
    engine: &Engine,
    request: RapportRequest,
) -> (StatusCode, serde_json::Value) {
    let start = Instant::now();
    let result = crate::router::dispatch(request, engine).await;
    let took_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(mut data) => {
            if let Some(obj) = data.as_object_mut() {
                obj.insert("took_ms".to_string(), serde_json::json!(took_ms));
            }
            (StatusCode::OK, data)
        }
        Err(e) => (
            error_status(&e),
            serde_json::json!({
                "error": e.to_string(),
                "status": "error",
            }),
        ),
    }
}

// ============================================================================
// Axum handler wrappers
// ============================================================================

type Reply = (StatusCode, Json<serde_json::Value>);

async fn dispatch(state: &HttpState, request: RapportRequest) -> Reply {
    let (status, body) = dispatch_inner(&state.engine, request).await;
    (status, Json(body))
}

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.engine).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn message_handler(
    State(state): State<Arc<HttpState>>,
    Json(message): Json<IncomingMessage>,
) -> impl IntoResponse {
    dispatch(&state, RapportRequest::RecordMessage { message }).await
}

pub async fn reaction_handler(
    State(state): State<Arc<HttpState>>,
    Json(reaction): Json<IncomingReaction>,
) -> impl IntoResponse {
    dispatch(&state, RapportRequest::RecordReaction { reaction }).await
}

pub async fn member_handler(
    State(state): State<Arc<HttpState>>,
    Json(member): Json<Member>,
) -> impl IntoResponse {
    dispatch(&state, RapportRequest::UpsertMember { member }).await
}

pub async fn relationships_handler(
    State(state): State<Arc<HttpState>>,
    Path((guild_id, user_id)): Path<(String, String)>,
    Query(params): Query<LimitParams>,
) -> impl IntoResponse {
    let request = RapportRequest::TopRelationships {
        guild_id,
        user_id,
        limit: params.limit,
    };
    dispatch(&state, request).await
}

pub async fn context_handler(
    State(state): State<Arc<HttpState>>,
    Path((guild_id, user_id)): Path<(String, String)>,
    Query(params): Query<LimitParams>,
) -> impl IntoResponse {
    let request = RapportRequest::RelationshipContext {
        guild_id,
        user_id,
        limit: params.limit,
    };
    dispatch(&state, request).await
}

pub async fn member_rollup_handler(
    State(state): State<Arc<HttpState>>,
    Path((guild_id, user_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let request = RapportRequest::Rollup {
        guild_id,
        user_id: Some(user_id),
    };
    dispatch(&state, request).await
}

pub async fn pair_handler(
    State(state): State<Arc<HttpState>>,
    Path((guild_id, user_a, user_b)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let request = RapportRequest::RelationshipBetween {
        guild_id,
        user_a,
        user_b,
    };
    dispatch(&state, request).await
}

pub async fn mutual_handler(
    State(state): State<Arc<HttpState>>,
    Path((guild_id, user_a, user_b)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let request = RapportRequest::MutualConnections {
        guild_id,
        user_a,
        user_b,
    };
    dispatch(&state, request).await
}

pub async fn analysis_handler(
    State(state): State<Arc<HttpState>>,
    Path((guild_id, user_a, user_b)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let request = RapportRequest::AnalyzeRelationship {
        guild_id,
        user_a,
        user_b,
    };
    dispatch(&state, request).await
}

pub async fn guild_rollup_handler(
    State(state): State<Arc<HttpState>>,
    Path(guild_id): Path<String>,
) -> impl IntoResponse {
    let request = RapportRequest::Rollup {
        guild_id,
        user_id: None,
    };
    dispatch(&state, request).await
}

pub async fn backfill_handler(
    State(state): State<Arc<HttpState>>,
    Path(guild_id): Path<String>,
) -> impl IntoResponse {
    dispatch(&state, RapportRequest::Backfill { guild_id }).await
}

pub async fn maintain_handler(
    State(state): State<Arc<HttpState>>,
    Path(guild_id): Path<String>,
) -> impl IntoResponse {
    dispatch(&state, RapportRequest::Maintain { guild_id }).await
}

// ============================================================================
// Helpers
// ============================================================================

/// Status code for an engine error.
fn error_status(err: &RapportError) -> StatusCode {
    match err {
        RapportError::InvalidPair(_) => StatusCode::BAD_REQUEST,
        RapportError::MemberNotFound { .. } => StatusCode::NOT_FOUND,
        RapportError::ConsolidationConflict(_) => StatusCode::CONFLICT,
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rapport_core::store::MemoryStore;
    use rapport_core::RapportConfig;

    fn engine() -> (Arc<MemoryStore>, Engine) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), Engine::new(store, RapportConfig::default()))
    }

    // ========================================================================
    // TEST 1: version_inner is pure and returns correct fields
    // ========================================================================
    #[test]
    fn test_version_inner_pure() {
        let v = version_inner();
        assert!(v["version"].is_string());
        assert_eq!(v["protocol"], "rapport/1");
    }

    // ========================================================================
    // TEST 2: a store outage during dispatch is 503
    // ========================================================================
    #[tokio::test]
    async fn test_dispatch_storage_outage() {
        let (store, engine) = engine();
        store.fail_next(1);
        let (status, body) = dispatch_inner(&engine, RapportRequest::Health).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().starts_with("Storage unavailable"));
    }

    // ========================================================================
    // TEST 3: error taxonomy maps onto status codes by variant
    // ========================================================================
    #[test]
    fn test_error_status_mapping() {
        let invalid = RapportError::InvalidPair("self-pair 1".into());
        assert_eq!(error_status(&invalid), StatusCode::BAD_REQUEST);

        let missing = RapportError::MemberNotFound {
            guild_id: "g".into(),
            user_id: "u".into(),
        };
        assert_eq!(error_status(&missing), StatusCode::NOT_FOUND);

        // Message text alone no longer decides the status
        let lookalike = RapportError::Ipc("Invalid pair of sockets".into());
        assert_eq!(error_status(&lookalike), StatusCode::INTERNAL_SERVER_ERROR);

        let fatal = RapportError::Serialization(serde_json::from_str::<u32>("x").unwrap_err());
        assert_eq!(error_status(&fatal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    // ========================================================================
    // TEST 4: health reports healthy, then 503 when the store fails
    // ========================================================================
    #[tokio::test]
    async fn test_health_inner() {
        let (store, engine) = engine();
        let (status, body) = health_inner(&engine).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["socket"], "/tmp/rapport.sock");

        store.fail_next(1);
        let (status, body) = health_inner(&engine).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
    }

    // ========================================================================
    // TEST 5: dispatch adds timing and maps errors
    // ========================================================================
    #[tokio::test]
    async fn test_dispatch_inner() {
        let (_store, engine) = engine();
        let (status, body) = dispatch_inner(&engine, RapportRequest::Ping).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["took_ms"].is_number());

        let (status, body) = dispatch_inner(
            &engine,
            RapportRequest::Rollup {
                guild_id: "g".into(),
                user_id: Some("ghost".into()),
            },
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "error");
    }
}
