//! Read-only JSON query API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Health check (returns version) |
//! | `GET` | `/api/reports/top-products?limit=` | Most frequent terms in message text |
//! | `GET` | `/api/channels/{channel}/activity` | Daily message count and views for a channel |
//! | `GET` | `/api/search/messages?query=&limit=` | Keyword search, newest first |
//! | `GET` | `/api/reports/visual-content` | Image category histogram |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "channel not found: @ghost" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! The capability set is checked per request, so tables created by a
//! pipeline run while the server is up are picked up without a restart.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::{ApiConfig, Config};
use crate::db;
use crate::query::{self, Capabilities, CategoryStat, DailyActivity, MessageHit, QueryError, TermCount};

#[derive(Clone)]
struct AppState {
    pool: SqlitePool,
    api: Arc<ApiConfig>,
}

/// Bind to `[server].bind` and serve until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let app = router(pool, config.api.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "query API listening");
    println!("Query API listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the API router over an open warehouse pool.
pub fn router(pool: SqlitePool, api: ApiConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/reports/top-products", get(handle_top_products))
        .route("/api/channels/{channel}/activity", get(handle_channel_activity))
        .route("/api/search/messages", get(handle_search))
        .route("/api/reports/visual-content", get(handle_visual_content))
        .layer(cors)
        .with_state(AppState {
            pool,
            api: Arc::new(api),
        })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<QueryError> for AppError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::NotFound(msg) => not_found(msg),
            QueryError::InvalidInput(msg) => bad_request(msg),
            QueryError::Database(e) => {
                error!(error = %e, "query failed");
                internal("database error")
            }
        }
    }
}

async fn capabilities(state: &AppState) -> Result<Capabilities, AppError> {
    Ok(Capabilities::detect(&state.pool).await?)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /api/reports/top-products ============

#[derive(Deserialize)]
struct LimitParams {
    limit: Option<i64>,
}

async fn handle_top_products(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<TermCount>>, AppError> {
    let limit = params.limit.unwrap_or(state.api.default_top_limit);
    let caps = capabilities(&state).await?;
    Ok(Json(query::top_terms(&state.pool, caps, limit).await?))
}

// ============ GET /api/channels/{channel}/activity ============

async fn handle_channel_activity(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> Result<Json<Vec<DailyActivity>>, AppError> {
    let caps = capabilities(&state).await?;
    Ok(Json(query::channel_activity(&state.pool, caps, &channel).await?))
}

// ============ GET /api/search/messages ============

#[derive(Deserialize)]
struct SearchParams {
    query: Option<String>,
    limit: Option<i64>,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<MessageHit>>, AppError> {
    let keyword = params
        .query
        .ok_or_else(|| bad_request("query parameter is required"))?;
    let max = state.api.max_search_results;
    let limit = params.limit.unwrap_or(max).min(max);
    let caps = capabilities(&state).await?;
    Ok(Json(query::search_messages(&state.pool, caps, &keyword, limit).await?))
}

// ============ GET /api/reports/visual-content ============

async fn handle_visual_content(
    State(state): State<AppState>,
) -> Result<Json<Vec<CategoryStat>>, AppError> {
    let caps = capabilities(&state).await?;
    Ok(Json(query::visual_content(&state.pool, caps).await?))
}
