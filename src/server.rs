use crate::config::AppConfig;
use crate::data::{self, DrawnShape};
use crate::error::{ExtractError, ProviderError};
use crate::geocoder::Place;
use crate::processing::{ExtractionPipeline, ExtractionReport, Progress, Session};
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

pub const SESSION_HEADER: &str = "x-session-id";
const DEFAULT_SESSION: &str = "default";

pub struct AppState {
    pub config: AppConfig,
    pub pipeline: Arc<ExtractionPipeline>,
    sessions: Mutex<HashMap<String, SessionSlot>>,
}

struct SessionSlot {
    session: Arc<Mutex<Session>>,
    last_used: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: ExtractionPipeline) -> Self {
        Self {
            config,
            pipeline: Arc::new(pipeline),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Each session id gets its own quota window and cache. Sessions idle for
    /// longer than the cache window are dropped unless a run still holds them.
    fn session(&self, id: &str) -> Result<Arc<Mutex<Session>>, ApiError> {
        let now = self.pipeline.now();
        let idle_limit = Duration::hours(i64::from(self.config.cache.duration_hours));
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| ApiError::Internal("session table lock poisoned".into()))?;

        let before = sessions.len();
        sessions.retain(|_, slot| now - slot.last_used <= idle_limit || Arc::strong_count(&slot.session) > 1);
        if sessions.len() < before {
            info!(dropped = before - sessions.len(), "dropped idle sessions");
        }

        let slot = sessions.entry(id.to_string()).or_insert_with(|| {
            info!(session = id, "new session");
            SessionSlot {
                session: Arc::new(Mutex::new(Session::new(&self.config, now))),
                last_used: now,
            }
        });
        slot.last_used = now;
        Ok(slot.session.clone())
    }
}

#[derive(Deserialize)]
pub struct ExtractRequest {
    shape: DrawnShape,
    spacing: Option<f64>,
}

#[derive(Deserialize)]
pub struct SearchParams {
    q: String,
}

#[derive(Debug)]
pub enum ApiError {
    Rejected(ExtractError),
    Provider(ProviderError),
    Internal(String),
}

impl From<ExtractError> for ApiError {
    fn from(err: ExtractError) -> Self {
        Self::Rejected(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Rejected(err) if err.is_quota() => (StatusCode::TOO_MANY_REQUESTS, err.to_string()),
            Self::Rejected(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            Self::Provider(err) => (StatusCode::BAD_GATEWAY, err.to_string()),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let static_dir = state.config.server.static_dir.clone();

    let app = Router::new()
        .route("/api/health", get(|| async { "ok" }))
        .route("/api/extract", post(extract_handler))
        .route("/api/search", get(search_handler));

    let app = match static_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app,
    };

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(config: AppConfig, pipeline: ExtractionPipeline) -> Result<()> {
    let port = config.server.port;
    let state = Arc::new(AppState::new(config, pipeline));
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn extract_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ExtractRequest>,
) -> Result<Json<ExtractionReport>, ApiError> {
    let polygon = data::polygon_from_shape(&request.shape)?;
    let spacing = request.spacing.unwrap_or(state.config.grid.default_spacing);
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_SESSION)
        .to_string();
    let session = state.session(&session_id)?;
    let pipeline = state.pipeline.clone();

    // Geocoding blocks between provider calls; keep it off the async workers.
    let report = tokio::task::spawn_blocking(move || {
        let mut session = session
            .lock()
            .map_err(|_| ApiError::Internal("session lock poisoned".into()))?;
        let mut on_progress = |p: Progress| {
            debug!(session = %session_id, processed = p.processed, total = p.total, "progress");
            ControlFlow::Continue(())
        };
        pipeline
            .extract(&mut session, &polygon, spacing, &mut on_progress)
            .map_err(ApiError::from)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(report))
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Option<Place>>, ApiError> {
    let pipeline = state.pipeline.clone();
    let place = tokio::task::spawn_blocking(move || pipeline.client().search(&params.q))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::Provider)?;
    Ok(Json(place))
}
