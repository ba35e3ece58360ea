use accounting::tasks;
use accounting::{AccountingError, Monitor, Report};
use axum::{
    Router,
    extract::{Json, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

pub struct ApiServer {
    monitor: Arc<Monitor>,
    addr: String,
    admin_token: Option<String>,
    storage_timeout: Duration,
}

#[derive(Clone)]
struct AppState {
    monitor: Arc<Monitor>,
    admin_token: Option<Arc<str>>,
    /// Upper bound on handler work that writes to disk.
    storage_timeout: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
struct SetLimitRequest {
    /// Bytes; `null` removes the limit
    #[serde(default)]
    limit: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GenericResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
}

impl ApiServer {
    pub fn new(
        monitor: Arc<Monitor>,
        addr: String,
        admin_token: Option<String>,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            monitor,
            addr,
            admin_token,
            storage_timeout,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        if self.admin_token.is_none() {
            warn!("No admin_token configured, mutating API routes are unauthenticated");
        }

        let app = router(AppState {
            monitor: self.monitor,
            admin_token: self.admin_token.map(Arc::from),
            storage_timeout: self.storage_timeout,
        });

        info!("Starting API server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/report", get(get_report))
        .route("/api/limit", put(set_limit))
        .route("/api/reset", post(reset_accounting))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.admin_token.as_deref() else {
        return true;
    };
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

fn unauthorized() -> (StatusCode, Json<GenericResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(GenericResponse {
            success: false,
            message: "Missing or invalid admin token".to_string(),
        }),
    )
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_report(State(state): State<AppState>) -> Result<Json<Report>, StatusCode> {
    let monitor = state.monitor.clone();
    match tokio::task::spawn_blocking(move || monitor.get_report()).await {
        Ok(report) => Ok(Json(report)),
        Err(e) => {
            error!("API: report task failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[instrument(skip(state, headers))]
async fn set_limit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SetLimitRequest>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        warn!("API: rejected unauthenticated limit change");
        return unauthorized();
    }
    info!("API: Set limit request {:?}", request.limit);

    match tasks::set_limit_with_timeout(state.monitor.clone(), request.limit, state.storage_timeout)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(GenericResponse {
                success: true,
                message: match request.limit {
                    Some(limit) => format!("Limit set to {} bytes", limit),
                    None => "Limit removed".to_string(),
                },
            }),
        ),
        Err(e @ AccountingError::InvalidLimit(_)) => (
            StatusCode::BAD_REQUEST,
            Json(GenericResponse {
                success: false,
                message: e.to_string(),
            }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(GenericResponse {
                success: false,
                message: format!("Failed to set limit: {}", e),
            }),
        ),
    }
}

#[instrument(skip(state, headers))]
async fn reset_accounting(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        warn!("API: rejected unauthenticated accounting reset");
        return unauthorized();
    }
    info!("API: Reset accounting request");

    match tasks::reset_with_timeout(state.monitor.clone(), state.storage_timeout).await {
        Ok(()) => (
            StatusCode::OK,
            Json(GenericResponse {
                success: true,
                message: "Accounting reset".to_string(),
            }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(GenericResponse {
                success: false,
                message: format!("Failed to reset accounting: {}", e),
            }),
        ),
    }
}
