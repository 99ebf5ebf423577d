use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_config::RelayConfig;
use relay_core::{ChatFailure, ChatRequest, ErrorKind, HealthStatus, RelayError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::relay::RelayProxy;
use crate::upstream::HttpUpstream;

const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(86400);

/// A relay failure on its way out as a JSON failure body.
#[derive(Debug)]
pub struct ApiError(pub RelayError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized
            | ErrorKind::RateLimited
            | ErrorKind::UpstreamRejectedRequest
            | ErrorKind::UpstreamError => self
                .0
                .upstream_status()
                .and_then(|status| StatusCode::from_u16(status).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            ErrorKind::TransportError => StatusCode::BAD_GATEWAY,
            ErrorKind::AlreadyInFlight => StatusCode::CONFLICT,
            ErrorKind::UnknownConversation => StatusCode::NOT_FOUND,
            ErrorKind::MalformedUpstreamResponse | ErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self.0.kind() {
            ErrorKind::Internal => error!("internal error: {}", self.0),
            _ if status.is_server_error() => warn!("relay failed with {}: {}", status, self.0),
            _ => {}
        }
        (status, Json(ChatFailure::from(&self.0))).into_response()
    }
}

/// Routes of the relay: `/chat` (POST, OPTIONS, GET) and `/health`.
pub fn router(proxy: Arc<RelayProxy>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS, Method::GET])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(PREFLIGHT_MAX_AGE);

    Router::new()
        .route(
            "/chat",
            post(chat)
                .get(health)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(proxy)
}

/// Binds the configured address and serves until ctrl-c.
pub async fn serve(config: &RelayConfig) -> Result<()> {
    let settings = config.proxy.clone();
    let api_key = settings.resolve_api_key()?;
    let upstream = HttpUpstream::new(&settings, api_key)?;
    info!("Relaying to {} (default model {})", upstream.url(), settings.default_model);

    let listener = TcpListener::bind(settings.bind.as_str()).await?;
    let addr = listener.local_addr()?;
    let proxy = Arc::new(RelayProxy::new(Arc::new(upstream), settings));

    info!("Relay proxy listening on http://{}", addr);
    axum::serve(listener, router(proxy))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Relay proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn chat(State(proxy): State<Arc<RelayProxy>>, body: Bytes) -> Response {
    let started = Instant::now();

    // Parsed by hand so malformed bodies get the failure contract instead of axum's rejection.
    let result = match serde_json::from_slice::<ChatRequest>(&body) {
        Ok(request) => proxy.relay(request).await,
        Err(e) => Err(RelayError::InvalidRequest(format!("Invalid request body: {}", e))),
    };

    let mut response = match result {
        Ok(success) => (StatusCode::OK, Json(success)).into_response(),
        Err(err) => ApiError(err).into_response(),
    };

    let elapsed = format!("{}ms", started.elapsed().as_millis());
    if let Ok(value) = HeaderValue::from_str(&elapsed) {
        response.headers_mut().insert("x-response-time", value);
    }
    response
}

async fn health(State(proxy): State<Arc<RelayProxy>>) -> Json<HealthStatus> {
    let settings = proxy.settings();
    Json(HealthStatus::online(
        settings.service_name.clone(),
        settings.service_version.clone(),
    ))
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn method_not_allowed() -> Response {
    let failure = ChatFailure {
        success: false,
        error: "Method not allowed".to_string(),
        status: None,
        kind: Some(ErrorKind::InvalidRequest),
    };
    (StatusCode::METHOD_NOT_ALLOWED, Json(failure)).into_response()
}
