//! HTTP server for exposing Prometheus metrics.
//!
//! This module provides an Axum-based HTTP server that serves the `/metrics`
//! endpoint for Prometheus scraping and a `/health` endpoint for health checks.
//! `/` and `/metrics` are protected with HTTP Basic authentication unless the
//! configuration sets `no_auth`.

use crate::collector::MetricsCollector;
use crate::config::HttpServerConfig;
use crate::error::{NakivoError, Result};
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::Engine;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Application name reported on `/`.
pub const APP_NAME: &str = "nakivo_prometheus_exporter";

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Credentials Prometheus must present.
#[derive(Clone)]
pub struct BasicCredentials {
    username: String,
    password: String,
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .field("password", &"***REDACTED***")
            .finish()
    }
}

impl BasicCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credentials required by the configuration, `None` when `no_auth` is set.
    pub fn from_config(config: &HttpServerConfig) -> Option<Self> {
        if config.no_auth {
            None
        } else {
            Some(Self::new(&config.username, &config.password))
        }
    }

    fn matches(&self, username: &str, password: &str) -> bool {
        // Both comparisons always run.
        let username_ok = constant_time_eq(self.username.as_bytes(), username.as_bytes());
        let password_ok = constant_time_eq(self.password.as_bytes(), password.as_bytes());
        username_ok & password_ok
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Decode an `Authorization: Basic ...` header value.
fn parse_basic_authorization(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Shared application state.
#[derive(Clone)]
struct AppState {
    metrics: Arc<MetricsCollector>,
    credentials: Option<Arc<BasicCredentials>>,
}

/// Build the exporter router.
pub fn build_router(metrics: MetricsCollector, credentials: Option<BasicCredentials>) -> Router {
    let state = AppState {
        metrics: Arc::new(metrics),
        credentials: credentials.map(Arc::new),
    };

    let protected = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/", get(root_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_basic_auth,
        ));

    Router::new()
        .merge(protected)
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
///
/// # Arguments
///
/// * `config` - HTTP server settings (listen address, credentials)
/// * `metrics` - Metrics collector instance
///
/// # Examples
///
/// ```no_run
/// use nakivo_exporter::collector::MetricsCollector;
/// use nakivo_exporter::config::Settings;
/// use nakivo_exporter::server::start_server;
///
/// #[tokio::main]
/// async fn main() {
///     let settings = Settings::load("nakivo_prometheus_exporter.yaml").unwrap();
///     let metrics = MetricsCollector::new(settings.nakivo_hosts, settings.collector);
///     start_server(&settings.http_server, metrics).await.unwrap();
/// }
/// ```
pub async fn start_server(config: &HttpServerConfig, metrics: MetricsCollector) -> Result<()> {
    let credentials = BasicCredentials::from_config(config);
    if credentials.is_none() {
        warn!("Running without HTTP authentication");
    } else {
        info!("Running with HTTP authentication");
    }

    let app = build_router(metrics, credentials);
    let listen_address = config.listen_address();

    info!("Starting HTTP server on {}", listen_address);

    let listener = TcpListener::bind(&listen_address).await?;

    axum::serve(listener, app)
        .await
        .map_err(|e| NakivoError::Server(e.to_string()))?;

    Ok(())
}

async fn require_basic_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = &state.credentials else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_basic_authorization)
        .is_some_and(|(username, password)| expected.matches(&username, &password));

    if authorized {
        next.run(request).await
    } else {
        warn!("Rejected request to {} with bad credentials", request.uri().path());
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic")],
            "Incorrect username or password",
        )
            .into_response()
    }
}

/// Handler for /metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    info!("Received metrics scrape request");

    // Broken hosts show up as error gauges; only encoding can fail here.
    match state.metrics.scrape().await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Handler for /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

/// Handler for root endpoint.
async fn root_handler() -> Response {
    (StatusCode::OK, Json(json!({ "app": APP_NAME }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_authorization() {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode("prometheus:s3cret:with:colons");
        assert_eq!(
            parse_basic_authorization(&format!("Basic {}", encoded)),
            Some(("prometheus".to_string(), "s3cret:with:colons".to_string()))
        );
        assert_eq!(parse_basic_authorization(&format!("Bearer {}", encoded)), None);
        assert_eq!(parse_basic_authorization("Basic !!!notbase64"), None);
        assert_eq!(parse_basic_authorization("Basic"), None);
    }

    #[test]
    fn test_credentials_match() {
        let credentials = BasicCredentials::new("prometheus", "secret");
        assert!(credentials.matches("prometheus", "secret"));
        assert!(!credentials.matches("prometheus", "secreT"));
        assert!(!credentials.matches("prometheu", "secret"));
        assert!(!credentials.matches("", ""));
    }

    #[test]
    fn test_credentials_from_config() {
        let mut config = HttpServerConfig::default();
        assert!(BasicCredentials::from_config(&config).is_some());
        config.no_auth = true;
        assert!(BasicCredentials::from_config(&config).is_none());
    }
}
