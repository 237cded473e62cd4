//! REST API module
//!
//! Per-domain route modules merged into one router.

mod admin;
mod cdn;
mod error;
mod manifests;
mod self_heal;
mod sessions;

use crate::api::AppState;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::Router;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

pub use admin::admin_routes;
pub use cdn::cdn_routes;
pub use error::AppError;
pub use manifests::manifest_routes;
pub use self_heal::self_heal_routes;
pub use sessions::session_routes;

/// Routes with state applied, without the transport layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(manifest_routes())
        .merge(cdn_routes())
        .merge(self_heal_routes())
        .merge(session_routes())
        .merge(admin_routes())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    // CORS: Read allowed origins from CORS_ORIGINS env var (comma-separated)
    let cors_origins: Vec<HeaderValue> = std::env::var("CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    tracing::info!("CORS allowed origins: {:?}", cors_origins);

    let cors = CorsLayer::new()
        .allow_origin(cors_origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::RANGE])
        .expose_headers(vec![header::HeaderName::from_static("x-request-id")]);

    // Inline manifests in scan/repair bodies can be large
    let body_limit = DefaultBodyLimit::max(64 * 1024 * 1024);

    let x_request_id = header::HeaderName::from_static("x-request-id");

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().include_headers(true).level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let app = router(state)
        .layer(cors)
        .layer(body_limit)
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .layer(trace_layer);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("REST API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::api::AppState;
    use crate::config::Config;
    use crate::delivery::ChunkFetcher;
    use crate::manifest::ManifestService;
    use crate::storage::fast_hash::NativeHasher;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use std::path::Path;
    use std::sync::Arc;
    use tower::ServiceExt;

    /// State over `source_root` with no disk cache and small chunks.
    pub fn state(source_root: &Path) -> AppState {
        build_state(Some(source_root))
    }

    /// State with no content source, so unknown games get synthetic manifests.
    pub fn synthetic_state() -> AppState {
        build_state(None)
    }

    fn build_state(source_root: Option<&Path>) -> AppState {
        let root = source_root.map(|p| p.to_string_lossy().to_string());
        let config = Config::from_lookup(|key| match key {
            "SOURCE_ROOT" => root.clone(),
            "MANIFEST_CACHE_DIR" => Some("off".into()),
            "CHUNK_SIZE" => Some("1024".into()),
            "PRIMARY_CDN_URL" => Some("http://cdn.test".into()),
            "PREWARM" => Some("false".into()),
            _ => None,
        })
        .unwrap();
        let manifests = Arc::new(ManifestService::from_config(&config).unwrap());
        let fetcher = ChunkFetcher::from_config(&config);
        AppState::new(config, manifests, fetcher, Arc::new(NativeHasher))
    }

    pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    pub async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::get(uri).body(Body::empty()).unwrap();
        let (status, body) = send(app, request).await;
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    pub async fn send_json(
        app: &Router,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, body) = send(app, request).await;
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }
}
