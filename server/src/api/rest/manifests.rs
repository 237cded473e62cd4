//! Manifest routes
//!
//! Serves resolved manifests wrapped in the v2 envelope with an integrity
//! block clients use to detect manifest drift.

use crate::api::AppState;
use crate::manifest::{Manifest, ManifestOrigin};
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::AppError;

pub const SCHEMA_VERSION: u32 = 2;
pub const DEFAULT_CHANNEL: &str = "stable";

// ============================================================================
// ROUTES
// ============================================================================

pub fn manifest_routes() -> Router<AppState> {
    Router::new().route("/manifests/v2/:slug", get(get_manifest))
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Deserialize)]
struct ManifestQuery {
    version: Option<String>,
    channel: Option<String>,
}

#[derive(Serialize)]
struct Integrity {
    algorithm: &'static str,
    canonical_hash: String,
}

#[derive(Serialize)]
struct ManifestEnvelope<'a> {
    schema_version: u32,
    slug: String,
    channel: String,
    version: String,
    origin: ManifestOrigin,
    generated_at: DateTime<Utc>,
    integrity: Integrity,
    manifest: &'a Manifest,
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn get_manifest(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<ManifestQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let resolved = state.manifests.resolve(&slug, query.version.as_deref()).await?;
    let manifest = &resolved.manifest;
    let canonical_hash = manifest
        .canonical_hash()
        .map_err(|e| AppError::Internal(format!("canonical manifest encoding failed: {e}")))?;

    let envelope = ManifestEnvelope {
        schema_version: SCHEMA_VERSION,
        slug: manifest.slug.clone(),
        channel: query.channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
        version: manifest.version.clone(),
        origin: resolved.origin,
        generated_at: Utc::now(),
        integrity: Integrity {
            algorithm: "SHA-256",
            canonical_hash,
        },
        manifest,
    };
    let body = serde_json::to_value(envelope)
        .map_err(|e| AppError::Internal(format!("manifest encoding failed: {e}")))?;
    Ok(Json(body))
}
