//! CDN chunk routes
//!
//! Raw chunk bytes addressed by game, file id and chunk index. The optional
//! `build` query pins the manifest build the chunk URL was issued for.

use crate::api::AppState;
use crate::delivery::{chunk_range, ChunkPayload, FetchError};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use super::error::AppError;

// ============================================================================
// ROUTES
// ============================================================================

pub fn cdn_routes() -> Router<AppState> {
    Router::new().route("/cdn/chunks/:game_id/:file_id/:chunk_index", get(get_chunk))
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Deserialize)]
struct ChunkQuery {
    size: Option<u64>,
    build: Option<String>,
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn get_chunk(
    State(state): State<AppState>,
    Path((game_id, file_id, chunk_index)): Path<(String, String, u32)>,
    Query(query): Query<ChunkQuery>,
) -> Result<Response, AppError> {
    let resolved = state
        .manifests
        .locate_file(&game_id, &file_id, query.build.as_deref())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("unknown file {game_id}/{file_id}")))?;
    let file = resolved
        .manifest
        .find_by_file_id(&file_id)
        .ok_or_else(|| AppError::NotFound(format!("unknown file {game_id}/{file_id}")))?;

    let size = match query.size {
        Some(size) => size,
        None => file
            .chunk(chunk_index)
            .map(|c| c.size)
            .ok_or_else(|| FetchError::UnknownChunk(format!("{file_id}#{chunk_index}")))?,
    };
    let range = chunk_range(resolved.manifest.chunk_size, file, chunk_index, size)?;
    let payload = state.fetcher.fetch(&resolved, file, range).await?;

    let len = payload.len();
    let body = match payload {
        ChunkPayload::Local { file, len } => Body::from_stream(ReaderStream::new(file.take(len))),
        ChunkPayload::Memory(bytes) => Body::from(bytes),
    };
    tracing::debug!(game_id = %game_id, file_id = %file_id, chunk_index, len, "chunk served");

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        body,
    )
        .into_response())
}
