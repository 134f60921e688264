// SPDX-License-Identifier: MIT
//! Attachment blob store — `files/<id>.<ext>` plus a `.meta.json` sidecar.
//! Mail references attachments by id; blobs never travel inside mail files.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HiveError;
use crate::AppContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct UploadQuery {
    pub filename: String,
}

fn blob_name(id: &str, filename: &str) -> String {
    match std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
    {
        Some(ext) => format!("{id}.{ext}"),
        None => id.to_string(),
    }
}

/// files.upload — raw request body plus `?filename=`; the content type is
/// taken from the request header.
pub async fn upload(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<FileMeta>), HiveError> {
    if query.filename.is_empty() || query.filename.contains('/') {
        return Err(HiveError::Validation(format!(
            "invalid attachment filename '{}'",
            query.filename
        )));
    }
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let id = uuid::Uuid::new_v4().to_string();
    let meta = FileMeta {
        id: id.clone(),
        filename: query.filename.clone(),
        mime_type,
        size: body.len() as u64,
        uploaded_at: Utc::now(),
    };

    let dir = ctx.store.files_dir();
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(dir.join(blob_name(&id, &query.filename)), &body).await?;
    let meta_bytes = serde_json::to_vec_pretty(&meta)
        .map_err(|e| HiveError::Validation(format!("encode attachment meta: {e}")))?;
    tokio::fs::write(dir.join(format!("{id}.meta.json")), meta_bytes).await?;

    Ok((StatusCode::CREATED, Json(meta)))
}

async fn load_meta(ctx: &AppContext, id: &str) -> Result<FileMeta, HiveError> {
    let path = ctx.store.files_dir().join(format!("{id}.meta.json"));
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(HiveError::NotFound(id.to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| HiveError::Validation(format!("attachment meta unreadable: {e}")))
}

/// files.fetch — the blob bytes with their stored content type.
pub async fn fetch(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HiveError> {
    let meta = load_meta(&ctx, &id).await?;
    let blob = ctx.store.files_dir().join(blob_name(&id, &meta.filename));
    let bytes = match tokio::fs::read(&blob).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(HiveError::NotFound(id))
        }
        Err(e) => return Err(e.into()),
    };
    Ok((
        [
            (header::CONTENT_TYPE, meta.mime_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", meta.filename),
            ),
        ],
        bytes,
    ))
}

/// files.meta — the sidecar record alone.
pub async fn meta(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<FileMeta>, HiveError> {
    Ok(Json(load_meta(&ctx, &id).await?))
}
