use crate::{error::AppError, state::AppState};
use axum::{
    body::Body,
    extract::{Path as UrlPath, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::path::{Component, Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

const STREAM_CHUNK_SIZE: usize = 64 * 1024;

pub async fn root_handler() -> &'static str {
    "lowKey-Stream Server"
}

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let tunnel = state.tunnel.borrow().clone();
    Json(serde_json::json!({
        "status": "ok",
        "tunnel": {
            "connected": tunnel.healthy,
            "url": tunnel.url,
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Serialize the latest completed catalog snapshot. Never blocks on a scan in
/// progress; an ongoing rescan publishes its result only when finished.
pub async fn list_videos(State(state): State<AppState>) -> impl IntoResponse {
    let catalog = state.catalog().await;
    Json(serde_json::json!({
        "videos": &catalog.videos,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "server_status": "online",
    }))
}

/// Serve a video file with HTTP range support for seeking.
pub async fn stream_video(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let catalog = state.catalog().await;
    let entry = catalog.get(&path).ok_or(AppError::NotFound)?;
    let content_type = mime_for_extension(&entry.extension);

    let full_path = resolve_media_path(&state.config.media_dir, &path).await?;
    serve_file(&full_path, content_type, &headers).await
}

/// Serve a sidecar subtitle file. Full content only, no range handling.
pub async fn stream_subtitle(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
) -> Result<Response, AppError> {
    let ext = crate::config::extension_of(Path::new(&path)).ok_or(AppError::NotFound)?;
    if !state.extensions.is_subtitle(&ext) {
        return Err(AppError::NotFound);
    }

    let full_path = resolve_media_path(&state.config.media_dir, &path).await?;
    let file = File::open(&full_path).await?;
    let size = file.metadata().await?.len();
    let stream = ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, subtitle_content_type(&ext))
        .header(header::CONTENT_LENGTH, size)
        .body(Body::from_stream(stream))?)
}

/// Resolve a client-supplied relative path against the media root, rejecting
/// any form of directory traversal: decode (done by the router), normalize,
/// then verify the canonical result is still under the canonical root.
async fn resolve_media_path(media_dir: &Path, relative: &str) -> Result<PathBuf, AppError> {
    let candidate = Path::new(relative);
    for component in candidate.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(AppError::Forbidden),
        }
    }

    let root = tokio::fs::canonicalize(media_dir)
        .await
        .map_err(|_| AppError::NotFound)?;
    let full = tokio::fs::canonicalize(root.join(candidate))
        .await
        .map_err(|_| AppError::NotFound)?;

    if !full.starts_with(&root) {
        return Err(AppError::Forbidden);
    }
    if !full.is_file() {
        return Err(AppError::NotFound);
    }

    Ok(full)
}

async fn serve_file(
    path: &Path,
    content_type: &'static str,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let mut file = File::open(path).await?;
    let file_size = file.metadata().await?.len();

    let range = match headers.get(header::RANGE) {
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| AppError::RangeNotSatisfiable { file_size })?;
            debug!("Range request: {raw}");
            Some(parse_range_header(raw, file_size)
                .ok_or(AppError::RangeNotSatisfiable { file_size })?)
        }
        None => None,
    };

    match range {
        Some((start, end)) => {
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start)).await?;
            let stream = ReaderStream::with_capacity(file.take(length), STREAM_CHUNK_SIZE);

            Ok(Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{file_size}"),
                )
                .header(header::CONTENT_LENGTH, length)
                .body(Body::from_stream(stream))?)
        }
        None => {
            let stream = ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_LENGTH, file_size)
                .body(Body::from_stream(stream))?)
        }
    }
}

/// Parse a single-range HTTP `Range` header.
///
/// Supported forms (the first range only; multi-range is not supported):
/// - `bytes=0-499`
/// - `bytes=500-`   (from 500 to EOF)
/// - `bytes=-500`   (last 500 bytes)
///
/// Returns `None` for a malformed header or a start beyond EOF; the caller
/// maps that to 416 with `Content-Range: bytes */total`.
fn parse_range_header(header: &str, file_size: u64) -> Option<(u64, u64)> {
    let ranges = header.strip_prefix("bytes=")?;
    let first = ranges.split(',').next()?;

    let (start, end) = first.split_once('-')?;
    let start = start.trim();
    let end = end.trim();

    match (start.is_empty(), end.is_empty()) {
        // bytes=-500
        (true, false) => {
            let suffix_len: u64 = end.parse().ok()?;
            if suffix_len == 0 || file_size == 0 {
                return None;
            }
            let start = file_size.saturating_sub(suffix_len);
            Some((start, file_size - 1))
        }
        // bytes=500-
        (false, true) => {
            let start: u64 = start.parse().ok()?;
            if start >= file_size {
                return None;
            }
            Some((start, file_size - 1))
        }
        // bytes=0-499
        (false, false) => {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            if start >= file_size || start > end {
                return None;
            }
            Some((start, end.min(file_size - 1)))
        }
        (true, true) => None,
    }
}

fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        ".mp4" | ".m4v" => "video/mp4",
        ".webm" => "video/webm",
        ".mkv" => "video/x-matroska",
        ".avi" => "video/x-msvideo",
        ".mov" => "video/quicktime",
        ".mpg" | ".mpeg" => "video/mpeg",
        _ => "application/octet-stream",
    }
}

fn subtitle_content_type(ext: &str) -> &'static str {
    match ext {
        ".vtt" => "text/vtt; charset=utf-8",
        ".srt" => "application/x-subrip; charset=utf-8",
        _ => "text/plain; charset=utf-8",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_full_span() {
        assert_eq!(parse_range_header("bytes=0-499", 1000), Some((0, 499)));
    }

    #[test]
    fn range_open_end() {
        assert_eq!(parse_range_header("bytes=500-", 1000), Some((500, 999)));
    }

    #[test]
    fn range_suffix() {
        assert_eq!(parse_range_header("bytes=-200", 1000), Some((800, 999)));
        // Suffix longer than the file clamps to the whole file.
        assert_eq!(parse_range_header("bytes=-5000", 1000), Some((0, 999)));
    }

    #[test]
    fn range_end_clamped_to_eof() {
        assert_eq!(parse_range_header("bytes=0-2000", 1000), Some((0, 999)));
    }

    #[test]
    fn range_start_beyond_eof_unsatisfiable() {
        assert_eq!(parse_range_header("bytes=1000-", 1000), None);
        assert_eq!(parse_range_header("bytes=1500-1600", 1000), None);
    }

    #[test]
    fn range_malformed() {
        assert_eq!(parse_range_header("bytes=-", 1000), None);
        assert_eq!(parse_range_header("bytes=abc-def", 1000), None);
        assert_eq!(parse_range_header("items=0-10", 1000), None);
        assert_eq!(parse_range_header("bytes=5-2", 1000), None);
    }

    #[test]
    fn range_only_first_of_multiple() {
        assert_eq!(parse_range_header("bytes=0-1,5-9", 1000), Some((0, 1)));
    }

    #[test]
    fn mime_types() {
        assert_eq!(mime_for_extension(".mp4"), "video/mp4");
        assert_eq!(mime_for_extension(".mkv"), "video/x-matroska");
        assert_eq!(mime_for_extension(".xyz"), "application/octet-stream");
        assert_eq!(subtitle_content_type(".vtt"), "text/vtt; charset=utf-8");
    }

    #[tokio::test]
    async fn resolve_rejects_traversal_components() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_media_path(dir.path(), "../etc/passwd")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden));

        let err = resolve_media_path(dir.path(), "/etc/passwd").await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden));
    }

    #[tokio::test]
    async fn resolve_accepts_nested_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.mp4"), b"x").unwrap();

        let resolved = resolve_media_path(dir.path(), "sub/a.mp4").await.unwrap();
        assert!(resolved.ends_with("sub/a.mp4"));
    }

    #[tokio::test]
    async fn resolve_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_media_path(dir.path(), "missing.mp4").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }
}
