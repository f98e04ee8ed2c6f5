use crate::state::SharedState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
};
use std::path::{Component, PathBuf};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

/// Streams a file from the media root by name.
///
/// This is the thin "file store" collaborator the dashboard uses to
/// preview uploaded videos; it never touches the session registry.
pub async fn serve_media_file(
    State(state): State<SharedState>,
    Path(file_name): Path<String>,
) -> Result<Response<Body>, (StatusCode, String)> {
    // 1. Reject anything that could escape the media root
    let relative = PathBuf::from(&file_name);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err((StatusCode::BAD_REQUEST, "Illegal file name".to_string()));
    }

    // 2. Construct the file path under the configured media root
    let mut file_path = PathBuf::from(&state.config.server.media_root);
    file_path.push(relative);

    // 3. Open the file for reading
    let file = File::open(&file_path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found".to_string()))?;

    // 4. Determine the Content-Type based on the file extension
    let content_type = mime_guess::from_path(&file_path)
        .first_or_octet_stream()
        .to_string();

    // Stream the file body instead of buffering it
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-store")
        .body(body)
        .unwrap())
}
