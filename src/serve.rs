//! Local static tile server for previewing an exploded tree.

use crate::error::{PipelineError, Result};
use crate::publish::ObjectHeaders;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Router serving files under `root` with tile headers and open CORS.
pub fn router(root: PathBuf) -> Router {
    Router::new()
        .route("/*path", get(serve_file))
        .with_state(Arc::new(root))
}

/// Serve `root` on `addr` until Ctrl-C.
pub async fn serve(root: PathBuf, addr: SocketAddr) -> Result<()> {
    if !root.is_dir() {
        return Err(PipelineError::io(
            &root,
            std::io::Error::new(std::io::ErrorKind::NotFound, "tile directory not found"),
        ));
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| PipelineError::io(&root, e))?;
    tracing::info!(
        "Serving {} at http://{}/{{z}}/{{x}}/{{y}}.pbf",
        root.display(),
        addr
    );

    axum::serve(listener, router(root.clone()).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down tile server");
        })
        .await
        .map_err(|e| PipelineError::io(&root, e))
}

async fn serve_file(State(root): State<Arc<PathBuf>>, UrlPath(path): UrlPath<String>) -> Response {
    file_response(&root, &path).await
}

/// Build the response for `rel` under `root`.
pub async fn file_response(root: &Path, rel: &str) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));

    let Some(path) = resolve_path(root, rel) else {
        return (StatusCode::NOT_FOUND, headers).into_response();
    };

    match tokio::fs::read(&path).await {
        Ok(data) => {
            let h = ObjectHeaders::for_path(&path);
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(h.content_type));
            if let Some(encoding) = h.content_encoding {
                headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding));
            }
            tracing::debug!("200 {}", rel);
            (StatusCode::OK, headers, data).into_response()
        }
        Err(e) => {
            tracing::debug!("404 {} ({})", rel, e);
            (StatusCode::NOT_FOUND, headers).into_response()
        }
    }
}

/// Map a request path onto `root`, refusing anything that escapes it.
fn resolve_path(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel.trim_start_matches('/'));
    let mut out = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (out != root).then_some(out)
}
