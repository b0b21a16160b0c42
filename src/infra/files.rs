//! Directory-backed route served behind the response cache.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{
        HeaderValue, Method, StatusCode, Uri,
        header::{CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED},
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tracing::error;

const SOURCE: &str = "infra::files";
const INDEX_FILE: &str = "index.html";

#[derive(Debug, Error)]
pub enum FileError {
    #[error("invalid request path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A resolved file ready to be sent.
#[derive(Debug, Clone)]
pub struct ServedFile {
    pub path: PathBuf,
    pub contents: Bytes,
    pub modified: Option<std::time::SystemTime>,
}

/// Read-only view of a directory tree.
#[derive(Debug, Clone)]
pub struct FileRoot {
    root: Arc<PathBuf>,
}

impl FileRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the file a URI path points at; directories resolve to their `index.html`.
    pub async fn read(&self, request_path: &str) -> Result<ServedFile, FileError> {
        let mut path = self.resolve(request_path)?;
        let mut metadata = fs::metadata(&path).await?;
        if metadata.is_dir() {
            path.push(INDEX_FILE);
            metadata = fs::metadata(&path).await?;
        }

        let contents = fs::read(&path).await?;
        Ok(ServedFile {
            path,
            contents: Bytes::from(contents),
            modified: metadata.modified().ok(),
        })
    }

    fn resolve(&self, request_path: &str) -> Result<PathBuf, FileError> {
        let relative = Path::new(request_path.trim_start_matches('/'));
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
        {
            return Err(FileError::InvalidPath);
        }

        Ok(self.root.join(relative))
    }
}

/// Fallback handler serving `GET`/`HEAD` requests from the file root.
pub async fn serve_file(State(files): State<FileRoot>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    match files.read(uri.path()).await {
        Ok(file) => build_file_response(&file, method == Method::HEAD),
        Err(FileError::InvalidPath) => StatusCode::NOT_FOUND.into_response(),
        Err(FileError::Io(err))
            if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) =>
        {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(err) => {
            error!(
                target = SOURCE,
                path = %uri.path(),
                error = %err,
                "failed to read file"
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn build_file_response(file: &ServedFile, head_only: bool) -> Response {
    let body = if head_only {
        Body::empty()
    } else {
        Body::from(file.contents.clone())
    };
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    let mime = mime_guess::from_path(&file.path).first_or_octet_stream();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&file.contents.len().to_string()) {
        headers.insert(CONTENT_LENGTH, value);
    }
    if let Some(modified) = file.modified
        && let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified))
    {
        headers.insert(LAST_MODIFIED, value);
    }

    response
}
