use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};

const ERROR_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>500 Internal Server Error</title></head>
<body>
    <h1>Internal Server Error</h1>
    <p>The server encountered an internal error and was unable to complete your request.</p>
</body>
</html>
"#;

/// Anything that can go wrong while handling an upload.
///
/// Every variant renders the same generic 500 page; the cause only goes to the log.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("failed to read multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("failed to store upload: {0}")]
    Io(#[from] std::io::Error),

    #[error("captioning failed: {0:#}")]
    Caption(anyhow::Error),

    #[error("failed to render page: {0}")]
    Render(#[from] minijinja::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, Html(ERROR_PAGE)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
