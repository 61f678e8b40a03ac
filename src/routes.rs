use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    response::Html,
    routing::get,
    Router,
};
use tower_http::services::ServeDir;
use tracing::{debug, info, instrument};

use crate::{
    caption::Captioner,
    error::{AppError, Result},
    page::{PageContext, PageRenderer},
};

const IMAGE_FIELD: &str = "image";

#[derive(Clone)]
pub struct AppState {
    pub captioner: Arc<dyn Captioner>,
    pub renderer: Arc<PageRenderer>,
    pub upload_dir: PathBuf,
}

impl AppState {
    pub fn new(
        captioner: Arc<dyn Captioner>,
        upload_dir: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            captioner,
            renderer: Arc::new(PageRenderer::new()?),
            upload_dir: upload_dir.into(),
        })
    }
}

/// `GET /` and `POST /` serve the page, `/uploads/*` serves stored files.
///
/// `max_upload_bytes` of `None` removes the request body limit.
pub fn router(state: AppState, max_upload_bytes: Option<usize>) -> Router {
    let body_limit = match max_upload_bytes {
        Some(limit) => DefaultBodyLimit::max(limit),
        None => DefaultBodyLimit::disable(),
    };

    Router::new()
        .route("/", get(index).post(upload))
        .nest_service("/uploads", ServeDir::new(&state.upload_dir))
        .layer(body_limit)
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> Result<Html<String>> {
    Ok(Html(state.renderer.render(&PageContext::default())?))
}

#[instrument(skip_all)]
async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Result<Html<String>> {
    let mut page = PageContext::default();

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let Some(filename) = field.file_name().and_then(stored_name) else {
            debug!("upload field has no usable filename");
            break;
        };
        let data = field.bytes().await?;

        let path = state.upload_dir.join(&filename);
        tokio::fs::write(&path, &data).await?;
        info!(file = %path.display(), bytes = data.len(), "saved upload");

        let caption = state
            .captioner
            .caption(&path)
            .await
            .map_err(AppError::Caption)?;
        info!(file = %filename, %caption, "captioned upload");

        page = PageContext::captioned(&filename, caption);
        break;
    }

    Ok(Html(state.renderer.render(&page)?))
}

/// Name an upload is stored under: the last component of the client's filename.
/// `None` means the form carried no file.
fn stored_name(client_name: &str) -> Option<String> {
    let name = Path::new(client_name).file_name()?.to_str()?;
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::stored_name;

    #[test]
    fn keeps_plain_names_verbatim() {
        assert_eq!(stored_name("cat.png").as_deref(), Some("cat.png"));
        assert_eq!(stored_name("my cat (1).JPG").as_deref(), Some("my cat (1).JPG"));
    }

    #[test]
    fn strips_directories() {
        assert_eq!(stored_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(stored_name("/tmp/cat.png").as_deref(), Some("cat.png"));
    }

    #[test]
    fn empty_means_no_file() {
        assert_eq!(stored_name(""), None);
        assert_eq!(stored_name(".."), None);
        assert_eq!(stored_name("/"), None);
    }
}
