pub mod blip;
pub mod gemini;

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::{Backend, Config};

pub use blip::Blip;
pub use gemini::Gemini;

/// Turns an image on disk into a short description.
///
/// Implementations are loaded once at startup and shared by every request.
#[async_trait]
pub trait Captioner: Send + Sync {
    fn name(&self) -> &str;

    async fn caption(&self, path: &Path) -> Result<String>;
}

/// Builds the backend selected in `config`. For BLIP this downloads weights on first run.
pub async fn load(config: &Config) -> Result<Arc<dyn Captioner>> {
    let captioner: Arc<dyn Captioner> = match config.backend {
        Backend::Blip => Arc::new(
            Blip::load(
                config.blip_model,
                config.cpu,
                config.max_caption_tokens,
                config.model_cache_dir.clone(),
            )
            .await
            .context("failed to load BLIP model")?,
        ),
        Backend::Gemini => {
            let api_key = config
                .gemini_api_key
                .clone()
                .context("GEMINI_API_KEY is not set")?;
            Arc::new(Gemini::new(api_key, config.gemini_model.clone()))
        }
    };
    tracing::info!(backend = captioner.name(), "captioner ready");
    Ok(captioner)
}
