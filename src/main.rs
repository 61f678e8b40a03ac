use anyhow::{Context, Result};
use image_describer::{caption, router, AppState, Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before the subscriber so RUST_LOG from the file applies.
    let dotenv = dotenvy::dotenv();
    init_tracing();
    match dotenv {
        Ok(path) => info!("loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => return Err(e).context("failed to read .env"),
    }

    let config = Config::from_env()?;

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("failed to create {}", config.upload_dir.display()))?;

    let captioner = caption::load(&config).await?;
    let state = AppState::new(captioner, config.upload_dir.clone())?;
    let app = router(state, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;

    info!(
        upload_dir = %config.upload_dir.display(),
        "listening on http://{}",
        listener.local_addr()?
    );

    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "image_describer=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
