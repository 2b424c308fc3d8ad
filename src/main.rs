use anyhow::{Context, Result};
use descriptor_pipeline::{AppState, queue::worker};
use dotenvy::dotenv;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_tracing();

    if let Err(err) = app_main().await {
        error!(?err, "application error");
        std::process::exit(1);
    }
}

async fn app_main() -> Result<()> {
    let state = AppState::new().await.context("failed to start descriptor worker")?;
    let settings = state.config().worker.clone();

    worker::run_until(state.pipeline(), state.queue(), settings, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    })
    .await;

    info!("descriptor worker stopped");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
