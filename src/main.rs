use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use gbp_sync::config;
use gbp_sync::db;
use gbp_sync::gbp::GbpClient;
use gbp_sync::handlers::{self, AppState};
use gbp_sync::reconcile::ReconcileOptions;
use gbp_sync::sync::SyncLocks;

#[derive(Debug, Parser)]
#[command(author, version, about = "Business Profile listing sync API")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.default_database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let state = AppState {
        pool: pool.clone(),
        source: Arc::new(GbpClient::from_config(&cfg.gbp)?),
        locks: SyncLocks::new(),
        options: ReconcileOptions::from(&cfg.sync),
    };

    let listener = tokio::net::TcpListener::bind(&cfg.app.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.app.bind_addr))?;
    info!(addr = %cfg.app.bind_addr, "listening");

    axum::serve(listener, handlers::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    pool.close().await;
    Ok(())
}
