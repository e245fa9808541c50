use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use gbp_sync::config;
use gbp_sync::db::{self, SqliteListingStore};
use gbp_sync::gbp::GbpClient;
use gbp_sync::reconcile::ReconcileOptions;
use gbp_sync::sync::{self, SyncContext, SyncLocks};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Sync one organization's listings with Business Profile and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Organization to sync
    #[arg(long)]
    organization: String,

    /// Only match by Business Profile location id, never by display name
    #[arg(long)]
    strict_matching: bool,
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

    let org = db::find_organization(&pool, &args.organization)
        .await?
        .ok_or_else(|| anyhow!("organization {} not found", args.organization))?;

    let mut options = ReconcileOptions::from(&cfg.sync);
    if args.strict_matching {
        options.match_display_name = false;
    }

    let client = GbpClient::from_config(&cfg.gbp)?;
    let store = SqliteListingStore::new(pool.clone());
    let locks = SyncLocks::new();
    let ctx = SyncContext {
        store: &store,
        source: &client,
        locks: &locks,
        options,
    };

    info!(organization_id = %org.id, "starting listing sync");
    let result = sync::run_sync(&ctx, &org.id, org.gbp_refresh_token.as_deref()).await;
    pool.close().await;

    match result {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(err) => {
            error!(%err, "listing sync failed");
            Err(err.into())
        }
    }
}
