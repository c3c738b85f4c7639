use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use canteen::{
    clock::SystemClock, config::Config, db, services::staff::StaffService, state::AppState,
};

/// How long running jobs get to finish after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    let pool = db::create_pool(&config.database_path).await?;
    db::run_migrations(&pool).await?;
    info!("Database opened at {} and migrations applied", config.database_path.display());

    if let Some(password) = StaffService::ensure_initial_admin(&pool).await? {
        warn!("initial administrator password: {password} (change it after first login)");
    }

    let state = AppState::build(config.clone(), pool, Arc::new(SystemClock))?;

    let report = state.scheduler.start(state.catalog.clone()).await?;
    info!(
        "scheduler started: {} job(s) installed (enabled: {})",
        report.installed.len(),
        config.scheduler.enabled
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    state.mapping.cancel();
    if !state.scheduler.shutdown(SHUTDOWN_GRACE).await {
        warn!("some scheduled jobs were still running after {SHUTDOWN_GRACE:?}");
    }
    state.pool.close().await;
    info!("canteen stopped");

    Ok(())
}
