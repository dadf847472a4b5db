//! # Shelf Sync
//!
//! Synchronizes a reader's book sources, shelf groups, bookshelf with reading
//! progress, and RSS sources with a self-hosted server.

pub mod db;
pub mod sync;

use db::Database;
use std::sync::Arc;
use sync::{BackgroundScheduler, SyncConfig, SyncManager, SyncManagerError, SyncReport, CONFIG_KEY};

// ============================================================================
// Entry Point
// ============================================================================

/// Run one sync pass, or keep syncing on a schedule with `--watch`
pub fn run() {
    // Load .env file for server settings
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let app_dir = match directories::ProjectDirs::from("com", "shelfsync", "shelf-sync") {
        Some(dirs) => dirs,
        None => {
            log::error!("Failed to get app directories - cannot determine data location");
            eprintln!("FATAL: Cannot determine data directory");
            std::process::exit(1);
        }
    };

    let db_path = app_dir.data_dir().join("shelf-sync.db");
    log::info!("Database path: {:?}", db_path);

    let db = match Database::new(db_path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            log::error!("Failed to initialize database: {}", e);
            eprintln!("FATAL: Database initialization failed: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let watch = std::env::args().skip(1).any(|arg| arg == "--watch");

    let outcome = runtime.block_on(async move {
        if watch {
            sync_on_schedule(db).await
        } else {
            sync_once(db).await
        }
    });

    if let Err(e) = outcome {
        log::error!("Sync failed: {}", e);
        std::process::exit(1);
    }
}

async fn build_manager(db: Arc<Database>) -> Result<SyncManager, SyncManagerError> {
    let stored: SyncConfig = db.get_setting(CONFIG_KEY)?.unwrap_or_default();
    let config = apply_env_overrides(stored, SyncConfig::from_env());

    let manager = SyncManager::new(config, db)?;
    // Keeps the device id stable across runs
    manager.save_config().await?;
    Ok(manager)
}

async fn sync_once(db: Arc<Database>) -> Result<(), SyncManagerError> {
    let manager = build_manager(db).await?;
    let report = manager.sync_all().await?;
    log_report(&report);
    Ok(())
}

async fn sync_on_schedule(db: Arc<Database>) -> Result<(), SyncManagerError> {
    let manager = build_manager(db.clone()).await?;
    let interval = manager.get_config().await.sync_interval_minutes;

    let scheduler = BackgroundScheduler::new(db);
    scheduler.load_config().await?;
    scheduler.update_config(true, interval, manager).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }

    scheduler.stop().await?;
    Ok(())
}

/// Endpoint and account from the environment win over stored values.
/// The password only ever comes from the environment.
fn apply_env_overrides(mut stored: SyncConfig, env: SyncConfig) -> SyncConfig {
    if env.server_url.is_some() {
        stored.server_url = env.server_url;
    }
    if env.username.is_some() {
        stored.username = env.username;
    }
    stored.password = env.password;
    stored
}

fn log_report(report: &SyncReport) {
    for (domain, result) in &report.results {
        log::info!(
            "{}: uploaded={}, downloaded={}, updated={}",
            domain,
            result.uploaded,
            result.downloaded,
            result.updated
        );
    }
    for (domain, reason) in &report.failures {
        log::warn!("{}: failed ({})", domain, reason);
    }
}
