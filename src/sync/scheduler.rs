//! Background Sync Scheduler
//!
//! Provides automatic periodic synchronization at configurable intervals.
//! Uses Tokio tasks for non-blocking background execution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task::JoinHandle;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use chrono::{DateTime, Utc};
use crate::db::Database;
use super::manager::SyncManager;

/// Settings key of the scheduler configuration
const SCHEDULER_CONFIG_KEY: &str = "scheduler_config";

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub last_run: Option<DateTime<Utc>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            last_run: None,
        }
    }
}

/// Background scheduler for automatic sync operations
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Arc<Database>,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
    cancel: Arc<StdMutex<CancellationToken>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

fn validate_interval(interval_minutes: u64) -> Result<(), SchedulerError> {
    if !(1..=1440).contains(&interval_minutes) {
        return Err(SchedulerError::InvalidInterval(
            format!("Interval must be 1-1440 minutes, got {}", interval_minutes)
        ));
    }
    Ok(())
}

impl BackgroundScheduler {
    /// Create new scheduler instance
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
            cancel: Arc::new(StdMutex::new(CancellationToken::new())),
        }
    }

    /// Load configuration from database settings table
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let config: SchedulerConfig = self.db
            .get_setting(SCHEDULER_CONFIG_KEY)
            .map_err(|e| SchedulerError::Database(e.to_string()))?
            .unwrap_or_default();

        *self.config.write().await = config;
        Ok(())
    }

    /// Save configuration to database settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db
            .set_setting(SCHEDULER_CONFIG_KEY, &config)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Start background scheduler task
    pub async fn start(&self, sync_manager: SyncManager) -> Result<(), SchedulerError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let interval_minutes = self.config.read().await.interval_minutes;
        validate_interval(interval_minutes)?;

        self.running.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        *self.lock_cancel() = cancel.clone();

        let db = self.db.clone();
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            Self::scheduler_loop(db, config, sync_manager, cancel).await;
        });

        *self.lock_handle() = Some(handle);

        log::info!("Background scheduler started (interval: {} minutes)", interval_minutes);
        Ok(())
    }

    /// Stop background scheduler task. A pass in flight stops at its next
    /// entity boundary.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        self.lock_cancel().cancel();

        // The loop exits on its own once it sees the cancellation
        let _ = self.lock_handle().take();

        log::info!("Background scheduler stopped");
        Ok(())
    }

    /// Check if scheduler is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get current configuration
    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration and restart scheduler if needed
    pub async fn update_config(
        &self,
        enabled: bool,
        interval_minutes: u64,
        sync_manager: SyncManager,
    ) -> Result<(), SchedulerError> {
        validate_interval(interval_minutes)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
        }

        self.save_config().await?;

        if self.is_running() {
            // Ignore error if not running (race condition)
            let _ = self.stop().await;
        }

        if enabled {
            self.start(sync_manager).await?;
        }

        log::info!("Scheduler config updated: enabled={}, interval={} minutes", enabled, interval_minutes);
        Ok(())
    }

    fn lock_cancel(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_handle(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task_handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        db: Arc<Database>,
        config: Arc<RwLock<SchedulerConfig>>,
        sync_manager: SyncManager,
        cancel: CancellationToken,
    ) {
        let interval_minutes = config.read().await.interval_minutes;
        let mut interval = tokio::time::interval(
            std::time::Duration::from_secs(60 * interval_minutes)
        );

        log::info!("Scheduler loop started (interval: {} minutes)", interval_minutes);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            log::info!("Background sync triggered by scheduler");

            match sync_manager.sync_all_with(&cancel).await {
                Ok(report) => {
                    let total = report.total();
                    log::info!(
                        "Background sync completed: uploaded={}, downloaded={}, updated={}, errors={}",
                        total.uploaded,
                        total.downloaded,
                        total.updated,
                        report.failures.len()
                    );

                    if !report.failures.is_empty() {
                        log::warn!("Background sync had {} errors: {:?}", report.failures.len(), report.failures);
                    }

                    if report.cancelled {
                        break;
                    }

                    let mut cfg = config.write().await;
                    cfg.last_run = Some(Utc::now());
                    let snapshot = cfg.clone();
                    drop(cfg);

                    if let Err(e) = db.set_setting(SCHEDULER_CONFIG_KEY, &snapshot) {
                        log::error!("Failed to save last_run timestamp: {}", e);
                    }
                }
                Err(e) => {
                    // Missing config or network; try again next tick
                    log::warn!("Background sync skipped: {}", e);
                }
            }
        }

        log::info!("Scheduler loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================
