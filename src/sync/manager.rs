//! Sync Manager - Orchestrates synchronization operations
//!
//! Coordinates between the local store, the session cache and the API client.
//! Handles:
//! - Configuration (persisted without the password)
//! - Preconditions (configured endpoint, reachable network)
//! - Full passes over all domains in dependency order
//! - Single-domain sync and standalone progress push
//! - Token management (auto-refresh on 401)

use super::api::{RemoteApi, SyncApiClient, SyncApiError};
use super::identity::{BookIdentity, NameAuthorIdentity};
use super::models::{
    BookRecord, Credentials, PushOutcome, ReadingProgress, Session, SyncConfig, SyncDomain,
    SyncReport, SyncResult,
};
use super::network::{Connectivity, TcpConnectivity};
use super::reconcile::{self, SyncContext};
use super::scheduler::SchedulerError;
use super::session::{LoginContext, SessionManager};
use crate::db::{Database, DbError, LocalStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Settings key of the persisted sync configuration
pub const CONFIG_KEY: &str = "sync_config";

/// Sync manager - main orchestrator
#[derive(Clone)]
pub struct SyncManager {
    api: Arc<dyn RemoteApi>,
    db: Arc<Database>,
    store: Arc<dyn LocalStore>,
    sessions: SessionManager,
    config: Arc<RwLock<SyncConfig>>,
    connectivity: Arc<dyn Connectivity>,
    identity: Arc<dyn BookIdentity>,
    sync_lock: Arc<Mutex<()>>,
}

impl SyncManager {
    /// Create a sync manager talking HTTP to the configured server
    pub fn new(config: SyncConfig, db: Arc<Database>) -> Result<Self, SyncManagerError> {
        let timeout = Duration::from_secs(config.request_timeout_secs.max(1));
        let api = SyncApiClient::new(timeout)?;

        Ok(Self {
            api: Arc::new(api),
            store: db.clone(),
            sessions: SessionManager::new(db.clone()),
            db,
            config: Arc::new(RwLock::new(config)),
            connectivity: Arc::new(TcpConnectivity::new(timeout)),
            identity: Arc::new(NameAuthorIdentity),
            sync_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Replace the remote API implementation
    pub fn with_api(mut self, api: Arc<dyn RemoteApi>) -> Self {
        self.api = api;
        self
    }

    /// Replace the connectivity probe
    pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Replace the cross-system book identity
    pub fn with_identity(mut self, identity: Arc<dyn BookIdentity>) -> Self {
        self.identity = identity;
        self
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Get current configuration
    pub async fn get_config(&self) -> SyncConfig {
        self.config.read().await.clone()
    }

    /// Replace configuration and persist it. A new endpoint or account drops
    /// the cached session.
    pub async fn update_config(&self, new_config: SyncConfig) -> Result<(), SyncManagerError> {
        let identity_changed = {
            let mut config = self.config.write().await;
            let changed = config.identity_changed(&new_config);
            *config = new_config;
            changed
        };

        if identity_changed {
            log::info!("Sync endpoint or credentials changed, dropping session");
            self.sessions.invalidate().await?;
        }

        self.save_config().await
    }

    /// Load configuration from the settings table. The in-memory password is
    /// kept since it is never persisted.
    pub async fn load_config(&self) -> Result<(), SyncManagerError> {
        let Some(mut stored) = self.db.get_setting::<SyncConfig>(CONFIG_KEY)? else {
            return Ok(());
        };

        let mut config = self.config.write().await;
        stored.password = config.password.take();
        *config = stored;
        Ok(())
    }

    /// Save configuration to the settings table
    pub async fn save_config(&self) -> Result<(), SyncManagerError> {
        let config = self.config.read().await.clone();
        self.db.set_setting(CONFIG_KEY, &config)?;
        Ok(())
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Log in with the configured credentials, ignoring any cached token
    pub async fn verify_credentials(&self) -> Result<(), SyncManagerError> {
        let config = self.config.read().await.clone();
        let (endpoint, credentials) = self.check_preconditions(&config).await?;

        let ctx = login_context(&config, &endpoint, &credentials);
        self.sessions.login(self.api.as_ref(), &ctx).await?;
        Ok(())
    }

    /// Forget the session, both cached and persisted
    pub async fn logout(&self) -> Result<(), SyncManagerError> {
        self.sessions.invalidate().await?;
        log::info!("Logged out of sync server");
        Ok(())
    }

    /// Current session, if one is cached
    pub async fn session(&self) -> Option<Session> {
        self.sessions.current().await
    }

    // ========================================================================
    // Sync Operations
    // ========================================================================

    /// Perform a full pass over every enabled domain
    pub async fn sync_all(&self) -> Result<SyncReport, SyncManagerError> {
        self.sync_all_with(&CancellationToken::new()).await
    }

    /// Perform a full pass, stopping early once `cancel` fires.
    ///
    /// Fails only on missing configuration or network. Domain failures are
    /// collected in the report and do not stop the pass.
    pub async fn sync_all_with(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncManagerError> {
        let _pass = self.sync_lock.lock().await;

        let config = self.config.read().await.clone();
        let (endpoint, credentials) = self.check_preconditions(&config).await?;

        log::info!("Starting sync with {}", endpoint);

        let mut report = SyncReport::default();
        for domain in SyncDomain::ORDER {
            if cancel.is_cancelled() {
                break;
            }

            if !config.domain_enabled(domain) {
                log::debug!("Skipping disabled domain {}", domain);
                report.results.insert(domain, SyncResult::default());
                continue;
            }

            match self.run_domain(domain, &config, &endpoint, &credentials, cancel).await {
                Ok(result) => {
                    report.results.insert(domain, result);
                }
                Err(e) => {
                    log::warn!("Sync of {} failed: {}", domain, e);
                    report.failures.insert(domain, e.to_string());
                }
            }
        }

        if cancel.is_cancelled() {
            log::info!("Sync cancelled");
            report.cancelled = true;
            return Ok(report);
        }

        self.stamp_last_sync().await;

        let total = report.total();
        log::info!(
            "Sync finished: {} uploaded, {} downloaded, {} updated, {} failed domains",
            total.uploaded,
            total.downloaded,
            total.updated,
            report.failures.len()
        );

        Ok(report)
    }

    /// Sync a single domain
    pub async fn sync_domain(&self, domain: SyncDomain) -> Result<SyncResult, SyncManagerError> {
        self.sync_domain_with(domain, &CancellationToken::new()).await
    }

    /// Sync a single domain under an external cancellation token
    pub async fn sync_domain_with(
        &self,
        domain: SyncDomain,
        cancel: &CancellationToken,
    ) -> Result<SyncResult, SyncManagerError> {
        let _pass = self.sync_lock.lock().await;

        let config = self.config.read().await.clone();
        let (endpoint, credentials) = self.check_preconditions(&config).await?;

        if cancel.is_cancelled() {
            return Err(SyncManagerError::Cancelled);
        }
        if !config.domain_enabled(domain) {
            return Ok(SyncResult::default());
        }

        self.run_domain(domain, &config, &endpoint, &credentials, cancel).await
    }

    /// Push the reading position of `book`
    pub async fn push_book_progress(&self, book: &BookRecord) -> Result<PushOutcome, SyncManagerError> {
        self.push_progress(&ReadingProgress::from(book)).await
    }

    /// Push a reading position.
    ///
    /// Never fails for missing configuration or network; those come back as
    /// outcomes so the reader is not interrupted.
    pub async fn push_progress(
        &self,
        progress: &ReadingProgress,
    ) -> Result<PushOutcome, SyncManagerError> {
        let config = self.config.read().await.clone();

        if !config.sync_progress {
            log::debug!("Progress sync disabled, not pushing {}", progress.name);
            return Ok(PushOutcome::Disabled);
        }

        let (Some(endpoint), Some(credentials)) = (config.endpoint(), config.credentials()) else {
            log::debug!("Sync not configured, not pushing {}", progress.name);
            return Ok(PushOutcome::Unconfigured);
        };

        if !self.connectivity.is_online(&endpoint).await {
            log::debug!("Offline, not pushing {}", progress.name);
            return Ok(PushOutcome::Offline);
        }

        let ctx = login_context(&config, &endpoint, &credentials);
        let session = self.sessions.valid_session(self.api.as_ref(), &ctx).await?;

        if self.api.save_progress(&session, progress).await? {
            self.sessions.persist().await;
            Ok(PushOutcome::Sent)
        } else {
            log::warn!("Server refused progress for {} by {}", progress.name, progress.author);
            Ok(PushOutcome::Rejected)
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn check_preconditions(
        &self,
        config: &SyncConfig,
    ) -> Result<(String, Credentials), SyncManagerError> {
        let endpoint = config.endpoint().ok_or_else(|| {
            SyncManagerError::NotConfigured("server URL is missing or invalid".to_string())
        })?;
        let credentials = config.credentials().ok_or_else(|| {
            SyncManagerError::NotConfigured("username or password is missing".to_string())
        })?;

        if !self.connectivity.is_online(&endpoint).await {
            return Err(SyncManagerError::NetworkUnavailable);
        }

        Ok((endpoint, credentials))
    }

    /// Run one reconciler. A token the server no longer accepts is dropped
    /// and the domain retried once with a fresh login.
    async fn run_domain(
        &self,
        domain: SyncDomain,
        config: &SyncConfig,
        endpoint: &str,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<SyncResult, SyncManagerError> {
        let login = login_context(config, endpoint, credentials);
        let mut relogged = false;

        loop {
            let session = self.sessions.valid_session(self.api.as_ref(), &login).await?;
            let ctx = SyncContext {
                api: self.api.as_ref(),
                store: self.store.as_ref(),
                session: &session,
                identity: self.identity.as_ref(),
                cancel,
            };

            match reconcile::run(domain, &ctx).await {
                Ok(result) => {
                    self.sessions.persist().await;
                    return Ok(result);
                }
                Err(SyncManagerError::Api(SyncApiError::Unauthorized)) if !relogged => {
                    log::warn!("Token rejected during {} sync, logging in again", domain);
                    self.sessions.invalidate().await?;
                    relogged = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stamp_last_sync(&self) {
        let config = {
            let mut config = self.config.write().await;
            config.last_sync_at = Some(Utc::now());
            config.clone()
        };

        if let Err(e) = self.db.set_setting(CONFIG_KEY, &config) {
            log::warn!("Failed to save last sync time: {}", e);
        }
    }
}

fn login_context<'a>(
    config: &'a SyncConfig,
    endpoint: &'a str,
    credentials: &'a Credentials,
) -> LoginContext<'a> {
    LoginContext {
        server_url: endpoint,
        credentials,
        device_id: &config.device_id,
        device_name: &config.device_name,
        retry: config.retry,
        refresh_margin_secs: config.token_refresh_margin_secs,
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncManagerError {
    #[error("Sync is not configured: {0}")]
    NotConfigured(String),

    #[error("Network is unavailable")]
    NetworkUnavailable,

    #[error("API error: {0}")]
    Api(#[from] SyncApiError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Sync was cancelled")]
    Cancelled,

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl From<SchedulerError> for SyncManagerError {
    fn from(e: SchedulerError) -> Self {
        SyncManagerError::Scheduler(e.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
