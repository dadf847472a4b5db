//! Session Manager - access token cache
//!
//! Keeps the current access token in memory and in the settings table so a
//! restart does not force a new login. Tokens are bound to the endpoint and
//! credentials they were issued for.

use super::api::{LoginRequest, RemoteApi, SyncApiError};
use super::models::{Credentials, RetryPolicy, Session};
use crate::db::DbResult;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Durable home of the session between runs
pub trait SessionStore: Send + Sync {
    fn load_session(&self) -> DbResult<Option<Session>>;
    fn save_session(&self, session: &Session) -> DbResult<()>;
    fn clear_session(&self) -> DbResult<()>;
}

/// Everything the login exchange needs
pub struct LoginContext<'a> {
    pub server_url: &'a str,
    pub credentials: &'a Credentials,
    pub device_id: &'a str,
    pub device_name: &'a str,
    pub retry: RetryPolicy,
    pub refresh_margin_secs: i64,
}

/// Cached access token, refreshed on demand
#[derive(Clone)]
pub struct SessionManager {
    current: Arc<RwLock<Option<Session>>>,
    store: Arc<dyn SessionStore>,
}

impl SessionManager {
    /// Create a manager, restoring the persisted session if one exists
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let restored = match store.load_session() {
            Ok(session) => session,
            Err(e) => {
                log::warn!("Failed to restore sync session: {}", e);
                None
            }
        };

        Self {
            current: Arc::new(RwLock::new(restored)),
            store,
        }
    }

    /// Current session, if any (may be expired)
    pub async fn current(&self) -> Option<Session> {
        self.current.read().await.clone()
    }

    /// Session usable right now, logging in when the cached one is missing,
    /// expired, or issued for another endpoint or account
    pub async fn valid_session(
        &self,
        api: &dyn RemoteApi,
        ctx: &LoginContext<'_>,
    ) -> Result<Session, SyncApiError> {
        {
            let current = self.current.read().await;
            if let Some(session) = current.as_ref() {
                if session.belongs_to(ctx.server_url, ctx.credentials)
                    && session.is_valid_at(Utc::now(), ctx.refresh_margin_secs)
                {
                    return Ok(session.clone());
                }
            }
        }

        self.login(api, ctx).await
    }

    /// Log in unconditionally and replace the cached session
    pub async fn login(
        &self,
        api: &dyn RemoteApi,
        ctx: &LoginContext<'_>,
    ) -> Result<Session, SyncApiError> {
        let request = LoginRequest {
            username: &ctx.credentials.username,
            password: &ctx.credentials.password,
            device_id: ctx.device_id,
            device_name: ctx.device_name,
        };

        let max_attempts = ctx.retry.max_attempts.max(1);
        let mut attempt = 1;
        let auth = loop {
            match api.login(ctx.server_url, &request).await {
                Ok(auth) => break auth,
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = ctx.retry.delay_for(attempt);
                    log::warn!(
                        "Login attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let session = Session {
            access_token: auth.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(auth.expires_in.max(0)),
            server_url: ctx.server_url.to_string(),
            username: ctx.credentials.username.clone(),
            credential_digest: ctx.credentials.fingerprint(),
        };

        log::info!(
            "Logged in to {} as {} (token valid until {})",
            session.server_url,
            session.username,
            session.expires_at
        );

        *self.current.write().await = Some(session.clone());
        self.persist().await;

        Ok(session)
    }

    /// Write the cached session to the store. Failures are logged only;
    /// a lost token costs one extra login.
    pub async fn persist(&self) {
        let current = self.current.read().await.clone();
        let Some(session) = current else {
            return;
        };

        if let Err(e) = self.store.save_session(&session) {
            log::warn!("Failed to persist sync session: {}", e);
        }
    }

    /// Drop the cached and persisted session
    pub async fn invalidate(&self) -> DbResult<()> {
        *self.current.write().await = None;
        self.store.clear_session()?;
        log::debug!("Sync session invalidated");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
