//! Per-domain reconciliation
//!
//! Each reconciler lists both sides, decides per entity what moves where,
//! and applies the decisions. Reconcilers stop at the next entity boundary
//! once cancellation is requested and return what they committed so far.

pub mod bookshelf;
pub mod groups;
pub mod rss;
pub mod sources;

use super::api::RemoteApi;
use super::identity::BookIdentity;
use super::manager::SyncManagerError;
use super::models::{Session, SyncDomain, SyncResult};
use crate::db::LocalStore;
use tokio_util::sync::CancellationToken;

pub type ReconcileResult = Result<SyncResult, SyncManagerError>;

/// Collaborators shared by all reconcilers during one pass
pub struct SyncContext<'a> {
    pub api: &'a dyn RemoteApi,
    pub store: &'a dyn LocalStore,
    pub session: &'a Session,
    pub identity: &'a dyn BookIdentity,
    pub cancel: &'a CancellationToken,
}

impl SyncContext<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Run the reconciler for `domain`
pub async fn run(domain: SyncDomain, ctx: &SyncContext<'_>) -> ReconcileResult {
    let result = match domain {
        SyncDomain::ShelfGroups => groups::reconcile(ctx).await?,
        SyncDomain::BookSources => sources::reconcile(ctx).await?,
        SyncDomain::Bookshelf => bookshelf::reconcile(ctx).await?,
        SyncDomain::RssSources => rss::reconcile(ctx).await?,
    };

    log::info!(
        "Synced {}: {} uploaded, {} downloaded, {} updated",
        domain,
        result.uploaded,
        result.downloaded,
        result.updated
    );

    Ok(result)
}
