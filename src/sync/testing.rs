//! In-memory sync server used by the unit and scenario tests

use super::api::{AuthResponse, LoginRequest, RemoteApi, SyncApiError};
use super::models::{
    BookRecord, BookSourceRecord, ReadingProgress, RssSourceRecord, Session, ShelfGroupRecord,
    SyncDomain,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct ServerState {
    book_sources: Vec<BookSourceRecord>,
    groups: Vec<ShelfGroupRecord>,
    books: Vec<BookRecord>,
    rss_sources: Vec<RssSourceRecord>,
    progress: Vec<ReadingProgress>,

    /// Every group received through save_shelf_group
    saved_groups: Vec<ShelfGroupRecord>,
    /// Every book received through save_book
    saved_books: Vec<BookRecord>,
    /// Batch sizes received through save_book_sources / save_rss_sources
    source_batches: Vec<usize>,
    rss_batches: Vec<usize>,

    token_lifetime_secs: i64,
    transient_login_failures: u32,
    reject_logins: bool,
    refuse_saves: bool,
    failing_lists: HashSet<SyncDomain>,
    unauthorized_lists: u32,
    cancel_on_list: Option<(SyncDomain, CancellationToken)>,
    cancel_after_saves: Option<(u32, CancellationToken)>,
    list_delay: Option<Duration>,

    /// Save requests of any kind, accepted or not
    saves: u32,
}

impl ServerState {
    fn note_save(&mut self) {
        self.saves += 1;
        if let Some((after, token)) = &self.cancel_after_saves {
            if self.saves >= *after {
                token.cancel();
            }
        }
    }
}

/// Fake sync server with counters and failure switches
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
    logins: Arc<AtomicU32>,
    lists: Arc<AtomicU32>,
    active_lists: Arc<AtomicU32>,
    max_active_lists: Arc<AtomicU32>,
}

impl FakeServer {
    pub fn new() -> Self {
        let state = ServerState {
            token_lifetime_secs: 3600,
            ..Default::default()
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            logins: Arc::new(AtomicU32::new(0)),
            lists: Arc::new(AtomicU32::new(0)),
            active_lists: Arc::new(AtomicU32::new(0)),
            max_active_lists: Arc::new(AtomicU32::new(0)),
        }
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    pub fn add_book_source(&self, source: BookSourceRecord) {
        self.state.lock().unwrap().book_sources.push(source);
    }

    pub fn add_group(&self, group: ShelfGroupRecord) {
        self.state.lock().unwrap().groups.push(group);
    }

    pub fn add_book(&self, book: BookRecord) {
        self.state.lock().unwrap().books.push(book);
    }

    pub fn add_rss_source(&self, source: RssSourceRecord) {
        self.state.lock().unwrap().rss_sources.push(source);
    }

    // ------------------------------------------------------------------
    // Switches
    // ------------------------------------------------------------------

    pub fn set_token_lifetime(&self, secs: i64) {
        self.state.lock().unwrap().token_lifetime_secs = secs;
    }

    pub fn fail_logins_transiently(&self, count: u32) {
        self.state.lock().unwrap().transient_login_failures = count;
    }

    pub fn reject_logins(&self, reject: bool) {
        self.state.lock().unwrap().reject_logins = reject;
    }

    pub fn refuse_saves(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_saves = refuse;
    }

    pub fn fail_list(&self, domain: SyncDomain) {
        self.state.lock().unwrap().failing_lists.insert(domain);
    }

    /// Answer the next `count` list calls with 401
    pub fn unauthorized_lists(&self, count: u32) {
        self.state.lock().unwrap().unauthorized_lists = count;
    }

    /// Trigger `token` while serving the list call of `domain`
    pub fn cancel_on_list(&self, domain: SyncDomain, token: CancellationToken) {
        self.state.lock().unwrap().cancel_on_list = Some((domain, token));
    }

    /// Trigger `token` once `count` save requests have been served
    pub fn cancel_after_saves(&self, count: u32, token: CancellationToken) {
        self.state.lock().unwrap().cancel_after_saves = Some((count, token));
    }

    pub fn set_list_delay(&self, delay: Duration) {
        self.state.lock().unwrap().list_delay = Some(delay);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn login_count(&self) -> u32 {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> u32 {
        self.lists.load(Ordering::SeqCst)
    }

    /// Highest number of list calls observed in flight at once
    pub fn max_concurrent_lists(&self) -> u32 {
        self.max_active_lists.load(Ordering::SeqCst)
    }

    pub fn book_sources(&self) -> Vec<BookSourceRecord> {
        self.state.lock().unwrap().book_sources.clone()
    }

    pub fn groups(&self) -> Vec<ShelfGroupRecord> {
        self.state.lock().unwrap().groups.clone()
    }

    pub fn books(&self) -> Vec<BookRecord> {
        self.state.lock().unwrap().books.clone()
    }

    pub fn rss_sources(&self) -> Vec<RssSourceRecord> {
        self.state.lock().unwrap().rss_sources.clone()
    }

    pub fn progress(&self) -> Vec<ReadingProgress> {
        self.state.lock().unwrap().progress.clone()
    }

    pub fn saved_groups(&self) -> Vec<ShelfGroupRecord> {
        self.state.lock().unwrap().saved_groups.clone()
    }

    pub fn saved_books(&self) -> Vec<BookRecord> {
        self.state.lock().unwrap().saved_books.clone()
    }

    pub fn source_batches(&self) -> Vec<usize> {
        self.state.lock().unwrap().source_batches.clone()
    }

    pub fn rss_batches(&self) -> Vec<usize> {
        self.state.lock().unwrap().rss_batches.clone()
    }

    /// Total save requests of any kind
    pub fn save_count(&self) -> u32 {
        self.state.lock().unwrap().saves
    }

    async fn enter_list(&self, session: &Session, domain: SyncDomain) -> Result<(), SyncApiError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let active = self.active_lists.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_lists.fetch_max(active, Ordering::SeqCst);

        let delay = self.state.lock().unwrap().list_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active_lists.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        if session.access_token.is_empty() {
            return Err(SyncApiError::Unauthorized);
        }
        if state.unauthorized_lists > 0 {
            state.unauthorized_lists -= 1;
            return Err(SyncApiError::Unauthorized);
        }
        if state.failing_lists.contains(&domain) {
            return Err(SyncApiError::ServerError(format!("{} unavailable", domain)));
        }
        if let Some((cancel_domain, token)) = &state.cancel_on_list {
            if *cancel_domain == domain {
                token.cancel();
            }
        }
        Ok(())
    }

    fn accept_save(&self) -> bool {
        !self.state.lock().unwrap().refuse_saves
    }
}

#[async_trait]
impl RemoteApi for FakeServer {
    async fn login(
        &self,
        _server_url: &str,
        req: &LoginRequest<'_>,
    ) -> Result<AuthResponse, SyncApiError> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.lock().unwrap();

        if state.transient_login_failures > 0 {
            state.transient_login_failures -= 1;
            return Err(SyncApiError::NetworkError("connection reset".to_string()));
        }
        if state.reject_logins || req.password.is_empty() {
            return Err(SyncApiError::InvalidCredentials);
        }

        Ok(AuthResponse {
            access_token: format!("token-{}-{}", req.username, n),
            expires_in: state.token_lifetime_secs,
        })
    }

    async fn list_book_sources(&self, session: &Session) -> Result<Vec<BookSourceRecord>, SyncApiError> {
        self.enter_list(session, SyncDomain::BookSources).await?;
        Ok(self.book_sources())
    }

    async fn save_book_sources(
        &self,
        _session: &Session,
        batch: &[BookSourceRecord],
    ) -> Result<bool, SyncApiError> {
        let accepted = self.accept_save();
        let mut state = self.state.lock().unwrap();
        state.source_batches.push(batch.len());
        state.note_save();
        if accepted {
            for source in batch {
                state.book_sources.retain(|s| s.book_source_url != source.book_source_url);
                state.book_sources.push(source.clone());
            }
        }
        Ok(accepted)
    }

    async fn list_shelf_groups(&self, session: &Session) -> Result<Vec<ShelfGroupRecord>, SyncApiError> {
        self.enter_list(session, SyncDomain::ShelfGroups).await?;
        Ok(self.groups())
    }

    async fn save_shelf_group(
        &self,
        _session: &Session,
        group: &ShelfGroupRecord,
    ) -> Result<bool, SyncApiError> {
        let accepted = self.accept_save();
        let mut state = self.state.lock().unwrap();
        state.saved_groups.push(group.clone());
        state.note_save();
        if accepted {
            state.groups.retain(|g| g.group_id != group.group_id);
            state.groups.push(ShelfGroupRecord::new(group.group_id, group.group_name.clone(), group.order));
        }
        Ok(accepted)
    }

    async fn list_bookshelf(&self, session: &Session) -> Result<Vec<BookRecord>, SyncApiError> {
        self.enter_list(session, SyncDomain::Bookshelf).await?;
        Ok(self.books())
    }

    async fn save_book(&self, _session: &Session, book: &BookRecord) -> Result<bool, SyncApiError> {
        let accepted = self.accept_save();
        let mut state = self.state.lock().unwrap();
        state.saved_books.push(book.clone());
        state.note_save();
        if accepted {
            let mut stored = book.clone();
            stored.id = None;
            state.books.retain(|b| !(b.name == book.name && b.author == book.author));
            state.books.push(stored);
        }
        Ok(accepted)
    }

    async fn list_rss_sources(&self, session: &Session) -> Result<Vec<RssSourceRecord>, SyncApiError> {
        self.enter_list(session, SyncDomain::RssSources).await?;
        Ok(self.rss_sources())
    }

    async fn save_rss_sources(
        &self,
        _session: &Session,
        batch: &[RssSourceRecord],
    ) -> Result<bool, SyncApiError> {
        let accepted = self.accept_save();
        let mut state = self.state.lock().unwrap();
        state.rss_batches.push(batch.len());
        state.note_save();
        if accepted {
            for source in batch {
                state.rss_sources.retain(|s| s.source_url != source.source_url);
                state.rss_sources.push(source.clone());
            }
        }
        Ok(accepted)
    }

    async fn save_progress(
        &self,
        _session: &Session,
        progress: &ReadingProgress,
    ) -> Result<bool, SyncApiError> {
        let accepted = self.accept_save();
        let mut state = self.state.lock().unwrap();
        state.progress.push(progress.clone());
        state.note_save();
        Ok(accepted)
    }
}
