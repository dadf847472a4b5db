//! Sync Data Models
//!
//! Defines the records exchanged with the sync server and stored locally:
//! - SyncConfig: endpoint, credentials and per-domain toggles
//! - BookSourceRecord: book source definitions (keyed by URL)
//! - ShelfGroupRecord: user shelf groups (keyed by id, id > 0 only)
//! - BookRecord: bookshelf entries with reading progress
//! - RssSourceRecord: RSS subscriptions (keyed by URL)
//! - SyncResult / SyncReport: per-domain outcome of a sync pass

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Origin tag of a book whose file lives on the sync server
pub const SERVER_FILE_ORIGIN: &str = "server_local";

/// `book_url` prefix of a book whose file lives on the sync server
pub const SERVER_FILE_PREFIX: &str = "storage/";

// ============================================================================
// Sync Configuration
// ============================================================================

/// Sync configuration and state
///
/// Persisted as JSON in the settings table. The password is never written
/// to disk; it is supplied by the caller on every start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the sync server (e.g. `https://reader.example.com/api`)
    pub server_url: Option<String>,

    /// Account name on the sync server
    pub username: Option<String>,

    /// Account password (never persisted)
    #[serde(skip)]
    pub password: Option<String>,

    /// Unique device identifier (UUID v4)
    pub device_id: String,

    /// Device name reported at login
    pub device_name: String,

    /// Selective sync toggles
    pub sync_groups: bool,
    pub sync_book_sources: bool,
    pub sync_bookshelf: bool,
    pub sync_rss_sources: bool,

    /// Push reading progress from the reader hook
    pub sync_progress: bool,

    /// Auto-sync interval in minutes (0 = manual only)
    pub sync_interval_minutes: u64,

    /// HTTP request timeout
    pub request_timeout_secs: u64,

    /// A cached token is refreshed this many seconds before it expires
    pub token_refresh_margin_secs: i64,

    /// Login retry policy for transient transport failures
    pub retry: RetryPolicy,

    /// Last completed full sync pass
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            username: None,
            password: None,
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: get_default_device_name(),
            sync_groups: true,
            sync_book_sources: true,
            sync_bookshelf: true,
            sync_rss_sources: true,
            sync_progress: true,
            sync_interval_minutes: 30,
            request_timeout_secs: 30,
            token_refresh_margin_secs: 60,
            retry: RetryPolicy::default(),
            last_sync_at: None,
        }
    }
}

impl SyncConfig {
    /// Build a config from `SHELF_SYNC_URL`, `SHELF_SYNC_USERNAME` and
    /// `SHELF_SYNC_PASSWORD`, keeping defaults for everything else.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.server_url = std::env::var("SHELF_SYNC_URL").ok().filter(|s| !s.is_empty());
        config.username = std::env::var("SHELF_SYNC_USERNAME").ok().filter(|s| !s.is_empty());
        config.password = std::env::var("SHELF_SYNC_PASSWORD").ok().filter(|s| !s.is_empty());
        config
    }

    /// Server URL with trailing slashes removed, if it is a valid http(s) URL
    pub fn endpoint(&self) -> Option<String> {
        let raw = self.server_url.as_deref()?.trim();
        let parsed = url::Url::parse(raw).ok()?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return None;
        }
        Some(raw.trim_end_matches('/').to_string())
    }

    /// Login credentials, if both username and password are set
    pub fn credentials(&self) -> Option<Credentials> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => {
                Some(Credentials::new(u.to_string(), p.to_string()))
            }
            _ => None,
        }
    }

    /// Whether endpoint and credentials are both usable
    pub fn is_configured(&self) -> bool {
        self.endpoint().is_some() && self.credentials().is_some()
    }

    /// Whether a sync domain is enabled
    pub fn domain_enabled(&self, domain: SyncDomain) -> bool {
        match domain {
            SyncDomain::ShelfGroups => self.sync_groups,
            SyncDomain::BookSources => self.sync_book_sources,
            SyncDomain::Bookshelf => self.sync_bookshelf,
            SyncDomain::RssSources => self.sync_rss_sources,
        }
    }

    /// True when switching to `other` must drop the cached session
    pub fn identity_changed(&self, other: &SyncConfig) -> bool {
        self.endpoint() != other.endpoint()
            || self.username != other.username
            || self.password != other.password
    }
}

/// Get default device name from hostname
fn get_default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("{} device", std::env::consts::OS))
}

/// Retry policy for the login exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), exponential and capped
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        std::time::Duration::from_millis(ms)
    }
}

/// Login credentials, wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// SHA-256 of username and password, safe to persist next to a token
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.username.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.password.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Session
// ============================================================================

/// Access token issued by the sync server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,

    /// Endpoint and account the token was issued for
    pub server_url: String,
    pub username: String,

    /// `Credentials::fingerprint` at login time
    #[serde(default)]
    pub credential_digest: String,
}

impl Session {
    /// Usable at `now`, given a refresh margin in seconds
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin_secs: i64) -> bool {
        !self.access_token.is_empty()
            && self.expires_at - chrono::Duration::seconds(margin_secs) > now
    }

    /// Issued for this endpoint under these exact credentials
    pub fn belongs_to(&self, server_url: &str, credentials: &Credentials) -> bool {
        self.server_url == server_url
            && self.username == credentials.username
            && self.credential_digest == credentials.fingerprint()
    }
}

// ============================================================================
// Sync Domains & Results
// ============================================================================

/// The four synchronized data domains
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDomain {
    ShelfGroups,
    BookSources,
    Bookshelf,
    RssSources,
}

impl SyncDomain {
    /// Order of a full pass. Groups come first so bookshelf entries can
    /// reference them.
    pub const ORDER: [SyncDomain; 4] = [
        SyncDomain::ShelfGroups,
        SyncDomain::BookSources,
        SyncDomain::Bookshelf,
        SyncDomain::RssSources,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDomain::ShelfGroups => "shelf_groups",
            SyncDomain::BookSources => "book_sources",
            SyncDomain::Bookshelf => "bookshelf",
            SyncDomain::RssSources => "rss_sources",
        }
    }
}

impl fmt::Display for SyncDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-domain outcome counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub uploaded: u32,
    pub downloaded: u32,
    pub updated: u32,
}

impl SyncResult {
    pub fn total(&self) -> u32 {
        self.uploaded + self.downloaded + self.updated
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Outcome of a full sync pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Domains that completed (disabled domains carry a zero result)
    pub results: BTreeMap<SyncDomain, SyncResult>,

    /// Domains that failed, with a human readable reason
    pub failures: BTreeMap<SyncDomain, String>,

    /// The pass stopped early on a cancellation request
    pub cancelled: bool,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    pub fn result(&self, domain: SyncDomain) -> Option<&SyncResult> {
        self.results.get(&domain)
    }

    /// Sum of all per-domain counts
    pub fn total(&self) -> SyncResult {
        self.results.values().fold(SyncResult::default(), |acc, r| SyncResult {
            uploaded: acc.uploaded + r.uploaded,
            downloaded: acc.downloaded + r.downloaded,
            updated: acc.updated + r.updated,
        })
    }
}

/// Outcome of a standalone progress push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Server accepted the progress
    Sent,
    /// Server answered but refused the progress
    Rejected,
    /// Progress sync is switched off
    Disabled,
    /// No endpoint or credentials
    Unconfigured,
    /// No network
    Offline,
}

// ============================================================================
// Book Sources
// ============================================================================

/// Book source definition
///
/// Only the key and the update timestamp matter to the sync engine; the
/// parsing rules travel as an opaque map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSourceRecord {
    pub book_source_url: String,

    #[serde(default)]
    pub book_source_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_source_group: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub last_update_time: i64,

    /// Parsing rules and any other fields, passed through untouched
    #[serde(flatten)]
    pub rules: serde_json::Map<String, serde_json::Value>,
}

impl BookSourceRecord {
    pub fn new(url: impl Into<String>, name: impl Into<String>, last_update_time: i64) -> Self {
        Self {
            book_source_url: url.into(),
            book_source_name: name.into(),
            book_source_group: None,
            enabled: true,
            last_update_time,
            rules: serde_json::Map::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Shelf Groups
// ============================================================================

/// User shelf group
///
/// Only `group_id`, `group_name` and `order` exist on the server. The other
/// fields are local display settings and must survive a remote update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShelfGroupRecord {
    pub group_id: i64,
    pub group_name: String,
    #[serde(default)]
    pub order: i32,

    #[serde(skip, default = "default_true")]
    pub show: bool,
    #[serde(skip)]
    pub cover: Option<String>,
    #[serde(skip, default = "default_book_sort")]
    pub book_sort: i32,
}

fn default_book_sort() -> i32 {
    -1
}

impl ShelfGroupRecord {
    pub fn new(group_id: i64, group_name: impl Into<String>, order: i32) -> Self {
        Self {
            group_id,
            group_name: group_name.into(),
            order,
            show: true,
            cover: None,
            book_sort: default_book_sort(),
        }
    }

    /// Groups with id <= 0 are built-in and never synced
    pub fn is_user_group(&self) -> bool {
        self.group_id > 0
    }
}

// ============================================================================
// Bookshelf
// ============================================================================

/// Bookshelf entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookRecord {
    /// Local row id, never sent to the server
    #[serde(skip)]
    pub id: Option<i64>,

    pub name: String,
    #[serde(default)]
    pub author: String,

    /// Source that produced the book, or `SERVER_FILE_ORIGIN`
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub origin_name: String,

    /// Storage locator
    #[serde(default)]
    pub book_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,

    /// Shelf group id (0 = ungrouped)
    #[serde(default)]
    pub group: i64,

    #[serde(default)]
    pub dur_chapter_index: i32,
    #[serde(default)]
    pub dur_chapter_pos: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dur_chapter_title: Option<String>,
    /// Last reading activity (unix millis)
    #[serde(default)]
    pub dur_chapter_time: i64,

    /// Last time this entry was reconciled (unix millis)
    #[serde(default)]
    pub sync_time: i64,

    #[serde(default)]
    pub total_chapter_num: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_chapter_title: Option<String>,
}

impl BookRecord {
    pub fn new(
        name: impl Into<String>,
        author: impl Into<String>,
        origin: impl Into<String>,
        book_url: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            author: author.into(),
            origin: origin.into(),
            origin_name: String::new(),
            book_url: book_url.into(),
            cover_url: None,
            group: 0,
            dur_chapter_index: 0,
            dur_chapter_pos: 0,
            dur_chapter_title: None,
            dur_chapter_time: 0,
            sync_time: 0,
            total_chapter_num: 0,
            latest_chapter_title: None,
        }
    }

    /// Whether the book content is hosted by the sync server
    pub fn is_server_file(&self) -> bool {
        self.origin == SERVER_FILE_ORIGIN || is_server_file_url(&self.book_url)
    }

    /// Copy reading position from another record
    pub fn apply_progress(&mut self, progress: &ReadingProgress) {
        self.dur_chapter_index = progress.dur_chapter_index;
        self.dur_chapter_pos = progress.dur_chapter_pos;
        self.dur_chapter_title = progress.dur_chapter_title.clone();
        self.dur_chapter_time = progress.dur_chapter_time;
    }
}

/// Whether a storage locator points at the sync server's file storage
pub fn is_server_file_url(book_url: &str) -> bool {
    book_url.starts_with(SERVER_FILE_PREFIX)
}

/// Reading position of a book, sent on its own from the reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingProgress {
    pub name: String,
    pub author: String,
    pub dur_chapter_index: i32,
    pub dur_chapter_pos: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dur_chapter_title: Option<String>,
    pub dur_chapter_time: i64,
}

impl From<&BookRecord> for ReadingProgress {
    fn from(book: &BookRecord) -> Self {
        Self {
            name: book.name.clone(),
            author: book.author.clone(),
            dur_chapter_index: book.dur_chapter_index,
            dur_chapter_pos: book.dur_chapter_pos,
            dur_chapter_title: book.dur_chapter_title.clone(),
            dur_chapter_time: book.dur_chapter_time,
        }
    }
}

/// Remote progress is further along than local.
///
/// Position is compared first (chapter, then offset) because device clocks
/// may disagree; the activity timestamp is the fallback.
pub fn remote_is_newer(local: &ReadingProgress, remote: &ReadingProgress) -> bool {
    remote.dur_chapter_index > local.dur_chapter_index
        || (remote.dur_chapter_index == local.dur_chapter_index
            && remote.dur_chapter_pos > local.dur_chapter_pos)
        || remote.dur_chapter_time > local.dur_chapter_time
}

// ============================================================================
// RSS Sources
// ============================================================================

/// RSS subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RssSourceRecord {
    pub source_url: String,

    #[serde(default)]
    pub source_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_group: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RssSourceRecord {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source_url: url.into(),
            source_name: name.into(),
            source_group: None,
            enabled: true,
            extra: serde_json::Map::new(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
