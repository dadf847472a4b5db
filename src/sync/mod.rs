//! Sync Module - Remote Synchronization Engine
//!
//! Reconciles four data domains with a self-hosted server:
//! - Shelf groups (server owns name/order)
//! - Book sources (newest update time wins)
//! - Bookshelf (books matched by name and author, progress merged)
//! - RSS sources (presence only)
//!
//! Architecture:
//! - One `SyncManager` per configured endpoint, no global state
//! - Stateless API client; tokens live in the `SessionManager`
//! - Domain failures are isolated and reported, never fatal to a pass

pub mod api;
pub mod identity;
pub mod manager;
pub mod models;
pub mod network;
pub mod reconcile;
pub mod scheduler;
pub mod session;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use models::{
    BookRecord, BookSourceRecord, Credentials, PushOutcome, ReadingProgress, RetryPolicy,
    RssSourceRecord, Session, ShelfGroupRecord, SyncConfig, SyncDomain, SyncReport, SyncResult,
};

pub use api::{RemoteApi, SyncApiClient, SyncApiError};
pub use identity::{BookIdentity, NameAuthorIdentity};
pub use manager::{SyncManager, SyncManagerError, CONFIG_KEY};
pub use network::{Connectivity, StaticConnectivity, TcpConnectivity};
pub use reconcile::bookshelf::{merge_book, BookMerge};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
pub use session::{SessionManager, SessionStore};
