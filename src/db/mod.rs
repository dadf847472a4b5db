//! Database module for Shelf Sync
//!
//! SQLite storage for the four synchronized collections (book sources,
//! shelf groups, bookshelf, RSS sources) plus a key/value settings table
//! holding the sync config and the persisted session.

use crate::sync::models::{BookRecord, BookSourceRecord, RssSourceRecord, Session, ShelfGroupRecord};
use crate::sync::session::SessionStore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

const SESSION_KEY: &str = "sync_session";

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Local collections consumed by the sync engine
///
/// List, get-by-key, insert and update for each synchronized entity type.
/// Deletion is not part of sync and is left to the owning screens.
pub trait LocalStore: Send + Sync {
    fn list_book_sources(&self) -> DbResult<Vec<BookSourceRecord>>;
    fn get_book_source(&self, url: &str) -> DbResult<Option<BookSourceRecord>>;
    fn insert_book_source(&self, source: &BookSourceRecord) -> DbResult<()>;
    fn update_book_source(&self, source: &BookSourceRecord) -> DbResult<()>;

    fn list_groups(&self) -> DbResult<Vec<ShelfGroupRecord>>;
    fn get_group(&self, group_id: i64) -> DbResult<Option<ShelfGroupRecord>>;
    fn insert_group(&self, group: &ShelfGroupRecord) -> DbResult<()>;
    fn update_group(&self, group: &ShelfGroupRecord) -> DbResult<()>;

    fn list_books(&self) -> DbResult<Vec<BookRecord>>;
    fn get_book(&self, id: i64) -> DbResult<Option<BookRecord>>;
    /// Returns the new local row id
    fn insert_book(&self, book: &BookRecord) -> DbResult<i64>;
    /// `book.id` must be set
    fn update_book(&self, book: &BookRecord) -> DbResult<()>;

    fn list_rss_sources(&self) -> DbResult<Vec<RssSourceRecord>>;
    fn get_rss_source(&self, url: &str) -> DbResult<Option<RssSourceRecord>>;
    fn insert_rss_source(&self, source: &RssSourceRecord) -> DbResult<()>;
    fn update_rss_source(&self, source: &RssSourceRecord) -> DbResult<()>;
}

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) a database file
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("SQLite journal mode: {}", journal_mode);

        conn.execute_batch(r#"
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#)?;

        Self::init_schema(&conn)?;
        drop(conn);

        log::info!("Opened database at {}", db_path.display());

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every SQLite memory connection is its own database, so the pool is
    /// capped at a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;

        let conn = pool.get()?;
        Self::init_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn init_schema(conn: &Connection) -> DbResult<()> {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Ok(())
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;

        match result {
            Some(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    /// Remove a setting
    pub fn delete_setting(&self, key: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(())
    }
}

// =========================================================================
// ROW MAPPING
// =========================================================================

fn to_json<T: Serialize>(value: &T) -> DbResult<String> {
    serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(json: &str) -> DbResult<T> {
    serde_json::from_str(json).map_err(|e| DbError::Serialization(e.to_string()))
}

fn book_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BookRecord> {
    Ok(BookRecord {
        id: Some(row.get(0)?),
        name: row.get(1)?,
        author: row.get(2)?,
        origin: row.get(3)?,
        origin_name: row.get(4)?,
        book_url: row.get(5)?,
        cover_url: row.get(6)?,
        group: row.get(7)?,
        dur_chapter_index: row.get(8)?,
        dur_chapter_pos: row.get(9)?,
        dur_chapter_title: row.get(10)?,
        dur_chapter_time: row.get(11)?,
        sync_time: row.get(12)?,
        total_chapter_num: row.get(13)?,
        latest_chapter_title: row.get(14)?,
    })
}

const BOOK_COLUMNS: &str = "id, name, author, origin, origin_name, book_url, cover_url, group_id, \
    dur_chapter_index, dur_chapter_pos, dur_chapter_title, dur_chapter_time, sync_time, \
    total_chapter_num, latest_chapter_title";

fn group_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShelfGroupRecord> {
    Ok(ShelfGroupRecord {
        group_id: row.get(0)?,
        group_name: row.get(1)?,
        order: row.get(2)?,
        show: row.get(3)?,
        cover: row.get(4)?,
        book_sort: row.get(5)?,
    })
}

impl LocalStore for Database {
    // =========================================================================
    // BOOK SOURCES
    // =========================================================================

    fn list_book_sources(&self) -> DbResult<Vec<BookSourceRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT data FROM book_sources ORDER BY book_source_url")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        rows.iter().map(|json| from_json(json)).collect()
    }

    fn get_book_source(&self, url: &str) -> DbResult<Option<BookSourceRecord>> {
        let conn = self.get_conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT data FROM book_sources WHERE book_source_url = ?1",
                [url],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|j| from_json(&j)).transpose()
    }

    fn insert_book_source(&self, source: &BookSourceRecord) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO book_sources (book_source_url, book_source_name, last_update_time, data)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                source.book_source_url,
                source.book_source_name,
                source.last_update_time,
                to_json(source)?,
            ],
        )?;
        Ok(())
    }

    fn update_book_source(&self, source: &BookSourceRecord) -> DbResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE book_sources SET book_source_name = ?2, last_update_time = ?3, data = ?4
             WHERE book_source_url = ?1",
            params![
                source.book_source_url,
                source.book_source_name,
                source.last_update_time,
                to_json(source)?,
            ],
        )?;
        if affected == 0 {
            return Err(DbError::NotFound(format!("book source {}", source.book_source_url)));
        }
        Ok(())
    }

    // =========================================================================
    // SHELF GROUPS
    // =========================================================================

    fn list_groups(&self) -> DbResult<Vec<ShelfGroupRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT group_id, group_name, sort_order, show, cover, book_sort
             FROM book_groups ORDER BY sort_order, group_id",
        )?;
        let groups = stmt
            .query_map([], group_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    fn get_group(&self, group_id: i64) -> DbResult<Option<ShelfGroupRecord>> {
        let conn = self.get_conn()?;
        let group = conn
            .query_row(
                "SELECT group_id, group_name, sort_order, show, cover, book_sort
                 FROM book_groups WHERE group_id = ?1",
                [group_id],
                group_from_row,
            )
            .optional()?;
        Ok(group)
    }

    fn insert_group(&self, group: &ShelfGroupRecord) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO book_groups (group_id, group_name, sort_order, show, cover, book_sort)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                group.group_id,
                group.group_name,
                group.order,
                group.show,
                group.cover,
                group.book_sort,
            ],
        )?;
        Ok(())
    }

    fn update_group(&self, group: &ShelfGroupRecord) -> DbResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE book_groups
             SET group_name = ?2, sort_order = ?3, show = ?4, cover = ?5, book_sort = ?6
             WHERE group_id = ?1",
            params![
                group.group_id,
                group.group_name,
                group.order,
                group.show,
                group.cover,
                group.book_sort,
            ],
        )?;
        if affected == 0 {
            return Err(DbError::NotFound(format!("group {}", group.group_id)));
        }
        Ok(())
    }

    // =========================================================================
    // BOOKSHELF
    // =========================================================================

    fn list_books(&self) -> DbResult<Vec<BookRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM books ORDER BY id", BOOK_COLUMNS))?;
        let books = stmt
            .query_map([], book_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(books)
    }

    fn get_book(&self, id: i64) -> DbResult<Option<BookRecord>> {
        let conn = self.get_conn()?;
        let book = conn
            .query_row(
                &format!("SELECT {} FROM books WHERE id = ?1", BOOK_COLUMNS),
                [id],
                book_from_row,
            )
            .optional()?;
        Ok(book)
    }

    fn insert_book(&self, book: &BookRecord) -> DbResult<i64> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO books (
                name, author, origin, origin_name, book_url, cover_url, group_id,
                dur_chapter_index, dur_chapter_pos, dur_chapter_title, dur_chapter_time,
                sync_time, total_chapter_num, latest_chapter_title
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                book.name,
                book.author,
                book.origin,
                book.origin_name,
                book.book_url,
                book.cover_url,
                book.group,
                book.dur_chapter_index,
                book.dur_chapter_pos,
                book.dur_chapter_title,
                book.dur_chapter_time,
                book.sync_time,
                book.total_chapter_num,
                book.latest_chapter_title,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_book(&self, book: &BookRecord) -> DbResult<()> {
        let id = book
            .id
            .ok_or_else(|| DbError::NotFound(format!("book '{}' has no local id", book.name)))?;

        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE books SET
                name = ?2, author = ?3, origin = ?4, origin_name = ?5, book_url = ?6,
                cover_url = ?7, group_id = ?8, dur_chapter_index = ?9, dur_chapter_pos = ?10,
                dur_chapter_title = ?11, dur_chapter_time = ?12, sync_time = ?13,
                total_chapter_num = ?14, latest_chapter_title = ?15
            WHERE id = ?1
            "#,
            params![
                id,
                book.name,
                book.author,
                book.origin,
                book.origin_name,
                book.book_url,
                book.cover_url,
                book.group,
                book.dur_chapter_index,
                book.dur_chapter_pos,
                book.dur_chapter_title,
                book.dur_chapter_time,
                book.sync_time,
                book.total_chapter_num,
                book.latest_chapter_title,
            ],
        )?;
        if affected == 0 {
            return Err(DbError::NotFound(format!("book {}", id)));
        }
        Ok(())
    }

    // =========================================================================
    // RSS SOURCES
    // =========================================================================

    fn list_rss_sources(&self) -> DbResult<Vec<RssSourceRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT data FROM rss_sources ORDER BY source_url")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        rows.iter().map(|json| from_json(json)).collect()
    }

    fn get_rss_source(&self, url: &str) -> DbResult<Option<RssSourceRecord>> {
        let conn = self.get_conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT data FROM rss_sources WHERE source_url = ?1",
                [url],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|j| from_json(&j)).transpose()
    }

    fn insert_rss_source(&self, source: &RssSourceRecord) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO rss_sources (source_url, source_name, data) VALUES (?1, ?2, ?3)",
            params![source.source_url, source.source_name, to_json(source)?],
        )?;
        Ok(())
    }

    fn update_rss_source(&self, source: &RssSourceRecord) -> DbResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE rss_sources SET source_name = ?2, data = ?3 WHERE source_url = ?1",
            params![source.source_url, source.source_name, to_json(source)?],
        )?;
        if affected == 0 {
            return Err(DbError::NotFound(format!("rss source {}", source.source_url)));
        }
        Ok(())
    }
}

impl SessionStore for Database {
    fn load_session(&self) -> DbResult<Option<Session>> {
        self.get_setting(SESSION_KEY)
    }

    fn save_session(&self, session: &Session) -> DbResult<()> {
        self.set_setting(SESSION_KEY, session)
    }

    fn clear_session(&self) -> DbResult<()> {
        self.delete_setting(SESSION_KEY)
    }
}
