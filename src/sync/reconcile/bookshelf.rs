//! Bookshelf: books are matched by [`BookIdentity`] and merged field group
//! by field group (server file identity, shelf group, reading progress).
//!
//! [`BookIdentity`]: crate::sync::identity::BookIdentity

use super::{ReconcileResult, SyncContext};
use crate::sync::models::{
    is_server_file_url, remote_is_newer, BookRecord, ReadingProgress, SyncResult,
    SERVER_FILE_ORIGIN,
};
use std::collections::{HashMap, HashSet};

/// What to do with a matched local/remote pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookMerge {
    /// Remote progress copied into local; save locally
    PullProgress,
    /// Upload local; `save_local` when local was also corrected
    Push { save_local: bool },
    /// Only identity or group corrections; save locally
    SaveLocal,
    Unchanged,
}

/// Merge `remote` into `local` in place and decide the follow-up.
///
/// `now` is stamped into `sync_time` whenever local changes.
pub fn merge_book(local: &mut BookRecord, remote: &BookRecord, now: i64) -> BookMerge {
    let mut corrected = false;

    // Server-hosted file: local must keep pointing at server storage
    if is_server_file_url(&remote.book_url) {
        if local.origin != SERVER_FILE_ORIGIN {
            local.origin = SERVER_FILE_ORIGIN.to_string();
            corrected = true;
        }
        if !is_server_file_url(&local.book_url) {
            local.book_url = remote.book_url.clone();
            corrected = true;
        }
    }

    let mut needs_push = false;
    if local.group == 0 && remote.group != 0 {
        local.group = remote.group;
        corrected = true;
    } else if local.group != 0 && local.group != remote.group {
        needs_push = true;
    }

    let local_progress = ReadingProgress::from(&*local);
    let remote_progress = ReadingProgress::from(remote);

    if remote_is_newer(&local_progress, &remote_progress) {
        local.apply_progress(&remote_progress);
        local.sync_time = now;
        BookMerge::PullProgress
    } else if local.dur_chapter_time > remote.dur_chapter_time || needs_push {
        if corrected {
            local.sync_time = now;
        }
        BookMerge::Push { save_local: corrected }
    } else if corrected {
        local.sync_time = now;
        BookMerge::SaveLocal
    } else {
        BookMerge::Unchanged
    }
}

pub async fn reconcile(ctx: &SyncContext<'_>) -> ReconcileResult {
    let mut result = SyncResult::default();
    let now = chrono::Utc::now().timestamp_millis();

    let remote = ctx.api.list_bookshelf(ctx.session).await?;
    let local = ctx.store.list_books()?;

    if ctx.is_cancelled() {
        return Ok(result);
    }

    // A later duplicate key replaces the earlier record
    let mut remote_by_key: HashMap<String, &BookRecord> = HashMap::new();
    for book in &remote {
        remote_by_key.insert(ctx.identity.key(book), book);
    }
    let mut local_keys: HashSet<String> = HashSet::new();

    for mut book in local {
        if ctx.is_cancelled() {
            return Ok(result);
        }

        let key = ctx.identity.key(&book);
        let matched = remote_by_key.get(&key).copied();
        local_keys.insert(key);

        let Some(remote_book) = matched else {
            if ctx.api.save_book(ctx.session, &book).await? {
                result.uploaded += 1;
            } else {
                log::warn!("Server refused book {} by {}", book.name, book.author);
            }
            continue;
        };

        match merge_book(&mut book, remote_book, now) {
            BookMerge::PullProgress => {
                log::debug!(
                    "Pulled progress for {}: chapter {} offset {}",
                    book.name,
                    book.dur_chapter_index,
                    book.dur_chapter_pos
                );
                ctx.store.update_book(&book)?;
                result.updated += 1;
            }
            BookMerge::Push { save_local } => {
                if save_local {
                    ctx.store.update_book(&book)?;
                }
                if ctx.api.save_book(ctx.session, &book).await? {
                    result.uploaded += 1;
                } else {
                    log::warn!("Server refused book {} by {}", book.name, book.author);
                }
            }
            BookMerge::SaveLocal => {
                ctx.store.update_book(&book)?;
                result.updated += 1;
            }
            BookMerge::Unchanged => {}
        }
    }

    for remote_book in &remote {
        let key = ctx.identity.key(remote_book);
        if local_keys.contains(&key) {
            continue;
        }
        let Some(latest) = remote_by_key.get(&key).copied() else {
            continue;
        };
        if ctx.is_cancelled() {
            return Ok(result);
        }

        let mut book = latest.clone();
        book.id = None;
        book.sync_time = now;
        if is_server_file_url(&book.book_url) {
            book.origin = SERVER_FILE_ORIGIN.to_string();
        }
        ctx.store.insert_book(&book)?;
        local_keys.insert(key);
        result.downloaded += 1;
    }

    Ok(result)
}
