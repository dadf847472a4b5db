//! Book sources: two-way merge keyed by URL, newest `last_update_time` wins.

use super::{ReconcileResult, SyncContext};
use crate::sync::models::{BookSourceRecord, SyncResult};
use std::collections::HashMap;

pub async fn reconcile(ctx: &SyncContext<'_>) -> ReconcileResult {
    let mut result = SyncResult::default();

    let remote = ctx.api.list_book_sources(ctx.session).await?;
    let local = ctx.store.list_book_sources()?;

    if ctx.is_cancelled() {
        return Ok(result);
    }

    let (to_upload, to_download) = plan(local, remote);

    if !to_upload.is_empty() {
        if ctx.is_cancelled() {
            return Ok(result);
        }
        if ctx.api.save_book_sources(ctx.session, &to_upload).await? {
            result.uploaded = to_upload.len() as u32;
        } else {
            log::warn!("Server refused batch of {} book sources", to_upload.len());
        }
    }

    for source in to_download {
        if ctx.is_cancelled() {
            return Ok(result);
        }
        // The row may have appeared since the listing
        if ctx.store.get_book_source(&source.book_source_url)?.is_some() {
            ctx.store.update_book_source(&source)?;
            result.updated += 1;
        } else {
            ctx.store.insert_book_source(&source)?;
            result.downloaded += 1;
        }
    }

    Ok(result)
}

/// Split both sides into (upload, download) sets. Equal timestamps move nothing.
fn plan(
    local: Vec<BookSourceRecord>,
    remote: Vec<BookSourceRecord>,
) -> (Vec<BookSourceRecord>, Vec<BookSourceRecord>) {
    let mut remote_by_url: HashMap<String, BookSourceRecord> = HashMap::new();
    for source in remote {
        remote_by_url.insert(source.book_source_url.clone(), source);
    }

    let mut to_upload = Vec::new();
    let mut to_download = Vec::new();

    for source in local {
        match remote_by_url.remove(&source.book_source_url) {
            None => to_upload.push(source),
            Some(remote) if source.last_update_time > remote.last_update_time => to_upload.push(source),
            Some(remote) if remote.last_update_time > source.last_update_time => to_download.push(remote),
            Some(_) => {}
        }
    }

    // Whatever is left exists only remotely
    let mut remote_only: Vec<BookSourceRecord> = remote_by_url.into_values().collect();
    remote_only.sort_by(|a, b| a.book_source_url.cmp(&b.book_source_url));
    to_download.extend(remote_only);

    (to_upload, to_download)
}
