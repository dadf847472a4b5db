//! RSS sources: presence only. Sources known to both sides are left alone.

use super::{ReconcileResult, SyncContext};
use crate::sync::models::{RssSourceRecord, SyncResult};
use std::collections::{HashMap, HashSet};

pub async fn reconcile(ctx: &SyncContext<'_>) -> ReconcileResult {
    let mut result = SyncResult::default();

    let remote = ctx.api.list_rss_sources(ctx.session).await?;
    let local = ctx.store.list_rss_sources()?;

    if ctx.is_cancelled() {
        return Ok(result);
    }

    let remote_urls: HashSet<&str> = remote.iter().map(|s| s.source_url.as_str()).collect();
    let mut local_urls: HashSet<String> = local.iter().map(|s| s.source_url.clone()).collect();

    let to_upload: Vec<RssSourceRecord> = local
        .iter()
        .filter(|s| !remote_urls.contains(s.source_url.as_str()))
        .cloned()
        .collect();

    if !to_upload.is_empty() {
        if ctx.is_cancelled() {
            return Ok(result);
        }
        if ctx.api.save_rss_sources(ctx.session, &to_upload).await? {
            result.uploaded = to_upload.len() as u32;
        } else {
            log::warn!("Server refused batch of {} RSS sources", to_upload.len());
        }
    }

    // A later duplicate URL replaces the earlier record
    let last_index: HashMap<&str, usize> = remote
        .iter()
        .enumerate()
        .map(|(i, s)| (s.source_url.as_str(), i))
        .collect();

    for (i, source) in remote.iter().enumerate() {
        if last_index.get(source.source_url.as_str()) != Some(&i)
            || local_urls.contains(&source.source_url)
        {
            continue;
        }
        if ctx.is_cancelled() {
            return Ok(result);
        }
        ctx.store.insert_rss_source(source)?;
        local_urls.insert(source.source_url.clone());
        result.downloaded += 1;
    }

    Ok(result)
}
