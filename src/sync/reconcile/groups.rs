//! Shelf groups: the server owns name and order, the device owns groups the
//! server has never seen. Built-in groups (id <= 0) never leave the device.

use super::{ReconcileResult, SyncContext};
use crate::sync::models::{ShelfGroupRecord, SyncResult};
use std::collections::{BTreeMap, HashMap};

pub async fn reconcile(ctx: &SyncContext<'_>) -> ReconcileResult {
    let mut result = SyncResult::default();

    // A later duplicate id replaces the earlier record
    let remote: BTreeMap<i64, ShelfGroupRecord> = ctx.api
        .list_shelf_groups(ctx.session)
        .await?
        .into_iter()
        .filter(ShelfGroupRecord::is_user_group)
        .map(|g| (g.group_id, g))
        .collect();
    let local: HashMap<i64, ShelfGroupRecord> = ctx.store
        .list_groups()?
        .into_iter()
        .filter(ShelfGroupRecord::is_user_group)
        .map(|g| (g.group_id, g))
        .collect();

    if ctx.is_cancelled() {
        return Ok(result);
    }

    for remote_group in remote.values() {
        if ctx.is_cancelled() {
            return Ok(result);
        }

        match local.get(&remote_group.group_id) {
            None => {
                let group = ShelfGroupRecord::new(
                    remote_group.group_id,
                    remote_group.group_name.clone(),
                    remote_group.order,
                );
                ctx.store.insert_group(&group)?;
                result.downloaded += 1;
            }
            Some(existing)
                if existing.group_name != remote_group.group_name
                    || existing.order != remote_group.order =>
            {
                let mut group = existing.clone();
                group.group_name = remote_group.group_name.clone();
                group.order = remote_group.order;
                ctx.store.update_group(&group)?;
                result.updated += 1;
            }
            Some(_) => {}
        }
    }

    // Upload in id order so the server sees a stable sequence
    let mut local_only: Vec<&ShelfGroupRecord> = local
        .values()
        .filter(|g| !remote.contains_key(&g.group_id))
        .collect();
    local_only.sort_by_key(|g| g.group_id);

    for group in local_only {
        if ctx.is_cancelled() {
            return Ok(result);
        }
        if ctx.api.save_shelf_group(ctx.session, group).await? {
            result.uploaded += 1;
        } else {
            log::warn!("Server refused shelf group {} ({})", group.group_id, group.group_name);
        }
    }

    Ok(result)
}
