//! Reconciling local history with the remote mirror.

use crate::models::{CollectionRecord, ItemRecord};
use crate::storage::{HistorySnapshot, InboundChanges};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Per-key last-writer-wins with a grace window in local's favour.
    Blend,
    /// Local history is untrusted; the remote mirror replaces it.
    Replace,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Remote records that must be written locally.
    pub inbound: InboundChanges,
    /// State after the merge, the source for republishing.
    pub merged: HistorySnapshot,
    pub remote_wins: usize,
    pub local_wins: usize,
}

/// Remote beats local only when it is newer by more than `grace_ms`.
/// Equal timestamps keep the local copy.
pub fn remote_wins(local_ts: Option<i64>, remote_ts: i64, grace_ms: i64) -> bool {
    match local_ts {
        None => true,
        Some(local_ts) => remote_ts > local_ts.saturating_add(grace_ms),
    }
}

pub fn merge(
    local: &HistorySnapshot,
    remote: HistorySnapshot,
    grace_ms: i64,
    mode: MergeMode,
) -> MergeOutcome {
    if mode == MergeMode::Replace {
        return MergeOutcome {
            remote_wins: remote.items.len() + remote.collections.len(),
            merged: remote,
            ..MergeOutcome::default()
        };
    }

    let mut outcome = MergeOutcome {
        merged: local.clone(),
        ..MergeOutcome::default()
    };

    for (id, item) in remote.items {
        if local
            .tombstones
            .get(&id)
            .is_some_and(|t| t.suppresses(item.last_touched_at))
        {
            // Deleted here after the remote copy was written
            outcome.local_wins += 1;
            continue;
        }
        let local_ts = local.items.get(&id).map(|i| i.last_touched_at);
        if remote_wins(local_ts, item.last_touched_at, grace_ms) {
            take_item(&mut outcome, item);
        } else {
            outcome.local_wins += 1;
        }
    }

    for (id, collection) in remote.collections {
        let local_ts = local.collections.get(&id).map(|c| c.last_updated_at);
        if remote_wins(local_ts, collection.last_updated_at, grace_ms) {
            take_collection(&mut outcome, collection);
        } else {
            outcome.local_wins += 1;
        }
    }

    // Deletions are compared against the merged item, not a grace window
    for (id, tombstone) in remote.tombstones {
        let newer = outcome
            .merged
            .tombstones
            .get(&id)
            .map_or(true, |t| tombstone.deleted_at > t.deleted_at);
        if !newer {
            continue;
        }
        if let Some(item) = outcome.merged.items.get(&id) {
            if !tombstone.suppresses(item.last_touched_at) {
                continue;
            }
            outcome.merged.items.remove(&id);
        }
        outcome.inbound.tombstones.push(tombstone.clone());
        outcome.merged.tombstones.insert(id, tombstone);
    }

    // A revived item outranks its older tombstone
    let HistorySnapshot {
        items, tombstones, ..
    } = &mut outcome.merged;
    tombstones.retain(|id, t| {
        items
            .get(id)
            .map_or(true, |item| t.suppresses(item.last_touched_at))
    });

    outcome
}

fn take_item(outcome: &mut MergeOutcome, item: ItemRecord) {
    outcome.remote_wins += 1;
    outcome.inbound.items.push(item.clone());
    outcome.merged.items.insert(item.id.clone(), item);
}

fn take_collection(outcome: &mut MergeOutcome, collection: CollectionRecord) {
    outcome.remote_wins += 1;
    outcome.inbound.collections.push(collection.clone());
    outcome.merged.collections.insert(collection.id.clone(), collection);
}
