use std::cmp::Reverse;
use std::collections::HashMap;

use crate::models::{CollectionRecord, ItemRecord, Tombstone};

/// Outcome of resolving one item id across both tiers.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    FoundLocal(ItemRecord),
    FoundArchival(ItemRecord),
    Tombstoned(Tombstone),
    Absent,
}

impl Lookup {
    /// The fast-tier copy wins outright; the archive is only a fallback.
    pub fn resolve(
        local: Option<ItemRecord>,
        archival: Option<ItemRecord>,
        tombstone: Option<Tombstone>,
    ) -> Self {
        let found = match (local, archival) {
            (Some(item), _) => Lookup::FoundLocal(item),
            (None, Some(item)) => Lookup::FoundArchival(item),
            (None, None) => Lookup::Absent,
        };

        let Some(tombstone) = tombstone else {
            return found;
        };

        let hidden = match &found {
            Lookup::FoundLocal(item) | Lookup::FoundArchival(item) => {
                tombstone.suppresses(item.last_touched_at)
            }
            Lookup::Tombstoned(_) | Lookup::Absent => true,
        };
        if hidden {
            Lookup::Tombstoned(tombstone)
        } else {
            found
        }
    }

    pub fn into_item(self) -> Option<ItemRecord> {
        match self {
            Lookup::FoundLocal(item) | Lookup::FoundArchival(item) => Some(item),
            Lookup::Tombstoned(_) | Lookup::Absent => None,
        }
    }
}

/// Overlay local items on the archived base set.
///
/// The larger `last_touched_at` wins, local on a tie. Ids hidden by a live
/// tombstone are dropped. Output is newest first, ties broken by id.
pub fn merge_items(
    archived: Vec<ItemRecord>,
    local: Vec<ItemRecord>,
    tombstones: &HashMap<String, Tombstone>,
) -> Vec<ItemRecord> {
    let mut merged: HashMap<String, ItemRecord> = archived
        .into_iter()
        .map(|item| (item.id.clone(), item))
        .collect();

    for item in local {
        match merged.get(&item.id) {
            Some(existing) if existing.last_touched_at > item.last_touched_at => {}
            _ => {
                merged.insert(item.id.clone(), item);
            }
        }
    }

    let mut items: Vec<ItemRecord> = merged
        .into_values()
        .filter(|item| {
            tombstones
                .get(&item.id)
                .map_or(true, |t| !t.suppresses(item.last_touched_at))
        })
        .collect();
    items.sort_by(|a, b| {
        Reverse(a.last_touched_at)
            .cmp(&Reverse(b.last_touched_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    items
}

/// Same overlay rule for collections, keyed on `last_updated_at`.
pub fn merge_collections(
    archived: Vec<CollectionRecord>,
    local: Vec<CollectionRecord>,
) -> Vec<CollectionRecord> {
    let mut merged: HashMap<String, CollectionRecord> = archived
        .into_iter()
        .map(|c| (c.id.clone(), c))
        .collect();

    for collection in local {
        match merged.get(&collection.id) {
            Some(existing) if existing.last_updated_at > collection.last_updated_at => {}
            _ => {
                merged.insert(collection.id.clone(), collection);
            }
        }
    }

    let mut collections: Vec<CollectionRecord> = merged.into_values().collect();
    collections.sort_by(|a, b| {
        Reverse(a.last_updated_at)
            .cmp(&Reverse(b.last_updated_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    collections
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, touched: i64, position: f64) -> ItemRecord {
        ItemRecord::new(id, touched).with_progress(position, 100.0)
    }

    #[test]
    fn local_copy_wins_lookup_even_when_older() {
        let found = Lookup::resolve(Some(item("a", 10, 1.0)), Some(item("a", 20, 2.0)), None);
        assert_eq!(found, Lookup::FoundLocal(item("a", 10, 1.0)));

        let archived = Lookup::resolve(None, Some(item("a", 20, 2.0)), None);
        assert!(matches!(archived, Lookup::FoundArchival(_)));
    }

    #[test]
    fn tombstone_hides_older_records_only() {
        let marker = Tombstone::new("a", 50);
        let hidden = Lookup::resolve(Some(item("a", 40, 1.0)), None, Some(marker.clone()));
        assert_eq!(hidden, Lookup::Tombstoned(marker.clone()));
        assert!(hidden.into_item().is_none());

        let revived = Lookup::resolve(Some(item("a", 60, 1.0)), None, Some(marker.clone()));
        assert!(matches!(revived, Lookup::FoundLocal(_)));

        assert!(matches!(
            Lookup::resolve(None, None, Some(marker)),
            Lookup::Tombstoned(_)
        ));
        assert_eq!(Lookup::resolve(None, None, None), Lookup::Absent);
    }

    #[test]
    fn merge_prefers_newer_and_local_on_tie() {
        let archived = vec![item("a", 100, 1.0), item("b", 300, 1.0), item("c", 50, 1.0)];
        let local = vec![item("a", 200, 2.0), item("b", 300, 2.0), item("c", 10, 2.0)];
        let merged = merge_items(archived, local, &HashMap::new());

        let by_id: HashMap<_, _> = merged.iter().map(|i| (i.id.as_str(), i)).collect();
        assert_eq!(by_id["a"].position_seconds, 2.0);
        assert_eq!(by_id["b"].position_seconds, 2.0);
        assert_eq!(by_id["c"].position_seconds, 1.0);
        let order: Vec<_> = merged.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn merge_excludes_tombstoned_ids_from_either_tier() {
        let tombstones: HashMap<_, _> = [
            ("a".to_string(), Tombstone::new("a", 1000)),
            ("b".to_string(), Tombstone::new("b", 1000)),
        ]
        .into_iter()
        .collect();
        let merged = merge_items(
            vec![item("a", 100, 1.0)],
            vec![item("b", 200, 1.0), item("c", 300, 1.0)],
            &tombstones,
        );
        let ids: Vec<_> = merged.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);
    }
}
