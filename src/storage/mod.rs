//! Hybrid storage facade: one logical store over the fast and archival tiers.

mod events;
mod hybrid;
mod legacy;
mod lookup;

use std::sync::atomic::{AtomicBool, Ordering};

pub use events::StorageEvent;
pub use hybrid::{
    ApplyReport, HistorySnapshot, HybridStorage, InboundChanges, StorageOptions, WriteOutcome,
};
pub use lookup::{merge_collections, merge_items, Lookup};

/// Holds a busy flag for as long as it lives.
pub struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    /// `None` when the flag is already held.
    pub fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
