use serde_json::Value;
use tracing::warn;

use crate::fast::entry_size;

#[derive(Debug, Default)]
pub struct Chunked {
    pub chunks: Vec<Vec<(String, Value)>>,
    /// Keys of records that alone exceed the ceiling.
    pub oversize: Vec<String>,
}

/// Pack entries greedily into batches whose total size stays within `ceiling`.
///
/// Records are never split. One that alone exceeds the ceiling cannot be
/// carried by any write; its key is reported in [`Chunked::oversize`].
pub fn chunk_entries(entries: Vec<(String, Value)>, ceiling: usize) -> Chunked {
    let mut chunked = Chunked::default();
    let mut current = Vec::new();
    let mut current_bytes = 0;

    for (key, value) in entries {
        let size = entry_size(&key, &value);
        if size > ceiling {
            warn!(
                "Not syncing {}: {} bytes exceeds the {} byte write limit",
                key, size, ceiling
            );
            chunked.oversize.push(key);
            continue;
        }
        if current_bytes + size > ceiling && !current.is_empty() {
            chunked.chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push((key, value));
    }

    if !current.is_empty() {
        chunked.chunks.push(current);
    }
    chunked
}
