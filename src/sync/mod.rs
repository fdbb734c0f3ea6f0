//! Optional multi-device synchronization over a shared key/value channel.

mod chunk;
mod merge;
mod record;
mod remote;
mod service;

pub use chunk::{chunk_entries, Chunked};
pub use merge::{merge, remote_wins, MergeMode, MergeOutcome};
pub use record::{decode_remote, SyncRecord};
pub use remote::{DirRemote, MemoryRemote, RemoteChannel};
pub use service::{SyncOptions, SyncReport, SyncService};
