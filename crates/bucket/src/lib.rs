//! BucketList merge engine for henyey.
//!
//! The BucketList stores the full ledger state as a hierarchy of sorted,
//! immutable, content-addressed files ("buckets"). Each closed ledger adds a
//! small fresh bucket at level 0; levels spill into deeper levels on a fixed
//! schedule, and the resulting merges run in the background.
//!
//! # Structure
//!
//! The BucketList has 11 levels (0-10), each holding two buckets:
//! - `curr`: the bucket receiving merged entries
//! - `snap`: the bucket frozen at the last spill
//!
//! | Level | Size    | Half    | Spill Period |
//! |-------|---------|---------|--------------|
//! | 0     | 4       | 2       | 2 ledgers    |
//! | 1     | 16      | 8       | 8 ledgers    |
//! | 2     | 64      | 32      | 32 ledgers   |
//! | ...   | ...     | ...     | ...          |
//! | 10    | -       | -       | never        |
//!
//! # Merge Semantics
//!
//! From protocol 11 onwards entries carry a lifecycle tag:
//!
//! - `INIT + DEAD` = both annihilated
//! - `DEAD + INIT` = `LIVE`
//! - `INIT + LIVE` = `INIT` with the new value
//! - `LIVE + DEAD` = `DEAD`
//!
//! Entries whose key also appears in a younger level ("shadow") are elided,
//! except lifecycle entries from protocol 11 onwards.
//!
//! # Persistence
//!
//! [`BucketList::to_snapshot`] captures every level, including merges still
//! in flight, as hashes. After a restart, [`BucketList::restore`] and
//! [`BucketList::restart_merges`] resume exactly where the list left off.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use henyey_bucket::{BucketList, BucketManager, BucketServices};
//!
//! let manager: Arc<dyn BucketServices> = Arc::new(BucketManager::new("/tmp/buckets")?);
//! let mut bucket_list = BucketList::new();
//!
//! bucket_list.add_batch(
//!     &manager,
//!     1,                // ledger sequence
//!     protocol_version, // ledger protocol
//!     init_entries,     // created entries
//!     live_entries,     // updated entries
//!     dead_entries,     // deleted keys
//! )?;
//!
//! let hash = bucket_list.hash();
//! ```

mod bucket;
mod bucket_list;
mod entry;
mod error;
mod future_bucket;
mod iterator;
mod manager;
mod merge;
mod metrics;

// ============================================================================
// Core bucket types
// ============================================================================

pub use bucket::{bucket_filename, compressed_bucket_filename, Bucket};
pub use bucket_list::{
    BucketLevel, BucketLevelSnapshot, BucketList, BucketListSnapshot, BUCKET_LIST_LEVELS,
};

// ============================================================================
// Entry types and comparison
// ============================================================================

pub use entry::{
    bucket_cmp, check_protocol_legality, compare_keys, ledger_entry_to_key, ledger_key_type,
    BucketEntry,
};

// ============================================================================
// Streaming I/O
// ============================================================================

pub use iterator::{temp_bucket_filename, BucketInputIterator, BucketOutputIterator};

// ============================================================================
// Background merges
// ============================================================================

pub use future_bucket::{FutureBucket, FutureBucketSnapshot, FutureBucketState, MergeSettings};

// ============================================================================
// Storage and services
// ============================================================================

pub use manager::{
    BackgroundScheduler, BucketManager, BucketRegistry, BucketServices, ProtocolVersionSource,
    TempDirProvider,
};
pub use metrics::{MergeCounters, MergeTimer};

// ============================================================================
// Errors
// ============================================================================

pub use error::BucketError;

/// Result type for bucket operations.
pub type Result<T> = std::result::Result<T, BucketError>;
