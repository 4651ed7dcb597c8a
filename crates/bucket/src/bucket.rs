//! Individual bucket handles and the two bucket-producing algorithms.
//!
//! A [`Bucket`] is an immutable, content-addressed file of sorted bucket
//! entries. Handles are shared as `Arc<Bucket>` between bucket-list levels,
//! in-flight merges and the bucket manager's registry; the backing file is
//! only removed once the registry's handle is the last one left (see
//! [`BucketManager::forget_unreferenced_buckets`]).
//!
//! New buckets come from exactly two places:
//!
//! - [`Bucket::fresh`]: one ledger's init/live/dead batch
//! - [`Bucket::merge`]: an older and a newer bucket, filtered by shadows
//!
//! [`BucketManager::forget_unreferenced_buckets`]: crate::BucketManager::forget_unreferenced_buckets

use std::path::{Path, PathBuf};
use std::sync::Arc;

use henyey_common::{supports_init_and_meta_entries, Hash256};
use stellar_xdr::curr::{LedgerEntry, LedgerKey};

use crate::entry::{bucket_cmp, BucketEntry};
use crate::iterator::{BucketInputIterator, BucketOutputIterator};
use crate::manager::{BucketRegistry, TempDirProvider};
use crate::merge::{merge_buckets, MergeInputs};
use crate::metrics::MergeCounters;
use crate::{BucketError, Result};

/// Canonical filename of the bucket named `hash`.
pub fn bucket_filename(hash: &Hash256) -> String {
    format!("bucket-{}.xdr", hash.to_hex())
}

/// Filename of the gzip-compressed archive copy of bucket `hash`.
pub fn compressed_bucket_filename(hash: &Hash256) -> String {
    format!("{}.gz", bucket_filename(hash))
}

/// An immutable bucket: hash, backing file and size in bytes.
///
/// The empty bucket has the zero hash, no file and size 0. It is the identity
/// element of [`Bucket::merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    hash: Hash256,
    path: Option<PathBuf>,
    size: u64,
}

impl Bucket {
    /// Create the empty bucket.
    pub fn empty() -> Self {
        Self {
            hash: Hash256::ZERO,
            path: None,
            size: 0,
        }
    }

    /// A handle to an existing bucket file.
    pub fn new(hash: Hash256, path: PathBuf, size: u64) -> Self {
        Self {
            hash,
            path: Some(path),
            size,
        }
    }

    /// SHA-256 of the file bytes, zero for the empty bucket.
    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.hash.is_zero()
    }

    /// Opens a streaming iterator over this bucket's entries.
    pub fn iter(&self) -> Result<BucketInputIterator> {
        BucketInputIterator::new(self)
    }

    /// Reads every data entry (META excluded) into memory.
    pub fn entries(&self) -> Result<Vec<BucketEntry>> {
        self.iter()?.collect_all()
    }

    /// Protocol version from the META record, 0 if there is none.
    pub fn protocol_version(&self) -> Result<u32> {
        Ok(self.iter()?.protocol_version())
    }

    /// Build a bucket from one ledger's changes.
    ///
    /// `init_entries` are tagged INIT from protocol 11 onwards and LIVE
    /// before it. The batch must not mention any key twice; a duplicate is a
    /// caller bug and fails with [`BucketError::MalformedBucket`].
    ///
    /// Returns the empty bucket for an empty batch.
    pub fn fresh<S>(
        services: &S,
        protocol_version: u32,
        init_entries: Vec<LedgerEntry>,
        live_entries: Vec<LedgerEntry>,
        dead_entries: Vec<LedgerKey>,
        count_merge_events: bool,
    ) -> Result<Arc<Bucket>>
    where
        S: TempDirProvider + BucketRegistry + ?Sized,
    {
        let entries = convert_to_bucket_entries(
            supports_init_and_meta_entries(protocol_version),
            init_entries,
            live_entries,
            dead_entries,
        )?;

        let mut counters = MergeCounters::new();
        let mut out = BucketOutputIterator::new(&services.tmp_dir(), protocol_version, true)?;
        for entry in entries {
            out.put(entry, &mut counters)?;
        }
        let bucket = out.finish(services, &mut counters)?;

        if count_merge_events {
            services.incr_merge_counters(&counters);
        }
        Ok(bucket)
    }

    /// Merge `old` and `new` into a new bucket, eliding entries already
    /// owned by one of `shadows`.
    ///
    /// See [`crate::merge`] for the full rules. Fails with
    /// [`BucketError::ProtocolViolation`] if the inputs are newer than
    /// `max_protocol_version`, and with [`BucketError::MalformedBucket`] on
    /// illegal input.
    #[allow(clippy::too_many_arguments)]
    pub fn merge<S>(
        services: &S,
        max_protocol_version: u32,
        old: &Arc<Bucket>,
        new: &Arc<Bucket>,
        shadows: &[Arc<Bucket>],
        keep_dead_entries: bool,
        count_merge_events: bool,
    ) -> Result<Arc<Bucket>>
    where
        S: TempDirProvider + BucketRegistry + ?Sized,
    {
        merge_buckets(
            services,
            MergeInputs {
                max_protocol_version,
                old,
                new,
                shadows,
                keep_dead_entries,
                count_merge_events,
            },
        )
    }
}

/// Tag and sort one ledger's changes, rejecting duplicate keys.
fn convert_to_bucket_entries(
    use_init: bool,
    init_entries: Vec<LedgerEntry>,
    live_entries: Vec<LedgerEntry>,
    dead_entries: Vec<LedgerKey>,
) -> Result<Vec<BucketEntry>> {
    let mut entries =
        Vec::with_capacity(init_entries.len() + live_entries.len() + dead_entries.len());
    entries.extend(init_entries.into_iter().map(|e| {
        if use_init {
            BucketEntry::Init(e)
        } else {
            BucketEntry::Live(e)
        }
    }));
    entries.extend(live_entries.into_iter().map(BucketEntry::Live));
    entries.extend(dead_entries.into_iter().map(BucketEntry::Dead));

    entries.sort_by(bucket_cmp);

    if let Some(pair) = entries
        .windows(2)
        .find(|pair| bucket_cmp(&pair[0], &pair[1]).is_ge())
    {
        return Err(BucketError::MalformedBucket(format!(
            "duplicate key in fresh batch: {:?}",
            pair[1].key()
        )));
    }
    Ok(entries)
}
