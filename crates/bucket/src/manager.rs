//! Collaborator interfaces and the reference `BucketManager`.
//!
//! The merge engine never touches the bucket directory or spawns threads on
//! its own. It goes through four narrow traits:
//!
//! - [`TempDirProvider`]: where in-progress merge output is written
//! - [`BucketRegistry`]: adopting finished files and resolving hashes
//! - [`BackgroundScheduler`]: running merge bodies off the control thread
//! - [`ProtocolVersionSource`]: the protocol ceiling for merges
//!
//! [`BucketServices`] bundles all four; long-lived engine state holds it as
//! `Arc<dyn BucketServices>`.
//!
//! # File Layout
//!
//! ```text
//! <bucket_dir>/
//!   bucket-<hex>.xdr        canonical bucket files
//!   bucket-<hex>.xdr.gz     archived copies (optional)
//!   tmp/
//!     tmp-bucket-<16 hex>.xdr   in-progress merge output
//! ```
//!
//! # Thread Safety
//!
//! A single `parking_lot::Mutex` guards the hash→bucket map and the
//! cumulative merge statistics. No callback is invoked while it is held.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use henyey_common::fs_utils::rename_with_retry;
use henyey_common::{BucketConfig, Hash256};

use crate::bucket::{bucket_filename, compressed_bucket_filename, Bucket};
use crate::iterator::temp_bucket_filename;
use crate::metrics::{MergeCounters, MergeTimer};
use crate::{BucketError, Result};

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Supplies the scratch directory for merge output.
pub trait TempDirProvider {
    fn tmp_dir(&self) -> PathBuf;
}

/// The shared hash→bucket registry.
pub trait BucketRegistry: Send + Sync {
    /// Take ownership of a just-written bucket file.
    ///
    /// The file is renamed to its canonical name, or discarded if a bucket
    /// with the same hash already exists. Either way the returned handle is
    /// the registered one.
    fn adopt_file_as_bucket(
        &self,
        path: &Path,
        hash: Hash256,
        object_count: u64,
        byte_count: u64,
    ) -> Result<Arc<Bucket>>;

    /// Resolve a hash to a bucket. The zero hash is the empty bucket;
    /// `Ok(None)` means the bucket is unknown.
    fn get_bucket_by_hash(&self, hash: &Hash256) -> Result<Option<Arc<Bucket>>>;

    fn incr_merge_counters(&self, delta: &MergeCounters);

    fn record_merge_time(&self, elapsed: Duration);

    /// Whether merges should report counters to this registry at all.
    fn count_merge_events(&self) -> bool {
        true
    }
}

/// Runs tasks off the control thread.
pub trait BackgroundScheduler {
    fn post_on_background_thread(&self, task: Box<dyn FnOnce() + Send + 'static>, label: &str);
}

/// Source of the highest protocol version a merge may produce.
pub trait ProtocolVersionSource {
    fn max_protocol_version(&self) -> u32;
}

/// Everything the engine needs from its host.
pub trait BucketServices:
    TempDirProvider + BucketRegistry + BackgroundScheduler + ProtocolVersionSource + Send + Sync
{
}

impl<T> BucketServices for T where
    T: TempDirProvider + BucketRegistry + BackgroundScheduler + ProtocolVersionSource + Send + Sync
{
}

// ============================================================================
// BucketManager
// ============================================================================

struct ManagerState {
    buckets: HashMap<Hash256, Arc<Bucket>>,
    merge_counters: MergeCounters,
    merge_timer: MergeTimer,
}

/// Owns the bucket directory and the registry of live buckets.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use henyey_bucket::{BucketList, BucketManager, BucketServices};
///
/// let manager = Arc::new(BucketManager::new("/var/lib/node/buckets")?);
/// let services: Arc<dyn BucketServices> = manager.clone();
///
/// let mut bucket_list = BucketList::new();
/// bucket_list.add_batch(&services, 1, 25, init, live, dead)?;
///
/// // Later, drop files nobody references any more.
/// manager.forget_unreferenced_buckets()?;
/// ```
pub struct BucketManager {
    bucket_dir: PathBuf,
    tmp_dir: PathBuf,
    max_protocol_version: u32,
    count_merge_events: bool,
    rename_retry_delay: Duration,
    empty: Arc<Bucket>,
    state: Mutex<ManagerState>,
}

impl BucketManager {
    /// Create a manager rooted at `bucket_dir` with default settings.
    pub fn new(bucket_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::from_config(&BucketConfig::with_dir(bucket_dir))
    }

    /// Create a manager from configuration.
    ///
    /// Creates the bucket and temp directories and removes temp files left
    /// behind by an earlier process.
    pub fn from_config(config: &BucketConfig) -> Result<Self> {
        let bucket_dir = config.bucket_dir.clone();
        let tmp_dir = config.effective_tmp_dir();
        fs::create_dir_all(&bucket_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        let removed = clean_tmp_dir(&tmp_dir)?;
        if removed > 0 {
            tracing::info!(
                tmp_dir = %tmp_dir.display(),
                removed,
                "removed stale temp bucket files"
            );
        }

        Ok(Self {
            bucket_dir,
            tmp_dir,
            max_protocol_version: config.max_protocol_version,
            count_merge_events: config.count_merge_events,
            rename_retry_delay: config.rename_retry_delay(),
            empty: Arc::new(Bucket::empty()),
            state: Mutex::new(ManagerState {
                buckets: HashMap::new(),
                merge_counters: MergeCounters::new(),
                merge_timer: MergeTimer::default(),
            }),
        })
    }

    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    /// Canonical path of bucket `hash`.
    pub fn bucket_path(&self, hash: &Hash256) -> PathBuf {
        self.bucket_dir.join(bucket_filename(hash))
    }

    /// Path of the archived copy of bucket `hash`.
    pub fn compressed_bucket_path(&self, hash: &Hash256) -> PathBuf {
        self.bucket_dir.join(compressed_bucket_filename(hash))
    }

    /// Cumulative counters over every counted merge.
    pub fn merge_counters(&self) -> MergeCounters {
        self.state.lock().merge_counters
    }

    pub fn merge_timer(&self) -> MergeTimer {
        self.state.lock().merge_timer
    }

    /// Hashes of every registered bucket, sorted.
    pub fn known_bucket_hashes(&self) -> Vec<Hash256> {
        let mut hashes: Vec<Hash256> = self.state.lock().buckets.keys().copied().collect();
        hashes.sort();
        hashes
    }

    /// Drop every registered bucket that nobody outside the registry holds
    /// and delete its file. Returns the number of buckets forgotten.
    pub fn forget_unreferenced_buckets(&self) -> Result<usize> {
        let forgotten: Vec<Arc<Bucket>> = {
            let mut state = self.state.lock();
            let unreferenced: Vec<Hash256> = state
                .buckets
                .iter()
                .filter(|(_, bucket)| Arc::strong_count(bucket) == 1)
                .map(|(hash, _)| *hash)
                .collect();
            unreferenced
                .iter()
                .filter_map(|hash| state.buckets.remove(hash))
                .collect()
        };

        for bucket in &forgotten {
            if let Some(path) = bucket.path() {
                tracing::debug!(hash = %bucket.hash(), "forgetting unreferenced bucket");
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(forgotten.len())
    }

    /// Write a gzip-compressed copy of bucket `hash` next to the canonical
    /// file and return its path.
    pub fn export_compressed(&self, hash: &Hash256) -> Result<PathBuf> {
        let bucket = self
            .get_bucket_by_hash(hash)?
            .ok_or_else(|| BucketError::NotFound(hash.to_hex()))?;
        let src = bucket.path().ok_or_else(|| {
            BucketError::InvalidState("the empty bucket has no file to export".to_string())
        })?;

        let dest = self.compressed_bucket_path(hash);
        let mut reader = BufReader::new(File::open(src)?);
        let mut encoder = GzEncoder::new(BufWriter::new(File::create(&dest)?), Compression::default());
        std::io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?.flush()?;

        tracing::debug!(hash = %hash, path = %dest.display(), "exported compressed bucket");
        Ok(dest)
    }

    fn register_existing(&self, hash: Hash256, path: PathBuf) -> Result<Arc<Bucket>> {
        let size = fs::metadata(&path)?.len();
        let mut state = self.state.lock();
        let bucket = state
            .buckets
            .entry(hash)
            .or_insert_with(|| Arc::new(Bucket::new(hash, path, size)));
        Ok(Arc::clone(bucket))
    }

    /// Decompress an archived copy into the temp directory, verify its hash
    /// and adopt it.
    fn restore_compressed(&self, hash: &Hash256, gz_path: &Path) -> Result<Arc<Bucket>> {
        let tmp_path = self
            .tmp_dir
            .join(temp_bucket_filename(rand::random::<u64>()));
        let mut decoder = GzDecoder::new(BufReader::new(File::open(gz_path)?));
        let mut writer = BufWriter::new(
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)?,
        );

        let mut hasher = Sha256::new();
        let copied = copy_hashing(&mut decoder, &mut writer, &mut hasher);
        let bytes = match copied {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e.into());
            }
        };
        drop(writer);

        let actual = Hash256::from_bytes(hasher.finalize().into());
        if actual != *hash {
            let _ = fs::remove_file(&tmp_path);
            return Err(BucketError::HashMismatch {
                expected: hash.to_hex(),
                actual: actual.to_hex(),
            });
        }
        let objects = count_records(&tmp_path)?;

        tracing::info!(hash = %hash, bytes, "restored bucket from compressed copy");
        self.adopt_file_as_bucket(&tmp_path, *hash, objects, bytes)
    }
}

impl TempDirProvider for BucketManager {
    fn tmp_dir(&self) -> PathBuf {
        self.tmp_dir.clone()
    }
}

impl BucketRegistry for BucketManager {
    fn adopt_file_as_bucket(
        &self,
        path: &Path,
        hash: Hash256,
        object_count: u64,
        byte_count: u64,
    ) -> Result<Arc<Bucket>> {
        let mut state = self.state.lock();

        if let Some(existing) = state.buckets.get(&hash) {
            tracing::trace!(hash = %hash, "bucket already registered, discarding new file");
            fs::remove_file(path)?;
            return Ok(Arc::clone(existing));
        }

        let canonical = self.bucket_path(&hash);
        let size = if canonical.exists() {
            fs::remove_file(path)?;
            fs::metadata(&canonical)?.len()
        } else {
            rename_with_retry(path, &canonical, self.rename_retry_delay).map_err(|e| {
                BucketError::StorageFailure(format!(
                    "failed to adopt {} as {}: {}",
                    path.display(),
                    canonical.display(),
                    e
                ))
            })?;
            byte_count
        };

        tracing::debug!(
            hash = %hash,
            objects = object_count,
            bytes = size,
            "adopted bucket file"
        );

        let bucket = Arc::new(Bucket::new(hash, canonical, size));
        state.buckets.insert(hash, Arc::clone(&bucket));
        Ok(bucket)
    }

    fn get_bucket_by_hash(&self, hash: &Hash256) -> Result<Option<Arc<Bucket>>> {
        if hash.is_zero() {
            return Ok(Some(Arc::clone(&self.empty)));
        }

        if let Some(bucket) = self.state.lock().buckets.get(hash) {
            return Ok(Some(Arc::clone(bucket)));
        }

        let canonical = self.bucket_path(hash);
        if canonical.exists() {
            return self.register_existing(*hash, canonical).map(Some);
        }

        let compressed = self.compressed_bucket_path(hash);
        if compressed.exists() {
            return self.restore_compressed(hash, &compressed).map(Some);
        }

        Ok(None)
    }

    fn incr_merge_counters(&self, delta: &MergeCounters) {
        self.state.lock().merge_counters += delta;
    }

    fn record_merge_time(&self, elapsed: Duration) {
        self.state.lock().merge_timer.record(elapsed);
    }

    fn count_merge_events(&self) -> bool {
        self.count_merge_events
    }
}

impl BackgroundScheduler for BucketManager {
    fn post_on_background_thread(&self, task: Box<dyn FnOnce() + Send + 'static>, label: &str) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::trace!(label, "posting task to blocking pool");
                drop(handle.spawn_blocking(task));
            }
            Err(_) => {
                tracing::trace!(label, "posting task to dedicated thread");
                let spawned = std::thread::Builder::new()
                    .name(label.to_string())
                    .spawn(task);
                if let Err(e) = spawned {
                    tracing::error!(label, error = %e, "failed to spawn background thread");
                }
            }
        }
    }
}

impl ProtocolVersionSource for BucketManager {
    fn max_protocol_version(&self) -> u32 {
        self.max_protocol_version
    }
}

impl std::fmt::Debug for BucketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketManager")
            .field("bucket_dir", &self.bucket_dir)
            .field("tmp_dir", &self.tmp_dir)
            .field("max_protocol_version", &self.max_protocol_version)
            .field("registered", &self.state.lock().buckets.len())
            .finish()
    }
}

/// Remove `tmp-bucket-*.xdr` files from `tmp_dir`.
fn clean_tmp_dir(tmp_dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(tmp_dir)? {
        let path = entry?.path();
        let is_temp_bucket = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with("tmp-bucket-") && name.ends_with(".xdr"));
        if is_temp_bucket {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Copy `reader` into `writer`, feeding every byte to `hasher`.
fn copy_hashing<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    hasher: &mut Sha256,
) -> std::io::Result<u64> {
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            writer.flush()?;
            return Ok(total);
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

fn count_records(path: &Path) -> Result<u64> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut count = 0;
    while henyey_common::xdr_stream::read_record(&mut reader)
        .map_err(|e| BucketError::MalformedBucket(format!("{}: {}", path.display(), e)))?
        .is_some()
    {
        count += 1;
    }
    Ok(count)
}
