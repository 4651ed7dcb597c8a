//! Streaming bucket iterators.
//!
//! - [`BucketInputIterator`]: forward-only reader over a bucket file
//! - [`BucketOutputIterator`]: append-only writer with keep-last
//!   deduplication that finalizes into a content-addressed bucket
//!
//! Both operate on the uncompressed on-disk format: a sequence of
//! record-marked XDR `BucketEntry` frames (see
//! [`henyey_common::xdr_stream`]), with an optional leading META record.
//!
//! ```ignore
//! let mut out = BucketOutputIterator::new(&tmp_dir, protocol_version, true)?;
//! out.put(entry, &mut counters)?;
//! let bucket = out.finish(&*registry, &mut counters)?;
//!
//! let mut iter = bucket.iter()?;
//! while let Some(entry) = iter.next()? {
//!     // ...
//! }
//! ```

use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use henyey_common::xdr_stream::{read_record, write_record};
use henyey_common::{supports_init_and_meta_entries, Hash256};
use sha2::{Digest, Sha256};
use stellar_xdr::curr::{BucketMetadata, BucketMetadataExt, LedgerKey};

use crate::bucket::Bucket;
use crate::entry::{bucket_cmp, check_protocol_legality, compare_keys, BucketEntry};
use crate::manager::BucketRegistry;
use crate::metrics::MergeCounters;
use crate::{BucketError, Result};

// ============================================================================
// Bucket Input Iterator
// ============================================================================

/// A forward-only iterator over the entries of one bucket.
///
/// The leading META record, if any, is consumed on open and exposed through
/// [`metadata`](Self::metadata); iteration yields only data entries. The
/// iterator holds at most one decoded entry at a time.
pub struct BucketInputIterator {
    /// `None` for the empty bucket.
    reader: Option<BufReader<File>>,
    path: Option<PathBuf>,
    current: Option<BucketEntry>,
    metadata: Option<BucketMetadata>,
    /// Key of the last data entry read, for the strict ordering check.
    last_key: Option<LedgerKey>,
    seen_other_entries: bool,
    entries_read: usize,
    bytes_read: usize,
}

impl BucketInputIterator {
    /// An iterator over `bucket`; empty for the empty bucket.
    pub fn new(bucket: &Bucket) -> Result<Self> {
        match bucket.path() {
            Some(path) if !bucket.is_empty() => Self::open(path),
            _ => Ok(Self::empty()),
        }
    }

    /// Opens a bucket file for streaming iteration.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        let mut iter = Self {
            reader: Some(BufReader::new(file)),
            path: Some(path),
            current: None,
            metadata: None,
            last_key: None,
            seen_other_entries: false,
            entries_read: 0,
            bytes_read: 0,
        };
        iter.load_entry()?;
        Ok(iter)
    }

    /// An iterator with no entries and no metadata.
    pub fn empty() -> Self {
        Self {
            reader: None,
            path: None,
            current: None,
            metadata: None,
            last_key: None,
            seen_other_entries: false,
            entries_read: 0,
            bytes_read: 0,
        }
    }

    fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        match read_record(reader) {
            Ok(frame) => Ok(frame),
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
            ) =>
            {
                Err(BucketError::MalformedBucket(format!(
                    "bad record in {}: {}",
                    self.display_path(),
                    e
                )))
            }
            Err(e) => Err(BucketError::Io(e)),
        }
    }

    /// Loads the next data entry, validating any META on the way.
    fn load_entry(&mut self) -> Result<()> {
        loop {
            let Some(data) = self.read_frame()? else {
                self.current = None;
                self.reader = None;
                return Ok(());
            };
            self.bytes_read += 4 + data.len();

            let entry = BucketEntry::from_xdr(&data)?;
            if let BucketEntry::Metadata(meta) = entry {
                if self.metadata.is_some() {
                    return Err(BucketError::MalformedBucket(format!(
                        "multiple METAENTRY in {}",
                        self.display_path()
                    )));
                }
                if self.seen_other_entries {
                    return Err(BucketError::MalformedBucket(format!(
                        "METAENTRY after other entries in {}",
                        self.display_path()
                    )));
                }
                if !supports_init_and_meta_entries(meta.ledger_version) {
                    return Err(BucketError::MalformedBucket(format!(
                        "METAENTRY with protocol {} in {}",
                        meta.ledger_version,
                        self.display_path()
                    )));
                }
                self.metadata = Some(meta);
                continue;
            }

            let key = entry.ledger_key()?;
            if let Some(last) = &self.last_key {
                if compare_keys(last, &key) != Ordering::Less {
                    return Err(BucketError::MalformedBucket(format!(
                        "entries out of order or duplicated in {}",
                        self.display_path()
                    )));
                }
            }
            self.last_key = Some(key);

            self.seen_other_entries = true;
            self.entries_read += 1;
            self.current = Some(entry);
            return Ok(());
        }
    }

    fn display_path(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<empty bucket>".to_string())
    }

    /// Returns the next entry, advancing the iterator.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<BucketEntry>> {
        let current = self.current.take();
        if current.is_some() {
            self.load_entry()?;
        }
        Ok(current)
    }

    /// Drops the current entry and loads the following one.
    pub fn advance(&mut self) -> Result<()> {
        self.next().map(|_| ())
    }

    /// Returns a reference to the current entry without advancing.
    pub fn peek(&self) -> Option<&BucketEntry> {
        self.current.as_ref()
    }

    /// Returns true if the iterator has more entries.
    pub fn has_next(&self) -> bool {
        self.current.is_some()
    }

    /// Returns true if the file carried a META record.
    pub fn seen_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    /// Returns the bucket metadata if present.
    pub fn metadata(&self) -> Option<&BucketMetadata> {
        self.metadata.as_ref()
    }

    /// Ledger protocol recorded in the META record, 0 if absent.
    pub fn protocol_version(&self) -> u32 {
        self.metadata.as_ref().map_or(0, |m| m.ledger_version)
    }

    /// Number of data entries read so far.
    pub fn entries_read(&self) -> usize {
        self.entries_read
    }

    /// Number of file bytes consumed so far.
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    /// Collects all remaining entries into a vector.
    pub fn collect_all(mut self) -> Result<Vec<BucketEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next()? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl std::fmt::Debug for BucketInputIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketInputIterator")
            .field("path", &self.path)
            .field("entries_read", &self.entries_read)
            .field("bytes_read", &self.bytes_read)
            .field("has_current", &self.current.is_some())
            .finish()
    }
}

// ============================================================================
// Bucket Output Iterator
// ============================================================================

/// A writer for bucket entries with keep-last deduplication.
///
/// Entries must be put in non-decreasing [`bucket_cmp`] order. The most
/// recent entry is held in a one-slot buffer and only written once an entry
/// with a strictly greater key arrives (an equal key replaces it), so the
/// finished file never contains two entries for the same key.
///
/// For protocol 11+ a META record is written ahead of the first data entry.
/// If no data entry is ever written the temp file is removed and
/// [`finish`](Self::finish) returns the empty bucket.
pub struct BucketOutputIterator {
    /// Taken by `finish`; `Drop` removes the temp file if still present.
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    buffer: Option<BucketEntry>,
    keep_dead_entries: bool,
    protocol_version: u32,
    wrote_metadata: bool,
    /// SHA-256 over every byte written, framing included.
    hasher: Sha256,
    objects_written: u64,
    bytes_written: u64,
}

impl BucketOutputIterator {
    /// Creates a writer on a fresh `tmp-bucket-<16 hex>.xdr` in `tmp_dir`.
    pub fn new(tmp_dir: &Path, protocol_version: u32, keep_dead_entries: bool) -> Result<Self> {
        fs::create_dir_all(tmp_dir)?;
        let (file, path) = create_temp_bucket_file(tmp_dir)?;

        Ok(Self {
            writer: Some(BufWriter::new(file)),
            path,
            buffer: None,
            keep_dead_entries,
            protocol_version,
            wrote_metadata: false,
            hasher: Sha256::new(),
            objects_written: 0,
            bytes_written: 0,
        })
    }

    /// Adds an entry.
    ///
    /// DEAD entries are dropped when the writer does not keep tombstones.
    /// META may not be put explicitly; it is derived from the protocol.
    pub fn put(&mut self, entry: BucketEntry, counters: &mut MergeCounters) -> Result<()> {
        check_protocol_legality(&entry, self.protocol_version)?;
        if entry.is_metadata() {
            return Err(BucketError::MalformedBucket(
                "explicit METAENTRY put into output iterator".to_string(),
            ));
        }

        if entry.is_dead() && !self.keep_dead_entries {
            counters.output_iterator_tombstone_elisions += 1;
            return Ok(());
        }

        match self.buffer.as_ref().map(|buffered| bucket_cmp(buffered, &entry)) {
            None => {
                self.buffer = Some(entry);
            }
            Some(Ordering::Less) => {
                self.flush_buffer(counters)?;
                self.buffer = Some(entry);
            }
            Some(Ordering::Equal) => {
                counters.output_iterator_buffer_updates += 1;
                self.buffer = Some(entry);
            }
            Some(Ordering::Greater) => {
                return Err(BucketError::MalformedBucket(format!(
                    "unsorted put into {}: {:?} after {:?}",
                    self.path.display(),
                    entry.key(),
                    self.buffer.as_ref().and_then(BucketEntry::key)
                )));
            }
        }
        Ok(())
    }

    fn flush_buffer(&mut self, counters: &mut MergeCounters) -> Result<()> {
        if let Some(entry) = self.buffer.take() {
            self.maybe_write_metadata()?;
            self.write_entry_raw(&entry)?;
            counters.output_iterator_actual_writes += 1;
        }
        Ok(())
    }

    fn maybe_write_metadata(&mut self) -> Result<()> {
        if self.wrote_metadata {
            return Ok(());
        }
        self.wrote_metadata = true;

        if supports_init_and_meta_entries(self.protocol_version) {
            let meta = BucketEntry::Metadata(BucketMetadata {
                ledger_version: self.protocol_version,
                ext: BucketMetadataExt::V0,
            });
            self.write_entry_raw(&meta)?;
        }
        Ok(())
    }

    fn write_entry_raw(&mut self, entry: &BucketEntry) -> Result<()> {
        let data = entry.to_xdr()?;
        let writer = self.writer.as_mut().ok_or_else(|| {
            BucketError::InvalidState("output iterator already finished".to_string())
        })?;

        let mut framed = Vec::with_capacity(4 + data.len());
        write_record(&mut framed, &data)?;
        writer.write_all(&framed)?;
        self.hasher.update(&framed);

        self.objects_written += 1;
        self.bytes_written += framed.len() as u64;
        Ok(())
    }

    /// Flushes the buffered entry, closes the file and hands it to the
    /// registry for adoption under its content hash.
    pub fn finish<R>(mut self, registry: &R, counters: &mut MergeCounters) -> Result<Arc<Bucket>>
    where
        R: BucketRegistry + ?Sized,
    {
        self.flush_buffer(counters)?;

        let writer = self.writer.take().ok_or_else(|| {
            BucketError::InvalidState("output iterator already finished".to_string())
        })?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        if self.objects_written == 0 {
            tracing::trace!(path = %self.path.display(), "removing empty bucket output");
            fs::remove_file(&self.path)?;
            return Ok(Arc::new(Bucket::empty()));
        }

        let hash = Hash256::from_bytes(self.hasher.clone().finalize().into());
        registry.adopt_file_as_bucket(&self.path, hash, self.objects_written, self.bytes_written)
    }

    /// Number of records written so far, META included.
    pub fn objects_written(&self) -> u64 {
        self.objects_written
    }

    /// Number of bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Path of the temp file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BucketOutputIterator {
    fn drop(&mut self) {
        // Abandoned before finish (merge error): discard the partial file.
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl std::fmt::Debug for BucketOutputIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketOutputIterator")
            .field("path", &self.path)
            .field("protocol_version", &self.protocol_version)
            .field("objects_written", &self.objects_written)
            .field("bytes_written", &self.bytes_written)
            .field("has_buffer", &self.buffer.is_some())
            .finish()
    }
}

/// Name of a temp merge-output file.
pub fn temp_bucket_filename(nonce: u64) -> String {
    format!("tmp-bucket-{:016x}.xdr", nonce)
}

fn create_temp_bucket_file(tmp_dir: &Path) -> Result<(File, PathBuf)> {
    loop {
        let path = tmp_dir.join(temp_bucket_filename(rand::random::<u64>()));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(BucketError::Io(e)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
