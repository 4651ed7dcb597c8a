//! Merge counters and timers.
//!
//! Purely observational: nothing in the merge algorithm reads these back.
//! Each merge fills in its own [`MergeCounters`]; the bucket manager folds
//! them into a cumulative total with `+=`.

use std::ops::AddAssign;
use std::time::Duration;

use crate::entry::BucketEntry;

// ============================================================================
// Merge Counters
// ============================================================================

/// Per-kind statistics for one or more merges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounters {
    /// Merges whose resolved protocol predates INIT/META entries.
    pub pre_init_entry_protocol_merges: u64,
    /// Merges whose resolved protocol supports INIT/META entries.
    pub post_init_entry_protocol_merges: u64,

    pub new_meta_entries: u64,
    pub new_init_entries: u64,
    pub new_live_entries: u64,
    pub new_dead_entries: u64,
    pub old_meta_entries: u64,
    pub old_init_entries: u64,
    pub old_live_entries: u64,
    pub old_dead_entries: u64,

    /// Old entries emitted because no new entry shared their key.
    pub old_entries_default_accepted: u64,
    /// New entries emitted because no old entry shared their key.
    pub new_entries_default_accepted: u64,
    /// Equal keys: new INIT over old DEAD, emitted as LIVE.
    pub new_init_entries_merged_with_old_dead: u64,
    /// Equal keys: old INIT under new LIVE, emitted as INIT.
    pub old_init_entries_merged_with_new_live: u64,
    /// Equal keys: old INIT under new DEAD, both dropped.
    pub old_init_entries_merged_with_new_dead: u64,
    /// Equal keys where the old entry was not INIT; new wins.
    pub new_entries_merged_with_old_neither_init: u64,

    /// Shadow cursor advances while looking for a candidate's key.
    pub shadow_scan_steps: u64,
    pub meta_entry_shadow_elisions: u64,
    pub live_entry_shadow_elisions: u64,
    pub init_entry_shadow_elisions: u64,
    pub dead_entry_shadow_elisions: u64,

    /// DEAD entries dropped by an output iterator not keeping tombstones.
    pub output_iterator_tombstone_elisions: u64,
    /// Buffered entries replaced by a later entry with the same key.
    pub output_iterator_buffer_updates: u64,
    /// Records actually written to disk (excluding META).
    pub output_iterator_actual_writes: u64,
}

impl MergeCounters {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_old_entry(&mut self, entry: &BucketEntry) {
        match entry {
            BucketEntry::Metadata(_) => self.old_meta_entries += 1,
            BucketEntry::Init(_) => self.old_init_entries += 1,
            BucketEntry::Live(_) => self.old_live_entries += 1,
            BucketEntry::Dead(_) => self.old_dead_entries += 1,
        }
    }

    pub(crate) fn record_new_entry(&mut self, entry: &BucketEntry) {
        match entry {
            BucketEntry::Metadata(_) => self.new_meta_entries += 1,
            BucketEntry::Init(_) => self.new_init_entries += 1,
            BucketEntry::Live(_) => self.new_live_entries += 1,
            BucketEntry::Dead(_) => self.new_dead_entries += 1,
        }
    }

    pub(crate) fn record_shadow_elision(&mut self, entry: &BucketEntry) {
        match entry {
            BucketEntry::Metadata(_) => self.meta_entry_shadow_elisions += 1,
            BucketEntry::Init(_) => self.init_entry_shadow_elisions += 1,
            BucketEntry::Live(_) => self.live_entry_shadow_elisions += 1,
            BucketEntry::Dead(_) => self.dead_entry_shadow_elisions += 1,
        }
    }

    /// Total number of merges counted.
    pub fn total_merges(&self) -> u64 {
        self.pre_init_entry_protocol_merges + self.post_init_entry_protocol_merges
    }

    /// Total entries elided by shadows, across kinds.
    pub fn total_shadow_elisions(&self) -> u64 {
        self.meta_entry_shadow_elisions
            + self.live_entry_shadow_elisions
            + self.init_entry_shadow_elisions
            + self.dead_entry_shadow_elisions
    }
}

impl AddAssign<&MergeCounters> for MergeCounters {
    fn add_assign(&mut self, delta: &MergeCounters) {
        self.pre_init_entry_protocol_merges += delta.pre_init_entry_protocol_merges;
        self.post_init_entry_protocol_merges += delta.post_init_entry_protocol_merges;

        self.new_meta_entries += delta.new_meta_entries;
        self.new_init_entries += delta.new_init_entries;
        self.new_live_entries += delta.new_live_entries;
        self.new_dead_entries += delta.new_dead_entries;
        self.old_meta_entries += delta.old_meta_entries;
        self.old_init_entries += delta.old_init_entries;
        self.old_live_entries += delta.old_live_entries;
        self.old_dead_entries += delta.old_dead_entries;

        self.old_entries_default_accepted += delta.old_entries_default_accepted;
        self.new_entries_default_accepted += delta.new_entries_default_accepted;
        self.new_init_entries_merged_with_old_dead += delta.new_init_entries_merged_with_old_dead;
        self.old_init_entries_merged_with_new_live += delta.old_init_entries_merged_with_new_live;
        self.old_init_entries_merged_with_new_dead += delta.old_init_entries_merged_with_new_dead;
        self.new_entries_merged_with_old_neither_init +=
            delta.new_entries_merged_with_old_neither_init;

        self.shadow_scan_steps += delta.shadow_scan_steps;
        self.meta_entry_shadow_elisions += delta.meta_entry_shadow_elisions;
        self.live_entry_shadow_elisions += delta.live_entry_shadow_elisions;
        self.init_entry_shadow_elisions += delta.init_entry_shadow_elisions;
        self.dead_entry_shadow_elisions += delta.dead_entry_shadow_elisions;

        self.output_iterator_tombstone_elisions += delta.output_iterator_tombstone_elisions;
        self.output_iterator_buffer_updates += delta.output_iterator_buffer_updates;
        self.output_iterator_actual_writes += delta.output_iterator_actual_writes;
    }
}

impl AddAssign for MergeCounters {
    fn add_assign(&mut self, delta: MergeCounters) {
        *self += &delta;
    }
}

// ============================================================================
// Merge Timer
// ============================================================================

/// Wall-clock time spent in merges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeTimer {
    /// Number of merges timed.
    pub count: u64,
    /// Total time across all timed merges.
    pub total: Duration,
}

impl MergeTimer {
    pub fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
    }

    /// Mean merge duration, zero if nothing was timed.
    pub fn mean(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total / n,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }
}
