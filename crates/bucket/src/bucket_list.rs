//! BucketList - the fixed-depth hierarchy of bucket levels.
//!
//! The BucketList holds the whole ledger state as 11 levels (0-10), each
//! with two buckets:
//!
//! - `curr`: the bucket currently accumulating merged entries
//! - `snap`: the bucket frozen at the level's last spill
//!
//! plus `next`, a [`FutureBucket`] holding the merge that will become the
//! level's new `curr`.
//!
//! ```text
//! Level 0:  [curr] [snap]   <- spills every 2 ledgers
//! Level 1:  [curr] [snap]   <- spills every 8 ledgers
//! Level 2:  [curr] [snap]   <- spills every 32 ledgers
//! ...
//! Level 10: [curr] [snap]   <- never spills
//! ```
//!
//! # Spill Mechanics
//!
//! - `level_size(N)` = 4^(N+1)
//! - `level_half(N)` = level_size(N) / 2
//! - level N spills at ledgers that are multiples of `level_half(N)` or
//!   `level_size(N)`, except the last level, which never spills
//!
//! On a spill of level `i-1`, its `curr` becomes its `snap`, level `i`
//! commits its previous merge and starts merging that snap into its `curr`.
//! The merge is shadowed by the buckets of every level younger than `i-1`.
//!
//! # Hash
//!
//! Each level hashes as `SHA256(curr_hash || snap_hash)`, and the list as
//! the SHA-256 of the concatenated level hashes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stellar_xdr::curr::{LedgerEntry, LedgerKey};

use henyey_common::Hash256;

use crate::bucket::Bucket;
use crate::future_bucket::{FutureBucket, FutureBucketSnapshot, MergeSettings};
use crate::manager::{BucketRegistry, BucketServices, ProtocolVersionSource};
use crate::{BucketError, Result};

/// Number of levels in the BucketList.
pub const BUCKET_LIST_LEVELS: usize = 11;

// ============================================================================
// BucketLevel
// ============================================================================

/// One level of the BucketList.
#[derive(Debug)]
pub struct BucketLevel {
    level: usize,
    curr: Arc<Bucket>,
    snap: Arc<Bucket>,
    next: FutureBucket,
}

impl BucketLevel {
    /// Create a new empty level.
    pub fn new(level: usize) -> Self {
        Self {
            level,
            curr: Arc::new(Bucket::empty()),
            snap: Arc::new(Bucket::empty()),
            next: FutureBucket::clear(),
        }
    }

    pub fn level_number(&self) -> usize {
        self.level
    }

    pub fn curr(&self) -> &Arc<Bucket> {
        &self.curr
    }

    pub fn snap(&self) -> &Arc<Bucket> {
        &self.snap
    }

    /// The pending merge that will become `curr`.
    pub fn next(&self) -> &FutureBucket {
        &self.next
    }

    /// SHA256(curr_hash || snap_hash).
    pub fn hash(&self) -> Hash256 {
        Hash256::hash_concat(&[self.curr.hash(), self.snap.hash()])
    }

    /// Replace `curr`, discarding any pending merge.
    pub fn set_curr(&mut self, bucket: Arc<Bucket>) {
        self.next = FutureBucket::clear();
        self.curr = bucket;
    }

    pub fn set_snap(&mut self, bucket: Arc<Bucket>) {
        self.snap = bucket;
    }

    pub fn set_next(&mut self, next: FutureBucket) {
        self.next = next;
    }

    /// Promote `next` into `curr` if its merge has already finished.
    ///
    /// Never blocks. Returns whether `curr` changed.
    pub fn commit(&mut self) -> Result<bool> {
        if self.next.is_live() && self.next.merge_complete() {
            let bucket = self.next.resolve()?;
            self.set_curr(bucket);
            return Ok(true);
        }
        Ok(false)
    }

    /// Promote `next` into `curr`, waiting for a running merge.
    pub fn resolve_and_commit(&mut self) -> Result<()> {
        if self.next.is_live() {
            let bucket = self.next.resolve()?;
            self.set_curr(bucket);
        } else if self.next.has_hashes() {
            return Err(BucketError::InvalidState(format!(
                "level {} has a persisted merge that was never restarted",
                self.level
            )));
        }
        Ok(())
    }

    /// Wait for a running merge without committing it.
    pub fn resolve_next(&mut self) -> Result<()> {
        if self.next.is_merging() {
            self.next.resolve()?;
        }
        Ok(())
    }

    /// Merge `fresh` into level 0's `curr` on the calling thread.
    ///
    /// Level 0 merges are small and committed straight away, so they never
    /// go through the background scheduler.
    pub fn prepare_first_level(
        &mut self,
        services: &Arc<dyn BucketServices>,
        protocol_version: u32,
        fresh: Arc<Bucket>,
        count_merge_events: bool,
    ) -> Result<()> {
        if self.level != 0 {
            return Err(BucketError::InvalidState(format!(
                "prepare_first_level called on level {}",
                self.level
            )));
        }
        if !self.next.is_clear() {
            return Err(BucketError::InvalidState(format!(
                "level 0 prepared while its next merge is {:?}",
                self.next.state()
            )));
        }

        let merged = Bucket::merge(
            &**services,
            protocol_version,
            &self.curr,
            &fresh,
            &[],
            BucketList::keep_dead_entries(0),
            count_merge_events,
        )?;
        tracing::debug!(level = 0, merged = %merged.hash(), "level 0 merge complete");
        self.set_curr(merged);
        Ok(())
    }

    /// Move `curr` into `snap`, leaving `curr` empty. Returns the new snap.
    pub fn snap_curr(&mut self) -> Arc<Bucket> {
        self.snap = std::mem::replace(&mut self.curr, Arc::new(Bucket::empty()));
        tracing::trace!(level = self.level, snap = %self.snap.hash(), "snapped level");
        Arc::clone(&self.snap)
    }

    /// Start merging `snap` from the level below into this level.
    ///
    /// `curr` is replaced by the empty bucket when the level is about to
    /// snap before the merge would be committed.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare(
        &mut self,
        services: &Arc<dyn BucketServices>,
        current_ledger: u32,
        protocol_version: u32,
        snap: Arc<Bucket>,
        shadows: Vec<Arc<Bucket>>,
        count_merge_events: bool,
    ) -> Result<()> {
        if !self.next.is_clear() {
            return Err(BucketError::InvalidState(format!(
                "level {} prepared while its next merge is {:?}",
                self.level,
                self.next.state()
            )));
        }

        let curr = if BucketList::should_merge_with_empty_curr(current_ledger, self.level) {
            Arc::new(Bucket::empty())
        } else {
            Arc::clone(&self.curr)
        };

        tracing::debug!(
            level = self.level,
            ledger = current_ledger,
            curr = %curr.hash(),
            snap = %snap.hash(),
            shadows = shadows.len(),
            "preparing level merge"
        );

        self.next = FutureBucket::start_merge(
            services,
            curr,
            snap,
            shadows,
            MergeSettings {
                max_protocol_version: protocol_version,
                keep_dead_entries: BucketList::keep_dead_entries(self.level),
                count_merge_events,
            },
        )?;
        Ok(())
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Persisted form of one level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLevelSnapshot {
    pub curr: String,
    pub next: FutureBucketSnapshot,
    pub snap: String,
}

/// Persisted form of a BucketList, one entry per level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketListSnapshot {
    pub levels: Vec<BucketLevelSnapshot>,
}

// ============================================================================
// BucketList
// ============================================================================

/// The full bucket hierarchy.
#[derive(Debug)]
pub struct BucketList {
    levels: Vec<BucketLevel>,
    count_merge_events: bool,
}

impl BucketList {
    /// Number of levels in the BucketList.
    pub const NUM_LEVELS: usize = BUCKET_LIST_LEVELS;

    /// Create a new empty BucketList.
    pub fn new() -> Self {
        Self {
            levels: (0..BUCKET_LIST_LEVELS).map(BucketLevel::new).collect(),
            count_merge_events: true,
        }
    }

    /// Whether merges started by this list report their counters.
    ///
    /// Counters are reported only if the registry also asks for them.
    pub fn set_count_merge_events(&mut self, count: bool) {
        self.count_merge_events = count;
    }

    pub fn levels(&self) -> &[BucketLevel] {
        &self.levels
    }

    pub fn level(&self, idx: usize) -> Option<&BucketLevel> {
        self.levels.get(idx)
    }

    pub fn level_mut(&mut self, idx: usize) -> Option<&mut BucketLevel> {
        self.levels.get_mut(idx)
    }

    /// SHA-256 over every level hash.
    pub fn hash(&self) -> Hash256 {
        let level_hashes: Vec<Hash256> = self.levels.iter().map(BucketLevel::hash).collect();
        Hash256::hash_concat(&level_hashes)
    }

    /// Add one closed ledger's changes.
    ///
    /// Walks the levels from the oldest down to 1, spilling each level whose
    /// younger neighbour is due, then merges a fresh bucket of the batch into
    /// level 0. Level 0's merge is committed before returning; merges on
    /// deeper levels keep running in the background.
    #[allow(clippy::too_many_arguments)]
    pub fn add_batch(
        &mut self,
        services: &Arc<dyn BucketServices>,
        current_ledger: u32,
        protocol_version: u32,
        init_entries: Vec<LedgerEntry>,
        live_entries: Vec<LedgerEntry>,
        dead_entries: Vec<LedgerKey>,
    ) -> Result<()> {
        if current_ledger == 0 {
            return Err(BucketError::InvalidState(
                "ledger sequence must be > 0".to_string(),
            ));
        }
        let max_protocol_version = services.max_protocol_version();
        if protocol_version > max_protocol_version {
            return Err(BucketError::ProtocolViolation(format!(
                "ledger protocol {} exceeds max protocol version {}",
                protocol_version, max_protocol_version
            )));
        }

        tracing::debug!(
            ledger = current_ledger,
            protocol_version,
            init = init_entries.len(),
            live = live_entries.len(),
            dead = dead_entries.len(),
            "adding batch to bucket list"
        );

        let count_merge_events = self.count_merge_events && services.count_merge_events();

        // Shadows for level i are the buckets of levels 0..=i-2.
        let mut shadows: Vec<Arc<Bucket>> = self
            .levels
            .iter()
            .flat_map(|level| [Arc::clone(&level.curr), Arc::clone(&level.snap)])
            .collect();
        shadows.truncate(shadows.len().saturating_sub(2));

        for i in (1..BUCKET_LIST_LEVELS).rev() {
            shadows.truncate(shadows.len().saturating_sub(2));
            if Self::level_should_spill(current_ledger, i - 1) {
                let snap = self.levels[i - 1].snap_curr();
                self.levels[i].resolve_and_commit()?;
                self.levels[i].prepare(
                    services,
                    current_ledger,
                    protocol_version,
                    snap,
                    shadows.clone(),
                    count_merge_events,
                )?;
            }
        }

        let fresh = Bucket::fresh(
            &**services,
            protocol_version,
            init_entries,
            live_entries,
            dead_entries,
            count_merge_events,
        )?;
        self.levels[0].prepare_first_level(services, protocol_version, fresh, count_merge_events)
    }

    /// Wait for every running merge, leaving the results in `next`.
    pub fn resolve_all_pending_merges(&mut self) -> Result<()> {
        for level in &mut self.levels {
            level.resolve_next()?;
        }
        Ok(())
    }

    /// Every hash referenced by the list: `curr`, `snap`, and the inputs or
    /// output of each `next`.
    pub fn all_bucket_hashes(&self) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(BUCKET_LIST_LEVELS * 3);
        for level in &self.levels {
            hashes.push(level.curr.hash());
            hashes.push(level.snap.hash());
            hashes.extend(level.next.hashes());
        }
        hashes
    }

    /// The persisted form of the list. Running merges are written as their
    /// input hashes.
    pub fn to_snapshot(&self) -> BucketListSnapshot {
        BucketListSnapshot {
            levels: self
                .levels
                .iter()
                .map(|level| BucketLevelSnapshot {
                    curr: level.curr.hash().to_hex(),
                    next: level.next.to_snapshot(),
                    snap: level.snap.hash().to_hex(),
                })
                .collect(),
        }
    }

    /// Rebuild a list from its persisted form.
    ///
    /// Pending merges come back hash-only; call [`BucketList::restart_merges`]
    /// before adding the next batch.
    pub fn restore<R>(registry: &R, snapshot: &BucketListSnapshot) -> Result<Self>
    where
        R: BucketRegistry + ?Sized,
    {
        if snapshot.levels.len() != BUCKET_LIST_LEVELS {
            return Err(BucketError::Serialization(format!(
                "expected {} levels, got {}",
                BUCKET_LIST_LEVELS,
                snapshot.levels.len()
            )));
        }

        let load = |field: &str, hex: &str| -> Result<Arc<Bucket>> {
            let hash = Hash256::from_hex(hex)
                .map_err(|e| BucketError::Serialization(format!("invalid {} hash: {}", field, e)))?;
            registry
                .get_bucket_by_hash(&hash)?
                .ok_or_else(|| BucketError::NotFound(hash.to_hex()))
        };

        let mut list = Self::new();
        for (level, persisted) in list.levels.iter_mut().zip(&snapshot.levels) {
            level.curr = load("curr", &persisted.curr)?;
            level.snap = load("snap", &persisted.snap)?;
            level.next = FutureBucket::from_snapshot(&persisted.next)?;
        }
        Ok(list)
    }

    /// Make every hash-only `next` live again, restarting interrupted merges.
    pub fn restart_merges(
        &mut self,
        services: &Arc<dyn BucketServices>,
        max_protocol_version: u32,
    ) -> Result<()> {
        let count_merge_events = self.count_merge_events && services.count_merge_events();
        for level in &mut self.levels {
            if !level.next.has_hashes() {
                continue;
            }
            tracing::info!(level = level.level, "restarting level merge");
            level.next.make_live(
                services,
                MergeSettings {
                    max_protocol_version,
                    keep_dead_entries: Self::keep_dead_entries(level.level),
                    count_merge_events,
                },
            )?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Leveling schedule
    // ------------------------------------------------------------------------

    /// Round down `value` to a multiple of the power of two `modulus`.
    pub fn round_down(value: u32, modulus: u32) -> u32 {
        value & !(modulus - 1)
    }

    /// Idealized size of a level: 4, 16, 64, 256, ...
    pub fn level_size(level: usize) -> u32 {
        1u32 << (2 * (level + 1))
    }

    /// Half the idealized size of a level: 2, 8, 32, 128, ...
    pub fn level_half(level: usize) -> u32 {
        Self::level_size(level) >> 1
    }

    /// Whether `level` spills at `ledger`.
    pub fn level_should_spill(ledger: u32, level: usize) -> bool {
        if level == BUCKET_LIST_LEVELS - 1 {
            return false;
        }
        ledger == Self::round_down(ledger, Self::level_half(level))
            || ledger == Self::round_down(ledger, Self::level_size(level))
    }

    /// Tombstones are kept everywhere but the last level.
    pub fn keep_dead_entries(level: usize) -> bool {
        level < BUCKET_LIST_LEVELS - 1
    }

    /// Whether a merge into `level` prepared at `ledger` must ignore the
    /// level's `curr`, because the level snaps before the merge lands.
    pub fn should_merge_with_empty_curr(ledger: u32, level: usize) -> bool {
        if level == 0 {
            return false;
        }
        let next_change_ledger = ledger.wrapping_add(Self::level_half(level - 1));
        Self::level_should_spill(next_change_ledger, level)
    }

    /// Number of ledgers whose changes live in `level`'s `curr`.
    pub fn size_of_curr(ledger: u32, level: usize) -> u32 {
        if ledger == 0 {
            return 0;
        }
        if level == 0 {
            return if ledger == 1 { 1 } else { 1 + ledger % 2 };
        }

        let size = Self::level_size(level);
        let half = Self::level_half(level);
        if level != BUCKET_LIST_LEVELS - 1 && Self::round_down(ledger, half) != 0 {
            let size_delta = 1u32 << (2 * level - 1);
            if Self::round_down(ledger, half) == ledger || Self::round_down(ledger, size) == ledger
            {
                return size_delta;
            }

            let prev_size = Self::level_size(level - 1);
            let prev_half = Self::level_half(level - 1);
            let previous_relevant_ledger = [prev_half, prev_size, half, size]
                .into_iter()
                .map(|m| Self::round_down(ledger - 1, m))
                .fold(0, u32::max);

            if Self::round_down(ledger, prev_half) == ledger
                || Self::round_down(ledger, prev_size) == ledger
            {
                size_delta + Self::size_of_curr(previous_relevant_ledger, level)
            } else {
                Self::size_of_curr(previous_relevant_ledger, level)
            }
        } else {
            ledger.saturating_sub(Self::size_of_younger_levels(ledger, level))
        }
    }

    /// Number of ledgers whose changes live in `level`'s `snap`.
    pub fn size_of_snap(ledger: u32, level: usize) -> u32 {
        if ledger == 0 || level == BUCKET_LIST_LEVELS - 1 {
            0
        } else if Self::round_down(ledger, Self::level_size(level)) != 0 {
            Self::level_half(level)
        } else {
            ledger.saturating_sub(
                Self::size_of_younger_levels(ledger, level) + Self::size_of_curr(ledger, level),
            )
        }
    }

    /// Oldest ledger in `level`'s `curr`, `u32::MAX` if it holds none.
    pub fn oldest_ledger_in_curr(ledger: u32, level: usize) -> u32 {
        if Self::size_of_curr(ledger, level) == 0 {
            return u32::MAX;
        }
        ledger - Self::size_of_younger_levels(ledger, level) - Self::size_of_curr(ledger, level) + 1
    }

    /// Oldest ledger in `level`'s `snap`, `u32::MAX` if it holds none.
    pub fn oldest_ledger_in_snap(ledger: u32, level: usize) -> u32 {
        if Self::size_of_snap(ledger, level) == 0 {
            return u32::MAX;
        }
        ledger - Self::size_of_younger_levels(ledger, level + 1) + 1
    }

    fn size_of_younger_levels(ledger: u32, level: usize) -> u32 {
        (0..level)
            .map(|l| Self::size_of_curr(ledger, l) + Self::size_of_snap(ledger, l))
            .sum()
    }
}

impl Default for BucketList {
    fn default() -> Self {
        Self::new()
    }
}
