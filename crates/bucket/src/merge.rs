//! Bucket merging.
//!
//! A merge streams two sorted buckets, `old` and `new`, into one sorted
//! output, with entries from `new` winning on equal keys:
//!
//! ```text
//! Old Bucket: [A=1, C=3, E=5]
//! New Bucket: [B=2, C=30, D=4]
//! Merged:     [A=1, B=2, C=30, D=4, E=5]
//! ```
//!
//! # Protocol Version
//!
//! The output's protocol is the maximum of the inputs' and shadows' META
//! versions. A merge whose inputs are newer than the caller's ceiling fails
//! with [`BucketError::ProtocolViolation`]. From protocol 11 the INIT
//! lifecycle is active and INIT/DEAD entries are never shadow-elided.
//!
//! # Equal-Key Lifecycle Rules
//!
//! | Old      | New      | Output                          |
//! |----------|----------|---------------------------------|
//! | `DEAD`   | `INIT=x` | `LIVE=x`                        |
//! | other    | `INIT`   | error: old non-DEAD + new INIT  |
//! | `INIT`   | `LIVE=y` | `INIT=y`                        |
//! | `INIT`   | `DEAD`   | nothing (annihilated)           |
//! | `LIVE`/`DEAD` | any | new entry                      |
//!
//! # Shadows
//!
//! Shadows are buckets from younger levels. A candidate output entry whose
//! key appears in any shadow is redundant (the younger level already
//! supersedes it) and is dropped, except for INIT and DEAD entries once the
//! lifecycle is active. Each shadow is scanned with its own cursor, which
//! only ever moves forward since candidates arrive in sorted order.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use henyey_common::supports_init_and_meta_entries;

use crate::bucket::Bucket;
use crate::entry::{bucket_cmp, check_protocol_legality, BucketEntry};
use crate::iterator::{BucketInputIterator, BucketOutputIterator};
use crate::manager::{BucketRegistry, TempDirProvider};
use crate::metrics::MergeCounters;
use crate::{BucketError, Result};

/// Arguments of one merge.
pub(crate) struct MergeInputs<'a> {
    pub max_protocol_version: u32,
    pub old: &'a Arc<Bucket>,
    pub new: &'a Arc<Bucket>,
    pub shadows: &'a [Arc<Bucket>],
    pub keep_dead_entries: bool,
    pub count_merge_events: bool,
}

/// Run a full merge and return the adopted output bucket.
pub(crate) fn merge_buckets<S>(services: &S, inputs: MergeInputs<'_>) -> Result<Arc<Bucket>>
where
    S: TempDirProvider + BucketRegistry + ?Sized,
{
    let start = Instant::now();
    let mut counters = MergeCounters::new();

    let mut old_iter = inputs.old.iter()?;
    let mut new_iter = inputs.new.iter()?;
    let mut shadow_iters = inputs
        .shadows
        .iter()
        .map(|shadow| shadow.iter())
        .collect::<Result<Vec<_>>>()?;

    let protocol_version = calculate_merge_protocol_version(
        inputs.max_protocol_version,
        &old_iter,
        &new_iter,
        &shadow_iters,
        &mut counters,
    )?;
    let keep_shadowed_lifecycle_entries = supports_init_and_meta_entries(protocol_version);

    tracing::debug!(
        old = %inputs.old.hash(),
        new = %inputs.new.hash(),
        shadows = inputs.shadows.len(),
        protocol_version,
        keep_dead_entries = inputs.keep_dead_entries,
        "starting bucket merge"
    );

    let mut out = BucketOutputIterator::new(
        &services.tmp_dir(),
        protocol_version,
        inputs.keep_dead_entries,
    )?;
    let mut ctx = MergeContext {
        protocol_version,
        keep_shadowed_lifecycle_entries,
        shadows: &mut shadow_iters,
        counters: &mut counters,
    };

    while old_iter.has_next() || new_iter.has_next() {
        if !ctx.merge_default_acceptance(&mut old_iter, &mut new_iter, &mut out)? {
            ctx.merge_equal_keys(&mut old_iter, &mut new_iter, &mut out)?;
        }
    }

    let bucket = out.finish(services, &mut counters)?;
    let elapsed = start.elapsed();

    if inputs.count_merge_events {
        services.incr_merge_counters(&counters);
    }
    services.record_merge_time(elapsed);

    tracing::debug!(
        old = %inputs.old.hash(),
        new = %inputs.new.hash(),
        output = %bucket.hash(),
        writes = counters.output_iterator_actual_writes,
        shadow_elisions = counters.total_shadow_elisions(),
        elapsed_ms = elapsed.as_millis() as u64,
        "finished bucket merge"
    );

    Ok(bucket)
}

/// The output protocol: max of every input's META version, bounded above.
fn calculate_merge_protocol_version(
    max_protocol_version: u32,
    old: &BucketInputIterator,
    new: &BucketInputIterator,
    shadows: &[BucketInputIterator],
    counters: &mut MergeCounters,
) -> Result<u32> {
    let protocol_version = shadows
        .iter()
        .map(BucketInputIterator::protocol_version)
        .fold(
            old.protocol_version().max(new.protocol_version()),
            u32::max,
        );

    if protocol_version > max_protocol_version {
        return Err(BucketError::ProtocolViolation(format!(
            "bucket protocol version {} exceeds max protocol version {}",
            protocol_version, max_protocol_version
        )));
    }

    if supports_init_and_meta_entries(protocol_version) {
        counters.post_init_entry_protocol_merges += 1;
    } else {
        counters.pre_init_entry_protocol_merges += 1;
    }
    Ok(protocol_version)
}

struct MergeContext<'a> {
    protocol_version: u32,
    keep_shadowed_lifecycle_entries: bool,
    shadows: &'a mut [BucketInputIterator],
    counters: &'a mut MergeCounters,
}

impl MergeContext<'_> {
    /// Emit whichever head sorts strictly first. Returns false when both
    /// heads share a key.
    fn merge_default_acceptance(
        &mut self,
        old: &mut BucketInputIterator,
        new: &mut BucketInputIterator,
        out: &mut BucketOutputIterator,
    ) -> Result<bool> {
        let order = match (old.peek(), new.peek()) {
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(o), Some(n)) => bucket_cmp(o, n),
            (None, None) => return Ok(true),
        };

        let (source, is_old) = match order {
            Ordering::Less => (old, true),
            Ordering::Greater => (new, false),
            Ordering::Equal => return Ok(false),
        };
        let Some(entry) = source.next()? else {
            return Ok(true);
        };

        check_protocol_legality(&entry, self.protocol_version)?;
        if is_old {
            self.counters.old_entries_default_accepted += 1;
            self.counters.record_old_entry(&entry);
        } else {
            self.counters.new_entries_default_accepted += 1;
            self.counters.record_new_entry(&entry);
        }
        self.maybe_put(entry, out)?;
        Ok(true)
    }

    /// Apply the equal-key lifecycle rules and advance both inputs.
    fn merge_equal_keys(
        &mut self,
        old: &mut BucketInputIterator,
        new: &mut BucketInputIterator,
        out: &mut BucketOutputIterator,
    ) -> Result<()> {
        let (Some(old_entry), Some(new_entry)) = (old.next()?, new.next()?) else {
            return Err(BucketError::InvalidState(
                "equal-key merge step with an exhausted input".to_string(),
            ));
        };
        check_protocol_legality(&old_entry, self.protocol_version)?;
        check_protocol_legality(&new_entry, self.protocol_version)?;
        self.counters.record_old_entry(&old_entry);
        self.counters.record_new_entry(&new_entry);

        match (old_entry, new_entry) {
            (BucketEntry::Dead(_), BucketEntry::Init(entry)) => {
                self.counters.new_init_entries_merged_with_old_dead += 1;
                self.maybe_put(BucketEntry::Live(entry), out)
            }
            (_, BucketEntry::Init(_)) => Err(BucketError::MalformedBucket(
                "old non-DEAD + new INIT".to_string(),
            )),
            (BucketEntry::Init(_), BucketEntry::Live(entry)) => {
                self.counters.old_init_entries_merged_with_new_live += 1;
                self.maybe_put(BucketEntry::Init(entry), out)
            }
            (BucketEntry::Init(_), BucketEntry::Dead(_)) => {
                self.counters.old_init_entries_merged_with_new_dead += 1;
                Ok(())
            }
            (BucketEntry::Init(_), BucketEntry::Metadata(_)) => Err(
                BucketError::MalformedBucket("old INIT + new non-LIVE/DEAD".to_string()),
            ),
            (BucketEntry::Metadata(_), _) | (_, BucketEntry::Metadata(_)) => Err(
                BucketError::MalformedBucket("METAENTRY in merge input stream".to_string()),
            ),
            (BucketEntry::Live(_) | BucketEntry::Dead(_), entry) => {
                self.counters.new_entries_merged_with_old_neither_init += 1;
                self.maybe_put(entry, out)
            }
        }
    }

    /// Write `entry` unless a shadow already holds its key.
    fn maybe_put(&mut self, entry: BucketEntry, out: &mut BucketOutputIterator) -> Result<()> {
        if self.keep_shadowed_lifecycle_entries && (entry.is_init() || entry.is_dead()) {
            return out.put(entry, self.counters);
        }

        for shadow in self.shadows.iter_mut() {
            while let Some(head) = shadow.peek() {
                if bucket_cmp(head, &entry) != Ordering::Less {
                    break;
                }
                self.counters.shadow_scan_steps += 1;
                shadow.advance()?;
            }
            if shadow
                .peek()
                .is_some_and(|head| bucket_cmp(&entry, head) == Ordering::Equal)
            {
                self.counters.record_shadow_elision(&entry);
                return Ok(());
            }
        }

        out.put(entry, self.counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::BucketManager;
    use stellar_xdr::curr::*;
    use crate::BucketEntry; // Re-import to shadow XDR's BucketEntry
    use tempfile::TempDir;

    fn make_account_id(bytes: [u8; 32]) -> AccountId {
        AccountId(PublicKey::PublicKeyTypeEd25519(Uint256(bytes)))
    }

    fn make_account_entry(bytes: [u8; 32], balance: i64) -> LedgerEntry {
        LedgerEntry {
            last_modified_ledger_seq: 1,
            data: LedgerEntryData::Account(AccountEntry {
                account_id: make_account_id(bytes),
                balance,
                seq_num: SequenceNumber(1),
                num_sub_entries: 0,
                inflation_dest: None,
                flags: 0,
                home_domain: String32::default(),
                thresholds: Thresholds([1, 0, 0, 0]),
                signers: Vec::new().try_into().unwrap(),
                ext: AccountEntryExt::V0,
            }),
            ext: LedgerEntryExt::V0,
        }
    }

    fn make_account_key(bytes: [u8; 32]) -> LedgerKey {
        LedgerKey::Account(LedgerKeyAccount {
            account_id: make_account_id(bytes),
        })
    }

    fn balance_of(entry: &BucketEntry) -> i64 {
        match entry.as_ledger_entry().map(|e| &e.data) {
            Some(LedgerEntryData::Account(acc)) => acc.balance,
            _ => panic!("not an account entry: {:?}", entry),
        }
    }

    fn setup() -> (TempDir, BucketManager) {
        let dir = TempDir::new().unwrap();
        let manager = BucketManager::new(dir.path().join("buckets")).unwrap();
        (dir, manager)
    }

    fn fresh(
        manager: &BucketManager,
        protocol: u32,
        init: Vec<LedgerEntry>,
        live: Vec<LedgerEntry>,
        dead: Vec<LedgerKey>,
    ) -> Arc<Bucket> {
        Bucket::fresh(manager, protocol, init, live, dead, false).unwrap()
    }

    #[test]
    fn test_merge_empty_buckets() {
        let (_dir, manager) = setup();
        let empty = Arc::new(Bucket::empty());
        let merged = Bucket::merge(&manager, 25, &empty, &empty, &[], true, true).unwrap();
        assert!(merged.is_empty());
        assert_eq!(manager.merge_counters().pre_init_entry_protocol_merges, 1);
    }

    #[test]
    fn test_merge_no_overlap() {
        let (_dir, manager) = setup();
        let old = fresh(&manager, 25, vec![], vec![make_account_entry([1; 32], 1)], vec![]);
        let new = fresh(&manager, 25, vec![], vec![make_account_entry([2; 32], 2)], vec![]);

        let merged = Bucket::merge(&manager, 25, &old, &new, &[], true, false).unwrap();
        let entries = merged.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(balance_of(&entries[0]), 1);
        assert_eq!(balance_of(&entries[1]), 2);
    }

    #[test]
    fn test_new_live_wins_over_old_live() {
        let (_dir, manager) = setup();
        let old = fresh(&manager, 25, vec![], vec![make_account_entry([1; 32], 1)], vec![]);
        let new = fresh(&manager, 25, vec![], vec![make_account_entry([1; 32], 100)], vec![]);

        let merged = Bucket::merge(&manager, 25, &old, &new, &[], true, true).unwrap();
        let entries = merged.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(balance_of(&entries[0]), 100);
        assert_eq!(manager.merge_counters().new_entries_merged_with_old_neither_init, 1);
    }

    #[test]
    fn test_dead_plus_init_becomes_live() {
        let (_dir, manager) = setup();
        let old = fresh(&manager, 25, vec![], vec![], vec![make_account_key([1; 32])]);
        let new = fresh(&manager, 25, vec![make_account_entry([1; 32], 5)], vec![], vec![]);

        let merged = Bucket::merge(&manager, 25, &old, &new, &[], true, true).unwrap();
        let entries = merged.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_live());
        assert_eq!(balance_of(&entries[0]), 5);
        assert_eq!(manager.merge_counters().new_init_entries_merged_with_old_dead, 1);
    }

    #[test]
    fn test_init_plus_live_stays_init() {
        let (_dir, manager) = setup();
        let old = fresh(&manager, 25, vec![make_account_entry([1; 32], 1)], vec![], vec![]);
        let new = fresh(&manager, 25, vec![], vec![make_account_entry([1; 32], 7)], vec![]);

        let merged = Bucket::merge(&manager, 25, &old, &new, &[], true, false).unwrap();
        let entries = merged.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_init());
        assert_eq!(balance_of(&entries[0]), 7);
    }

    #[test]
    fn test_init_plus_dead_annihilates() {
        let (_dir, manager) = setup();
        let old = fresh(&manager, 25, vec![make_account_entry([1; 32], 1)], vec![], vec![]);
        let new = fresh(&manager, 25, vec![], vec![], vec![make_account_key([1; 32])]);

        let merged = Bucket::merge(&manager, 25, &old, &new, &[], true, true).unwrap();
        assert!(merged.is_empty());
        assert_eq!(manager.merge_counters().old_init_entries_merged_with_new_dead, 1);
    }

    #[test]
    fn test_old_live_plus_new_init_is_malformed() {
        let (_dir, manager) = setup();
        let old = fresh(&manager, 25, vec![], vec![make_account_entry([1; 32], 1)], vec![]);
        let new = fresh(&manager, 25, vec![make_account_entry([1; 32], 2)], vec![], vec![]);

        let err = Bucket::merge(&manager, 25, &old, &new, &[], true, false).unwrap_err();
        match err {
            BucketError::MalformedBucket(msg) => assert!(msg.contains("old non-DEAD + new INIT")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    /// A bucket file written record by record, with no META.
    fn raw_bucket(dir: &TempDir, name: &str, entries: &[BucketEntry]) -> Arc<Bucket> {
        let mut bytes = Vec::new();
        for entry in entries {
            henyey_common::xdr_stream::write_record(&mut bytes, &entry.to_xdr().unwrap()).unwrap();
        }
        let path = dir.path().join(name);
        std::fs::write(&path, &bytes).unwrap();
        Arc::new(Bucket::new(
            henyey_common::Hash256::hash(&bytes),
            path,
            bytes.len() as u64,
        ))
    }

    #[test]
    fn test_equal_key_init_without_meta_is_malformed() {
        let (dir, manager) = setup();

        // DEAD + INIT would become LIVE if the INIT were legal.
        let old = raw_bucket(&dir, "old.xdr", &[BucketEntry::Dead(make_account_key([1; 32]))]);
        let new = raw_bucket(&dir, "new.xdr", &[BucketEntry::Init(make_account_entry([1; 32], 5))]);
        let err = Bucket::merge(&manager, 25, &old, &new, &[], true, false).unwrap_err();
        assert!(err.is_malformed(), "unexpected error {:?}", err);

        // INIT + DEAD would annihilate if the INIT were legal.
        let old = raw_bucket(&dir, "old2.xdr", &[BucketEntry::Init(make_account_entry([2; 32], 1))]);
        let new = raw_bucket(&dir, "new2.xdr", &[BucketEntry::Dead(make_account_key([2; 32]))]);
        let err = Bucket::merge(&manager, 25, &old, &new, &[], true, false).unwrap_err();
        assert!(err.is_malformed(), "unexpected error {:?}", err);
    }

    #[test]
    fn test_protocol_ceiling() {
        let (_dir, manager) = setup();
        let old = fresh(&manager, 20, vec![], vec![make_account_entry([1; 32], 1)], vec![]);
        let new = Arc::new(Bucket::empty());

        let err = Bucket::merge(&manager, 19, &old, &new, &[], true, false).unwrap_err();
        assert!(matches!(err, BucketError::ProtocolViolation(_)));
    }

    #[test]
    fn test_output_protocol_is_max_of_inputs_and_shadows() {
        let (_dir, manager) = setup();
        let old = fresh(&manager, 12, vec![], vec![make_account_entry([1; 32], 1)], vec![]);
        let new = fresh(&manager, 14, vec![], vec![make_account_entry([2; 32], 1)], vec![]);
        let shadow = fresh(&manager, 18, vec![], vec![make_account_entry([9; 32], 1)], vec![]);

        let merged = Bucket::merge(&manager, 25, &old, &new, &[shadow], true, false).unwrap();
        assert_eq!(merged.protocol_version().unwrap(), 18);
    }

    #[test]
    fn test_shadow_elides_live_before_protocol_11() {
        let (_dir, manager) = setup();
        let old = fresh(
            &manager,
            10,
            vec![],
            vec![make_account_entry([1; 32], 1), make_account_entry([2; 32], 2)],
            vec![],
        );
        let new = fresh(&manager, 10, vec![], vec![], vec![make_account_key([3; 32])]);
        let shadow = fresh(
            &manager,
            10,
            vec![],
            vec![make_account_entry([2; 32], 20), make_account_entry([3; 32], 30)],
            vec![],
        );

        let merged = Bucket::merge(&manager, 25, &old, &new, &[shadow], true, true).unwrap();
        let entries = merged.entries().unwrap();
        // Key 2 (LIVE) and key 3 (DEAD) are both shadowed pre-11.
        assert_eq!(entries.len(), 1);
        assert_eq!(balance_of(&entries[0]), 1);

        let counters = manager.merge_counters();
        assert_eq!(counters.live_entry_shadow_elisions, 1);
        assert_eq!(counters.dead_entry_shadow_elisions, 1);
    }

    #[test]
    fn test_shadow_keeps_lifecycle_entries_from_protocol_11() {
        let (_dir, manager) = setup();
        let old = fresh(
            &manager,
            11,
            vec![make_account_entry([1; 32], 1)],
            vec![make_account_entry([2; 32], 2)],
            vec![],
        );
        let new = fresh(&manager, 11, vec![], vec![], vec![make_account_key([3; 32])]);
        let shadow = fresh(
            &manager,
            11,
            vec![],
            vec![
                make_account_entry([1; 32], 10),
                make_account_entry([2; 32], 20),
                make_account_entry([3; 32], 30),
            ],
            vec![],
        );

        let merged = Bucket::merge(&manager, 25, &old, &new, &[shadow], true, false).unwrap();
        let entries = merged.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_init());
        assert!(entries[1].is_dead());
    }

    #[test]
    fn test_keep_dead_entries_false_drops_tombstones() {
        let (_dir, manager) = setup();
        let old = fresh(&manager, 25, vec![], vec![make_account_entry([1; 32], 1)], vec![]);
        let new = fresh(&manager, 25, vec![], vec![], vec![make_account_key([1; 32])]);

        let merged = Bucket::merge(&manager, 25, &old, &new, &[], false, true).unwrap();
        assert!(merged.is_empty());
        assert_eq!(manager.merge_counters().output_iterator_tombstone_elisions, 1);
    }
}
