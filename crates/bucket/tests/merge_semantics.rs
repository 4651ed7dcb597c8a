//! Integration tests for bucket merge semantics.
//!
//! Covers the INIT/LIVE/DEAD lifecycle table, shadow elision before and
//! after protocol 11, tombstone handling and the protocol ceiling.

use std::sync::Arc;

use henyey_bucket::{Bucket, BucketEntry, BucketError, BucketManager};
use henyey_common::Hash256;
use stellar_xdr::curr::*;
use tempfile::TempDir;

const TEST_PROTOCOL: u32 = 25;
const PRE_INIT_PROTOCOL: u32 = 10;

// =============================================================================
// Test Helpers
// =============================================================================

fn make_account_id(byte: u8) -> AccountId {
    AccountId(PublicKey::PublicKeyTypeEd25519(Uint256([byte; 32])))
}

fn make_account_entry(byte: u8, balance: i64) -> LedgerEntry {
    LedgerEntry {
        last_modified_ledger_seq: 1,
        data: LedgerEntryData::Account(AccountEntry {
            account_id: make_account_id(byte),
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

fn make_account_key(byte: u8) -> LedgerKey {
    LedgerKey::Account(LedgerKeyAccount {
        account_id: make_account_id(byte),
    })
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
    Bucket::fresh(manager, protocol, init, live, dead, true).unwrap()
}

fn merge(
    manager: &BucketManager,
    old: &Arc<Bucket>,
    new: &Arc<Bucket>,
    shadows: &[Arc<Bucket>],
    keep_dead: bool,
) -> Arc<Bucket> {
    Bucket::merge(manager, TEST_PROTOCOL, old, new, shadows, keep_dead, true).unwrap()
}

fn balance_of(entry: &BucketEntry) -> Option<i64> {
    match entry.as_ledger_entry().map(|e| &e.data) {
        Some(LedgerEntryData::Account(account)) => Some(account.balance),
        _ => None,
    }
}

/// Summarize a bucket as (type tag, key byte, balance) triples.
fn describe(bucket: &Bucket) -> Vec<(&'static str, u8, Option<i64>)> {
    bucket
        .entries()
        .unwrap()
        .iter()
        .map(|entry| {
            let tag = match entry {
                BucketEntry::Init(_) => "INIT",
                BucketEntry::Live(_) => "LIVE",
                BucketEntry::Dead(_) => "DEAD",
                BucketEntry::Metadata(_) => "META",
            };
            let byte = match entry.key() {
                Some(LedgerKey::Account(k)) => match k.account_id.0 {
                    PublicKey::PublicKeyTypeEd25519(Uint256(bytes)) => bytes[0],
                },
                _ => 0,
            };
            (tag, byte, balance_of(entry))
        })
        .collect()
}

// =============================================================================
// Lifecycle table
// =============================================================================

#[test]
fn test_lifecycle_table() {
    let (_dir, manager) = setup();

    let old = fresh(
        &manager,
        TEST_PROTOCOL,
        vec![make_account_entry(1, 10), make_account_entry(2, 20)],
        vec![make_account_entry(3, 30), make_account_entry(5, 50)],
        vec![make_account_key(4)],
    );
    let new = fresh(
        &manager,
        TEST_PROTOCOL,
        vec![make_account_entry(4, 41)],
        vec![make_account_entry(2, 21), make_account_entry(6, 60)],
        vec![make_account_key(1), make_account_key(3)],
    );

    let merged = merge(&manager, &old, &new, &[], true);
    assert_eq!(
        describe(&merged),
        vec![
            // INIT + DEAD annihilate, so key 1 is gone.
            ("INIT", 2, Some(21)),
            ("DEAD", 3, None),
            ("LIVE", 4, Some(41)),
            ("LIVE", 5, Some(50)),
            ("LIVE", 6, Some(60)),
        ]
    );
    assert_eq!(merged.protocol_version().unwrap(), TEST_PROTOCOL);

    let counters = manager.merge_counters();
    assert_eq!(counters.old_init_entries_merged_with_new_dead, 1);
    assert_eq!(counters.old_init_entries_merged_with_new_live, 1);
    assert_eq!(counters.new_init_entries_merged_with_old_dead, 1);
    assert_eq!(counters.new_entries_merged_with_old_neither_init, 1);
    assert_eq!(counters.post_init_entry_protocol_merges, 1);
}

#[test]
fn test_init_over_live_is_malformed() {
    let (_dir, manager) = setup();
    let old = fresh(&manager, TEST_PROTOCOL, vec![], vec![make_account_entry(1, 1)], vec![]);
    let new = fresh(&manager, TEST_PROTOCOL, vec![make_account_entry(1, 2)], vec![], vec![]);

    let err = Bucket::merge(&manager, TEST_PROTOCOL, &old, &new, &[], true, false).unwrap_err();
    assert!(err.is_malformed(), "unexpected error: {}", err);
}

#[test]
fn test_init_over_init_is_malformed() {
    let (_dir, manager) = setup();
    let old = fresh(&manager, TEST_PROTOCOL, vec![make_account_entry(1, 1)], vec![], vec![]);
    let new = fresh(&manager, TEST_PROTOCOL, vec![make_account_entry(1, 2)], vec![], vec![]);

    assert!(matches!(
        Bucket::merge(&manager, TEST_PROTOCOL, &old, &new, &[], true, false),
        Err(BucketError::MalformedBucket(_))
    ));
}

#[test]
fn test_init_then_dead_collapses_to_empty_bucket() {
    let (_dir, manager) = setup();
    let old = fresh(&manager, TEST_PROTOCOL, vec![make_account_entry(1, 1)], vec![], vec![]);
    let new = fresh(&manager, TEST_PROTOCOL, vec![], vec![], vec![make_account_key(1)]);

    let merged = merge(&manager, &old, &new, &[], true);
    assert!(merged.is_empty());
    assert_eq!(merged.hash(), Hash256::ZERO);
}

// =============================================================================
// Protocol ceiling
// =============================================================================

#[test]
fn test_merge_above_ceiling_fails() {
    let (_dir, manager) = setup();
    let old = fresh(&manager, TEST_PROTOCOL, vec![], vec![make_account_entry(1, 1)], vec![]);
    let new = fresh(&manager, TEST_PROTOCOL, vec![], vec![make_account_entry(2, 2)], vec![]);

    let err =
        Bucket::merge(&manager, TEST_PROTOCOL - 1, &old, &new, &[], true, false).unwrap_err();
    assert!(err.is_protocol_violation());
}

#[test]
fn test_shadow_protocol_counts_toward_ceiling() {
    let (_dir, manager) = setup();
    let old = fresh(&manager, PRE_INIT_PROTOCOL, vec![], vec![make_account_entry(1, 1)], vec![]);
    let new = fresh(&manager, PRE_INIT_PROTOCOL, vec![], vec![make_account_entry(2, 2)], vec![]);
    let shadow = fresh(&manager, TEST_PROTOCOL, vec![], vec![make_account_entry(9, 9)], vec![]);

    assert!(matches!(
        Bucket::merge(&manager, PRE_INIT_PROTOCOL, &old, &new, &[shadow], true, false),
        Err(BucketError::ProtocolViolation(_))
    ));
}

#[test]
fn test_pre_init_merge_has_no_meta() {
    let (_dir, manager) = setup();
    let old = fresh(&manager, PRE_INIT_PROTOCOL, vec![make_account_entry(1, 1)], vec![], vec![]);
    let new = fresh(&manager, PRE_INIT_PROTOCOL, vec![], vec![make_account_entry(2, 2)], vec![]);

    let merged = merge(&manager, &old, &new, &[], true);
    // INIT is written as LIVE before protocol 11.
    assert_eq!(
        describe(&merged),
        vec![("LIVE", 1, Some(1)), ("LIVE", 2, Some(2))]
    );
    assert_eq!(merged.protocol_version().unwrap(), 0);
    assert_eq!(manager.merge_counters().pre_init_entry_protocol_merges, 1);
}

// =============================================================================
// Shadows
// =============================================================================

#[test]
fn test_pre_init_shadows_elide_everything() {
    let (_dir, manager) = setup();
    let old = fresh(
        &manager,
        PRE_INIT_PROTOCOL,
        vec![],
        vec![make_account_entry(1, 1), make_account_entry(2, 2)],
        vec![],
    );
    let new = fresh(
        &manager,
        PRE_INIT_PROTOCOL,
        vec![],
        vec![make_account_entry(3, 3)],
        vec![make_account_key(4)],
    );
    let shadow = fresh(
        &manager,
        PRE_INIT_PROTOCOL,
        vec![],
        vec![make_account_entry(2, 200)],
        vec![make_account_key(4)],
    );

    let merged = merge(&manager, &old, &new, &[shadow], true);
    assert_eq!(
        describe(&merged),
        vec![("LIVE", 1, Some(1)), ("LIVE", 3, Some(3))]
    );

    let counters = manager.merge_counters();
    assert_eq!(counters.live_entry_shadow_elisions, 1);
    assert_eq!(counters.dead_entry_shadow_elisions, 1);
}

#[test]
fn test_lifecycle_entries_survive_shadows() {
    let (_dir, manager) = setup();
    let old = fresh(
        &manager,
        TEST_PROTOCOL,
        vec![make_account_entry(1, 1)],
        vec![make_account_entry(2, 2)],
        vec![],
    );
    let new = fresh(&manager, TEST_PROTOCOL, vec![], vec![], vec![make_account_key(3)]);
    let shadow = fresh(
        &manager,
        TEST_PROTOCOL,
        vec![],
        vec![
            make_account_entry(1, 100),
            make_account_entry(2, 200),
            make_account_entry(3, 300),
        ],
        vec![],
    );

    let merged = merge(&manager, &old, &new, &[shadow], true);
    assert_eq!(
        describe(&merged),
        vec![("INIT", 1, Some(1)), ("DEAD", 3, None)]
    );
    assert_eq!(manager.merge_counters().live_entry_shadow_elisions, 1);
}

#[test]
fn test_multiple_shadows_each_elide() {
    let (_dir, manager) = setup();
    let old = fresh(
        &manager,
        PRE_INIT_PROTOCOL,
        vec![],
        (1..=6).map(|i| make_account_entry(i, i as i64)).collect(),
        vec![],
    );
    let new = Arc::new(Bucket::empty());
    let shadow_a = fresh(&manager, PRE_INIT_PROTOCOL, vec![], vec![make_account_entry(2, 0)], vec![]);
    let shadow_b = fresh(
        &manager,
        PRE_INIT_PROTOCOL,
        vec![],
        vec![make_account_entry(4, 0), make_account_entry(5, 0)],
        vec![],
    );

    let merged = merge(&manager, &old, &new, &[shadow_a, shadow_b], true);
    let keys: Vec<u8> = describe(&merged).into_iter().map(|(_, k, _)| k).collect();
    assert_eq!(keys, vec![1, 3, 6]);
}

// =============================================================================
// Tombstones and identity
// =============================================================================

#[test]
fn test_dropping_tombstones() {
    let (_dir, manager) = setup();
    let old = fresh(&manager, TEST_PROTOCOL, vec![], vec![make_account_entry(1, 1)], vec![]);
    let new = fresh(
        &manager,
        TEST_PROTOCOL,
        vec![],
        vec![make_account_entry(2, 2)],
        vec![make_account_key(1), make_account_key(3)],
    );

    let kept = merge(&manager, &old, &new, &[], true);
    assert_eq!(
        describe(&kept),
        vec![("DEAD", 1, None), ("LIVE", 2, Some(2)), ("DEAD", 3, None)]
    );

    let dropped = merge(&manager, &old, &new, &[], false);
    assert_eq!(describe(&dropped), vec![("LIVE", 2, Some(2))]);
    assert!(manager.merge_counters().output_iterator_tombstone_elisions >= 2);
}

#[test]
fn test_merge_with_empty_is_identity() {
    let (_dir, manager) = setup();
    let bucket = fresh(
        &manager,
        TEST_PROTOCOL,
        vec![make_account_entry(1, 1)],
        vec![make_account_entry(2, 2)],
        vec![make_account_key(3)],
    );
    let empty = Arc::new(Bucket::empty());

    assert_eq!(merge(&manager, &empty, &bucket, &[], true).hash(), bucket.hash());
    assert_eq!(merge(&manager, &bucket, &empty, &[], true).hash(), bucket.hash());
    assert!(merge(&manager, &empty, &empty, &[], true).is_empty());
}

#[test]
fn test_merge_is_deterministic_and_content_addressed() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let manager_a = BucketManager::new(dir_a.path()).unwrap();
    let manager_b = BucketManager::new(dir_b.path()).unwrap();

    let build = |manager: &BucketManager| {
        let old = fresh(
            manager,
            TEST_PROTOCOL,
            vec![make_account_entry(1, 1)],
            vec![make_account_entry(2, 2)],
            vec![],
        );
        let new = fresh(
            manager,
            TEST_PROTOCOL,
            vec![],
            vec![make_account_entry(1, 10)],
            vec![make_account_key(2)],
        );
        merge(manager, &old, &new, &[], true)
    };

    let a = build(&manager_a);
    let b = build(&manager_b);
    assert_eq!(a.hash(), b.hash());
    assert_eq!(
        std::fs::read(a.path().unwrap()).unwrap(),
        std::fs::read(b.path().unwrap()).unwrap()
    );

    // Rebuilding in the same manager hands back the registered bucket.
    let again = build(&manager_a);
    assert!(Arc::ptr_eq(&a, &again));
}

#[test]
fn test_fresh_rejects_duplicate_keys() {
    let (_dir, manager) = setup();
    let err = Bucket::fresh(
        &manager,
        TEST_PROTOCOL,
        vec![make_account_entry(1, 1)],
        vec![make_account_entry(1, 2)],
        vec![],
        false,
    )
    .unwrap_err();
    assert!(err.is_malformed());
}
