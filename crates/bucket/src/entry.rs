//! Bucket entries and their total order.
//!
//! A bucket is a sorted run of [`BucketEntry`] values. This module defines
//! the entry type and the two orderings every bucket must respect:
//!
//! 1. [`compare_keys`]: a total order over [`LedgerKey`]s, first by ledger
//!    entry type discriminant (Account < Trustline < Offer < Data < ...) and
//!    then by the type-specific key fields.
//! 2. [`bucket_cmp`]: the lift of that order to bucket entries. META sorts
//!    ahead of every data entry, so when present it can only ever be first.
//!
//! # Entry Types
//!
//! | Type       | Description                                      |
//! |------------|--------------------------------------------------|
//! | `Live`     | A live ledger entry (created or updated)         |
//! | `Init`     | A live entry that did not exist before this run  |
//! | `Dead`     | A tombstone for a deleted key                    |
//! | `Metadata` | File-level metadata (protocol version)           |

use std::cmp::Ordering;

use henyey_common::{
    supports_init_and_meta_entries, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
};
use stellar_xdr::curr::{
    BucketEntry as XdrBucketEntry, BucketEntryType, BucketMetadata, LedgerEntry, LedgerEntryData,
    LedgerEntryType, LedgerKey, LedgerKeyAccount, LedgerKeyClaimableBalance,
    LedgerKeyConfigSetting, LedgerKeyContractCode, LedgerKeyContractData, LedgerKeyData,
    LedgerKeyLiquidityPool, LedgerKeyOffer, LedgerKeyTrustLine, LedgerKeyTtl, Limits, ReadXdr,
    WriteXdr,
};

use crate::{BucketError, Result};

/// An entry stored in a bucket.
///
/// Serializes to the XDR `BucketEntry` union. Merge behavior per variant is
/// described in [`crate::merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketEntry {
    /// A live ledger entry (the current state of this key).
    Live(LedgerEntry),
    /// A tombstone marking that this key has been deleted.
    Dead(LedgerKey),
    /// A live entry whose key did not exist immediately before it.
    Init(LedgerEntry),
    /// Bucket metadata; only legal as the first record of a file.
    Metadata(BucketMetadata),
}

impl BucketEntry {
    /// Parse a BucketEntry from XDR bytes.
    ///
    /// Bytes that do not decode are treated as bucket corruption.
    pub fn from_xdr(bytes: &[u8]) -> Result<Self> {
        let xdr_entry = XdrBucketEntry::from_xdr(bytes, Limits::none()).map_err(|e| {
            BucketError::MalformedBucket(format!("undecodable bucket entry: {}", e))
        })?;
        Ok(Self::from(xdr_entry))
    }

    /// Convert to XDR BucketEntry.
    pub fn to_xdr_entry(&self) -> XdrBucketEntry {
        match self {
            BucketEntry::Live(entry) => XdrBucketEntry::Liveentry(entry.clone()),
            BucketEntry::Init(entry) => XdrBucketEntry::Initentry(entry.clone()),
            BucketEntry::Dead(key) => XdrBucketEntry::Deadentry(key.clone()),
            BucketEntry::Metadata(meta) => XdrBucketEntry::Metaentry(meta.clone()),
        }
    }

    /// Serialize to XDR bytes.
    pub fn to_xdr(&self) -> Result<Vec<u8>> {
        self.to_xdr_entry()
            .to_xdr(Limits::none())
            .map_err(|e| BucketError::Serialization(format!("Failed to serialize XDR: {}", e)))
    }

    /// Get the LedgerKey for this entry, or `None` for metadata.
    pub fn key(&self) -> Option<LedgerKey> {
        match self {
            BucketEntry::Live(entry) | BucketEntry::Init(entry) => Some(ledger_entry_to_key(entry)),
            BucketEntry::Dead(key) => Some(key.clone()),
            BucketEntry::Metadata(_) => None,
        }
    }

    /// Get the LedgerKey of a data entry.
    ///
    /// Metadata has no key; asking for one means a META record turned up
    /// where only LIVE/INIT/DEAD are valid.
    pub fn ledger_key(&self) -> Result<LedgerKey> {
        self.key().ok_or_else(|| {
            BucketError::MalformedBucket("METAENTRY where a data entry was expected".to_string())
        })
    }

    pub fn is_metadata(&self) -> bool {
        matches!(self, BucketEntry::Metadata(_))
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, BucketEntry::Dead(_))
    }

    pub fn is_live(&self) -> bool {
        matches!(self, BucketEntry::Live(_))
    }

    pub fn is_init(&self) -> bool {
        matches!(self, BucketEntry::Init(_))
    }

    /// Get the ledger entry if this is a live or init entry.
    pub fn as_ledger_entry(&self) -> Option<&LedgerEntry> {
        match self {
            BucketEntry::Live(entry) | BucketEntry::Init(entry) => Some(entry),
            _ => None,
        }
    }

    /// Get the bucket entry type.
    pub fn entry_type(&self) -> BucketEntryType {
        match self {
            BucketEntry::Live(_) => BucketEntryType::Liveentry,
            BucketEntry::Dead(_) => BucketEntryType::Deadentry,
            BucketEntry::Init(_) => BucketEntryType::Initentry,
            BucketEntry::Metadata(_) => BucketEntryType::Metaentry,
        }
    }
}

impl From<XdrBucketEntry> for BucketEntry {
    fn from(xdr: XdrBucketEntry) -> Self {
        match xdr {
            XdrBucketEntry::Liveentry(entry) => BucketEntry::Live(entry),
            XdrBucketEntry::Initentry(entry) => BucketEntry::Init(entry),
            XdrBucketEntry::Deadentry(key) => BucketEntry::Dead(key),
            XdrBucketEntry::Metaentry(meta) => BucketEntry::Metadata(meta),
        }
    }
}

/// Extract a LedgerKey from a LedgerEntry.
pub fn ledger_entry_to_key(entry: &LedgerEntry) -> LedgerKey {
    match &entry.data {
        LedgerEntryData::Account(account) => LedgerKey::Account(LedgerKeyAccount {
            account_id: account.account_id.clone(),
        }),
        LedgerEntryData::Trustline(trustline) => LedgerKey::Trustline(LedgerKeyTrustLine {
            account_id: trustline.account_id.clone(),
            asset: trustline.asset.clone(),
        }),
        LedgerEntryData::Offer(offer) => LedgerKey::Offer(LedgerKeyOffer {
            seller_id: offer.seller_id.clone(),
            offer_id: offer.offer_id,
        }),
        LedgerEntryData::Data(data) => LedgerKey::Data(LedgerKeyData {
            account_id: data.account_id.clone(),
            data_name: data.data_name.clone(),
        }),
        LedgerEntryData::ClaimableBalance(cb) => {
            LedgerKey::ClaimableBalance(LedgerKeyClaimableBalance {
                balance_id: cb.balance_id.clone(),
            })
        }
        LedgerEntryData::LiquidityPool(pool) => {
            LedgerKey::LiquidityPool(LedgerKeyLiquidityPool {
                liquidity_pool_id: pool.liquidity_pool_id.clone(),
            })
        }
        LedgerEntryData::ContractData(contract_data) => {
            LedgerKey::ContractData(LedgerKeyContractData {
                contract: contract_data.contract.clone(),
                key: contract_data.key.clone(),
                durability: contract_data.durability,
            })
        }
        LedgerEntryData::ContractCode(contract_code) => {
            LedgerKey::ContractCode(LedgerKeyContractCode {
                hash: contract_code.hash.clone(),
            })
        }
        LedgerEntryData::ConfigSetting(config) => {
            LedgerKey::ConfigSetting(LedgerKeyConfigSetting {
                config_setting_id: config.discriminant(),
            })
        }
        LedgerEntryData::Ttl(ttl) => LedgerKey::Ttl(LedgerKeyTtl {
            key_hash: ttl.key_hash.clone(),
        }),
    }
}

/// The ledger entry type a key belongs to.
pub fn ledger_key_type(key: &LedgerKey) -> LedgerEntryType {
    match key {
        LedgerKey::Account(_) => LedgerEntryType::Account,
        LedgerKey::Trustline(_) => LedgerEntryType::Trustline,
        LedgerKey::Offer(_) => LedgerEntryType::Offer,
        LedgerKey::Data(_) => LedgerEntryType::Data,
        LedgerKey::ClaimableBalance(_) => LedgerEntryType::ClaimableBalance,
        LedgerKey::LiquidityPool(_) => LedgerEntryType::LiquidityPool,
        LedgerKey::ContractData(_) => LedgerEntryType::ContractData,
        LedgerKey::ContractCode(_) => LedgerEntryType::ContractCode,
        LedgerKey::ConfigSetting(_) => LedgerEntryType::ConfigSetting,
        LedgerKey::Ttl(_) => LedgerEntryType::Ttl,
    }
}

/// Compare two LedgerKeys.
///
/// Keys sort first by type discriminant, then by type-specific fields in
/// XDR declaration order:
///
/// - Account: `account_id`
/// - Trustline: `account_id`, then `asset`
/// - Offer: `seller_id`, then `offer_id`
/// - Data: `account_id`, then `data_name`
/// - ContractData: `contract`, then `key`, then `durability`
/// - the remaining types by their single identifying field
///
/// Bucket hashes depend on this order, so it must never change.
pub fn compare_keys(a: &LedgerKey, b: &LedgerKey) -> Ordering {
    let a_type = ledger_key_type(a) as i32;
    let b_type = ledger_key_type(b) as i32;
    a_type.cmp(&b_type).then_with(|| compare_keys_same_type(a, b))
}

fn compare_keys_same_type(a: &LedgerKey, b: &LedgerKey) -> Ordering {
    match (a, b) {
        (LedgerKey::Account(a), LedgerKey::Account(b)) => a.account_id.cmp(&b.account_id),
        (LedgerKey::Trustline(a), LedgerKey::Trustline(b)) => a
            .account_id
            .cmp(&b.account_id)
            .then_with(|| a.asset.cmp(&b.asset)),
        (LedgerKey::Offer(a), LedgerKey::Offer(b)) => a
            .seller_id
            .cmp(&b.seller_id)
            .then_with(|| a.offer_id.cmp(&b.offer_id)),
        (LedgerKey::Data(a), LedgerKey::Data(b)) => a
            .account_id
            .cmp(&b.account_id)
            .then_with(|| a.data_name.cmp(&b.data_name)),
        (LedgerKey::ClaimableBalance(a), LedgerKey::ClaimableBalance(b)) => {
            a.balance_id.cmp(&b.balance_id)
        }
        (LedgerKey::LiquidityPool(a), LedgerKey::LiquidityPool(b)) => {
            a.liquidity_pool_id.cmp(&b.liquidity_pool_id)
        }
        (LedgerKey::ContractData(a), LedgerKey::ContractData(b)) => a
            .contract
            .cmp(&b.contract)
            .then_with(|| a.key.cmp(&b.key))
            .then_with(|| a.durability.cmp(&b.durability)),
        (LedgerKey::ContractCode(a), LedgerKey::ContractCode(b)) => a.hash.cmp(&b.hash),
        (LedgerKey::ConfigSetting(a), LedgerKey::ConfigSetting(b)) => {
            a.config_setting_id.cmp(&b.config_setting_id)
        }
        (LedgerKey::Ttl(a), LedgerKey::Ttl(b)) => a.key_hash.cmp(&b.key_hash),
        // Unreachable after the discriminant comparison in compare_keys.
        _ => Ordering::Equal,
    }
}

/// Reject entries that cannot exist in a bucket of `protocol_version`.
///
/// INIT and META entries only exist from protocol 11 onwards.
pub fn check_protocol_legality(entry: &BucketEntry, protocol_version: u32) -> Result<()> {
    if supports_init_and_meta_entries(protocol_version) {
        return Ok(());
    }
    match entry {
        BucketEntry::Init(_) | BucketEntry::Metadata(_) => {
            Err(BucketError::MalformedBucket(format!(
                "{:?} entry in bucket of protocol {} (requires {})",
                entry.entry_type(),
                protocol_version,
                FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY
            )))
        }
        BucketEntry::Live(_) | BucketEntry::Dead(_) => Ok(()),
    }
}

/// Compare two bucket entries by identity.
///
/// If either side is META the entries are ordered by their XDR type tag
/// (METAENTRY is -1, below every data tag); otherwise by [`compare_keys`].
/// LIVE, INIT and DEAD entries for the same key compare equal.
pub fn bucket_cmp(a: &BucketEntry, b: &BucketEntry) -> Ordering {
    match (a.key(), b.key()) {
        (Some(key_a), Some(key_b)) => compare_keys(&key_a, &key_b),
        _ => (a.entry_type() as i32).cmp(&(b.entry_type() as i32)),
    }
}
