//! Protocol version utilities.
//!
//! Bucket contents are protocol-gated: INIT and META entries only exist from
//! [`FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY`] onwards, and a merge
//! may never produce a bucket newer than the node's supported protocol.

/// First ledger protocol in which buckets carry INIT entries and a leading
/// META record.
pub const FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY: u32 = 11;

/// The current maximum supported ledger protocol version.
pub const CURRENT_LEDGER_PROTOCOL_VERSION: u32 = 25;

/// Check if protocol version is strictly before a target.
#[inline]
pub fn protocol_version_is_before(version: u32, before: u32) -> bool {
    version < before
}

/// Check if protocol version is at or after a target.
#[inline]
pub fn protocol_version_starts_from(version: u32, from: u32) -> bool {
    version >= from
}

/// Whether buckets written at `version` use INIT entries and a META record.
#[inline]
pub fn supports_init_and_meta_entries(version: u32) -> bool {
    protocol_version_starts_from(version, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_entry_gate() {
        assert!(!supports_init_and_meta_entries(0));
        assert!(!supports_init_and_meta_entries(10));
        assert!(supports_init_and_meta_entries(11));
        assert!(supports_init_and_meta_entries(CURRENT_LEDGER_PROTOCOL_VERSION));
    }

    #[test]
    fn test_version_comparisons() {
        assert!(protocol_version_is_before(10, 11));
        assert!(!protocol_version_is_before(11, 11));
        assert!(protocol_version_starts_from(11, 11));
        assert!(!protocol_version_starts_from(10, 11));
    }
}
