//! Error types for bucket operations.

use henyey_common::Hash256;
use thiserror::Error;

/// Errors that can occur during bucket operations.
///
/// `MalformedBucket`, `ProtocolViolation` and `StorageFailure` are fatal for
/// the merge that raised them; the engine never retries or continues past one.
#[derive(Debug, Error)]
pub enum BucketError {
    /// Bucket contents violate ordering, lifecycle or protocol rules.
    #[error("malformed bucket: {0}")]
    MalformedBucket(String),

    /// A merge would produce a bucket newer than the allowed protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Finalizing a bucket file on disk failed.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Bucket file not found.
    #[error("bucket not found: {0}")]
    NotFound(String),

    /// Bucket hash mismatch.
    #[error("bucket hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Persisted state could not be decoded.
    #[error("bucket serialization error: {0}")]
    Serialization(String),

    /// A state machine was driven through an illegal transition.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Bucket merge error.
    #[error("bucket merge error: {0}")]
    Merge(String),

    /// A background merge failed; carries the hashes of its inputs.
    #[error("merge of curr={curr} snap={snap} failed: {source}")]
    MergeFailed {
        curr: Hash256,
        snap: Hash256,
        #[source]
        source: Box<BucketError>,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BucketError {
    /// The innermost error, looking through `MergeFailed` wrappers.
    pub fn root_cause(&self) -> &BucketError {
        let mut err = self;
        while let BucketError::MergeFailed { source, .. } = err {
            err = source;
        }
        err
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self.root_cause(), BucketError::MalformedBucket(_))
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self.root_cause(), BucketError::ProtocolViolation(_))
    }
}

impl Clone for BucketError {
    /// `Io` errors are rebuilt from their kind and message.
    fn clone(&self) -> Self {
        match self {
            BucketError::MalformedBucket(msg) => BucketError::MalformedBucket(msg.clone()),
            BucketError::ProtocolViolation(msg) => BucketError::ProtocolViolation(msg.clone()),
            BucketError::StorageFailure(msg) => BucketError::StorageFailure(msg.clone()),
            BucketError::NotFound(msg) => BucketError::NotFound(msg.clone()),
            BucketError::HashMismatch { expected, actual } => BucketError::HashMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            BucketError::Serialization(msg) => BucketError::Serialization(msg.clone()),
            BucketError::InvalidState(msg) => BucketError::InvalidState(msg.clone()),
            BucketError::Merge(msg) => BucketError::Merge(msg.clone()),
            BucketError::MergeFailed { curr, snap, source } => BucketError::MergeFailed {
                curr: *curr,
                snap: *snap,
                source: source.clone(),
            },
            BucketError::Io(e) => BucketError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_nested_merge_failures() {
        let inner = BucketError::MalformedBucket("old non-DEAD + new INIT".into());
        let wrapped = BucketError::MergeFailed {
            curr: Hash256::ZERO,
            snap: Hash256::hash(b"snap"),
            source: Box::new(BucketError::MergeFailed {
                curr: Hash256::ZERO,
                snap: Hash256::ZERO,
                source: Box::new(inner),
            }),
        };
        assert!(wrapped.is_malformed());
        assert!(!wrapped.is_protocol_violation());
        assert!(wrapped.to_string().contains("old non-DEAD + new INIT"));

        let copy = wrapped.clone();
        assert!(copy.is_malformed());
        assert_eq!(copy.to_string(), wrapped.to_string());
    }

    #[test]
    fn test_clone_keeps_io_kind() {
        let err = BucketError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        match err.clone() {
            BucketError::Io(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::NotFound);
                assert!(e.to_string().contains("gone"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
