use thiserror::Error;

use super::keys::{BucketId, DocumentKey};

/// Engine error taxonomy. Every variant has a stable wire code; higher
/// layers decide presentation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("identity missing or token scope violated")]
    Unauthorized,

    #[error("bucket {0} is tombstoned")]
    BucketClosed(BucketId),

    #[error("connection is not subscribed to {0}")]
    NotSubscribed(DocumentKey),

    #[error("update bytes were rejected by the document state")]
    MalformedUpdate,

    #[error("snapshot load failed for {key}")]
    SnapshotUnavailable {
        key: DocumentKey,
        #[source]
        source: anyhow::Error,
    },

    #[error("outbound queue overflowed")]
    SlowConsumer,

    #[error("message handler exceeded its budget")]
    HandlerTimeout,

    #[error("retriable snapshot failure")]
    Transient(#[source] anyhow::Error),
}

impl SyncError {
    /// Stable code carried on `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Unauthorized => "unauthorized",
            SyncError::BucketClosed(_) => "bucket-closed",
            SyncError::NotSubscribed(_) => "not-subscribed",
            SyncError::MalformedUpdate => "malformed-update",
            SyncError::SnapshotUnavailable { .. } => "snapshot-unavailable",
            SyncError::SlowConsumer => "slow-consumer",
            SyncError::HandlerTimeout => "handler-timeout",
            SyncError::Transient(_) => "transient",
        }
    }

    /// Whether the session must be torn down after reporting this error.
    /// Everything else is answered per message and the connection stays open.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            SyncError::Unauthorized | SyncError::SlowConsumer | SyncError::HandlerTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(SyncError::Unauthorized.code(), "unauthorized");
        assert_eq!(SyncError::MalformedUpdate.code(), "malformed-update");
        assert_eq!(SyncError::HandlerTimeout.code(), "handler-timeout");
        assert_eq!(SyncError::BucketClosed(BucketId::new()).code(), "bucket-closed");
    }

    #[test]
    fn only_fatal_kinds_close_the_connection() {
        assert!(SyncError::Unauthorized.closes_connection());
        assert!(SyncError::SlowConsumer.closes_connection());
        assert!(SyncError::HandlerTimeout.closes_connection());
        assert!(!SyncError::MalformedUpdate.closes_connection());
        assert!(!SyncError::BucketClosed(BucketId::new()).closes_connection());
    }
}
