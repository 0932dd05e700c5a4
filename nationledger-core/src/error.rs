use std::time::Duration;

use thiserror::Error;

use crate::artifact_store::ArtifactStoreError;
use crate::fingerprint::ContentAddress;
use crate::registry::RegistryError;
use crate::types::{ArtifactLocation, RecordId};

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("artifact is empty")]
    EmptyArtifact,

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Reading the caller's own input stream failed.
    #[error("could not read submitted artifact: {0}")]
    UnreadableInput(#[source] std::io::Error),

    #[error("artifact store unavailable: {0}")]
    StoreUnavailable(#[source] ArtifactStoreError),

    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The artifact was persisted but the record write failed. Retry with the
    /// same bytes; `content_address` identifies them.
    #[error("registry write failed for content {content_address}: {source}")]
    RegistryWriteFailed {
        content_address: ContentAddress,
        artifact_location: ArtifactLocation,
        #[source]
        source: RegistryError,
    },

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("record not found: {0}")]
    NotFound(RecordId),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

impl LedgerError {
    /// Transient infrastructure failures the caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) | Self::Timeout { .. } | Self::RegistryWriteFailed { .. } => {
                true
            }
            Self::Registry(e) => e.is_transient(),
            Self::EmptyArtifact
            | Self::InvalidMetadata(_)
            | Self::Unauthorized(_)
            | Self::UnreadableInput(_)
            | Self::NotFound(_)
            | Self::Integrity(_)
            | Self::InvalidTransition(_) => false,
        }
    }

    /// HTTP-style status for whichever transport wraps the core.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::EmptyArtifact | Self::InvalidMetadata(_) | Self::UnreadableInput(_) => 400,
            Self::Unauthorized(_) => 403,
            Self::NotFound(_) => 404,
            Self::InvalidTransition(_) => 409,
            Self::Integrity(_) => 422,
            Self::Registry(RegistryError::Conflict(_)) => 409,
            Self::StoreUnavailable(_) | Self::RegistryWriteFailed { .. } | Self::Registry(_) => {
                503
            }
            Self::Timeout { .. } => 504,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::ContentFingerprinter;

    // ── retryability ─────────────────────────────────────────────

    #[test]
    fn input_errors_are_not_retryable() {
        assert!(!LedgerError::EmptyArtifact.is_retryable());
        assert!(!LedgerError::InvalidMetadata("x".into()).is_retryable());
        assert!(!LedgerError::Unauthorized("x".into()).is_retryable());

        let input = LedgerError::UnreadableInput(std::io::Error::other("client reset"));
        assert!(!input.is_retryable());
        assert_eq!(input.status_code(), 400);
    }

    #[test]
    fn infrastructure_errors_are_retryable() {
        let store = LedgerError::StoreUnavailable(ArtifactStoreError::Unavailable("down".into()));
        assert!(store.is_retryable());

        let timeout = LedgerError::Timeout {
            operation: "artifact persistence",
            after: Duration::from_millis(10),
        };
        assert!(timeout.is_retryable());

        let write = LedgerError::RegistryWriteFailed {
            content_address: ContentFingerprinter::digest(b"AAA"),
            artifact_location: ArtifactLocation::new("memory://x"),
            source: RegistryError::Unavailable("db down".into()),
        };
        assert!(write.is_retryable());
    }

    #[test]
    fn registry_conflict_is_not_retryable() {
        let e = LedgerError::Registry(RegistryError::Conflict("dup".into()));
        assert!(!e.is_retryable());
        assert_eq!(e.status_code(), 409);

        let e = LedgerError::Registry(RegistryError::Unavailable("db".into()));
        assert!(e.is_retryable());
        assert_eq!(e.status_code(), 503);
    }

    // ── status codes / display ───────────────────────────────────

    #[test]
    fn status_codes() {
        assert_eq!(LedgerError::EmptyArtifact.status_code(), 400);
        assert_eq!(LedgerError::Unauthorized("x".into()).status_code(), 403);
        assert_eq!(LedgerError::NotFound(RecordId::new()).status_code(), 404);
        assert_eq!(LedgerError::Integrity("x".into()).status_code(), 422);
        assert_eq!(
            LedgerError::Timeout {
                operation: "fingerprint",
                after: Duration::from_secs(1)
            }
            .status_code(),
            504
        );
    }

    #[test]
    fn display_timeout() {
        let e = LedgerError::Timeout {
            operation: "artifact persistence",
            after: Duration::from_millis(1500),
        };
        assert_eq!(e.to_string(), "artifact persistence timed out after 1500ms");
    }

    #[test]
    fn display_registry_write_failed_names_content() {
        let address = ContentFingerprinter::digest(b"AAA");
        let e = LedgerError::RegistryWriteFailed {
            content_address: address,
            artifact_location: ArtifactLocation::new("memory://x"),
            source: RegistryError::Unavailable("db down".into()),
        };
        assert!(e.to_string().contains(&address.to_hex()));
        assert!(e.to_string().contains("db down"));
    }
}
