//! Verification: does this exact byte sequence match a registered document?
//!
//! Lookup is restricted registry first (authoritative superset), then public.
//! A match is only reported once the referenced artifact is confirmed to
//! exist; a record whose artifact is gone fails closed with an integrity
//! alert rather than vouching for content nobody can produce.

use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncRead;

use crate::artifact_store::{ArtifactStore, ArtifactStoreError};
use crate::error::{LedgerError, Result};
use crate::events::{EventSink, LedgerEvent, TracingEventSink};
use crate::fingerprint::{ContentAddress, ContentFingerprinter};
use crate::registry::Registries;
use crate::types::{RecordId, RegistryKind, RegistryRecord};

/// Outcome of a verification lookup, before caller-specific redaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub authentic: bool,
    pub content_address: ContentAddress,
    pub record: Option<RegistryRecord>,
    pub matched_in: Option<RegistryKind>,
    /// Set when a record matched but its artifact did not check out.
    pub anomaly: Option<String>,
}

impl VerificationResult {
    pub fn matched(
        content_address: ContentAddress,
        record: RegistryRecord,
        matched_in: RegistryKind,
    ) -> Self {
        Self {
            authentic: true,
            content_address,
            record: Some(record),
            matched_in: Some(matched_in),
            anomaly: None,
        }
    }

    pub fn not_found(content_address: ContentAddress) -> Self {
        Self {
            authentic: false,
            content_address,
            record: None,
            matched_in: None,
            anomaly: None,
        }
    }

    pub fn failed_closed(content_address: ContentAddress, anomaly: impl Into<String>) -> Self {
        Self {
            authentic: false,
            content_address,
            record: None,
            matched_in: None,
            anomaly: Some(anomaly.into()),
        }
    }
}

pub struct VerificationService {
    registries: Registries,
    store: Arc<dyn ArtifactStore>,
    events: Arc<dyn EventSink>,
}

impl VerificationService {
    pub fn new(registries: Registries, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            registries,
            store,
            events: Arc::new(TracingEventSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Fingerprint `bytes` and look them up. Empty input is a valid (and
    /// normally unregistered) byte sequence.
    pub async fn verify(&self, bytes: &[u8]) -> Result<VerificationResult> {
        let address = ContentFingerprinter::digest_cooperative(bytes).await;
        self.resolve(address).await
    }

    /// Streaming variant of [`verify`](Self::verify).
    pub async fn verify_reader<R>(&self, reader: &mut R) -> Result<VerificationResult>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let (address, len) = ContentFingerprinter::digest_async_reader(reader)
            .await
            .map_err(LedgerError::UnreadableInput)?;
        tracing::debug!(content_address = %address, bytes = len, "Fingerprinted upload");
        self.resolve(address).await
    }

    /// Look up a precomputed address.
    pub async fn resolve(&self, address: ContentAddress) -> Result<VerificationResult> {
        let (record, kind) = match self
            .registries
            .restricted
            .find_by_content_address(&address)
            .await?
        {
            Some(record) => (record, RegistryKind::Restricted),
            None => match self.registries.public.find_by_content_address(&address).await? {
                Some(record) => (record, RegistryKind::Public),
                None => {
                    tracing::debug!(content_address = %address, "No registered match");
                    return Ok(VerificationResult::not_found(address));
                }
            },
        };

        let present = self
            .store
            .exists(&record.artifact_location)
            .await
            .map_err(LedgerError::StoreUnavailable)?;

        if !present {
            let detail = format!(
                "record {} matches but artifact {} is missing",
                record.id, record.artifact_location
            );
            tracing::error!(
                record_id = %record.id,
                content_address = %address,
                location = %record.artifact_location,
                "Verification failed closed: artifact missing"
            );
            self.events.emit(LedgerEvent::IntegrityAlert {
                record_id: Some(record.id),
                content_address: Some(address),
                detail: detail.clone(),
            });
            return Ok(VerificationResult::failed_closed(address, detail));
        }

        tracing::debug!(
            record_id = %record.id,
            content_address = %address,
            matched_in = %kind,
            "Verified"
        );
        Ok(VerificationResult::matched(address, record, kind))
    }

    /// Fetch a resolved record together with its bytes, re-checking the
    /// fingerprint on the way out.
    pub async fn retrieve(&self, id: RecordId) -> Result<(RegistryRecord, Vec<u8>)> {
        let record = match self.registries.restricted.get(id).await? {
            Some(record) => record,
            None => self
                .registries
                .public
                .get(id)
                .await?
                .ok_or(LedgerError::NotFound(id))?,
        };

        let Some(expected) = record.content_address.filter(|_| record.is_verifiable()) else {
            return Err(LedgerError::InvalidTransition(format!(
                "record {} is {}; only resolved records can be retrieved",
                id, record.status
            )));
        };

        let bytes = match self.store.get(&record.artifact_location).await {
            Ok(bytes) => bytes,
            Err(ArtifactStoreError::NotFound(_)) | Err(ArtifactStoreError::InvalidLocation(_)) => {
                return Err(self.integrity_failure(
                    &record,
                    expected,
                    format!("artifact {} is missing", record.artifact_location),
                ));
            }
            Err(e) => return Err(LedgerError::StoreUnavailable(e)),
        };

        let actual = ContentFingerprinter::digest_cooperative(&bytes).await;
        if actual != expected {
            return Err(self.integrity_failure(
                &record,
                expected,
                format!(
                    "artifact {} hashes to {} but record holds {}",
                    record.artifact_location, actual, expected
                ),
            ));
        }

        Ok((record, bytes))
    }

    fn integrity_failure(
        &self,
        record: &RegistryRecord,
        expected: ContentAddress,
        detail: String,
    ) -> LedgerError {
        tracing::error!(record_id = %record.id, error = %detail, "Integrity check failed");
        self.events.emit(LedgerEvent::IntegrityAlert {
            record_id: Some(record.id),
            content_address: Some(expected),
            detail: detail.clone(),
        });
        LedgerError::Integrity(detail)
    }
}
