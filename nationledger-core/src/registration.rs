//! RegistrationService: fingerprint, persist, record, replicate.
//!
//! Ordering within one `register` call is fixed: the artifact is durably
//! persisted before any record is written, so a failed or timed-out upload
//! never leaves a record pointing at missing content.
//!
//! ## Idempotency
//!
//! `(registered_by, content_address)` identifies a registration. A repeat
//! upload of the same bytes by the same principal returns the existing record
//! instead of creating a second one. Different principals get distinct records;
//! verification does not care which one matches.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::access::Principal;
use crate::artifact_store::{ArtifactStore, ArtifactStoreError};
use crate::config::RegistrationConfig;
use crate::error::{LedgerError, Result};
use crate::events::{EventSink, LedgerEvent, TracingEventSink};
use crate::fingerprint::{ContentAddress, ContentFingerprinter};
use crate::gc::{discard_unreferenced, MemoryOrphanLog, OrphanLog, StoreRole};
use crate::registry::{Registries, RegistryError};
use crate::types::{
    ArtifactLocation, Classification, DocumentMetadata, RecordId, RegistryKind,
    RegistryMembership, RegistryRecord, ResolutionStatus, ValidatedMetadata,
};

pub struct RegistrationService {
    registries: Registries,
    store: Arc<dyn ArtifactStore>,
    staging: Arc<dyn ArtifactStore>,
    config: RegistrationConfig,
    events: Arc<dyn EventSink>,
    orphans: Arc<dyn OrphanLog>,
}

impl RegistrationService {
    /// Staging defaults to the durable store; events go to tracing.
    pub fn new(
        registries: Registries,
        store: Arc<dyn ArtifactStore>,
        config: RegistrationConfig,
    ) -> Self {
        Self {
            registries,
            staging: store.clone(),
            store,
            config,
            events: Arc::new(TracingEventSink),
            orphans: Arc::new(MemoryOrphanLog::new()),
        }
    }

    pub fn with_staging(mut self, staging: Arc<dyn ArtifactStore>) -> Self {
        self.staging = staging;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Share the orphan log with a [`DanglingArtifactSweeper`](crate::gc::DanglingArtifactSweeper).
    pub fn with_orphan_log(mut self, orphans: Arc<dyn OrphanLog>) -> Self {
        self.orphans = orphans;
        self
    }

    pub fn orphan_log(&self) -> Arc<dyn OrphanLog> {
        self.orphans.clone()
    }

    // -----------------------------------------------------------------------
    // Synchronous registration
    // -----------------------------------------------------------------------

    /// Register an artifact whose bytes are in hand.
    ///
    /// Returns a `Resolved` record. Declassified records are mirrored into the
    /// public registry in the same call when possible; if the mirror write
    /// fails the record stays restricted-only and the worker completes it.
    pub async fn register(
        &self,
        principal: &Principal,
        bytes: &[u8],
        metadata: DocumentMetadata,
    ) -> Result<RegistryRecord> {
        principal.require_registrant()?;
        if bytes.is_empty() {
            return Err(LedgerError::EmptyArtifact);
        }
        let metadata = metadata.validate()?;

        let address = self.fingerprint(bytes).await?;

        if let Some(existing) = self
            .registries
            .restricted
            .find_by_registrant(&principal.id, &address)
            .await?
        {
            return Ok(self.deduplicated(existing));
        }

        let location = self
            .persist(self.store.as_ref(), bytes, &metadata.content_type)
            .await?;

        let record = RegistryRecord::resolved(
            metadata,
            address,
            location.clone(),
            principal.id.clone(),
            Utc::now(),
        );
        let record_id = record.id;

        let record = match self.insert_with_retry(record).await {
            Ok(record) => record,
            Err(RegistryError::Conflict(reason)) => {
                // Lost a race with a concurrent upload of the same bytes, or
                // an ambiguous earlier attempt actually landed.
                match self.recover_conflict(record_id, principal, &address).await? {
                    Some(existing) => {
                        if existing.artifact_location != location {
                            self.discard(self.store.as_ref(), StoreRole::Durable, &location)
                                .await;
                        }
                        if existing.id == record_id {
                            existing
                        } else {
                            return Ok(self.deduplicated(existing));
                        }
                    }
                    None => {
                        return Err(self
                            .write_failed(address, location, RegistryError::Conflict(reason))
                            .await)
                    }
                }
            }
            Err(e) => return Err(self.write_failed(address, location, e).await),
        };

        tracing::info!(
            record_id = %record.id,
            content_address = %address,
            classification = %record.classification,
            registered_by = %record.registered_by,
            "Registered document"
        );
        self.events.emit(LedgerEvent::Registered {
            record_id: record.id,
            content_address: Some(address),
            classification: record.classification,
            status: record.status,
        });

        Ok(self.replicate_to_public(record).await)
    }

    // -----------------------------------------------------------------------
    // Deferred registration
    // -----------------------------------------------------------------------

    /// Register an artifact already persisted in the staging store. The
    /// record starts `Pending`; the materialization worker resolves it.
    pub async fn register_deferred(
        &self,
        principal: &Principal,
        source_location: ArtifactLocation,
        metadata: DocumentMetadata,
    ) -> Result<RegistryRecord> {
        principal.require_registrant()?;
        let metadata = metadata.validate()?;

        match self.staging.exists(&source_location).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(LedgerError::StoreUnavailable(ArtifactStoreError::NotFound(
                    source_location.to_string(),
                )))
            }
            Err(e) => return Err(LedgerError::StoreUnavailable(e)),
        }

        self.insert_pending(principal, metadata, source_location)
            .await
            .map_err(LedgerError::from)
    }

    /// Put `bytes` into the staging store, then register them deferred.
    pub async fn stage_and_register_deferred(
        &self,
        principal: &Principal,
        bytes: &[u8],
        metadata: DocumentMetadata,
    ) -> Result<RegistryRecord> {
        principal.require_registrant()?;
        if bytes.is_empty() {
            return Err(LedgerError::EmptyArtifact);
        }
        let metadata = metadata.validate()?;

        let location = self
            .persist(self.staging.as_ref(), bytes, &metadata.content_type)
            .await?;

        match self.insert_pending(principal, metadata, location.clone()).await {
            Ok(record) => Ok(record),
            Err(e) => {
                self.discard(self.staging.as_ref(), StoreRole::Staging, &location)
                    .await;
                Err(LedgerError::from(e))
            }
        }
    }

    async fn insert_pending(
        &self,
        principal: &Principal,
        metadata: ValidatedMetadata,
        source_location: ArtifactLocation,
    ) -> std::result::Result<RegistryRecord, RegistryError> {
        let record = RegistryRecord::pending(
            metadata,
            source_location,
            principal.id.clone(),
            Utc::now(),
        );
        let record = self.insert_with_retry(record).await?;

        tracing::info!(
            record_id = %record.id,
            source = %record.artifact_location,
            registered_by = %record.registered_by,
            "Registered document pending materialization"
        );
        self.events.emit(LedgerEvent::Registered {
            record_id: record.id,
            content_address: None,
            classification: record.classification,
            status: record.status,
        });
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Administrative operations
    // -----------------------------------------------------------------------

    /// Change a record's classification and re-run the replication rule.
    pub async fn reclassify(
        &self,
        principal: &Principal,
        id: RecordId,
        classification: Classification,
    ) -> Result<RegistryRecord> {
        principal.require_admin()?;

        let record = self
            .registries
            .restricted
            .get(id)
            .await?
            .ok_or(LedgerError::NotFound(id))?;
        let from = record.classification;
        if from == classification {
            if classification == Classification::Restricted {
                // Finish a withdrawal that stopped after the restricted write
                self.registries.public.remove(id).await?;
            }
            return Ok(record);
        }

        let updated = match classification {
            Classification::Restricted => {
                // Restrict first, then withdraw. A replication racing this
                // call is refused when it marks the record and removes its
                // own copy.
                let mut membership = record.membership;
                membership.remove(RegistryKind::Public);
                let updated = self
                    .registries
                    .restricted
                    .set_classification(id, classification, membership)
                    .await?
                    .ok_or(LedgerError::NotFound(id))?;
                self.registries.public.remove(id).await?;
                updated
            }
            Classification::Declassified => {
                let updated = self
                    .registries
                    .restricted
                    .set_classification(id, classification, record.membership)
                    .await?
                    .ok_or(LedgerError::NotFound(id))?;
                self.replicate_to_public(updated).await
            }
        };

        tracing::info!(
            record_id = %id,
            from = %from,
            to = %classification,
            by = %principal.id,
            "Reclassified document"
        );
        self.events.emit(LedgerEvent::Reclassified {
            record_id: id,
            from,
            to: classification,
        });
        Ok(updated)
    }

    /// Put a `Failed` record, or a resolved record whose public replication
    /// was parked, back into the materialization queue.
    pub async fn requeue(&self, principal: &Principal, id: RecordId) -> Result<RegistryRecord> {
        principal.require_admin()?;

        let record = self
            .registries
            .restricted
            .get(id)
            .await?
            .ok_or(LedgerError::NotFound(id))?;
        if record.status != ResolutionStatus::Failed && !record.replication_exhausted() {
            return Err(LedgerError::InvalidTransition(format!(
                "record {} is {}; only failed records or parked replications can be re-queued",
                id, record.status
            )));
        }

        let updated = self
            .registries
            .restricted
            .requeue(id)
            .await?
            .ok_or_else(|| {
                LedgerError::InvalidTransition(format!("record {} changed state during re-queue", id))
            })?;

        tracing::info!(record_id = %id, status = %updated.status, by = %principal.id, "Re-queued record");
        self.events.emit(LedgerEvent::Requeued { record_id: id });
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn fingerprint(&self, bytes: &[u8]) -> Result<ContentAddress> {
        let limit = self.config.fingerprint_timeout();
        tokio::time::timeout(limit, ContentFingerprinter::digest_cooperative(bytes))
            .await
            .map_err(|_| LedgerError::Timeout {
                operation: "fingerprint",
                after: limit,
            })
    }

    async fn persist(
        &self,
        store: &dyn ArtifactStore,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<ArtifactLocation> {
        let limit = self.config.store_timeout();
        match tokio::time::timeout(limit, store.put(bytes, content_type)).await {
            Ok(Ok(location)) => Ok(location),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Artifact persistence failed");
                Err(LedgerError::StoreUnavailable(e))
            }
            Err(_) => {
                tracing::warn!(timeout_ms = limit.as_millis() as u64, "Artifact persistence timed out");
                Err(LedgerError::Timeout {
                    operation: "artifact persistence",
                    after: limit,
                })
            }
        }
    }

    /// Insert into the restricted registry, retrying transient failures with
    /// linear backoff. Each attempt is bounded by the store timeout.
    async fn insert_with_retry(
        &self,
        record: RegistryRecord,
    ) -> std::result::Result<RegistryRecord, RegistryError> {
        let attempts = self.config.registry_write_attempts.max(1);
        let limit = self.config.store_timeout();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                limit,
                self.registries.restricted.insert(record.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RegistryError::Unavailable(format!(
                    "registry write timed out after {}ms",
                    limit.as_millis()
                ))),
            };

            match result {
                Ok(record) => return Ok(record),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        record_id = %record.id,
                        attempt,
                        error = %e,
                        "Registry write failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        self.config.registry_retry_backoff() * attempt
    }

    /// After a `Conflict` on insert: our own earlier attempt, or a concurrent
    /// registration of the same bytes by the same principal.
    async fn recover_conflict(
        &self,
        record_id: RecordId,
        principal: &Principal,
        address: &ContentAddress,
    ) -> Result<Option<RegistryRecord>> {
        if let Some(own) = self.registries.restricted.get(record_id).await? {
            if own.content_address.as_ref() == Some(address) {
                return Ok(Some(own));
            }
        }
        Ok(self
            .registries
            .restricted
            .find_by_registrant(&principal.id, address)
            .await?)
    }

    fn deduplicated(&self, existing: RegistryRecord) -> RegistryRecord {
        tracing::debug!(
            record_id = %existing.id,
            registered_by = %existing.registered_by,
            "Duplicate upload, returning existing record"
        );
        self.events.emit(LedgerEvent::Deduplicated {
            record_id: existing.id,
            registered_by: existing.registered_by.clone(),
        });
        existing
    }

    /// Compensate for a record write that failed after persistence.
    async fn write_failed(
        &self,
        address: ContentAddress,
        location: ArtifactLocation,
        source: RegistryError,
    ) -> LedgerError {
        tracing::error!(
            content_address = %address,
            location = %location,
            error = %source,
            "Registry write failed after artifact persisted"
        );
        self.discard(self.store.as_ref(), StoreRole::Durable, &location)
            .await;
        LedgerError::RegistryWriteFailed {
            content_address: address,
            artifact_location: location,
            source,
        }
    }

    async fn discard(&self, store: &dyn ArtifactStore, role: StoreRole, location: &ArtifactLocation) {
        discard_unreferenced(
            &self.registries,
            store,
            role,
            location,
            self.orphans.as_ref(),
            self.events.as_ref(),
        )
        .await;
    }

    /// Mirror a resolved, declassified record into the public registry.
    /// Failures are left for the worker, which claims records owing a replica.
    async fn replicate_to_public(&self, mut record: RegistryRecord) -> RegistryRecord {
        if !record.needs_public_replica() {
            return record;
        }

        match self.registries.replicate_public(&record).await {
            Ok(true) => {
                record.membership = RegistryMembership::both();
                self.events.emit(LedgerEvent::PublicReplicated {
                    record_id: record.id,
                });
                record
            }
            Ok(false) => match self.registries.restricted.get(record.id).await {
                Ok(Some(current)) => current,
                _ => record,
            },
            Err(e) => {
                tracing::warn!(
                    record_id = %record.id,
                    error = %e,
                    "Public replication deferred to worker"
                );
                record
            }
        }
    }
}
