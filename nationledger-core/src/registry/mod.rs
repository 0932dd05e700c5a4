//! Metadata Registries
//!
//! Two registries hold [`RegistryRecord`]s: the restricted registry (the
//! authoritative superset, which also acts as the materialization work queue)
//! and the public registry (declassified subset). Both are reached through
//! [`Registry`]; the restricted one additionally implements
//! [`MaterializationQueue`].
//!
//! Adapters:
//! - [`MemoryRegistry`]: in-process, on `tokio::sync::RwLock`
//! - `PgRegistry`: Postgres, behind the `postgres` feature

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryRegistry;
#[cfg(feature = "postgres")]
pub use postgres::PgRegistry;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::fingerprint::ContentAddress;
use crate::types::{
    ArtifactLocation, Classification, PrincipalRef, RecordFilter, RecordId, RegistryKind,
    RegistryMembership, RegistryRecord, ResolutionStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Duplicate id, duplicate `(registered_by, content_address)`, or an
    /// attempt to change a resolved content address.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RegistryError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            #[cfg(feature = "postgres")]
            Self::Database(_) => true,
            Self::Conflict(_) | Self::Corrupt(_) => false,
        }
    }
}

/// Queryable store of records. Read-your-writes within one registry.
#[async_trait]
pub trait Registry: Send + Sync {
    fn kind(&self) -> RegistryKind;

    /// Insert a new record. Fails with `Conflict` if the id exists or the
    /// registrant already holds a record with the same content address.
    async fn insert(&self, record: RegistryRecord) -> Result<RegistryRecord, RegistryError>;

    /// Insert or replace by id. Refuses to change a resolved content address.
    async fn upsert(&self, record: RegistryRecord) -> Result<RegistryRecord, RegistryError>;

    async fn get(&self, id: RecordId) -> Result<Option<RegistryRecord>, RegistryError>;

    /// Administrative removal. Returns whether a record was removed.
    async fn remove(&self, id: RecordId) -> Result<bool, RegistryError>;

    /// The canonical record for an address: the earliest-registered
    /// `Resolved` record holding it. Pending and failed records never match.
    async fn find_by_content_address(
        &self,
        address: &ContentAddress,
    ) -> Result<Option<RegistryRecord>, RegistryError>;

    /// Idempotency lookup on `(registered_by, content_address)`, any status.
    async fn find_by_registrant(
        &self,
        registered_by: &PrincipalRef,
        address: &ContentAddress,
    ) -> Result<Option<RegistryRecord>, RegistryError>;

    /// Whether any record points at `location`.
    async fn references_location(&self, location: &ArtifactLocation)
        -> Result<bool, RegistryError>;

    /// Records matching `filter`, ordered by `registered_at`.
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<RegistryRecord>, RegistryError>;

    /// Record that the public registry holds a copy. Applies only while the
    /// record is still resolved and declassified, and settles any replication
    /// debt. Returns `false` when the record is missing or was reclassified.
    async fn mark_public_replica(&self, id: RecordId) -> Result<bool, RegistryError>;

    async fn set_classification(
        &self,
        id: RecordId,
        classification: Classification,
        membership: RegistryMembership,
    ) -> Result<Option<RegistryRecord>, RegistryError>;
}

/// Work-queue operations over the restricted registry.
///
/// Claims are leases: a claimed record carries `Lease { owner, expires_at }`
/// and every mutation below is fenced on the lease owner, so a worker whose
/// lease was reclaimed cannot overwrite the new owner's progress.
#[async_trait]
pub trait MaterializationQueue: Registry {
    /// Revert `Resolving` records with expired leases to `Pending` and drop
    /// expired leases on replication claims. Returns the number reverted.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, RegistryError>;

    /// Claim up to `limit` records needing work, oldest first. Pending
    /// records move to `Resolving`; resolved records owing a public replica
    /// keep their status and only gain the lease.
    async fn claim_pending(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<RegistryRecord>, RegistryError>;

    /// `Resolving → Resolved`, setting the address and durable location.
    /// Returns `None` if the caller no longer owns the lease.
    async fn complete_resolution(
        &self,
        id: RecordId,
        worker_id: &str,
        address: &ContentAddress,
        location: &ArtifactLocation,
        now: DateTime<Utc>,
    ) -> Result<Option<RegistryRecord>, RegistryError>;

    /// Drop the caller's lease after successful work.
    async fn release(&self, id: RecordId, worker_id: &str) -> Result<bool, RegistryError>;

    /// Count a failed resolution attempt and drop the lease. At
    /// `max_attempts` the record becomes `Failed`; otherwise it is retried no
    /// earlier than `retry_at`. Only `Resolving` records can fail this way.
    async fn record_failure(
        &self,
        id: RecordId,
        worker_id: &str,
        error: &str,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<RegistryRecord>, RegistryError>;

    /// Count a failed public-replica write on a `Resolved` record and drop the
    /// lease. The status never changes. At `max_attempts` no retry is
    /// scheduled and the record waits for an operator.
    async fn record_replication_failure(
        &self,
        id: RecordId,
        worker_id: &str,
        error: &str,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<RegistryRecord>, RegistryError>;

    /// Move straight to `Failed`, for faults that retrying cannot fix.
    async fn mark_failed(
        &self,
        id: RecordId,
        worker_id: &str,
        error: &str,
    ) -> Result<Option<RegistryRecord>, RegistryError>;

    /// Operator re-queue with a fresh attempt budget, for `Failed` records and
    /// for resolved records whose replication was given up. Returns `None`
    /// if the record is in neither state.
    async fn requeue(&self, id: RecordId) -> Result<Option<RegistryRecord>, RegistryError>;
}

/// Handles to both registries, injected into every service.
#[derive(Clone)]
pub struct Registries {
    pub restricted: Arc<dyn MaterializationQueue>,
    pub public: Arc<dyn Registry>,
}

impl Registries {
    pub fn new(restricted: Arc<dyn MaterializationQueue>, public: Arc<dyn Registry>) -> Self {
        Self { restricted, public }
    }

    /// Fresh in-memory pair.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryRegistry::restricted()),
            Arc::new(MemoryRegistry::public()),
        )
    }

    /// Whether any record in either registry points at `location`.
    pub async fn references_location(
        &self,
        location: &ArtifactLocation,
    ) -> Result<bool, RegistryError> {
        if self.restricted.references_location(location).await? {
            return Ok(true);
        }
        self.public.references_location(location).await
    }

    /// Write the public copy of `record`, then mark the restricted record as
    /// replicated.
    ///
    /// Reclassification changes the restricted record before withdrawing the
    /// public copy, so if the mark is refused here the record was
    /// reclassified mid-flight and the copy just written is removed again.
    /// Returns whether the record ended up replicated.
    pub async fn replicate_public(&self, record: &RegistryRecord) -> Result<bool, RegistryError> {
        self.public.upsert(record.public_copy()).await?;

        match self.restricted.mark_public_replica(record.id).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.public.remove(record.id).await?;
                tracing::info!(
                    record_id = %record.id,
                    "Record reclassified during replication; public copy withdrawn"
                );
                Ok(false)
            }
            Err(e) => {
                // Unconfirmed copies do not stay public.
                if let Err(remove_err) = self.public.remove(record.id).await {
                    tracing::error!(
                        record_id = %record.id,
                        error = %remove_err,
                        "Could not withdraw unconfirmed public copy"
                    );
                }
                Err(e)
            }
        }
    }
}

/// Refuse a status change the resolution state machine does not allow.
/// Re-entering the current status is accepted for idempotent replays.
pub(crate) fn check_transition(
    record: &RegistryRecord,
    target: ResolutionStatus,
) -> Result<(), RegistryError> {
    if record.status == target || record.status.can_transition_to(target) {
        return Ok(());
    }
    Err(RegistryError::Conflict(format!(
        "record {} cannot move from {} to {}",
        record.id, record.status, target
    )))
}
