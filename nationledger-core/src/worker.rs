//! MaterializationWorker: background resolution of pending records.
//!
//! Each cycle reclaims expired leases, claims a batch from the restricted
//! registry and, per record:
//!
//! 1. `Resolving`: fetch the source bytes, fingerprint them, persist them to
//!    the durable store and complete the resolution.
//! 2. Resolved + declassified without a public copy: mirror it.
//!
//! Failures are isolated per record. A failed resolution attempt is counted,
//! the lease dropped and the record retried after exponential backoff; at the
//! attempt ceiling it becomes `Failed` and an alert is emitted.
//!
//! A failed public mirror never touches the resolution status: the record
//! stays `Resolved` and verifiable, and the replication debt is counted
//! separately with the same backoff and ceiling. At the ceiling replication
//! is parked until an administrator requeues it.
//!
//! ## Idempotency
//!
//! Every step can be replayed after a crash. Content-addressed stores
//! deduplicate the durable write, `complete_resolution` accepts the same
//! address twice, and the public upsert is keyed by record id.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::artifact_store::{ArtifactStore, ArtifactStoreError};
use crate::config::WorkerConfig;
use crate::error::{LedgerError, Result};
use crate::events::{EventSink, LedgerEvent, TracingEventSink};
use crate::fingerprint::ContentFingerprinter;
use crate::gc::{discard_unreferenced, MemoryOrphanLog, OrphanLog, StoreRole};
use crate::registry::{Registries, RegistryError};
use crate::types::{RegistryRecord, ResolutionStatus};

/// Counters for one [`MaterializationWorker::run_once`] cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub reclaimed: usize,
    pub claimed: usize,
    pub resolved: usize,
    pub replicated: usize,
    pub retried: usize,
    pub failed: usize,
    /// Resolved records whose public replication hit the attempt ceiling.
    pub parked: usize,
}

enum Outcome {
    Done { resolved: bool, replicated: bool },
    /// Resolved, but the public mirror could not be written.
    ReplicationOwed {
        resolved: bool,
        record: RegistryRecord,
        error: LedgerError,
    },
    /// Another worker took over; nothing was written.
    LeaseLost,
    Failed,
}

pub struct MaterializationWorker {
    registries: Registries,
    source: Arc<dyn ArtifactStore>,
    store: Arc<dyn ArtifactStore>,
    config: WorkerConfig,
    events: Arc<dyn EventSink>,
    orphans: Arc<dyn OrphanLog>,
}

impl MaterializationWorker {
    /// `source` is where deferred uploads were staged; `store` is the
    /// durable artifact store.
    pub fn new(
        registries: Registries,
        source: Arc<dyn ArtifactStore>,
        store: Arc<dyn ArtifactStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            registries,
            source,
            store,
            config,
            events: Arc::new(TracingEventSink),
            orphans: Arc::new(MemoryOrphanLog::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_orphan_log(mut self, orphans: Arc<dyn OrphanLog>) -> Self {
        self.orphans = orphans;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run cycles until the shutdown signal is received.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.config.worker_id, "MaterializationWorker started");

        loop {
            if *shutdown_rx.borrow() {
                tracing::info!("MaterializationWorker shutting down");
                break;
            }

            if let Err(e) = self.run_once().await {
                tracing::warn!(error = %e, "MaterializationWorker: cycle failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = shutdown_rx.changed() => {
                    tracing::info!("MaterializationWorker shutting down (during sleep)");
                    break;
                }
            }
        }

        tracing::info!("MaterializationWorker stopped");
    }

    /// One reclaim + claim + process cycle. Only queue-level failures are
    /// returned; per-record failures are counted in the report.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let now = Utc::now();

        report.reclaimed = self.registries.restricted.reclaim_expired(now).await?;
        if report.reclaimed > 0 {
            tracing::info!(
                count = report.reclaimed,
                "MaterializationWorker: reclaimed expired leases"
            );
        }

        let batch = self
            .registries
            .restricted
            .claim_pending(
                &self.config.worker_id,
                now,
                self.config.lease(),
                self.config.batch_size,
            )
            .await?;
        report.claimed = batch.len();

        if !batch.is_empty() {
            tracing::debug!(
                count = batch.len(),
                "MaterializationWorker: processing claimed records"
            );
        }

        for record in batch {
            match self.process(&record).await {
                Ok(Outcome::Done {
                    resolved,
                    replicated,
                }) => {
                    report.resolved += usize::from(resolved);
                    report.replicated += usize::from(replicated);
                    self.release(&record).await;
                }
                Ok(Outcome::ReplicationOwed {
                    resolved,
                    record: current,
                    error,
                }) => {
                    report.resolved += usize::from(resolved);
                    match self.defer_replication(&current, &error).await {
                        Some(updated) if updated.replication_exhausted() => report.parked += 1,
                        Some(_) => report.retried += 1,
                        None => {}
                    }
                }
                Ok(Outcome::LeaseLost) => {}
                Ok(Outcome::Failed) => report.failed += 1,
                Err(e) => match self.fail_attempt(&record, &e).await {
                    Some(ResolutionStatus::Failed) => report.failed += 1,
                    Some(_) => report.retried += 1,
                    None => {}
                },
            }
        }

        Ok(report)
    }

    async fn process(&self, record: &RegistryRecord) -> Result<Outcome> {
        let mut resolved = false;
        let mut current = record.clone();

        if record.status == ResolutionStatus::Resolving {
            current = match self.resolve(record).await? {
                Some(updated) => updated,
                None => return Ok(Outcome::LeaseLost),
            };
            if current.status == ResolutionStatus::Failed {
                return Ok(Outcome::Failed);
            }
            resolved = true;
        }

        let replicated = match self.replicate(&current).await {
            Ok(replicated) => replicated,
            Err(error) => {
                return Ok(Outcome::ReplicationOwed {
                    resolved,
                    record: current,
                    error,
                })
            }
        };
        Ok(Outcome::Done {
            resolved,
            replicated,
        })
    }

    /// Fetch, fingerprint, persist, complete. `None` if the lease was lost.
    async fn resolve(&self, record: &RegistryRecord) -> Result<Option<RegistryRecord>> {
        let source_location = record.artifact_location.clone();

        let bytes = self
            .bounded("source fetch", self.source.get(&source_location))
            .await?;
        if bytes.is_empty() {
            return Err(LedgerError::EmptyArtifact);
        }
        let address = ContentFingerprinter::digest_cooperative(&bytes).await;

        let durable = self
            .bounded(
                "artifact persistence",
                self.store.put(&bytes, &record.content_type),
            )
            .await?;

        let completed = self
            .registries
            .restricted
            .complete_resolution(
                record.id,
                &self.config.worker_id,
                &address,
                &durable,
                Utc::now(),
            )
            .await;

        let updated = match completed {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                tracing::warn!(
                    record_id = %record.id,
                    worker_id = %self.config.worker_id,
                    "MaterializationWorker: lease lost before completion"
                );
                return Ok(None);
            }
            Err(RegistryError::Conflict(reason)) => {
                // Same registrant already holds these bytes; retrying cannot help.
                discard_unreferenced(
                    &self.registries,
                    self.store.as_ref(),
                    StoreRole::Durable,
                    &durable,
                    self.orphans.as_ref(),
                    self.events.as_ref(),
                )
                .await;
                return self.fail_permanently(record, &reason).await.map(Some);
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            record_id = %record.id,
            content_address = %address,
            location = %durable,
            "MaterializationWorker: resolved record"
        );
        self.events.emit(LedgerEvent::Resolved {
            record_id: record.id,
            content_address: address,
        });

        if source_location != durable {
            discard_unreferenced(
                &self.registries,
                self.source.as_ref(),
                StoreRole::Staging,
                &source_location,
                self.orphans.as_ref(),
                self.events.as_ref(),
            )
            .await;
        }

        Ok(Some(updated))
    }

    /// Mirror a declassified record into the public registry. Re-reads the
    /// record first so a concurrent reclassification is honoured.
    async fn replicate(&self, record: &RegistryRecord) -> Result<bool> {
        if !record.needs_public_replica() {
            return Ok(false);
        }

        let Some(current) = self.registries.restricted.get(record.id).await? else {
            return Ok(false);
        };
        if !current.needs_public_replica() {
            tracing::debug!(
                record_id = %record.id,
                "MaterializationWorker: replication no longer required"
            );
            return Ok(false);
        }

        if !self.registries.replicate_public(&current).await? {
            tracing::info!(
                record_id = %current.id,
                "MaterializationWorker: reclassified during replication, nothing published"
            );
            return Ok(false);
        }

        tracing::info!(record_id = %current.id, "MaterializationWorker: replicated to public registry");
        self.events.emit(LedgerEvent::PublicReplicated {
            record_id: current.id,
        });
        Ok(true)
    }

    async fn release(&self, record: &RegistryRecord) {
        if let Err(e) = self
            .registries
            .restricted
            .release(record.id, &self.config.worker_id)
            .await
        {
            // The lease expires on its own.
            tracing::warn!(
                record_id = %record.id,
                error = %e,
                "MaterializationWorker: failed to release lease"
            );
        }
    }

    /// Count a failed attempt. Returns the record's new status, or `None` if
    /// the failure could not be recorded.
    async fn fail_attempt(
        &self,
        record: &RegistryRecord,
        error: &LedgerError,
    ) -> Option<ResolutionStatus> {
        let attempts = record.attempts + 1;
        let delay = self.config.backoff_for(attempts);
        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let message = error.to_string();

        let updated = match self
            .registries
            .restricted
            .record_failure(
                record.id,
                &self.config.worker_id,
                &message,
                self.config.max_attempts,
                retry_at,
            )
            .await
        {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                tracing::warn!(
                    record_id = %record.id,
                    error = %message,
                    "MaterializationWorker: lease lost before failure was recorded"
                );
                return None;
            }
            Err(e) => {
                tracing::error!(
                    record_id = %record.id,
                    error = %e,
                    "MaterializationWorker: failed to record failure"
                );
                return None;
            }
        };

        if updated.status == ResolutionStatus::Failed {
            tracing::warn!(
                record_id = %record.id,
                attempts = updated.attempts,
                error = %message,
                "MaterializationWorker: record permanently failed after max attempts"
            );
            self.events.emit(LedgerEvent::MaterializationFailed {
                record_id: record.id,
                attempts: updated.attempts,
                error: message,
            });
        } else {
            tracing::debug!(
                record_id = %record.id,
                attempts = updated.attempts,
                retry_at = ?updated.next_attempt_at,
                error = %message,
                "MaterializationWorker: attempt failed, will retry"
            );
            self.events.emit(LedgerEvent::ResolutionRetry {
                record_id: record.id,
                attempts: updated.attempts,
                error: message,
                retry_at: updated.next_attempt_at,
            });
        }
        Some(updated.status)
    }

    /// Count a failed public mirror against a resolved record. Returns the
    /// updated record, or `None` if the failure could not be recorded.
    async fn defer_replication(
        &self,
        record: &RegistryRecord,
        error: &LedgerError,
    ) -> Option<RegistryRecord> {
        let attempts = record.replication_attempts + 1;
        let delay = self.config.backoff_for(attempts);
        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let message = error.to_string();

        let updated = match self
            .registries
            .restricted
            .record_replication_failure(
                record.id,
                &self.config.worker_id,
                &message,
                self.config.max_attempts,
                retry_at,
            )
            .await
        {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                tracing::warn!(
                    record_id = %record.id,
                    error = %message,
                    "MaterializationWorker: lease lost before replication failure was recorded"
                );
                return None;
            }
            Err(e) => {
                tracing::error!(
                    record_id = %record.id,
                    error = %e,
                    "MaterializationWorker: failed to record replication failure"
                );
                return None;
            }
        };

        if updated.replication_exhausted() {
            tracing::warn!(
                record_id = %record.id,
                attempts = updated.replication_attempts,
                error = %message,
                "MaterializationWorker: public replication parked after max attempts"
            );
            self.events.emit(LedgerEvent::ReplicationStalled {
                record_id: record.id,
                attempts: updated.replication_attempts,
                error: message,
            });
        } else {
            tracing::debug!(
                record_id = %record.id,
                attempts = updated.replication_attempts,
                retry_at = ?updated.next_attempt_at,
                error = %message,
                "MaterializationWorker: public replication failed, will retry"
            );
            self.events.emit(LedgerEvent::ReplicationRetry {
                record_id: record.id,
                attempts: updated.replication_attempts,
                error: message,
                retry_at: updated.next_attempt_at,
            });
        }
        Some(updated)
    }

    async fn fail_permanently(
        &self,
        record: &RegistryRecord,
        reason: &str,
    ) -> Result<RegistryRecord> {
        let updated = self
            .registries
            .restricted
            .mark_failed(record.id, &self.config.worker_id, reason)
            .await?
            .unwrap_or_else(|| RegistryRecord {
                status: ResolutionStatus::Failed,
                ..record.clone()
            });

        tracing::warn!(
            record_id = %record.id,
            error = %reason,
            "MaterializationWorker: record failed without retry"
        );
        self.events.emit(LedgerEvent::MaterializationFailed {
            record_id: record.id,
            attempts: updated.attempts,
            error: reason.to_string(),
        });
        Ok(updated)
    }

    /// Bound a store operation by the configured timeout.
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, ArtifactStoreError>>,
    {
        let limit: Duration = self.config.operation_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(LedgerError::StoreUnavailable(e)),
            Err(_) => Err(LedgerError::Timeout {
                operation,
                after: limit,
            }),
        }
    }
}
