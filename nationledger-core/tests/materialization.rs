//! Deferred registration through the materialization worker.

mod helpers;

use std::sync::Arc;

use chrono::Utc;
use helpers::{budget, channel_sink, flaky_public, reclassified_mid_replication};
use nationledger_core::{
    ArtifactLocation, ArtifactStore, Classification, ContentFingerprinter, InMemoryArtifactStore,
    LedgerError, LedgerEvent, MaterializationWorker, Principal, RecordFilter, RegistrationConfig,
    RegistrationService, Registries, Registry, RegistryMembership, ResolutionStatus,
    VerificationService, WorkerConfig,
};

struct Harness {
    registries: Registries,
    staging: Arc<InMemoryArtifactStore>,
    store: Arc<InMemoryArtifactStore>,
    registration: RegistrationService,
}

impl Harness {
    fn new() -> Self {
        Self::with_registries(Registries::in_memory())
    }

    fn with_registries(registries: Registries) -> Self {
        let staging = Arc::new(InMemoryArtifactStore::new());
        let store = Arc::new(InMemoryArtifactStore::new());
        let registration = RegistrationService::new(
            registries.clone(),
            store.clone(),
            RegistrationConfig::default(),
        )
        .with_staging(staging.clone());
        Self {
            registries,
            staging,
            store,
            registration,
        }
    }

    fn worker(&self, id: &str) -> MaterializationWorker {
        MaterializationWorker::new(
            self.registries.clone(),
            self.staging.clone(),
            self.store.clone(),
            WorkerConfig::default()
                .worker_id(id)
                .max_attempts(3)
                .backoff_ms(0, 0),
        )
    }

    fn verification(&self) -> VerificationService {
        VerificationService::new(self.registries.clone(), self.store.clone())
    }
}

#[tokio::test]
async fn test_pending_declassified_converges_to_both_registries() {
    let h = Harness::new();
    let record = h
        .registration
        .stage_and_register_deferred(
            &Principal::employee("emp-1"),
            b"AAA",
            budget(Classification::Declassified),
        )
        .await
        .unwrap();
    assert_eq!(record.membership, RegistryMembership::restricted_only());
    assert!(h.registries.public.get(record.id).await.unwrap().is_none());

    let report = h.worker("w1").run_once().await.unwrap();
    assert_eq!(report.resolved, 1);
    assert_eq!(report.replicated, 1);

    let resolved = h.registries.restricted.get(record.id).await.unwrap().unwrap();
    assert_eq!(resolved.status, ResolutionStatus::Resolved);
    assert_eq!(
        resolved.content_address,
        Some(ContentFingerprinter::digest(b"AAA"))
    );
    assert_eq!(resolved.membership, RegistryMembership::both());
    assert_eq!(resolved.registered_at, record.registered_at);

    let public = h.registries.public.get(record.id).await.unwrap().unwrap();
    assert_eq!(public.content_address, resolved.content_address);

    let result = h.verification().verify(b"AAA").await.unwrap();
    assert!(result.authentic);
    assert_eq!(result.record.map(|r| r.id), Some(record.id));
}

#[tokio::test]
async fn test_deferred_restricted_never_reaches_public() {
    let h = Harness::new();
    h.registration
        .stage_and_register_deferred(
            &Principal::employee("emp-1"),
            b"SECRET",
            budget(Classification::Restricted),
        )
        .await
        .unwrap();

    let report = h.worker("w1").run_once().await.unwrap();
    assert_eq!(report.resolved, 1);
    assert_eq!(report.replicated, 0);
    assert!(h
        .registries
        .public
        .list(&RecordFilter::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_claims_are_exclusive_between_workers() {
    let h = Harness::new();
    let emp = Principal::employee("emp-1");
    for body in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        h.registration
            .stage_and_register_deferred(&emp, body, budget(Classification::Restricted))
            .await
            .unwrap();
    }

    let now = Utc::now();
    let lease = chrono::Duration::seconds(60);
    let a = h
        .registries
        .restricted
        .claim_pending("a", now, lease, 2)
        .await
        .unwrap();
    let b = h
        .registries
        .restricted
        .claim_pending("b", now, lease, 10)
        .await
        .unwrap();

    assert_eq!(a.len(), 2);
    assert_eq!(b.len(), 1);
    assert!(a.iter().all(|r| r.id != b[0].id));
    assert!(a
        .iter()
        .chain(b.iter())
        .all(|r| r.status == ResolutionStatus::Resolving));
}

#[tokio::test]
async fn test_expired_lease_returns_record_to_queue() {
    let h = Harness::new();
    let record = h
        .registration
        .stage_and_register_deferred(
            &Principal::employee("emp-1"),
            b"AAA",
            budget(Classification::Restricted),
        )
        .await
        .unwrap();

    // A worker claims and then disappears.
    let claimed = h
        .registries
        .restricted
        .claim_pending("crashed", Utc::now(), chrono::Duration::zero(), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    let report = h.worker("w2").run_once().await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.resolved, 1);

    // The crashed worker can no longer complete.
    let stale = h
        .registries
        .restricted
        .complete_resolution(
            record.id,
            "crashed",
            &ContentFingerprinter::digest(b"AAA"),
            &ArtifactLocation::new("memory://stale"),
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(stale.is_none());
}

#[tokio::test]
async fn test_missing_source_fails_after_ceiling_and_requeues() {
    let h = Harness::new();
    let (sink, mut events) = channel_sink();
    let staged = h.staging.put(b"AAA", "text/plain").await.unwrap();
    let record = h
        .registration
        .register_deferred(
            &Principal::employee("emp-1"),
            staged.clone(),
            budget(Classification::Declassified),
        )
        .await
        .unwrap();
    h.staging.delete(&staged).await.unwrap();

    let worker = h.worker("w1").with_events(sink);
    for _ in 0..3 {
        worker.run_once().await.unwrap();
    }

    let failed = h.registries.restricted.get(record.id).await.unwrap().unwrap();
    assert_eq!(failed.status, ResolutionStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert!(failed.content_address.is_none());

    let emitted = events.drain();
    let retries = emitted
        .iter()
        .filter(|e| matches!(e, LedgerEvent::ResolutionRetry { .. }))
        .count();
    assert_eq!(retries, 2);
    assert!(emitted
        .iter()
        .any(|e| matches!(e, LedgerEvent::MaterializationFailed { attempts: 3, .. })));

    // Further cycles leave it alone.
    assert_eq!(worker.run_once().await.unwrap().claimed, 0);

    // Operator restores the source and re-queues.
    let err = h
        .registration
        .requeue(&Principal::employee("emp-1"), record.id)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Unauthorized(_)));

    let restaged = h.staging.put(b"AAA", "text/plain").await.unwrap();
    let requeued = h
        .registration
        .requeue(&Principal::admin("root"), record.id)
        .await
        .unwrap();
    assert_eq!(requeued.status, ResolutionStatus::Pending);
    assert_eq!(requeued.attempts, 0);

    // Point the record at the restored upload the way an operator would.
    let mut repaired = requeued.clone();
    repaired.artifact_location = restaged;
    h.registries.restricted.upsert(repaired).await.unwrap();

    let report = worker.run_once().await.unwrap();
    assert_eq!(report.resolved, 1);
    assert_eq!(report.replicated, 1);
}

#[tokio::test]
async fn test_one_bad_record_does_not_block_others() {
    let h = Harness::new();
    let emp = Principal::employee("emp-1");

    let bad_location = h.staging.put(b"gone", "text/plain").await.unwrap();
    let bad = h
        .registration
        .register_deferred(&emp, bad_location.clone(), budget(Classification::Restricted))
        .await
        .unwrap();
    h.staging.delete(&bad_location).await.unwrap();

    let good = h
        .registration
        .stage_and_register_deferred(&emp, b"fine", budget(Classification::Restricted))
        .await
        .unwrap();

    let report = h.worker("w1").run_once().await.unwrap();
    assert_eq!(report.claimed, 2);
    assert_eq!(report.resolved, 1);
    assert_eq!(report.retried, 1);

    let good = h.registries.restricted.get(good.id).await.unwrap().unwrap();
    assert_eq!(good.status, ResolutionStatus::Resolved);
    let bad = h.registries.restricted.get(bad.id).await.unwrap().unwrap();
    assert_eq!(bad.status, ResolutionStatus::Pending);
    assert_eq!(bad.attempts, 1);
}

#[tokio::test]
async fn test_duplicate_of_own_registration_is_marked_failed() {
    let h = Harness::new();
    let emp = Principal::employee("emp-1");

    h.registration
        .register(&emp, b"AAA", budget(Classification::Restricted))
        .await
        .unwrap();
    let pending = h
        .registration
        .stage_and_register_deferred(&emp, b"AAA", budget(Classification::Restricted))
        .await
        .unwrap();

    let report = h.worker("w1").run_once().await.unwrap();
    assert_eq!(report.failed, 1);

    let record = h.registries.restricted.get(pending.id).await.unwrap().unwrap();
    assert_eq!(record.status, ResolutionStatus::Failed);
    assert!(record.content_address.is_none());
}

#[tokio::test]
async fn test_rerun_after_completion_is_idempotent() {
    let h = Harness::new();
    let record = h
        .registration
        .stage_and_register_deferred(
            &Principal::employee("emp-1"),
            b"AAA",
            budget(Classification::Declassified),
        )
        .await
        .unwrap();

    h.worker("w1").run_once().await.unwrap();
    let first = h.registries.restricted.get(record.id).await.unwrap().unwrap();

    let again = h.worker("w2").run_once().await.unwrap();
    assert_eq!(again.claimed, 0);
    let second = h.registries.restricted.get(record.id).await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(
        h.registries
            .public
            .list(&RecordFilter::default())
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_worker_completes_deferred_public_replication() {
    let h = Harness::with_registries(flaky_public(1));
    let record = h
        .registration
        .register(
            &Principal::employee("emp-1"),
            b"AAA",
            budget(Classification::Declassified),
        )
        .await
        .unwrap();
    assert_eq!(record.status, ResolutionStatus::Resolved);
    assert_eq!(record.membership, RegistryMembership::restricted_only());

    let report = h.worker("w1").run_once().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.resolved, 0);
    assert_eq!(report.replicated, 1);

    let stored = h.registries.restricted.get(record.id).await.unwrap().unwrap();
    assert_eq!(stored.membership, RegistryMembership::both());
    assert!(stored.lease.is_none());
    assert!(h.registries.public.get(record.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_failed_public_mirror_never_demotes_resolved_record() {
    // Synchronous mirror plus three worker attempts all fail
    let h = Harness::with_registries(flaky_public(4));
    let (sink, mut events) = channel_sink();
    let employee = Principal::employee("emp-1");
    let record = h
        .registration
        .register(&employee, b"AAA", budget(Classification::Declassified))
        .await
        .unwrap();
    assert_eq!(record.status, ResolutionStatus::Resolved);

    let worker = h.worker("w1").with_events(sink);
    let mut parked = 0;
    for _ in 0..3 {
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.failed, 0);
        parked += report.parked;
    }
    assert_eq!(parked, 1);

    let stored = h.registries.restricted.get(record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ResolutionStatus::Resolved);
    assert_eq!(stored.content_address, record.content_address);
    assert_eq!(stored.membership, RegistryMembership::restricted_only());
    assert_eq!(stored.replication_attempts, 3);
    assert!(stored.replication_exhausted());
    assert_eq!(stored.attempts, 0);

    let emitted = events.drain();
    let retries = emitted
        .iter()
        .filter(|e| matches!(e, LedgerEvent::ReplicationRetry { .. }))
        .count();
    assert_eq!(retries, 2);
    assert!(emitted
        .iter()
        .any(|e| matches!(e, LedgerEvent::ReplicationStalled { attempts: 3, .. })));
    assert!(!emitted
        .iter()
        .any(|e| matches!(e, LedgerEvent::MaterializationFailed { .. })));

    // Parked replication stays out of the queue
    assert_eq!(worker.run_once().await.unwrap().claimed, 0);

    // Still authentic, and re-registration is still idempotent
    let result = h.verification().verify(b"AAA").await.unwrap();
    assert!(result.authentic);
    let again = h
        .registration
        .register(&employee, b"AAA", budget(Classification::Declassified))
        .await
        .unwrap();
    assert_eq!(again.id, record.id);
    assert_eq!(again.status, ResolutionStatus::Resolved);

    // Admin requeue resumes replication
    let requeued = h
        .registration
        .requeue(&Principal::admin("root"), record.id)
        .await
        .unwrap();
    assert_eq!(requeued.status, ResolutionStatus::Resolved);
    assert_eq!(requeued.replication_attempts, 0);
    assert!(requeued.replication_error.is_none());

    let report = worker.run_once().await.unwrap();
    assert_eq!(report.replicated, 1);
    let stored = h.registries.restricted.get(record.id).await.unwrap().unwrap();
    assert_eq!(stored.membership, RegistryMembership::both());
    assert!(stored.replication_error.is_none());
    assert!(h.registries.public.get(record.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_reclassification_during_worker_replication_withdraws_copy() {
    let (registries, restricted) = reclassified_mid_replication();
    let h = Harness::with_registries(registries);
    let staged = h.staging.put(b"AAA", "text/plain").await.unwrap();
    let record = h
        .registration
        .register_deferred(
            &Principal::employee("emp-1"),
            staged,
            budget(Classification::Declassified),
        )
        .await
        .unwrap();

    let report = h.worker("w1").run_once().await.unwrap();
    assert_eq!(report.resolved, 1);
    assert_eq!(report.replicated, 0);

    let stored = restricted.get(record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ResolutionStatus::Resolved);
    assert_eq!(stored.classification, Classification::Restricted);
    assert_eq!(stored.membership, RegistryMembership::restricted_only());
    assert!(h.registries.public.get(record.id).await.unwrap().is_none());
    assert!(h
        .registries
        .public
        .list(&RecordFilter::default())
        .await
        .unwrap()
        .is_empty());

    assert_eq!(h.worker("w1").run_once().await.unwrap().claimed, 0);
}
