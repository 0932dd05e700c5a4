//! Shared fixtures and fault-injecting fakes for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use nationledger_core::{
    ArtifactLocation, ArtifactStore, ArtifactStoreError, ChannelEventSink, Classification,
    ContentAddress, DocumentMetadata, InMemoryArtifactStore, MaterializationQueue, MemoryRegistry,
    PrincipalRef, RecordFilter, RecordId, Registries, Registry, RegistryError, RegistryKind,
    RegistryMembership, RegistryRecord,
};
use nationledger_core::events::EventReceiver;

pub fn budget(classification: Classification) -> DocumentMetadata {
    DocumentMetadata::new("Budget 2024", "Finance", classification)
}

pub fn channel_sink() -> (Arc<ChannelEventSink>, EventReceiver) {
    let (sink, receiver) = ChannelEventSink::new(64);
    (Arc::new(sink), receiver)
}

// ---------------------------------------------------------------------------
// Artifact stores
// ---------------------------------------------------------------------------

/// Every `put` fails; reads delegate.
#[derive(Default)]
pub struct FailingStore {
    pub inner: InMemoryArtifactStore,
}

#[async_trait]
impl ArtifactStore for FailingStore {
    async fn put(&self, _: &[u8], _: &str) -> Result<ArtifactLocation, ArtifactStoreError> {
        Err(ArtifactStoreError::Unavailable("injected put failure".into()))
    }

    async fn get(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactStoreError> {
        self.inner.get(location).await
    }

    async fn delete(&self, location: &ArtifactLocation) -> Result<(), ArtifactStoreError> {
        self.inner.delete(location).await
    }

    async fn exists(&self, location: &ArtifactLocation) -> Result<bool, ArtifactStoreError> {
        self.inner.exists(location).await
    }
}

/// `put` sleeps before delegating.
pub struct SlowStore {
    pub inner: InMemoryArtifactStore,
    pub delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryArtifactStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl ArtifactStore for SlowStore {
    async fn put(
        &self,
        content: &[u8],
        content_type: &str,
    ) -> Result<ArtifactLocation, ArtifactStoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(content, content_type).await
    }

    async fn get(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactStoreError> {
        self.inner.get(location).await
    }

    async fn delete(&self, location: &ArtifactLocation) -> Result<(), ArtifactStoreError> {
        self.inner.delete(location).await
    }

    async fn exists(&self, location: &ArtifactLocation) -> Result<bool, ArtifactStoreError> {
        self.inner.exists(location).await
    }
}

/// `delete` always fails; everything else delegates.
#[derive(Default)]
pub struct UndeletableStore {
    pub inner: InMemoryArtifactStore,
}

#[async_trait]
impl ArtifactStore for UndeletableStore {
    async fn put(
        &self,
        content: &[u8],
        content_type: &str,
    ) -> Result<ArtifactLocation, ArtifactStoreError> {
        self.inner.put(content, content_type).await
    }

    async fn get(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactStoreError> {
        self.inner.get(location).await
    }

    async fn delete(&self, _: &ArtifactLocation) -> Result<(), ArtifactStoreError> {
        Err(ArtifactStoreError::Unavailable("injected delete failure".into()))
    }

    async fn exists(&self, location: &ArtifactLocation) -> Result<bool, ArtifactStoreError> {
        self.inner.exists(location).await
    }
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

/// Wraps a [`MemoryRegistry`]; the first `insert_failures` inserts and the
/// first `upsert_failures` upserts fail with `Unavailable`.
///
/// With [`FlakyRegistry::reclassifying_after_upsert`], the first successful
/// upsert is followed by an administrator reclassifying that record back to
/// restricted, exactly as `RegistrationService::reclassify` does it.
pub struct FlakyRegistry {
    inner: MemoryRegistry,
    insert_failures: AtomicUsize,
    upsert_failures: AtomicUsize,
    pub insert_calls: AtomicUsize,
    reclassify_after_upsert: Mutex<Option<Arc<MemoryRegistry>>>,
}

impl FlakyRegistry {
    pub fn new(kind: RegistryKind) -> Self {
        Self {
            inner: MemoryRegistry::new(kind),
            insert_failures: AtomicUsize::new(0),
            upsert_failures: AtomicUsize::new(0),
            insert_calls: AtomicUsize::new(0),
            reclassify_after_upsert: Mutex::new(None),
        }
    }

    pub fn reclassifying_after_upsert(self, restricted: Arc<MemoryRegistry>) -> Self {
        *self.reclassify_after_upsert.lock().unwrap() = Some(restricted);
        self
    }

    pub fn failing_inserts(self, n: usize) -> Self {
        self.insert_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn failing_upserts(self, n: usize) -> Self {
        self.upsert_failures.store(n, Ordering::SeqCst);
        self
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Registry for FlakyRegistry {
    fn kind(&self) -> RegistryKind {
        self.inner.kind()
    }

    async fn insert(&self, record: RegistryRecord) -> Result<RegistryRecord, RegistryError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.insert_failures) {
            return Err(RegistryError::Unavailable("injected insert failure".into()));
        }
        self.inner.insert(record).await
    }

    async fn upsert(&self, record: RegistryRecord) -> Result<RegistryRecord, RegistryError> {
        if Self::take(&self.upsert_failures) {
            return Err(RegistryError::Unavailable("injected upsert failure".into()));
        }
        let id = record.id;
        let written = self.inner.upsert(record).await?;

        let restricted = self.reclassify_after_upsert.lock().unwrap().take();
        if let Some(restricted) = restricted {
            restricted
                .set_classification(
                    id,
                    Classification::Restricted,
                    RegistryMembership::restricted_only(),
                )
                .await?;
            self.inner.remove(id).await?;
        }
        Ok(written)
    }

    async fn get(&self, id: RecordId) -> Result<Option<RegistryRecord>, RegistryError> {
        self.inner.get(id).await
    }

    async fn remove(&self, id: RecordId) -> Result<bool, RegistryError> {
        self.inner.remove(id).await
    }

    async fn find_by_content_address(
        &self,
        address: &ContentAddress,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        self.inner.find_by_content_address(address).await
    }

    async fn find_by_registrant(
        &self,
        registered_by: &PrincipalRef,
        address: &ContentAddress,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        self.inner.find_by_registrant(registered_by, address).await
    }

    async fn references_location(
        &self,
        location: &ArtifactLocation,
    ) -> Result<bool, RegistryError> {
        self.inner.references_location(location).await
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<RegistryRecord>, RegistryError> {
        self.inner.list(filter).await
    }

    async fn mark_public_replica(&self, id: RecordId) -> Result<bool, RegistryError> {
        self.inner.mark_public_replica(id).await
    }

    async fn set_classification(
        &self,
        id: RecordId,
        classification: Classification,
        membership: RegistryMembership,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        self.inner
            .set_classification(id, classification, membership)
            .await
    }
}

#[async_trait]
impl MaterializationQueue for FlakyRegistry {
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, RegistryError> {
        self.inner.reclaim_expired(now).await
    }

    async fn claim_pending(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<RegistryRecord>, RegistryError> {
        self.inner.claim_pending(worker_id, now, lease, limit).await
    }

    async fn complete_resolution(
        &self,
        id: RecordId,
        worker_id: &str,
        address: &ContentAddress,
        location: &ArtifactLocation,
        now: DateTime<Utc>,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        self.inner
            .complete_resolution(id, worker_id, address, location, now)
            .await
    }

    async fn release(&self, id: RecordId, worker_id: &str) -> Result<bool, RegistryError> {
        self.inner.release(id, worker_id).await
    }

    async fn record_failure(
        &self,
        id: RecordId,
        worker_id: &str,
        error: &str,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        self.inner
            .record_failure(id, worker_id, error, max_attempts, retry_at)
            .await
    }

    async fn record_replication_failure(
        &self,
        id: RecordId,
        worker_id: &str,
        error: &str,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        self.inner
            .record_replication_failure(id, worker_id, error, max_attempts, retry_at)
            .await
    }

    async fn mark_failed(
        &self,
        id: RecordId,
        worker_id: &str,
        error: &str,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        self.inner.mark_failed(id, worker_id, error).await
    }

    async fn requeue(&self, id: RecordId) -> Result<Option<RegistryRecord>, RegistryError> {
        self.inner.requeue(id).await
    }
}

/// Restricted registry that fails the first `n` inserts.
pub fn flaky_restricted(n: usize) -> (Registries, Arc<FlakyRegistry>) {
    let restricted = Arc::new(FlakyRegistry::new(RegistryKind::Restricted).failing_inserts(n));
    let registries = Registries::new(restricted.clone(), Arc::new(MemoryRegistry::public()));
    (registries, restricted)
}

/// Public registry that fails the first `n` upserts.
pub fn flaky_public(n: usize) -> Registries {
    Registries::new(
        Arc::new(MemoryRegistry::restricted()),
        Arc::new(FlakyRegistry::new(RegistryKind::Public).failing_upserts(n)),
    )
}

/// Public registry where the record is reclassified to restricted right
/// after its public copy is written. Returns the restricted registry too.
pub fn reclassified_mid_replication() -> (Registries, Arc<MemoryRegistry>) {
    let restricted = Arc::new(MemoryRegistry::restricted());
    let public = FlakyRegistry::new(RegistryKind::Public)
        .reclassifying_after_upsert(restricted.clone());
    let registries = Registries::new(restricted.clone(), Arc::new(public));
    (registries, restricted)
}
