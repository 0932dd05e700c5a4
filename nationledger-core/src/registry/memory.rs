//! In-process registry adapter.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{check_transition, MaterializationQueue, Registry, RegistryError};
use crate::fingerprint::ContentAddress;
use crate::types::{
    ArtifactLocation, Classification, Lease, PrincipalRef, RecordFilter, RecordId, RegistryKind,
    RegistryMembership, RegistryRecord, ResolutionStatus,
};

#[derive(Default)]
struct MemoryState {
    records: HashMap<RecordId, RegistryRecord>,
    by_address: HashMap<ContentAddress, Vec<RecordId>>,
}

impl MemoryState {
    fn index(&mut self, record: &RegistryRecord) {
        if let Some(address) = record.content_address {
            let ids = self.by_address.entry(address).or_default();
            if !ids.contains(&record.id) {
                ids.push(record.id);
            }
        }
    }

    fn unindex(&mut self, record: &RegistryRecord) {
        let Some(address) = record.content_address else {
            return;
        };
        if let Some(ids) = self.by_address.get_mut(&address) {
            ids.retain(|id| *id != record.id);
            if ids.is_empty() {
                self.by_address.remove(&address);
            }
        }
    }

    fn with_address(&self, address: &ContentAddress) -> impl Iterator<Item = &RegistryRecord> {
        self.by_address
            .get(address)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.records.get(id))
    }

    fn registrant_duplicate(
        &self,
        registered_by: &PrincipalRef,
        address: &ContentAddress,
        except: RecordId,
    ) -> Option<&RegistryRecord> {
        self.with_address(address)
            .find(|r| r.id != except && &r.registered_by == registered_by)
    }

    /// Record leased to `worker_id`, or `None`.
    fn leased_mut(&mut self, id: RecordId, worker_id: &str) -> Option<&mut RegistryRecord> {
        self.records
            .get_mut(&id)
            .filter(|r| r.lease.as_ref().is_some_and(|l| l.owner == worker_id))
    }
}

/// In-memory [`Registry`] and [`MaterializationQueue`].
pub struct MemoryRegistry {
    kind: RegistryKind,
    state: RwLock<MemoryState>,
}

impl MemoryRegistry {
    pub fn new(kind: RegistryKind) -> Self {
        Self {
            kind,
            state: RwLock::new(MemoryState::default()),
        }
    }

    pub fn restricted() -> Self {
        Self::new(RegistryKind::Restricted)
    }

    pub fn public() -> Self {
        Self::new(RegistryKind::Public)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.records.is_empty()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn kind(&self) -> RegistryKind {
        self.kind
    }

    async fn insert(&self, record: RegistryRecord) -> Result<RegistryRecord, RegistryError> {
        let mut state = self.state.write().await;

        if state.records.contains_key(&record.id) {
            return Err(RegistryError::Conflict(format!(
                "record {} already exists",
                record.id
            )));
        }
        if let Some(address) = record.content_address {
            if let Some(existing) =
                state.registrant_duplicate(&record.registered_by, &address, record.id)
            {
                return Err(RegistryError::Conflict(format!(
                    "{} already registered {} as record {}",
                    record.registered_by, address, existing.id
                )));
            }
        }

        state.index(&record);
        state.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn upsert(&self, record: RegistryRecord) -> Result<RegistryRecord, RegistryError> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.records.get(&record.id) {
            if let Some(old) = existing.content_address {
                if record.content_address != Some(old) {
                    return Err(RegistryError::Conflict(format!(
                        "record {} already resolved to {}",
                        record.id, old
                    )));
                }
            }
            let existing = existing.clone();
            state.unindex(&existing);
        }

        state.index(&record);
        state.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: RecordId) -> Result<Option<RegistryRecord>, RegistryError> {
        Ok(self.state.read().await.records.get(&id).cloned())
    }

    async fn remove(&self, id: RecordId) -> Result<bool, RegistryError> {
        let mut state = self.state.write().await;
        match state.records.remove(&id) {
            Some(record) => {
                state.unindex(&record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_by_content_address(
        &self,
        address: &ContentAddress,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        let state = self.state.read().await;
        Ok(state
            .with_address(address)
            .filter(|r| r.is_verifiable())
            .min_by_key(|r| (r.registered_at, r.id))
            .cloned())
    }

    async fn find_by_registrant(
        &self,
        registered_by: &PrincipalRef,
        address: &ContentAddress,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        let state = self.state.read().await;
        Ok(state
            .with_address(address)
            .filter(|r| &r.registered_by == registered_by)
            .min_by_key(|r| (r.registered_at, r.id))
            .cloned())
    }

    async fn references_location(
        &self,
        location: &ArtifactLocation,
    ) -> Result<bool, RegistryError> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .any(|r| &r.artifact_location == location))
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<RegistryRecord>, RegistryError> {
        let state = self.state.read().await;
        let mut records: Vec<RegistryRecord> = state
            .records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.registered_at, r.id));
        Ok(records)
    }

    async fn mark_public_replica(&self, id: RecordId) -> Result<bool, RegistryError> {
        let mut state = self.state.write().await;
        let Some(record) = state.records.get_mut(&id) else {
            return Ok(false);
        };
        if record.status != ResolutionStatus::Resolved
            || !record.classification.replicates_to_public()
        {
            return Ok(false);
        }

        record.membership.insert(RegistryKind::Public);
        record.replication_attempts = 0;
        record.replication_error = None;
        record.next_attempt_at = None;
        Ok(true)
    }

    async fn set_classification(
        &self,
        id: RecordId,
        classification: Classification,
        membership: RegistryMembership,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        let mut state = self.state.write().await;
        Ok(state.records.get_mut(&id).map(|record| {
            record.classification = classification;
            record.membership = membership;
            record.clone()
        }))
    }
}

#[async_trait]
impl MaterializationQueue for MemoryRegistry {
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, RegistryError> {
        let mut state = self.state.write().await;
        let mut reverted = 0;
        for record in state.records.values_mut() {
            let expired = record.lease.as_ref().is_some_and(|l| l.is_expired(now));
            if !expired {
                continue;
            }
            record.lease = None;
            if record.status == ResolutionStatus::Resolving {
                check_transition(record, ResolutionStatus::Pending)?;
                record.status = ResolutionStatus::Pending;
                reverted += 1;
            }
        }
        Ok(reverted)
    }

    async fn claim_pending(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<RegistryRecord>, RegistryError> {
        let mut state = self.state.write().await;

        let mut candidates: Vec<(DateTime<Utc>, RecordId)> = state
            .records
            .values()
            .filter(|r| r.is_claimable(now))
            .map(|r| (r.registered_at, r.id))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(record) = state.records.get_mut(&id) {
                record.lease = Some(Lease {
                    owner: worker_id.to_string(),
                    expires_at: now + lease,
                });
                if matches!(
                    record.status,
                    ResolutionStatus::Pending | ResolutionStatus::Resolving
                ) {
                    check_transition(record, ResolutionStatus::Resolving)?;
                    record.status = ResolutionStatus::Resolving;
                }
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_resolution(
        &self,
        id: RecordId,
        worker_id: &str,
        address: &ContentAddress,
        location: &ArtifactLocation,
        now: DateTime<Utc>,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        let mut state = self.state.write().await;

        let Some(record) = state
            .records
            .get_mut(&id)
            .filter(|r| r.lease.as_ref().is_some_and(|l| l.is_held_by(worker_id, now)))
        else {
            return Ok(None);
        };
        check_transition(record, ResolutionStatus::Resolved)?;
        if let Some(existing) = record.content_address {
            if &existing != address {
                return Err(RegistryError::Conflict(format!(
                    "record {} already resolved to {}",
                    id, existing
                )));
            }
        }
        let registered_by = record.registered_by.clone();

        if let Some(duplicate) = state.registrant_duplicate(&registered_by, address, id) {
            return Err(RegistryError::Conflict(format!(
                "{} already registered {} as record {}",
                registered_by, address, duplicate.id
            )));
        }

        let Some(record) = state.records.get_mut(&id) else {
            return Ok(None);
        };
        record.content_address = Some(*address);
        record.artifact_location = location.clone();
        record.status = ResolutionStatus::Resolved;
        record.last_error = None;
        record.next_attempt_at = None;
        let updated = record.clone();
        state.index(&updated);
        Ok(Some(updated))
    }

    async fn release(&self, id: RecordId, worker_id: &str) -> Result<bool, RegistryError> {
        let mut state = self.state.write().await;
        match state.leased_mut(id, worker_id) {
            Some(record) => {
                record.lease = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_failure(
        &self,
        id: RecordId,
        worker_id: &str,
        error: &str,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        let mut state = self.state.write().await;
        let Some(record) = state.leased_mut(id, worker_id) else {
            return Ok(None);
        };

        let exhausted = record.attempts + 1 >= max_attempts;
        let target = if exhausted {
            ResolutionStatus::Failed
        } else {
            ResolutionStatus::Pending
        };
        check_transition(record, target)?;

        record.attempts += 1;
        record.last_error = Some(error.to_string());
        record.lease = None;
        record.status = target;
        record.next_attempt_at = (!exhausted).then_some(retry_at);
        Ok(Some(record.clone()))
    }

    async fn record_replication_failure(
        &self,
        id: RecordId,
        worker_id: &str,
        error: &str,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        let mut state = self.state.write().await;
        let Some(record) = state.leased_mut(id, worker_id) else {
            return Ok(None);
        };
        if record.status != ResolutionStatus::Resolved {
            return Err(RegistryError::Conflict(format!(
                "record {} is {}; only resolved records owe a public replica",
                id, record.status
            )));
        }

        record.replication_attempts += 1;
        record.replication_error = Some(error.to_string());
        record.lease = None;
        record.next_attempt_at =
            (record.replication_attempts < max_attempts).then_some(retry_at);
        Ok(Some(record.clone()))
    }

    async fn mark_failed(
        &self,
        id: RecordId,
        worker_id: &str,
        error: &str,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        let mut state = self.state.write().await;
        let Some(record) = state.leased_mut(id, worker_id) else {
            return Ok(None);
        };
        check_transition(record, ResolutionStatus::Failed)?;

        record.status = ResolutionStatus::Failed;
        record.last_error = Some(error.to_string());
        record.lease = None;
        record.next_attempt_at = None;
        Ok(Some(record.clone()))
    }

    async fn requeue(&self, id: RecordId) -> Result<Option<RegistryRecord>, RegistryError> {
        let mut state = self.state.write().await;
        let Some(record) = state
            .records
            .get_mut(&id)
            .filter(|r| r.status == ResolutionStatus::Failed || r.replication_exhausted())
        else {
            return Ok(None);
        };

        if record.status == ResolutionStatus::Failed {
            let target = if record.content_address.is_some() {
                ResolutionStatus::Resolved
            } else {
                ResolutionStatus::Pending
            };
            check_transition(record, target)?;
            record.status = target;
            record.attempts = 0;
            record.last_error = None;
        }
        record.replication_attempts = 0;
        record.replication_error = None;
        record.lease = None;
        record.next_attempt_at = None;
        Ok(Some(record.clone()))
    }
}
