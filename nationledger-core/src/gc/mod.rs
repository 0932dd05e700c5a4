//! Dangling-artifact cleanup.
//!
//! When a registration persists an artifact but cannot write its record, the
//! artifact is deleted on the spot if nothing references it. If that delete
//! fails too, the location goes into the [`OrphanLog`] and the
//! [`DanglingArtifactSweeper`] retries it later.
//!
//! Adapters:
//! - [`MemoryOrphanLog`]: in-process, lost on restart
//! - `PgOrphanLog`: Postgres, behind the `postgres` feature

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::PgOrphanLog;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::artifact_store::ArtifactStore;
use crate::events::{EventSink, LedgerEvent};
use crate::registry::{Registries, RegistryError};
use crate::types::ArtifactLocation;

/// Which store an orphaned location belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreRole {
    /// Durable artifacts referenced by resolved records.
    Durable,
    /// Uploads awaiting deferred materialization.
    Staging,
}

impl StoreRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Durable => "durable",
            Self::Staging => "staging",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "durable" => Some(Self::Durable),
            "staging" => Some(Self::Staging),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct OrphanedArtifact {
    pub role: StoreRole,
    pub location: ArtifactLocation,
}

/// Locations awaiting cleanup. Shared between registration, the worker and
/// the sweeper. Recording an entry that is already logged is a no-op.
#[async_trait]
pub trait OrphanLog: Send + Sync {
    async fn record(&self, entry: OrphanedArtifact) -> Result<(), RegistryError>;

    /// Every logged entry, oldest first.
    async fn pending(&self) -> Result<Vec<OrphanedArtifact>, RegistryError>;

    async fn forget(&self, entry: &OrphanedArtifact) -> Result<(), RegistryError>;
}

#[derive(Debug, Default)]
pub struct MemoryOrphanLog {
    entries: Mutex<BTreeSet<OrphanedArtifact>>,
}

impl MemoryOrphanLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrphanLog for MemoryOrphanLog {
    async fn record(&self, entry: OrphanedArtifact) -> Result<(), RegistryError> {
        self.entries.lock().await.insert(entry);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<OrphanedArtifact>, RegistryError> {
        Ok(self.entries.lock().await.iter().cloned().collect())
    }

    async fn forget(&self, entry: &OrphanedArtifact) -> Result<(), RegistryError> {
        self.entries.lock().await.remove(entry);
        Ok(())
    }
}

/// Best-effort delete of an artifact whose record was never written.
///
/// Content-addressed stores share one location between every record holding
/// the same bytes, so the location is only deleted when nothing references it.
pub(crate) async fn discard_unreferenced(
    registries: &Registries,
    store: &dyn ArtifactStore,
    role: StoreRole,
    location: &ArtifactLocation,
    orphans: &dyn OrphanLog,
    events: &dyn EventSink,
) {
    let outcome = match registries.references_location(location).await {
        Ok(true) => return,
        Ok(false) => store.delete(location).await.map_err(|e| e.to_string()),
        Err(e) => Err(format!("reference check failed: {}", e)),
    };

    if let Err(error) = outcome {
        tracing::warn!(
            location = %location,
            error = %error,
            "Could not discard unreferenced artifact; queued for sweep"
        );
        let entry = OrphanedArtifact {
            role,
            location: location.clone(),
        };
        if let Err(e) = orphans.record(entry).await {
            tracing::error!(
                location = %location,
                error = %e,
                "Could not log orphaned artifact; it will not be swept"
            );
        }
        events.emit(LedgerEvent::ArtifactOrphaned {
            location: location.clone(),
            error,
        });
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub deleted: usize,
    /// Dropped because a record now references them.
    pub referenced: usize,
    /// Left in the log for the next sweep.
    pub retained: usize,
}

pub struct DanglingArtifactSweeper {
    registries: Registries,
    store: Arc<dyn ArtifactStore>,
    staging: Arc<dyn ArtifactStore>,
    orphans: Arc<dyn OrphanLog>,
}

impl DanglingArtifactSweeper {
    pub fn new(
        registries: Registries,
        store: Arc<dyn ArtifactStore>,
        staging: Arc<dyn ArtifactStore>,
        orphans: Arc<dyn OrphanLog>,
    ) -> Self {
        Self {
            registries,
            store,
            staging,
            orphans,
        }
    }

    /// Retry every logged location once.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let pending = match self.orphans.pending().await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(error = %e, "Sweeper: could not read orphan log");
                return report;
            }
        };

        for entry in pending {
            report.examined += 1;

            match self.registries.references_location(&entry.location).await {
                Ok(true) => {
                    self.forget(&entry).await;
                    report.referenced += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        location = %entry.location,
                        error = %e,
                        "Sweeper: reference check failed"
                    );
                    report.retained += 1;
                    continue;
                }
            }

            let store = match entry.role {
                StoreRole::Durable => &self.store,
                StoreRole::Staging => &self.staging,
            };
            match store.delete(&entry.location).await {
                Ok(()) => {
                    self.forget(&entry).await;
                    report.deleted += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        location = %entry.location,
                        error = %e,
                        "Sweeper: delete failed"
                    );
                    report.retained += 1;
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                deleted = report.deleted,
                referenced = report.referenced,
                retained = report.retained,
                "Dangling artifact sweep complete"
            );
        }
        report
    }

    /// A failed forget leaves the entry for the next sweep, where deleting
    /// an already-deleted location succeeds again.
    async fn forget(&self, entry: &OrphanedArtifact) {
        if let Err(e) = self.orphans.forget(entry).await {
            tracing::warn!(
                location = %entry.location,
                error = %e,
                "Sweeper: could not clear orphan log entry"
            );
        }
    }
}
