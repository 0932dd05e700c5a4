//! NationLedger core: tamper-evident registration and verification of
//! government documents.
//!
//! ## Call chain
//!
//! ```text
//! register:  bytes -> ContentFingerprinter -> ArtifactStore::put -> restricted Registry
//!                                                               -> public Registry (declassified)
//! verify:    bytes -> ContentFingerprinter -> restricted / public lookup -> ArtifactStore::exists
//! deferred:  staged bytes -> Pending record -> MaterializationWorker -> Resolved (+ public replica)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nationledger_core::{
//!     Classification, DocumentMetadata, InMemoryArtifactStore, Principal, RegistrationConfig,
//!     RegistrationService, Registries, VerificationService,
//! };
//!
//! # async fn demo() -> nationledger_core::Result<()> {
//! let registries = Registries::in_memory();
//! let store = Arc::new(InMemoryArtifactStore::new());
//! let registration =
//!     RegistrationService::new(registries.clone(), store.clone(), RegistrationConfig::default());
//! let verification = VerificationService::new(registries, store);
//!
//! let meta = DocumentMetadata::new("Budget 2024", "Finance", Classification::Declassified);
//! registration.register(&Principal::employee("emp-1"), b"AAA", meta).await?;
//! assert!(verification.verify(b"AAA").await?.authentic);
//! # Ok(())
//! # }
//! ```

// Identity and redaction
pub mod access;

// Content addressing and storage
pub mod artifact_store;
pub mod fingerprint;

// Records and registries
pub mod registry;
pub mod types;

// Services
pub mod gc;
pub mod registration;
pub mod verification;
pub mod worker;

// Ambient
pub mod config;
pub mod error;
pub mod events;

pub use access::{redact, Principal, Role, VerificationView};
pub use artifact_store::{
    ArtifactStore, ArtifactStoreError, InMemoryArtifactStore, LocalArtifactStore,
};
pub use config::{LedgerConfig, RegistrationConfig, WorkerConfig};
pub use error::{LedgerError, Result};
pub use events::{ChannelEventSink, EventSink, LedgerEvent, TracingEventSink};
pub use fingerprint::{ContentAddress, ContentFingerprinter};
pub use gc::{
    DanglingArtifactSweeper, MemoryOrphanLog, OrphanLog, OrphanedArtifact, StoreRole, SweepReport,
};
#[cfg(feature = "postgres")]
pub use gc::PgOrphanLog;
pub use registration::RegistrationService;
pub use registry::{MaterializationQueue, MemoryRegistry, Registries, Registry, RegistryError};
#[cfg(feature = "postgres")]
pub use registry::PgRegistry;
pub use types::{
    ArtifactLocation, Classification, DocumentMetadata, PrincipalRef, RecordFilter, RecordId,
    RegistryKind, RegistryMembership, RegistryRecord, ResolutionStatus, Sector,
};
pub use verification::{VerificationResult, VerificationService};
pub use worker::{CycleReport, MaterializationWorker};
