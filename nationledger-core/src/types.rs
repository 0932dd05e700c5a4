//! Registry Data Model
//!
//! A [`RegistryRecord`] is the canonical unit of record. Resolution state is an
//! explicit [`ResolutionStatus`]; the content address is `None` until resolved
//! and is never overloaded with placeholder values.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::fingerprint::ContentAddress;

// ─── Identifiers ─────────────────────────────────────────────────────────────

/// Opaque record identifier. UUIDv7, so ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to the uploading principal, as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalRef(String);

impl PrincipalRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque pointer into an `ArtifactStore` (`file://…`, `memory://…`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactLocation(String);

impl ArtifactLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Sector ──────────────────────────────────────────────────────────────────

/// Government sector tag. Closed set; used for filtering only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sector {
    Defense,
    Finance,
    ForeignAffairs,
    Health,
    Education,
    Infrastructure,
}

impl Sector {
    pub const ALL: [Sector; 6] = [
        Self::Defense,
        Self::Finance,
        Self::ForeignAffairs,
        Self::Health,
        Self::Education,
        Self::Infrastructure,
    ];

    /// Display name, as shown to uploaders.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Defense => "Defense",
            Self::Finance => "Finance",
            Self::ForeignAffairs => "Foreign Affairs",
            Self::Health => "Health",
            Self::Education => "Education",
            Self::Infrastructure => "Infrastructure",
        }
    }

    /// Storage key (snake_case).
    pub fn key(&self) -> &'static str {
        match self {
            Self::Defense => "defense",
            Self::Finance => "finance",
            Self::ForeignAffairs => "foreign_affairs",
            Self::Health => "health",
            Self::Education => "education",
            Self::Infrastructure => "infrastructure",
        }
    }

    /// Accepts either the display name or the storage key, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL.into_iter().find(|sector| {
            sector.as_str().eq_ignore_ascii_case(s) || sector.key().eq_ignore_ascii_case(s)
        })
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Unknown sector: {}", s))
    }
}

// ─── Classification / registries ─────────────────────────────────────────────

/// Access tier of a document. Gates which registries hold it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Restricted,
    Declassified,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restricted => "restricted",
            Self::Declassified => "declassified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "restricted" => Some(Self::Restricted),
            "declassified" => Some(Self::Declassified),
            _ => None,
        }
    }

    /// Declassified records must eventually be mirrored into the public registry.
    pub fn replicates_to_public(&self) -> bool {
        matches!(self, Self::Declassified)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two registries. Restricted is the authoritative superset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryKind {
    Restricted,
    Public,
}

impl RegistryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restricted => "restricted",
            Self::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "restricted" => Some(Self::Restricted),
            "public" => Some(Self::Public),
            _ => None,
        }
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which registries currently hold a copy of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistryMembership {
    pub restricted: bool,
    pub public: bool,
}

impl RegistryMembership {
    pub fn restricted_only() -> Self {
        Self {
            restricted: true,
            public: false,
        }
    }

    pub fn both() -> Self {
        Self {
            restricted: true,
            public: true,
        }
    }

    pub fn contains(&self, kind: RegistryKind) -> bool {
        match kind {
            RegistryKind::Restricted => self.restricted,
            RegistryKind::Public => self.public,
        }
    }

    pub fn insert(&mut self, kind: RegistryKind) {
        match kind {
            RegistryKind::Restricted => self.restricted = true,
            RegistryKind::Public => self.public = true,
        }
    }

    pub fn remove(&mut self, kind: RegistryKind) {
        match kind {
            RegistryKind::Restricted => self.restricted = false,
            RegistryKind::Public => self.public = false,
        }
    }

    pub fn kinds(&self) -> Vec<RegistryKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.restricted {
            kinds.push(RegistryKind::Restricted);
        }
        if self.public {
            kinds.push(RegistryKind::Public);
        }
        kinds
    }
}

// ─── Resolution status ───────────────────────────────────────────────────────

/// Content-address resolution state.
///
/// `Pending → Resolving → Resolved` or `Pending → Resolving → Failed`.
/// `Resolving` reverts to `Pending` when its lease expires. `Resolved` is
/// final: public replication problems are tracked on the record, not in its
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Pending,
    Resolving,
    Resolved,
    Failed,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "resolving" => Some(Self::Resolving),
            "resolved" => Some(Self::Resolved),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, target: ResolutionStatus) -> bool {
        use ResolutionStatus::*;
        matches!(
            (self, target),
            (Pending, Resolving)
                | (Resolving, Resolved)
                | (Resolving, Failed)
                | (Resolving, Pending)
                // Operator re-queue
                | (Failed, Pending)
                | (Failed, Resolved)
        )
    }
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exclusive claim held by one worker on one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_held_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.owner == owner && !self.is_expired(now)
    }
}

// ─── Metadata ────────────────────────────────────────────────────────────────

/// Uploader-supplied metadata, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: String,
    pub sector: String,
    pub classification: Classification,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl DocumentMetadata {
    pub fn new(
        title: impl Into<String>,
        sector: impl Into<String>,
        classification: Classification,
    ) -> Self {
        Self {
            title: title.into(),
            sector: sector.into(),
            classification,
            file_name: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Reject blank titles, missing or unknown sectors.
    pub fn validate(&self) -> Result<ValidatedMetadata, LedgerError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(LedgerError::InvalidMetadata("title is required".into()));
        }
        if self.sector.trim().is_empty() {
            return Err(LedgerError::InvalidMetadata("sector is required".into()));
        }
        let sector = Sector::parse(&self.sector).ok_or_else(|| {
            LedgerError::InvalidMetadata(format!("unrecognized sector '{}'", self.sector))
        })?;

        Ok(ValidatedMetadata {
            title: title.to_string(),
            sector,
            classification: self.classification,
            content_type: content_type_for(self.file_name.as_deref()).to_string(),
        })
    }
}

/// Metadata that passed [`DocumentMetadata::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedMetadata {
    pub title: String,
    pub sector: Sector,
    pub classification: Classification,
    pub content_type: String,
}

/// MIME type from a file-name extension.
pub fn content_type_for(file_name: Option<&str>) -> &'static str {
    let Some(ext) = file_name
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
    else {
        return "application/octet-stream";
    };

    match ext.as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

// ─── RegistryRecord ──────────────────────────────────────────────────────────

/// One document's metadata, fingerprint, classification and registry membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub id: RecordId,
    pub title: String,
    pub sector: Sector,
    pub classification: Classification,
    /// `None` while pending.
    pub content_address: Option<ContentAddress>,
    /// Durable location once resolved; the source (staging) location while pending.
    pub artifact_location: ArtifactLocation,
    pub content_type: String,
    pub registered_by: PrincipalRef,
    pub registered_at: DateTime<Utc>,
    pub membership: RegistryMembership,
    pub status: ResolutionStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub lease: Option<Lease>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Failed public-replica writes since the last success or re-queue.
    pub replication_attempts: u32,
    /// Last replication failure. With no `next_attempt_at` scheduled, the
    /// worker has given up.
    pub replication_error: Option<String>,
}

impl RegistryRecord {
    /// A record whose artifact was fingerprinted and persisted synchronously.
    pub fn resolved(
        metadata: ValidatedMetadata,
        content_address: ContentAddress,
        artifact_location: ArtifactLocation,
        registered_by: PrincipalRef,
        registered_at: DateTime<Utc>,
    ) -> Self {
        Self::build(
            metadata,
            Some(content_address),
            artifact_location,
            registered_by,
            registered_at,
            ResolutionStatus::Resolved,
        )
    }

    /// A record whose content address will be resolved by the worker.
    pub fn pending(
        metadata: ValidatedMetadata,
        source_location: ArtifactLocation,
        registered_by: PrincipalRef,
        registered_at: DateTime<Utc>,
    ) -> Self {
        Self::build(
            metadata,
            None,
            source_location,
            registered_by,
            registered_at,
            ResolutionStatus::Pending,
        )
    }

    fn build(
        metadata: ValidatedMetadata,
        content_address: Option<ContentAddress>,
        artifact_location: ArtifactLocation,
        registered_by: PrincipalRef,
        registered_at: DateTime<Utc>,
        status: ResolutionStatus,
    ) -> Self {
        Self {
            id: RecordId::new(),
            title: metadata.title,
            sector: metadata.sector,
            classification: metadata.classification,
            content_address,
            artifact_location,
            content_type: metadata.content_type,
            registered_by,
            registered_at,
            membership: RegistryMembership::restricted_only(),
            status,
            attempts: 0,
            last_error: None,
            lease: None,
            next_attempt_at: None,
            replication_attempts: 0,
            replication_error: None,
        }
    }

    /// Eligible to match in verification.
    pub fn is_verifiable(&self) -> bool {
        self.status == ResolutionStatus::Resolved && self.content_address.is_some()
    }

    /// Resolved and declassified, but not yet mirrored into the public registry.
    pub fn needs_public_replica(&self) -> bool {
        self.status == ResolutionStatus::Resolved
            && self.classification.replicates_to_public()
            && !self.membership.public
            && !self.replication_exhausted()
    }

    /// The worker stopped retrying the public replica.
    pub fn replication_exhausted(&self) -> bool {
        self.replication_error.is_some() && self.next_attempt_at.is_none()
    }

    /// Work remains for the materialization worker.
    pub fn needs_materialization(&self) -> bool {
        matches!(
            self.status,
            ResolutionStatus::Pending | ResolutionStatus::Resolving
        ) || self.needs_public_replica()
    }

    /// Whether a worker may claim this record at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.needs_materialization()
            && self.lease.as_ref().map_or(true, |l| l.is_expired(now))
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Copy written into the public registry. Worker bookkeeping stays in the
    /// restricted registry.
    pub fn public_copy(&self) -> RegistryRecord {
        RegistryRecord {
            membership: RegistryMembership::both(),
            attempts: 0,
            last_error: None,
            lease: None,
            next_attempt_at: None,
            replication_attempts: 0,
            replication_error: None,
            ..self.clone()
        }
    }
}

// ─── Filtering ───────────────────────────────────────────────────────────────

/// Listing filter. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub sector: Option<Sector>,
    pub classification: Option<Classification>,
    pub status: Option<ResolutionStatus>,
    pub registered_by: Option<PrincipalRef>,
}

impl RecordFilter {
    pub fn sector(mut self, sector: Sector) -> Self {
        self.sector = Some(sector);
        self
    }

    pub fn classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }

    pub fn status(mut self, status: ResolutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn registered_by(mut self, principal: PrincipalRef) -> Self {
        self.registered_by = Some(principal);
        self
    }

    pub fn matches(&self, record: &RegistryRecord) -> bool {
        self.sector.map_or(true, |s| s == record.sector)
            && self
                .classification
                .map_or(true, |c| c == record.classification)
            && self.status.map_or(true, |s| s == record.status)
            && self
                .registered_by
                .as_ref()
                .map_or(true, |p| p == &record.registered_by)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::ContentFingerprinter;

    fn metadata(classification: Classification) -> ValidatedMetadata {
        DocumentMetadata::new("Budget 2024", "Finance", classification)
            .validate()
            .unwrap()
    }

    #[test]
    fn test_sector_parse_accepts_display_and_key() {
        assert_eq!(Sector::parse("Foreign Affairs"), Some(Sector::ForeignAffairs));
        assert_eq!(Sector::parse("foreign_affairs"), Some(Sector::ForeignAffairs));
        assert_eq!(Sector::parse(" finance "), Some(Sector::Finance));
        assert_eq!(Sector::parse("Agriculture"), None);
        assert!("Space".parse::<Sector>().is_err());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            ResolutionStatus::Pending,
            ResolutionStatus::Resolving,
            ResolutionStatus::Resolved,
            ResolutionStatus::Failed,
        ] {
            assert_eq!(ResolutionStatus::parse(status.as_str()), Some(status));
        }
        for kind in [RegistryKind::Restricted, RegistryKind::Public] {
            assert_eq!(RegistryKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_status_transitions() {
        use ResolutionStatus::*;
        assert!(Pending.can_transition_to(Resolving));
        assert!(Resolving.can_transition_to(Resolved));
        assert!(Resolving.can_transition_to(Failed));
        assert!(Resolving.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Resolved));
        assert!(!Resolved.can_transition_to(Pending));
        assert!(!Resolved.can_transition_to(Failed));
    }

    #[test]
    fn test_metadata_validation() {
        let err = DocumentMetadata::new("   ", "Finance", Classification::Restricted)
            .validate()
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidMetadata(_)));

        let err = DocumentMetadata::new("Report", "", Classification::Restricted)
            .validate()
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidMetadata(ref m) if m.contains("sector")));

        let err = DocumentMetadata::new("Report", "Agriculture", Classification::Restricted)
            .validate()
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidMetadata(ref m) if m.contains("Agriculture")));

        let ok = DocumentMetadata::new("  Report  ", "Health", Classification::Declassified)
            .with_file_name("report.PDF")
            .validate()
            .unwrap();
        assert_eq!(ok.title, "Report");
        assert_eq!(ok.sector, Sector::Health);
        assert_eq!(ok.content_type, "application/pdf");
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(
            content_type_for(Some("a.docx")),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        );
        assert_eq!(content_type_for(Some("scan.JPEG")), "image/jpeg");
        assert_eq!(content_type_for(Some("noext")), "application/octet-stream");
        assert_eq!(content_type_for(None), "application/octet-stream");
    }

    #[test]
    fn test_pending_record_needs_materialization() {
        let now = Utc::now();
        let record = RegistryRecord::pending(
            metadata(Classification::Declassified),
            ArtifactLocation::new("memory://staged"),
            PrincipalRef::new("emp-1"),
            now,
        );
        assert_eq!(record.status, ResolutionStatus::Pending);
        assert!(record.content_address.is_none());
        assert!(!record.is_verifiable());
        assert!(record.needs_materialization());
        assert!(record.is_claimable(now));
        assert_eq!(record.membership, RegistryMembership::restricted_only());
    }

    #[test]
    fn test_claimability_respects_lease_and_backoff() {
        let now = Utc::now();
        let mut record = RegistryRecord::pending(
            metadata(Classification::Restricted),
            ArtifactLocation::new("memory://staged"),
            PrincipalRef::new("emp-1"),
            now,
        );

        record.lease = Some(Lease {
            owner: "w1".into(),
            expires_at: now + chrono::Duration::seconds(30),
        });
        assert!(!record.is_claimable(now));
        assert!(record.is_claimable(now + chrono::Duration::seconds(31)));

        record.lease = None;
        record.next_attempt_at = Some(now + chrono::Duration::seconds(5));
        assert!(!record.is_claimable(now));
        assert!(record.is_claimable(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_declassified_resolved_needs_public_replica() {
        let now = Utc::now();
        let mut record = RegistryRecord::resolved(
            metadata(Classification::Declassified),
            ContentFingerprinter::digest(b"AAA"),
            ArtifactLocation::new("memory://a"),
            PrincipalRef::new("emp-1"),
            now,
        );
        assert!(record.needs_public_replica());

        record.membership.insert(RegistryKind::Public);
        assert!(!record.needs_public_replica());
        assert!(!record.needs_materialization());

        let copy = record.public_copy();
        assert_eq!(copy.id, record.id);
        assert_eq!(copy.membership, RegistryMembership::both());
        assert!(copy.lease.is_none());
    }

    #[test]
    fn test_replication_debt_parks_without_demoting() {
        let now = Utc::now();
        let mut record = RegistryRecord::resolved(
            metadata(Classification::Declassified),
            ContentFingerprinter::digest(b"AAA"),
            ArtifactLocation::new("memory://a"),
            PrincipalRef::new("emp-1"),
            now,
        );

        record.replication_attempts = 1;
        record.replication_error = Some("public registry down".into());
        record.next_attempt_at = Some(now + chrono::Duration::seconds(5));
        assert!(!record.replication_exhausted());
        assert!(record.needs_public_replica());
        assert!(!record.is_claimable(now));

        record.next_attempt_at = None;
        assert!(record.replication_exhausted());
        assert!(!record.needs_public_replica());
        assert!(!record.is_claimable(now));
        assert!(record.is_verifiable());

        let copy = record.public_copy();
        assert_eq!(copy.replication_attempts, 0);
        assert!(copy.replication_error.is_none());
    }

    #[test]
    fn test_lease_is_held_until_expiry() {
        let now = Utc::now();
        let lease = Lease {
            owner: "w1".into(),
            expires_at: now + chrono::Duration::seconds(30),
        };
        assert!(lease.is_held_by("w1", now));
        assert!(!lease.is_held_by("w2", now));
        assert!(!lease.is_held_by("w1", now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_membership_ops() {
        let mut m = RegistryMembership::restricted_only();
        assert_eq!(m.kinds(), vec![RegistryKind::Restricted]);
        m.insert(RegistryKind::Public);
        assert_eq!(m, RegistryMembership::both());
        m.remove(RegistryKind::Public);
        assert!(!m.contains(RegistryKind::Public));
    }

    #[test]
    fn test_filter_matches() {
        let now = Utc::now();
        let record = RegistryRecord::resolved(
            metadata(Classification::Declassified),
            ContentFingerprinter::digest(b"AAA"),
            ArtifactLocation::new("memory://a"),
            PrincipalRef::new("emp-1"),
            now,
        );
        assert!(RecordFilter::default().matches(&record));
        assert!(RecordFilter::default().sector(Sector::Finance).matches(&record));
        assert!(!RecordFilter::default().sector(Sector::Defense).matches(&record));
        assert!(!RecordFilter::default()
            .classification(Classification::Restricted)
            .matches(&record));
        assert!(RecordFilter::default()
            .registered_by(PrincipalRef::new("emp-1"))
            .status(ResolutionStatus::Resolved)
            .matches(&record));
    }
}
