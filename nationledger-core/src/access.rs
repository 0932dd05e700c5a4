//! Principals, roles, and caller-side redaction.
//!
//! The core services never read ambient identity; the transport layer builds
//! a [`Principal`] from whatever the identity provider supplies and passes it
//! in explicitly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::fingerprint::ContentAddress;
use crate::types::{
    ArtifactLocation, Classification, PrincipalRef, RecordId, RegistryKind, Sector,
};
use crate::verification::VerificationResult;

/// Coarse role from the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Unauthenticated or citizen access.
    Public,
    Employee,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Employee => "employee",
            Self::Admin => "admin",
        }
    }

    /// Unknown role strings degrade to `Public`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Self::Admin,
            "employee" => Self::Employee,
            _ => Self::Public,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: PrincipalRef,
    pub role: Role,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: PrincipalRef::new(id),
            role,
        }
    }

    pub fn public(id: impl Into<String>) -> Self {
        Self::new(id, Role::Public)
    }

    pub fn employee(id: impl Into<String>) -> Self {
        Self::new(id, Role::Employee)
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Employees and admins may upload.
    pub fn can_register(&self) -> bool {
        matches!(self.role, Role::Employee | Role::Admin)
    }

    /// Employees and admins may see restricted metadata.
    pub fn can_view_restricted(&self) -> bool {
        matches!(self.role, Role::Employee | Role::Admin)
    }

    pub fn require_registrant(&self) -> Result<(), LedgerError> {
        if self.can_register() {
            Ok(())
        } else {
            Err(LedgerError::Unauthorized(format!(
                "{} may not register documents",
                self.id
            )))
        }
    }

    pub fn require_admin(&self) -> Result<(), LedgerError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(LedgerError::Unauthorized(format!("{} is not an admin", self.id)))
        }
    }
}

/// Verification outcome as shown to a particular caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationView {
    pub authentic: bool,
    pub content_address: ContentAddress,
    pub matched_in: Option<RegistryKind>,
    pub record_id: Option<RecordId>,
    pub classification: Option<Classification>,
    pub title: Option<String>,
    pub sector: Option<Sector>,
    pub registered_by: Option<PrincipalRef>,
    pub registered_at: Option<DateTime<Utc>>,
    pub artifact_location: Option<ArtifactLocation>,
    /// Metadata was withheld from this caller.
    pub redacted: bool,
}

/// Shape a verification result for `principal`. A restricted match seen by a
/// public caller keeps its verdict but loses its descriptive metadata.
pub fn redact(result: &VerificationResult, principal: &Principal) -> VerificationView {
    let mut view = VerificationView {
        authentic: result.authentic,
        content_address: result.content_address,
        matched_in: result.matched_in,
        record_id: None,
        classification: None,
        title: None,
        sector: None,
        registered_by: None,
        registered_at: None,
        artifact_location: None,
        redacted: false,
    };

    let Some(record) = result.record.as_ref() else {
        return view;
    };

    view.record_id = Some(record.id);
    view.classification = Some(record.classification);
    view.registered_at = Some(record.registered_at);

    if record.classification == Classification::Restricted && !principal.can_view_restricted() {
        view.redacted = true;
        return view;
    }

    view.title = Some(record.title.clone());
    view.sector = Some(record.sector);
    view.registered_by = Some(record.registered_by.clone());
    view.artifact_location = Some(record.artifact_location.clone());
    view
}
