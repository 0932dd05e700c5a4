//! Postgres registry adapter.
//!
//! Both registries share `nationledger.registry_records`, partitioned by the
//! `registry` column. Claims use `FOR UPDATE SKIP LOCKED` plus a lease expiry
//! so concurrent workers never pick the same record.
//!
//! Uses runtime `sqlx::query` so the crate builds without `DATABASE_URL`.
//! The schema lives in `migrations/001_registry_records.sql`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{check_transition, MaterializationQueue, Registry, RegistryError};
use crate::fingerprint::ContentAddress;
use crate::types::{
    ArtifactLocation, Classification, Lease, PrincipalRef, RecordFilter, RecordId, RegistryKind,
    RegistryMembership, RegistryRecord, ResolutionStatus, Sector,
};

const COLUMNS: &str = "record_id, title, sector, classification, content_address, \
    artifact_location, content_type, registered_by, registered_at, in_restricted, in_public, \
    status, attempts, last_error, lease_owner, lease_expires_at, next_attempt_at, \
    replication_attempts, replication_error";

/// `COLUMNS` qualified with a table alias, for statements joining a CTE.
fn qualified(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn record_from_row(row: &PgRow) -> Result<RegistryRecord, RegistryError> {
    let record_id: Uuid = row.try_get("record_id")?;

    let sector: String = row.try_get("sector")?;
    let sector = Sector::parse(&sector).ok_or_else(|| {
        RegistryError::Corrupt(format!("{}: unknown sector {}", record_id, sector))
    })?;

    let classification: String = row.try_get("classification")?;
    let classification = Classification::parse(&classification).ok_or_else(|| {
        RegistryError::Corrupt(format!(
            "{}: unknown classification {}",
            record_id, classification
        ))
    })?;

    let status: String = row.try_get("status")?;
    let status = ResolutionStatus::parse(&status).ok_or_else(|| {
        RegistryError::Corrupt(format!("{}: unknown status {}", record_id, status))
    })?;

    let content_address = row
        .try_get::<Option<String>, _>("content_address")?
        .map(|hex| ContentAddress::from_hex(&hex))
        .transpose()
        .map_err(|e| RegistryError::Corrupt(format!("{}: {}", record_id, e)))?;

    let lease_owner: Option<String> = row.try_get("lease_owner")?;
    let lease_expires_at: Option<DateTime<Utc>> = row.try_get("lease_expires_at")?;
    let lease = match (lease_owner, lease_expires_at) {
        (Some(owner), Some(expires_at)) => Some(Lease { owner, expires_at }),
        _ => None,
    };

    let attempts: i32 = row.try_get("attempts")?;
    let replication_attempts: i32 = row.try_get("replication_attempts")?;

    Ok(RegistryRecord {
        id: RecordId(record_id),
        title: row.try_get("title")?,
        sector,
        classification,
        content_address,
        artifact_location: ArtifactLocation::new(row.try_get::<String, _>("artifact_location")?),
        content_type: row.try_get("content_type")?,
        registered_by: PrincipalRef::new(row.try_get::<String, _>("registered_by")?),
        registered_at: row.try_get("registered_at")?,
        membership: RegistryMembership {
            restricted: row.try_get("in_restricted")?,
            public: row.try_get("in_public")?,
        },
        status,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error")?,
        lease,
        next_attempt_at: row.try_get("next_attempt_at")?,
        replication_attempts: replication_attempts.max(0) as u32,
        replication_error: row.try_get("replication_error")?,
    })
}

fn records_from_rows(rows: &[PgRow]) -> Result<Vec<RegistryRecord>, RegistryError> {
    rows.iter().map(record_from_row).collect()
}

/// Unique violations become `Conflict`; everything else stays a database error.
fn write_error(e: sqlx::Error, what: &str) -> RegistryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RegistryError::Conflict(format!("{}: {}", what, db.message()))
        }
        _ => RegistryError::Database(e),
    }
}

/// Postgres-backed [`Registry`] and [`MaterializationQueue`].
pub struct PgRegistry {
    pool: PgPool,
    kind: RegistryKind,
}

impl PgRegistry {
    pub fn new(pool: PgPool, kind: RegistryKind) -> Self {
        Self { pool, kind }
    }

    pub fn restricted(pool: PgPool) -> Self {
        Self::new(pool, RegistryKind::Restricted)
    }

    pub fn public(pool: PgPool) -> Self {
        Self::new(pool, RegistryKind::Public)
    }

    fn registry(&self) -> &'static str {
        self.kind.as_str()
    }

    /// A fenced update matched nothing: the lease is gone (`None`), or the
    /// caller still holds it and the status change is not allowed.
    async fn fenced_miss(
        &self,
        id: RecordId,
        worker_id: &str,
        target: ResolutionStatus,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        match self.fetch(id).await? {
            Some(current) if current.lease.as_ref().is_some_and(|l| l.owner == worker_id) => {
                check_transition(&current, target)?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn fetch(&self, id: RecordId) -> Result<Option<RegistryRecord>, RegistryError> {
        let sql = format!(
            "SELECT {} FROM nationledger.registry_records WHERE registry = $1 AND record_id = $2",
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(self.registry())
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }
}

#[async_trait]
impl Registry for PgRegistry {
    fn kind(&self) -> RegistryKind {
        self.kind
    }

    async fn insert(&self, record: RegistryRecord) -> Result<RegistryRecord, RegistryError> {
        sqlx::query(
            r#"
            INSERT INTO nationledger.registry_records
                (registry, record_id, title, sector, classification, content_address,
                 artifact_location, content_type, registered_by, registered_at,
                 in_restricted, in_public, status, attempts, last_error,
                 lease_owner, lease_expires_at, next_attempt_at,
                 replication_attempts, replication_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(self.registry())
        .bind(record.id.0)
        .bind(&record.title)
        .bind(record.sector.key())
        .bind(record.classification.as_str())
        .bind(record.content_address.map(|a| a.to_hex()))
        .bind(record.artifact_location.as_str())
        .bind(&record.content_type)
        .bind(record.registered_by.as_str())
        .bind(record.registered_at)
        .bind(record.membership.restricted)
        .bind(record.membership.public)
        .bind(record.status.as_str())
        .bind(record.attempts as i32)
        .bind(record.last_error.as_deref())
        .bind(record.lease.as_ref().map(|l| l.owner.clone()))
        .bind(record.lease.as_ref().map(|l| l.expires_at))
        .bind(record.next_attempt_at)
        .bind(record.replication_attempts as i32)
        .bind(record.replication_error.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(e, "insert registry record"))?;

        Ok(record)
    }

    async fn upsert(&self, record: RegistryRecord) -> Result<RegistryRecord, RegistryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO nationledger.registry_records AS r
                (registry, record_id, title, sector, classification, content_address,
                 artifact_location, content_type, registered_by, registered_at,
                 in_restricted, in_public, status, attempts, last_error,
                 lease_owner, lease_expires_at, next_attempt_at,
                 replication_attempts, replication_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (registry, record_id) DO UPDATE
            SET title = EXCLUDED.title,
                sector = EXCLUDED.sector,
                classification = EXCLUDED.classification,
                content_address = EXCLUDED.content_address,
                artifact_location = EXCLUDED.artifact_location,
                content_type = EXCLUDED.content_type,
                in_restricted = EXCLUDED.in_restricted,
                in_public = EXCLUDED.in_public,
                status = EXCLUDED.status,
                attempts = EXCLUDED.attempts,
                last_error = EXCLUDED.last_error,
                lease_owner = EXCLUDED.lease_owner,
                lease_expires_at = EXCLUDED.lease_expires_at,
                next_attempt_at = EXCLUDED.next_attempt_at,
                replication_attempts = EXCLUDED.replication_attempts,
                replication_error = EXCLUDED.replication_error
            WHERE r.content_address IS NULL
               OR r.content_address = EXCLUDED.content_address
            "#,
        )
        .bind(self.registry())
        .bind(record.id.0)
        .bind(&record.title)
        .bind(record.sector.key())
        .bind(record.classification.as_str())
        .bind(record.content_address.map(|a| a.to_hex()))
        .bind(record.artifact_location.as_str())
        .bind(&record.content_type)
        .bind(record.registered_by.as_str())
        .bind(record.registered_at)
        .bind(record.membership.restricted)
        .bind(record.membership.public)
        .bind(record.status.as_str())
        .bind(record.attempts as i32)
        .bind(record.last_error.as_deref())
        .bind(record.lease.as_ref().map(|l| l.owner.clone()))
        .bind(record.lease.as_ref().map(|l| l.expires_at))
        .bind(record.next_attempt_at)
        .bind(record.replication_attempts as i32)
        .bind(record.replication_error.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(e, "upsert registry record"))?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::Conflict(format!(
                "record {} already resolved to a different address",
                record.id
            )));
        }
        Ok(record)
    }

    async fn get(&self, id: RecordId) -> Result<Option<RegistryRecord>, RegistryError> {
        self.fetch(id).await
    }

    async fn remove(&self, id: RecordId) -> Result<bool, RegistryError> {
        let result = sqlx::query(
            "DELETE FROM nationledger.registry_records WHERE registry = $1 AND record_id = $2",
        )
        .bind(self.registry())
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_content_address(
        &self,
        address: &ContentAddress,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM nationledger.registry_records
            WHERE registry = $1 AND content_address = $2 AND status = 'resolved'
            ORDER BY registered_at, record_id
            LIMIT 1
            "#,
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(self.registry())
            .bind(address.to_hex())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_by_registrant(
        &self,
        registered_by: &PrincipalRef,
        address: &ContentAddress,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM nationledger.registry_records
            WHERE registry = $1 AND registered_by = $2 AND content_address = $3
            ORDER BY registered_at, record_id
            LIMIT 1
            "#,
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(self.registry())
            .bind(registered_by.as_str())
            .bind(address.to_hex())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn references_location(
        &self,
        location: &ArtifactLocation,
    ) -> Result<bool, RegistryError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM nationledger.registry_records
                WHERE registry = $1 AND artifact_location = $2
            ) AS referenced
            "#,
        )
        .bind(self.registry())
        .bind(location.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("referenced")?)
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<RegistryRecord>, RegistryError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM nationledger.registry_records
            WHERE registry = $1
              AND ($2::text IS NULL OR sector = $2)
              AND ($3::text IS NULL OR classification = $3)
              AND ($4::text IS NULL OR status = $4)
              AND ($5::text IS NULL OR registered_by = $5)
            ORDER BY registered_at, record_id
            "#,
            COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(self.registry())
            .bind(filter.sector.map(|s| s.key()))
            .bind(filter.classification.map(|c| c.as_str()))
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.registered_by.as_ref().map(|p| p.as_str().to_string()))
            .fetch_all(&self.pool)
            .await?;
        records_from_rows(&rows)
    }

    async fn mark_public_replica(&self, id: RecordId) -> Result<bool, RegistryError> {
        let result = sqlx::query(
            r#"
            UPDATE nationledger.registry_records
            SET in_public = TRUE,
                replication_attempts = 0,
                replication_error = NULL,
                next_attempt_at = NULL
            WHERE registry = $1 AND record_id = $2
              AND status = 'resolved'
              AND classification = 'declassified'
            "#,
        )
        .bind(self.registry())
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_classification(
        &self,
        id: RecordId,
        classification: Classification,
        membership: RegistryMembership,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        let sql = format!(
            r#"
            UPDATE nationledger.registry_records
            SET classification = $3, in_restricted = $4, in_public = $5
            WHERE registry = $1 AND record_id = $2
            RETURNING {}
            "#,
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(self.registry())
            .bind(id.0)
            .bind(classification.as_str())
            .bind(membership.restricted)
            .bind(membership.public)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }
}

#[async_trait]
impl MaterializationQueue for PgRegistry {
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, RegistryError> {
        let row = sqlx::query(
            r#"
            WITH expired AS (
                SELECT record_id, status
                FROM nationledger.registry_records
                WHERE registry = $1
                  AND lease_expires_at IS NOT NULL
                  AND lease_expires_at <= $2
                FOR UPDATE SKIP LOCKED
            ),
            updated AS (
                UPDATE nationledger.registry_records r
                SET status = CASE WHEN e.status = 'resolving' THEN 'pending' ELSE r.status END,
                    lease_owner = NULL,
                    lease_expires_at = NULL
                FROM expired e
                WHERE r.registry = $1 AND r.record_id = e.record_id
                RETURNING e.status AS previous_status
            )
            SELECT COUNT(*) FILTER (WHERE previous_status = 'resolving') AS reverted
            FROM updated
            "#,
        )
        .bind(self.registry())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let reverted: i64 = row.try_get("reverted")?;
        Ok(reverted.max(0) as usize)
    }

    async fn claim_pending(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<RegistryRecord>, RegistryError> {
        // Atomic claim using CTE + FOR UPDATE SKIP LOCKED.
        let sql = format!(
            r#"
            WITH claimable AS (
                SELECT record_id
                FROM nationledger.registry_records
                WHERE registry = $1
                  AND (status IN ('pending', 'resolving')
                       OR (status = 'resolved'
                           AND classification = 'declassified'
                           AND NOT in_public
                           AND (replication_error IS NULL OR next_attempt_at IS NOT NULL)))
                  AND (lease_expires_at IS NULL OR lease_expires_at <= $3)
                  AND (next_attempt_at IS NULL OR next_attempt_at <= $3)
                ORDER BY registered_at, record_id
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            UPDATE nationledger.registry_records r
            SET lease_owner = $2,
                lease_expires_at = $4,
                status = CASE WHEN r.status IN ('pending', 'resolving') THEN 'resolving'
                              ELSE r.status END
            FROM claimable c
            WHERE r.registry = $1 AND r.record_id = c.record_id
            RETURNING {}
            "#,
            qualified("r")
        );
        let rows = sqlx::query(&sql)
            .bind(self.registry())
            .bind(worker_id)
            .bind(now)
            .bind(now + lease)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut claimed = records_from_rows(&rows)?;
        claimed.sort_by_key(|r| (r.registered_at, r.id));
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
        let sql = format!(
            r#"
            UPDATE nationledger.registry_records
            SET content_address = $4,
                artifact_location = $5,
                status = 'resolved',
                last_error = NULL,
                next_attempt_at = NULL
            WHERE registry = $1 AND record_id = $2
              AND lease_owner = $3 AND lease_expires_at > $6
              AND status IN ('resolving', 'resolved')
              AND (content_address IS NULL OR content_address = $4)
            RETURNING {}
            "#,
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(self.registry())
            .bind(id.0)
            .bind(worker_id)
            .bind(address.to_hex())
            .bind(location.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| write_error(e, "complete resolution"))?;

        if let Some(row) = row {
            return record_from_row(&row).map(Some);
        }

        // Distinguish a lost lease from an address conflict
        match self.fetch(id).await? {
            Some(current) if current.lease.as_ref().is_some_and(|l| l.is_held_by(worker_id, now)) => {
                check_transition(&current, ResolutionStatus::Resolved)?;
                if current.content_address.is_some_and(|a| &a != address) {
                    return Err(RegistryError::Conflict(format!(
                        "record {} already resolved to a different address",
                        id
                    )));
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, id: RecordId, worker_id: &str) -> Result<bool, RegistryError> {
        let result = sqlx::query(
            r#"
            UPDATE nationledger.registry_records
            SET lease_owner = NULL, lease_expires_at = NULL
            WHERE registry = $1 AND record_id = $2 AND lease_owner = $3
            "#,
        )
        .bind(self.registry())
        .bind(id.0)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_failure(
        &self,
        id: RecordId,
        worker_id: &str,
        error: &str,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        let sql = format!(
            r#"
            UPDATE nationledger.registry_records
            SET attempts = attempts + 1,
                last_error = $4,
                lease_owner = NULL,
                lease_expires_at = NULL,
                status = CASE WHEN attempts + 1 >= $5 THEN 'failed' ELSE 'pending' END,
                next_attempt_at = CASE WHEN attempts + 1 >= $5 THEN NULL ELSE $6::timestamptz END
            WHERE registry = $1 AND record_id = $2 AND lease_owner = $3
              AND status = 'resolving'
            RETURNING {}
            "#,
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(self.registry())
            .bind(id.0)
            .bind(worker_id)
            .bind(error)
            .bind(max_attempts as i32)
            .bind(retry_at)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => record_from_row(&row).map(Some),
            None => self.fenced_miss(id, worker_id, ResolutionStatus::Pending).await,
        }
    }

    async fn record_replication_failure(
        &self,
        id: RecordId,
        worker_id: &str,
        error: &str,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        let sql = format!(
            r#"
            UPDATE nationledger.registry_records
            SET replication_attempts = replication_attempts + 1,
                replication_error = $4,
                lease_owner = NULL,
                lease_expires_at = NULL,
                next_attempt_at = CASE
                    WHEN replication_attempts + 1 >= $5 THEN NULL
                    ELSE $6::timestamptz
                END
            WHERE registry = $1 AND record_id = $2 AND lease_owner = $3
              AND status = 'resolved'
            RETURNING {}
            "#,
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(self.registry())
            .bind(id.0)
            .bind(worker_id)
            .bind(error)
            .bind(max_attempts as i32)
            .bind(retry_at)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            return record_from_row(&row).map(Some);
        }

        match self.fetch(id).await? {
            Some(current)
                if current.lease.as_ref().is_some_and(|l| l.owner == worker_id)
                    && current.status != ResolutionStatus::Resolved =>
            {
                Err(RegistryError::Conflict(format!(
                    "record {} is {}; only resolved records owe a public replica",
                    id, current.status
                )))
            }
            _ => Ok(None),
        }
    }

    async fn mark_failed(
        &self,
        id: RecordId,
        worker_id: &str,
        error: &str,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        let sql = format!(
            r#"
            UPDATE nationledger.registry_records
            SET status = 'failed',
                last_error = $4,
                lease_owner = NULL,
                lease_expires_at = NULL,
                next_attempt_at = NULL
            WHERE registry = $1 AND record_id = $2 AND lease_owner = $3
              AND status = 'resolving'
            RETURNING {}
            "#,
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(self.registry())
            .bind(id.0)
            .bind(worker_id)
            .bind(error)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => record_from_row(&row).map(Some),
            None => self.fenced_miss(id, worker_id, ResolutionStatus::Failed).await,
        }
    }

    async fn requeue(&self, id: RecordId) -> Result<Option<RegistryRecord>, RegistryError> {
        let sql = format!(
            r#"
            UPDATE nationledger.registry_records
            SET status = CASE
                    WHEN status <> 'failed' THEN status
                    WHEN content_address IS NULL THEN 'pending'
                    ELSE 'resolved'
                END,
                attempts = CASE WHEN status = 'failed' THEN 0 ELSE attempts END,
                last_error = CASE WHEN status = 'failed' THEN NULL ELSE last_error END,
                replication_attempts = 0,
                replication_error = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                next_attempt_at = NULL
            WHERE registry = $1 AND record_id = $2
              AND (status = 'failed'
                   OR (status = 'resolved'
                       AND replication_error IS NOT NULL
                       AND next_attempt_at IS NULL))
            RETURNING {}
            "#,
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(self.registry())
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }
}
