//! Postgres orphan log on `nationledger.orphaned_artifacts`, so locations
//! that failed cleanup survive a worker restart.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::{OrphanLog, OrphanedArtifact, StoreRole};
use crate::registry::RegistryError;
use crate::types::ArtifactLocation;

pub struct PgOrphanLog {
    pool: PgPool,
}

impl PgOrphanLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrphanLog for PgOrphanLog {
    async fn record(&self, entry: OrphanedArtifact) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            INSERT INTO nationledger.orphaned_artifacts (role, location)
            VALUES ($1, $2)
            ON CONFLICT (role, location) DO NOTHING
            "#,
        )
        .bind(entry.role.as_str())
        .bind(entry.location.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<OrphanedArtifact>, RegistryError> {
        let rows = sqlx::query(
            r#"
            SELECT role, location
            FROM nationledger.orphaned_artifacts
            ORDER BY recorded_at, location
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<OrphanedArtifact, RegistryError> {
                let role: String = row.try_get("role")?;
                let location: String = row.try_get("location")?;
                let role = StoreRole::parse(&role).ok_or_else(|| {
                    RegistryError::Corrupt(format!("{}: unknown store role {}", location, role))
                })?;
                Ok(OrphanedArtifact {
                    role,
                    location: ArtifactLocation::new(location),
                })
            })
            .collect()
    }

    async fn forget(&self, entry: &OrphanedArtifact) -> Result<(), RegistryError> {
        sqlx::query(
            "DELETE FROM nationledger.orphaned_artifacts WHERE role = $1 AND location = $2",
        )
        .bind(entry.role.as_str())
        .bind(entry.location.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
