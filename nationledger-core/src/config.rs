//! Ledger configuration.
//!
//! Loaded from YAML (every field optional, falling back to defaults), then
//! overridden from `NATIONLEDGER_*` environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub registration: RegistrationConfig,
    pub worker: WorkerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
}

impl LedgerConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `NATIONLEDGER_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Unparseable values are
    /// logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let r = &mut self.registration;
        override_from(&lookup, "NATIONLEDGER_STORE_TIMEOUT_MS", &mut r.store_timeout_ms);
        override_from(
            &lookup,
            "NATIONLEDGER_FINGERPRINT_TIMEOUT_MS",
            &mut r.fingerprint_timeout_ms,
        );
        override_from(
            &lookup,
            "NATIONLEDGER_REGISTRY_WRITE_ATTEMPTS",
            &mut r.registry_write_attempts,
        );

        let w = &mut self.worker;
        override_from(&lookup, "NATIONLEDGER_WORKER_ID", &mut w.worker_id);
        override_from(&lookup, "NATIONLEDGER_POLL_INTERVAL_MS", &mut w.poll_interval_ms);
        override_from(&lookup, "NATIONLEDGER_BATCH_SIZE", &mut w.batch_size);
        override_from(&lookup, "NATIONLEDGER_LEASE_SECS", &mut w.lease_secs);
        override_from(&lookup, "NATIONLEDGER_MAX_ATTEMPTS", &mut w.max_attempts);
        override_from(&lookup, "NATIONLEDGER_SWEEP_INTERVAL_SECS", &mut w.sweep_interval_secs);

        let s = &mut self.storage;
        override_from(&lookup, "NATIONLEDGER_ARTIFACT_ROOT", &mut s.artifact_root);
        override_from(&lookup, "NATIONLEDGER_STAGING_ROOT", &mut s.staging_root);

        if let Some(url) = lookup("NATIONLEDGER_DATABASE_URL").or_else(|| lookup("DATABASE_URL")) {
            self.database.url = Some(url);
        }
        override_from(
            &lookup,
            "NATIONLEDGER_DB_MAX_CONNECTIONS",
            &mut self.database.max_connections,
        );
    }

    pub fn registration(mut self, registration: RegistrationConfig) -> Self {
        self.registration = registration;
        self
    }

    pub fn worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}

fn override_from<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparseable config override"),
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Synchronous registration path.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Upper bound on one `ArtifactStore::put`.
    pub store_timeout_ms: u64,

    /// Upper bound on fingerprinting one artifact.
    pub fingerprint_timeout_ms: u64,

    /// Record-write attempts before compensation.
    pub registry_write_attempts: u32,

    pub registry_retry_backoff_ms: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: 60_000,
            fingerprint_timeout_ms: 30_000,
            registry_write_attempts: 3,
            registry_retry_backoff_ms: 100,
        }
    }
}

impl RegistrationConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn fingerprint_timeout(&self) -> Duration {
        Duration::from_millis(self.fingerprint_timeout_ms)
    }

    pub fn registry_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.registry_retry_backoff_ms)
    }

    pub fn store_timeout_ms(mut self, ms: u64) -> Self {
        self.store_timeout_ms = ms;
        self
    }

    pub fn fingerprint_timeout_ms(mut self, ms: u64) -> Self {
        self.fingerprint_timeout_ms = ms;
        self
    }

    pub fn registry_write_attempts(mut self, attempts: u32) -> Self {
        self.registry_write_attempts = attempts;
        self
    }

    pub fn registry_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.registry_retry_backoff_ms = ms;
        self
    }
}

/// Materialization worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Lease owner id. Must be unique per running worker.
    pub worker_id: String,

    pub poll_interval_ms: u64,

    /// Records claimed per cycle.
    pub batch_size: usize,

    pub lease_secs: u64,

    /// Attempt ceiling before a record is marked `Failed`.
    pub max_attempts: u32,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Upper bound on each source fetch / store write.
    pub operation_timeout_ms: u64,

    pub sweep_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4().simple()),
            poll_interval_ms: 1000,
            batch_size: 16,
            lease_secs: 60,
            max_attempts: 5,
            backoff_base_ms: 1000,
            backoff_max_ms: 300_000,
            operation_timeout_ms: 60_000,
            sweep_interval_secs: 300,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs.min(i64::MAX as u64) as i64)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// `min(base * 2^(attempts-1), max)` for the attempt that just failed.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    pub fn worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn lease_secs(mut self, secs: u64) -> Self {
        self.lease_secs = secs;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.backoff_base_ms = base;
        self.backoff_max_ms = max;
        self
    }

    pub fn operation_timeout_ms(mut self, ms: u64) -> Self {
        self.operation_timeout_ms = ms;
        self
    }
}

/// Filesystem roots for the local artifact stores.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Durable, content-addressed artifacts.
    pub artifact_root: PathBuf,

    /// Uploads awaiting deferred materialization.
    pub staging_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from("data/artifacts"),
            staging_root: PathBuf::from("data/staging"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}
