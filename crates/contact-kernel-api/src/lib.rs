use std::path::PathBuf;

use anyhow::Result;
use contact_kernel_core::{ContactError, ContactRecord, ContactResponse, IdentityQuery};
use contact_kernel_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyRequest {
    pub email: Option<String>,
    #[serde(rename = "phoneNumber")]
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// How an identify call failed, split along the caller-fault / system-fault
/// line so transports can map each side to the right status code.
#[derive(Debug, thiserror::Error)]
pub enum IdentifyError {
    #[error("{0}")]
    Precondition(String),
    #[error("contact store failure")]
    Infrastructure(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct ContactKernelApi {
    db_path: PathBuf,
}

impl ContactKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Resolve one identify request against the stored contact graph.
    ///
    /// # Errors
    /// Returns `IdentifyError::Precondition` when the request carries no usable
    /// identifier, and `IdentifyError::Infrastructure` when the store fails.
    pub fn identify(&self, input: &IdentifyRequest) -> Result<ContactResponse, IdentifyError> {
        let query = IdentityQuery::new(input.email.as_deref(), input.phone_number.as_deref())
            .map_err(|err| match err {
                ContactError::Validation(message) => IdentifyError::Precondition(message),
                ContactError::Integrity(message) => {
                    IdentifyError::Infrastructure(anyhow::anyhow!(message))
                }
            })?;

        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store.identify(&query)?)
    }

    /// List every stored contact row in id order.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn list_contacts(&self) -> Result<Vec<ContactRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_contacts()
    }

    /// Run database and link-invariant integrity probes.
    ///
    /// # Errors
    /// Returns an error when an integrity probe cannot run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.integrity_check()
    }
}
