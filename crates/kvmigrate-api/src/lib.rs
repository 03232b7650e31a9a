use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use kvmigrate_core::{
    Edition, MigrationPlan, Migrator, PlannedDescriptor, RecordSource, Registry, VersionRecord,
    VersionService,
};
use kvmigrate_store_sqlite::{LayoutStatus, SqliteStore};
use serde::Serialize;
use tracing::{debug, warn};

mod releases;

pub use releases::release_registry;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Data model version this build writes; the default migration target.
pub const APP_SCHEMA_VERSION: &str = "2.16.0";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    pub target_version: String,
    pub current_version: Option<String>,
    pub replay_count: Option<u32>,
    pub edition: Option<Edition>,
    pub instance_id: Option<String>,
    pub is_updating: bool,
    pub record_source: RecordSource,
    pub pending_steps: Vec<String>,
    pub up_to_date: bool,
    pub layout: LayoutStatus,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub record_source: RecordSource,
    pub current_version: String,
    pub target_version: String,
    pub would_apply_steps: Vec<String>,
    pub descriptors: Vec<PlannedDescriptor>,
    pub executed_steps: Option<Vec<String>>,
    pub after_version: Option<String>,
    pub replay_count: Option<u32>,
    /// Whether the store was already at the target before this run.
    pub up_to_date: bool,
}

/// File-backed entry point shared by the CLI and the service.
#[derive(Debug, Clone)]
pub struct MigratorApi {
    db_path: PathBuf,
    edition: Edition,
}

impl MigratorApi {
    /// `edition` is stamped on the record of a fresh installation; existing records keep
    /// their own.
    #[must_use]
    pub fn new(db_path: PathBuf, edition: Edition) -> Self {
        Self { db_path, edition }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Open the database for a query; unlike [`MigratorApi::open_store`] a missing file is
    /// an error instead of a new database.
    fn open_existing_store(&self) -> Result<SqliteStore> {
        if !self.db_path.exists() {
            return Err(anyhow!("database {} does not exist", self.db_path.display()));
        }
        self.open_store()
    }

    fn registry() -> Result<Registry> {
        release_registry().context("release registry is invalid")
    }

    /// Report the stored version and what a migration to `target` would do, without
    /// writing to the data model.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or the stored version
    /// information cannot be read or planned against.
    pub fn status(&self, target: &str) -> Result<StatusReport> {
        // A database that does not exist yet is planned against an empty in-memory store.
        let exists = self.db_path.exists();
        let store = if exists {
            self.open_store()?
        } else {
            SqliteStore::open(Path::new(":memory:"))?
        };
        let registry = Self::registry()?;
        let migrator = Migrator::new(&store, &registry, self.edition)?;
        let versions = migrator.versions();

        let record = versions.try_current_version().context("failed to read version record")?;
        let planned = migrator
            .plan(target)
            .with_context(|| format!("failed to plan migration to {target}"))?;

        Ok(StatusReport {
            target_version: planned.plan.to_version.clone(),
            current_version: record.as_ref().map(|record| record.schema_version.clone()),
            replay_count: record.as_ref().map(|record| record.replay_count),
            edition: record.as_ref().map(|record| record.edition),
            instance_id: record.map(|record| record.instance_id),
            is_updating: versions.is_updating().context("failed to read updating flag")?,
            record_source: planned.record_source,
            pending_steps: planned.plan.pending_steps(),
            up_to_date: planned.record_source == RecordSource::Existing
                && planned.plan.is_up_to_date(),
            layout: if exists { store.layout_status()? } else { LayoutStatus::unapplied() },
        })
    }

    /// Migrate the data model to `target`, or only plan it in dry-run mode.
    ///
    /// # Errors
    /// Returns an error when planning or any part of the migration fails. A failed run
    /// leaves the updating flag raised.
    pub fn migrate(&self, target: &str, dry_run: bool) -> Result<MigrateResult> {
        let store = self.open_store()?;
        let registry = Self::registry()?;
        let migrator = Migrator::new(&store, &registry, self.edition)?;

        if dry_run {
            let planned = migrator
                .plan(target)
                .with_context(|| format!("failed to plan migration to {target}"))?;
            let would_apply_steps = planned.plan.pending_steps();
            let up_to_date = planned.record_source == RecordSource::Existing
                && planned.plan.is_up_to_date();
            let MigrationPlan { from_version, to_version, descriptors, .. } = planned.plan;
            return Ok(MigrateResult {
                dry_run: true,
                record_source: planned.record_source,
                current_version: from_version,
                target_version: to_version,
                would_apply_steps,
                descriptors,
                executed_steps: None,
                after_version: None,
                replay_count: None,
                up_to_date,
            });
        }

        // The run raises the updating flag before it reads the stored record, so a record
        // the plan cannot read is left for the run to reject.
        let planned = match migrator.plan(target) {
            Ok(planned) => Some(planned),
            Err(err) => {
                debug!(error = %err, "could not plan migration; deferring to the run");
                None
            }
        };

        let outcome = match migrator.run_migration(target) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "migration failed; store left flagged as updating");
                return Err(err).with_context(|| format!("failed to migrate database to {target}"));
            }
        };

        let report = outcome.report;
        let (descriptors, would_apply_steps, up_to_date) = match planned {
            Some(planned) => {
                let pending = planned.plan.pending_steps();
                let up_to_date = planned.record_source == RecordSource::Existing
                    && planned.plan.is_up_to_date();
                (planned.plan.descriptors, pending, up_to_date)
            }
            None => (Vec::new(), report.executed_steps.clone(), false),
        };

        Ok(MigrateResult {
            dry_run: false,
            record_source: outcome.record_source,
            current_version: report.from_version,
            target_version: report.to_version.clone(),
            would_apply_steps,
            descriptors,
            executed_steps: Some(report.executed_steps),
            after_version: Some(report.to_version),
            replay_count: Some(report.replay_count),
            up_to_date,
        })
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or holds no version record.
    pub fn current_version(&self) -> Result<VersionRecord> {
        let store = self.open_existing_store()?;
        let record = VersionService::new(&store)?
            .current_version()
            .context("failed to read version record")?;
        Ok(record)
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or holds no version record.
    pub fn edition(&self) -> Result<Edition> {
        Ok(self.current_version()?.edition)
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or holds no version record.
    pub fn instance_id(&self) -> Result<String> {
        Ok(self.current_version()?.instance_id)
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or the flag cannot be read.
    pub fn is_updating(&self) -> Result<bool> {
        let store = self.open_existing_store()?;
        let updating = VersionService::new(&store)?
            .is_updating()
            .context("failed to read updating flag")?;
        Ok(updating)
    }

    /// Replace the stored instance id and return the updated record.
    ///
    /// # Errors
    /// Returns an error when `instance_id` is blank, no record exists, or the write fails.
    pub fn set_instance_id(&self, instance_id: &str) -> Result<VersionRecord> {
        let instance_id = instance_id.trim();
        if instance_id.is_empty() {
            return Err(anyhow!("instance id must not be empty"));
        }

        let store = self.open_store()?;
        let record = VersionService::new(&store)?
            .store_instance_id(instance_id)
            .context("failed to store instance id")?;
        Ok(record)
    }

    /// Copy the database to `out_file`.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or the backup fails.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        self.open_store()?.backup_database(out_file)
    }
}
