use semver::Version;
use serde::Serialize;
use tracing::info;

use crate::connection::Connection;
use crate::engine::{MigrationEngine, MigrationPlan, MigrationReport};
use crate::error::MigrationError;
use crate::legacy::{migrate_legacy_version, read_legacy_record, BridgeOutcome};
use crate::registry::Registry;
use crate::service::VersionService;
use crate::version::{parse_version, Edition, VersionRecord, VERSION_KEY};

/// Where the version record used by a run came from.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    Existing,
    Legacy,
    FreshInstall,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct MigrationOutcome {
    pub record_source: RecordSource,
    pub report: MigrationReport,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct PlanOutcome {
    pub record_source: RecordSource,
    pub plan: MigrationPlan,
}

/// Startup sequence for one store: legacy bridge, fresh install bootstrap, then the engine.
pub struct Migrator<'a> {
    versions: VersionService<'a>,
    registry: &'a Registry,
    edition: Edition,
}

impl<'a> Migrator<'a> {
    /// `edition` only applies when a fresh install has to create its first record.
    ///
    /// # Errors
    /// Returns an error when the `version` bucket cannot be created.
    pub fn new(
        conn: &'a dyn Connection,
        registry: &'a Registry,
        edition: Edition,
    ) -> Result<Self, MigrationError> {
        Ok(Self { versions: VersionService::new(conn)?, registry, edition })
    }

    #[must_use]
    pub fn versions(&self) -> VersionService<'a> {
        self.versions
    }

    /// Make sure a version record exists, importing legacy keys or creating a default
    /// record at `target` for a store that was never versioned.
    ///
    /// # Errors
    /// Returns an error when the bridge fails or the new record cannot be written.
    pub fn bootstrap(&self, target: &Version) -> Result<RecordSource, MigrationError> {
        match migrate_legacy_version(&self.versions)? {
            BridgeOutcome::AlreadyVersioned => Ok(RecordSource::Existing),
            BridgeOutcome::Imported(_) => Ok(RecordSource::Legacy),
            BridgeOutcome::NoLegacyData => {
                let record = VersionRecord::fresh(target, self.edition);
                self.versions
                    .update_version(&record)
                    .map_err(|source| MigrationError::PersistFailure { key: VERSION_KEY, source })?;
                info!(
                    schema_version = %record.schema_version,
                    instance_id = %record.instance_id,
                    "initialised version record for new installation"
                );
                Ok(RecordSource::FreshInstall)
            }
        }
    }

    /// Bootstrap the record if needed and run every pending migration up to `target`.
    ///
    /// # Errors
    /// Returns the first bootstrap or engine failure.
    pub fn run_migration(&self, target: &str) -> Result<MigrationOutcome, MigrationError> {
        let version = parse_target(target)?;
        let record_source = self.bootstrap(&version)?;
        let report = MigrationEngine::new(self.versions, self.registry).run(target)?;
        Ok(MigrationOutcome { record_source, report })
    }

    /// What [`Migrator::run_migration`] would do, without writing anything.
    ///
    /// # Errors
    /// Returns an error when the target or stored record cannot be parsed, or the legacy
    /// keys cannot be read.
    pub fn plan(&self, target: &str) -> Result<PlanOutcome, MigrationError> {
        let version = parse_target(target)?;
        let (record_source, record) = match self.versions.try_current_version()? {
            Some(record) => (RecordSource::Existing, record),
            None => match read_legacy_record(&self.versions)? {
                Some(record) => (RecordSource::Legacy, record),
                None => (RecordSource::FreshInstall, VersionRecord::fresh(&version, self.edition)),
            },
        };
        let plan = MigrationEngine::new(self.versions, self.registry).plan(&record, &version)?;
        Ok(PlanOutcome { record_source, plan })
    }
}

fn parse_target(target: &str) -> Result<Version, MigrationError> {
    parse_version(target)
        .map_err(|source| MigrationError::InvalidTarget { version: target.to_string(), source })
}
