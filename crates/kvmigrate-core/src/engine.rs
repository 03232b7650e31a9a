use semver::Version;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::MigrationError;
use crate::registry::{MigrationDescriptor, Registry};
use crate::service::VersionService;
use crate::version::{parse_version, VersionRecord, UPDATING_KEY, VERSION_KEY};

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorAction {
    /// The stored schema predates the descriptor; every step runs.
    Upgrade,
    /// The stored schema equals the descriptor but not all of its steps were recorded as
    /// applied; every step runs again from the first.
    Replay,
    Skip,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct PlannedDescriptor {
    pub target_version: String,
    pub action: DescriptorAction,
    pub steps: Vec<String>,
}

/// Decisions for one run, computed from the stored record before anything executes.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct MigrationPlan {
    pub from_version: String,
    pub from_replay_count: u32,
    pub to_version: String,
    pub replay_count: u32,
    pub descriptors: Vec<PlannedDescriptor>,
}

impl MigrationPlan {
    /// Names of the steps the run would execute, in order.
    #[must_use]
    pub fn pending_steps(&self) -> Vec<String> {
        self.descriptors
            .iter()
            .filter(|descriptor| descriptor.action != DescriptorAction::Skip)
            .flat_map(|descriptor| descriptor.steps.iter().cloned())
            .collect()
    }

    /// True when running would execute nothing and leave the record unchanged.
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.from_version == self.to_version
            && self.from_replay_count == self.replay_count
            && self.descriptors.iter().all(|descriptor| descriptor.action == DescriptorAction::Skip)
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct MigrationReport {
    pub from_version: String,
    pub to_version: String,
    pub replay_count: u32,
    pub executed_steps: Vec<String>,
}

/// Walks a [`Registry`] against the stored version record.
pub struct MigrationEngine<'a> {
    versions: VersionService<'a>,
    registry: &'a Registry,
}

impl<'a> MigrationEngine<'a> {
    #[must_use]
    pub fn new(versions: VersionService<'a>, registry: &'a Registry) -> Self {
        Self { versions, registry }
    }

    /// Decide what a run from `record` to `target` would do.
    ///
    /// # Errors
    /// Returns [`MigrationError::CorruptVersion`] when the stored schema version does not
    /// parse.
    pub fn plan(
        &self,
        record: &VersionRecord,
        target: &Version,
    ) -> Result<MigrationPlan, MigrationError> {
        let schema_version = record.parsed_schema_version()?;
        Ok(plan_walk(self.registry, &schema_version, record, target))
    }

    /// Bring the stored data model up to `target`.
    ///
    /// The updating flag is raised before anything is read and cleared only after the new
    /// record is persisted. Every failure leaves it raised so the next start can tell the
    /// store is half migrated.
    ///
    /// # Errors
    /// Returns an error when the target does not parse, the flag or record cannot be
    /// written, the stored record is missing or corrupt, or a step fails.
    pub fn run(&self, target: &str) -> Result<MigrationReport, MigrationError> {
        let target = parse_version(target)
            .map_err(|source| MigrationError::InvalidTarget { version: target.to_string(), source })?;

        info!(version = %target, "migrating database");
        self.versions
            .store_is_updating(true)
            .map_err(|source| MigrationError::PersistFailure { key: UPDATING_KEY, source })?;

        let mut record = self.versions.current_version()?;
        let plan = self.plan(&record, &target)?;

        let mut executed_steps = Vec::new();
        for (descriptor, planned) in self.registry.descriptors().iter().zip(&plan.descriptors) {
            match planned.action {
                DescriptorAction::Skip => {
                    debug!(version = %planned.target_version, "skipping migration");
                }
                DescriptorAction::Upgrade => {
                    info!(version = %planned.target_version, "migrating db");
                    self.run_descriptor(descriptor, &mut executed_steps)?;
                }
                DescriptorAction::Replay => {
                    info!(
                        version = %planned.target_version,
                        applied = record.replay_count,
                        "replaying migrations at current version"
                    );
                    self.run_descriptor(descriptor, &mut executed_steps)?;
                }
            }
        }

        let from_version = std::mem::replace(&mut record.schema_version, plan.to_version.clone());
        record.replay_count = plan.replay_count;
        self.versions
            .update_version(&record)
            .map_err(|source| MigrationError::PersistFailure { key: VERSION_KEY, source })?;
        info!(version = %record.schema_version, replay_count = record.replay_count, "migrated db");

        self.versions
            .store_is_updating(false)
            .map_err(|source| MigrationError::PersistFailure { key: UPDATING_KEY, source })?;

        Ok(MigrationReport {
            from_version,
            to_version: record.schema_version,
            replay_count: record.replay_count,
            executed_steps,
        })
    }

    fn run_descriptor(
        &self,
        descriptor: &MigrationDescriptor,
        executed_steps: &mut Vec<String>,
    ) -> Result<(), MigrationError> {
        for step in descriptor.steps() {
            if let Err(source) = step.run(self.versions.connection()) {
                error!(
                    version = %descriptor.target_version(),
                    step = step.name(),
                    error = %source,
                    "migration step failed"
                );
                return Err(MigrationError::StepFailure { step: step.name().to_string(), source });
            }
            executed_steps.push(step.name().to_string());
        }
        Ok(())
    }
}

fn plan_walk(
    registry: &Registry,
    schema_version: &Version,
    record: &VersionRecord,
    target: &Version,
) -> MigrationPlan {
    let mut applied = record.replay_count;
    let descriptors = registry
        .descriptors()
        .iter()
        .map(|descriptor| {
            let step_count = u32::try_from(descriptor.steps().len()).unwrap_or(u32::MAX);
            let action = if schema_version < descriptor.target_version() {
                applied = 0;
                DescriptorAction::Upgrade
            } else if schema_version == descriptor.target_version() && applied < step_count {
                applied = step_count;
                DescriptorAction::Replay
            } else {
                DescriptorAction::Skip
            };
            PlannedDescriptor {
                target_version: descriptor.target_version().to_string(),
                action,
                steps: descriptor.step_names(),
            }
        })
        .collect();

    MigrationPlan {
        from_version: record.schema_version.clone(),
        from_replay_count: record.replay_count,
        to_version: target.to_string(),
        replay_count: applied,
        descriptors,
    }
}
