use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use semver::Version;

use crate::connection::Connection;
use crate::error::{BoxError, MigrationError};
use crate::version::parse_version;

pub type StepResult = Result<(), BoxError>;

/// Body of a migration step. Steps must be idempotent: running one twice in a row leaves
/// the store exactly as running it once.
pub type StepFn = Arc<dyn Fn(&dyn Connection) -> StepResult + Send + Sync>;

/// Name of the step registered on the floor descriptor.
pub const REJECT_UNSUPPORTED_STEP: &str = "reject_unsupported_schema";

#[derive(Clone)]
pub struct MigrationStep {
    name: String,
    run: StepFn,
}

impl MigrationStep {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&dyn Connection) -> StepResult + Send + Sync + 'static,
    {
        Self { name: name.into(), run: Arc::new(run) }
    }

    /// A step that always fails with [`MigrationError::TooOld`].
    #[must_use]
    pub fn reject_unsupported() -> Self {
        Self::new(REJECT_UNSUPPORTED_STEP, |_| Err(MigrationError::TooOld.into()))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// # Errors
    /// Returns whatever the step body reports.
    pub fn run(&self, conn: &dyn Connection) -> StepResult {
        (self.run)(conn)
    }
}

impl Debug for MigrationStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Binds a target schema version to the steps that bring the data model up to it.
#[derive(Debug, Clone)]
pub struct MigrationDescriptor {
    target_version: Version,
    steps: Vec<MigrationStep>,
}

impl MigrationDescriptor {
    #[must_use]
    pub fn new(target_version: Version, steps: Vec<MigrationStep>) -> Self {
        Self { target_version, steps }
    }

    #[must_use]
    pub fn target_version(&self) -> &Version {
        &self.target_version
    }

    #[must_use]
    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    #[must_use]
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.name.clone()).collect()
    }
}

/// Ordered, append-only list of migration descriptors.
///
/// The order is the release history, not the version order: a branch released later can
/// carry a lower version than an entry before it. The engine walks the list exactly as it
/// was built and nothing here ever sorts it.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    descriptors: Vec<MigrationDescriptor>,
}

impl Registry {
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    #[must_use]
    pub fn descriptors(&self) -> &[MigrationDescriptor] {
        &self.descriptors
    }

    /// Target versions in walk order.
    #[must_use]
    pub fn versions(&self) -> Vec<String> {
        self.descriptors.iter().map(|descriptor| descriptor.target_version.to_string()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entries: Vec<(String, Vec<MigrationStep>)>,
}

impl RegistryBuilder {
    /// Open the registry with the floor descriptor; stores at or below `version` are
    /// rejected with [`MigrationError::TooOld`] before any real step runs.
    #[must_use]
    pub fn floor(self, version: &str) -> Self {
        self.migration(version, [MigrationStep::reject_unsupported()])
    }

    /// Append a descriptor. Entries keep their insertion order.
    #[must_use]
    pub fn migration(
        mut self,
        version: &str,
        steps: impl IntoIterator<Item = MigrationStep>,
    ) -> Self {
        self.entries.push((version.to_string(), steps.into_iter().collect()));
        self
    }

    /// # Errors
    /// Returns [`MigrationError::InvalidDescriptor`] for the first unparseable version.
    pub fn build(self) -> Result<Registry, MigrationError> {
        let descriptors = self
            .entries
            .into_iter()
            .map(|(version, steps)| match parse_version(&version) {
                Ok(target_version) => Ok(MigrationDescriptor::new(target_version, steps)),
                Err(source) => Err(MigrationError::InvalidDescriptor { version, source }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Registry { descriptors })
    }
}
