use std::error::Error as StdError;

use crate::version::MINIMUM_SUPPORTED_VERSION;

/// Boxed error carried by store backends and migration steps.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error")]
    Backend(#[source] BoxError),
    #[error("failed to encode or decode object {bucket}/{key}")]
    Encoding {
        bucket: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn backend(err: impl Into<BoxError>) -> Self {
        Self::Backend(err.into())
    }

    pub fn encoding(bucket: &str, key: &str, source: serde_json::Error) -> Self {
        Self::Encoding { bucket: bucket.to_string(), key: key.to_string(), source }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error(
        "migrating from a schema older than {} is not supported; \
         upgrade through an intermediate release first",
        MINIMUM_SUPPORTED_VERSION
    )]
    TooOld,
    #[error("stored schema version {version:?} is not a valid semantic version")]
    CorruptVersion {
        version: String,
        #[source]
        source: semver::Error,
    },
    #[error("target version {version:?} is not a valid semantic version")]
    InvalidTarget {
        version: String,
        #[source]
        source: semver::Error,
    },
    #[error("migration descriptor version {version:?} is not a valid semantic version")]
    InvalidDescriptor {
        version: String,
        #[source]
        source: semver::Error,
    },
    #[error("unknown legacy schema version {0}")]
    UnknownLegacyVersion(i64),
    #[error("legacy key {0} is missing")]
    MissingLegacyKey(&'static str),
    #[error("version record is missing")]
    MissingVersionRecord,
    #[error("failed in migration step {step}")]
    StepFailure {
        step: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to persist {key}")]
    PersistFailure {
        key: &'static str,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MigrationError {
    /// True for [`MigrationError::TooOld`], directly or as the cause of a failed step.
    #[must_use]
    pub fn is_too_old(&self) -> bool {
        match self {
            Self::TooOld => true,
            Self::StepFailure { source, .. } => {
                matches!(source.downcast_ref::<MigrationError>(), Some(MigrationError::TooOld))
            }
            _ => false,
        }
    }

    /// True when the requested target, not the store, was at fault.
    #[must_use]
    pub fn is_invalid_target(&self) -> bool {
        matches!(self, Self::InvalidTarget { .. })
    }

    /// Name of the step that failed, when the run aborted inside a step.
    #[must_use]
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::StepFailure { step, .. } => Some(step),
            _ => None,
        }
    }
}
