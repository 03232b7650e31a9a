use std::fmt::{Display, Formatter};

use semver::Version;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::MigrationError;

/// Bucket holding the version record, the updating flag and the legacy keys.
pub const BUCKET_NAME: &str = "version";
pub const VERSION_KEY: &str = "VERSION";
pub const UPDATING_KEY: &str = "DB_UPDATING";

pub const LEGACY_DB_VERSION_KEY: &str = "DB_VERSION";
pub const LEGACY_EDITION_KEY: &str = "EDITION";
pub const LEGACY_INSTANCE_KEY: &str = "INSTANCE_ID";

/// Version stamped on installations imported from a pre-1.21 legacy layout.
pub const DEFAULT_LEGACY_SCHEMA_VERSION: &str = "1.0.0";

/// Oldest schema the migration chain can upgrade from.
pub const MINIMUM_SUPPORTED_VERSION: &str = "1.21.0";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(from = "i64", into = "i64")]
pub enum Edition {
    Community,
    Business,
    Enterprise,
    Other(i64),
}

impl Edition {
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::Community => 1,
            Self::Business => 2,
            Self::Enterprise => 3,
            Self::Other(code) => code,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Community => "community",
            Self::Business => "business",
            Self::Enterprise => "enterprise",
            Self::Other(_) => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "community" | "ce" => Some(Self::Community),
            "business" | "be" => Some(Self::Business),
            "enterprise" | "ee" => Some(Self::Enterprise),
            other => other.parse::<i64>().ok().map(Self::from),
        }
    }
}

impl From<i64> for Edition {
    fn from(code: i64) -> Self {
        match code {
            1 => Self::Community,
            2 => Self::Business,
            3 => Self::Enterprise,
            other => Self::Other(other),
        }
    }
}

impl From<Edition> for i64 {
    fn from(edition: Edition) -> Self {
        edition.code()
    }
}

impl Display for Edition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Other(code) => write!(f, "other({code})"),
            known => f.write_str(known.as_str()),
        }
    }
}

/// The single structured record describing the persisted data model.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VersionRecord {
    #[serde(rename = "SchemaVersion")]
    pub schema_version: String,
    /// Steps of the descriptor at `schema_version` already confirmed applied.
    #[serde(rename = "MigratorCount", default)]
    pub replay_count: u32,
    #[serde(rename = "Edition")]
    pub edition: Edition,
    #[serde(rename = "InstanceID")]
    pub instance_id: String,
}

impl VersionRecord {
    /// Default record for a brand new installation.
    #[must_use]
    pub fn fresh(schema_version: &Version, edition: Edition) -> Self {
        Self {
            schema_version: schema_version.to_string(),
            replay_count: 0,
            edition,
            instance_id: Ulid::new().to_string(),
        }
    }

    /// Parse the stored schema version.
    ///
    /// # Errors
    /// Returns [`MigrationError::CorruptVersion`] when the stored string is not a version.
    pub fn parsed_schema_version(&self) -> Result<Version, MigrationError> {
        parse_version(&self.schema_version).map_err(|source| MigrationError::CorruptVersion {
            version: self.schema_version.clone(),
            source,
        })
    }
}

/// Parse a semantic version, accepting the shortened `MAJOR` and `MAJOR.MINOR` forms
/// and a leading `v` that older releases wrote.
///
/// # Errors
/// Returns the strict parser's error when the coerced string is still not a version.
pub fn parse_version(raw: &str) -> Result<Version, semver::Error> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);

    let core_end = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(core_end);
    let padding = match core.matches('.').count() {
        0 if !core.is_empty() => ".0.0",
        1 => ".0",
        _ => "",
    };

    Version::parse(&format!("{core}{padding}{suffix}"))
}
