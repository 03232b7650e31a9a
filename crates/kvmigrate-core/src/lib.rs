//! Versioned data-model migration for a bucket-based key-value store.

pub mod connection;
pub mod engine;
pub mod error;
pub mod legacy;
pub mod migrator;
pub mod registry;
pub mod service;
pub mod transforms;
pub mod version;

pub use connection::{Connection, ConnectionExt, MemoryConnection};
pub use engine::{DescriptorAction, MigrationEngine, MigrationPlan, MigrationReport, PlannedDescriptor};
pub use error::{BoxError, MigrationError, StoreError};
pub use legacy::{legacy_schema_version, migrate_legacy_version, BridgeOutcome};
pub use migrator::{MigrationOutcome, Migrator, PlanOutcome, RecordSource};
pub use registry::{MigrationDescriptor, MigrationStep, Registry, RegistryBuilder, StepResult};
pub use service::VersionService;
pub use version::{parse_version, Edition, VersionRecord};
