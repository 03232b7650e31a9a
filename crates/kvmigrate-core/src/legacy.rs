//! One-time import of the pre-versioning layout, where schema version, edition and
//! instance id lived under three free-standing keys.

use serde::Serialize;
use tracing::{info, warn};

use crate::connection::ConnectionExt;
use crate::error::MigrationError;
use crate::service::VersionService;
use crate::version::{
    Edition, VersionRecord, BUCKET_NAME, DEFAULT_LEGACY_SCHEMA_VERSION, LEGACY_DB_VERSION_KEY,
    LEGACY_EDITION_KEY, LEGACY_INSTANCE_KEY, VERSION_KEY,
};

/// Internal schema numbers used before semantic versions, and the release each maps to.
/// 28, 29 and 31 were only ever produced by non-community editions.
const LEGACY_VERSION_MAP: &[(i64, &str)] = &[
    (18, "1.21.0"),
    (19, "1.22.0"),
    (20, "1.22.1"),
    (21, "1.22.2"),
    (22, "1.23.0"),
    (23, "1.24.0"),
    (24, "1.24.1"),
    (25, "2.0.0"),
    (26, "2.1.0"),
    (27, "2.2.0"),
    (28, "2.4.0"),
    (29, "2.4.0"),
    (30, "2.6.0"),
    (31, "2.7.0"),
    (32, "2.9.0"),
    (33, "2.9.1"),
    (34, "2.10.0"),
    (35, "2.9.3"),
    (36, "2.12.0"),
    (40, "2.13.0"),
    (50, "2.14.0"),
    (51, "2.14.1"),
    (52, "2.14.2"),
    (60, "2.15.0"),
    (70, "2.16.0"),
];

const LEGACY_KEYS: [&str; 3] = [LEGACY_DB_VERSION_KEY, LEGACY_EDITION_KEY, LEGACY_INSTANCE_KEY];

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "outcome", content = "record", rename_all = "snake_case")]
pub enum BridgeOutcome {
    /// A version record already exists; legacy keys, if any, are ignored.
    AlreadyVersioned,
    /// Neither a version record nor legacy keys exist.
    NoLegacyData,
    Imported(VersionRecord),
}

/// Map a legacy integer schema number to its semantic version.
///
/// # Errors
/// Returns [`MigrationError::UnknownLegacyVersion`] for numbers above the supported floor
/// that have no entry in the table.
pub fn legacy_schema_version(db_version: i64) -> Result<&'static str, MigrationError> {
    if let Some((_, version)) = LEGACY_VERSION_MAP.iter().find(|(number, _)| *number == db_version)
    {
        return Ok(*version);
    }

    let floor = LEGACY_VERSION_MAP.first().map_or(0, |(number, _)| *number);
    if db_version < floor {
        return Ok(DEFAULT_LEGACY_SCHEMA_VERSION);
    }

    Err(MigrationError::UnknownLegacyVersion(db_version))
}

/// Build the record the bridge would import, without writing anything.
///
/// # Errors
/// Returns an error when a legacy key is unreadable or missing, or the schema number
/// cannot be mapped.
pub fn read_legacy_record(
    service: &VersionService<'_>,
) -> Result<Option<VersionRecord>, MigrationError> {
    let conn = service.connection();
    let Some(db_version) = conn.get_typed::<i64>(BUCKET_NAME, LEGACY_DB_VERSION_KEY)? else {
        return Ok(None);
    };
    let edition = conn
        .get_typed::<i64>(BUCKET_NAME, LEGACY_EDITION_KEY)?
        .ok_or(MigrationError::MissingLegacyKey(LEGACY_EDITION_KEY))?;
    let instance_id = conn
        .get_typed::<String>(BUCKET_NAME, LEGACY_INSTANCE_KEY)?
        .ok_or(MigrationError::MissingLegacyKey(LEGACY_INSTANCE_KEY))?;

    Ok(Some(VersionRecord {
        schema_version: legacy_schema_version(db_version)?.to_string(),
        replay_count: 0,
        edition: Edition::from(edition),
        instance_id,
    }))
}

/// Replace the legacy keys with a structured version record.
///
/// # Errors
/// Returns an error when reading the legacy keys or persisting the record fails. Failing
/// to delete the legacy keys afterwards is logged and ignored.
pub fn migrate_legacy_version(service: &VersionService<'_>) -> Result<BridgeOutcome, MigrationError> {
    if service.try_current_version()?.is_some() {
        if service.connection().contains_key(BUCKET_NAME, LEGACY_DB_VERSION_KEY)? {
            warn!("ignoring residual legacy version keys; a version record already exists");
        }
        return Ok(BridgeOutcome::AlreadyVersioned);
    }

    let Some(record) = read_legacy_record(service)? else {
        return Ok(BridgeOutcome::NoLegacyData);
    };

    service
        .update_version(&record)
        .map_err(|source| MigrationError::PersistFailure { key: VERSION_KEY, source })?;
    info!(
        schema_version = %record.schema_version,
        edition = %record.edition,
        "imported legacy version keys"
    );

    for key in LEGACY_KEYS {
        if let Err(err) = service.connection().delete_object(BUCKET_NAME, key) {
            warn!(key, error = %err, "failed to remove legacy version key");
        }
    }

    Ok(BridgeOutcome::Imported(record))
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::connection::{Connection, MemoryConnection};
    use crate::error::StoreError;

    fn seed_legacy(conn: &MemoryConnection, db_version: i64) -> Result<(), StoreError> {
        conn.update_object(BUCKET_NAME, LEGACY_DB_VERSION_KEY, &json!(db_version))?;
        conn.update_object(BUCKET_NAME, LEGACY_EDITION_KEY, &json!(1))?;
        conn.update_object(BUCKET_NAME, LEGACY_INSTANCE_KEY, &json!("abc"))?;
        Ok(())
    }

    /// Accepts every write except deletes, which always fail.
    struct UndeletableConnection(MemoryConnection);

    impl Connection for UndeletableConnection {
        fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError> {
            self.0.ensure_bucket(bucket)
        }

        fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Value>, StoreError> {
            self.0.get_object(bucket, key)
        }

        fn update_object(&self, bucket: &str, key: &str, value: &Value) -> Result<(), StoreError> {
            self.0.update_object(bucket, key, value)
        }

        fn delete_object(&self, _bucket: &str, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::backend("read-only volume"))
        }

        fn list_keys(&self, bucket: &str) -> Result<Vec<String>, StoreError> {
            self.0.list_keys(bucket)
        }
    }

    /// Refuses to write the structured version record.
    struct UnwritableRecordConnection(MemoryConnection);

    impl Connection for UnwritableRecordConnection {
        fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError> {
            self.0.ensure_bucket(bucket)
        }

        fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Value>, StoreError> {
            self.0.get_object(bucket, key)
        }

        fn update_object(&self, bucket: &str, key: &str, value: &Value) -> Result<(), StoreError> {
            if bucket == BUCKET_NAME && key == VERSION_KEY {
                return Err(StoreError::backend("disk full"));
            }
            self.0.update_object(bucket, key, value)
        }

        fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
            self.0.delete_object(bucket, key)
        }

        fn list_keys(&self, bucket: &str) -> Result<Vec<String>, StoreError> {
            self.0.list_keys(bucket)
        }
    }

    #[test]
    fn legacy_numbers_map_through_the_table() -> Result<(), MigrationError> {
        assert_eq!(legacy_schema_version(18)?, "1.21.0");
        assert_eq!(legacy_schema_version(25)?, "2.0.0");
        assert_eq!(legacy_schema_version(35)?, "2.9.3");
        assert_eq!(legacy_schema_version(70)?, "2.16.0");
        Ok(())
    }

    #[test]
    fn numbers_below_the_table_map_to_the_default() -> Result<(), MigrationError> {
        assert_eq!(legacy_schema_version(17)?, "1.0.0");
        assert_eq!(legacy_schema_version(5)?, "1.0.0");
        assert_eq!(legacy_schema_version(0)?, "1.0.0");
        Ok(())
    }

    #[test]
    fn unmapped_numbers_above_the_floor_are_fatal() {
        assert!(matches!(legacy_schema_version(37), Err(MigrationError::UnknownLegacyVersion(37))));
        assert!(matches!(legacy_schema_version(71), Err(MigrationError::UnknownLegacyVersion(71))));
    }

    #[test]
    fn bridge_imports_and_removes_legacy_keys() -> Result<(), MigrationError> {
        let conn = MemoryConnection::new();
        let service = VersionService::new(&conn)?;
        seed_legacy(&conn, 25)?;

        let outcome = migrate_legacy_version(&service)?;
        let expected = VersionRecord {
            schema_version: "2.0.0".to_string(),
            replay_count: 0,
            edition: Edition::Community,
            instance_id: "abc".to_string(),
        };
        assert_eq!(outcome, BridgeOutcome::Imported(expected.clone()));
        assert_eq!(service.current_version()?, expected);

        for key in LEGACY_KEYS {
            assert!(!conn.contains_key(BUCKET_NAME, key)?, "{key} should be deleted");
        }

        assert_eq!(migrate_legacy_version(&service)?, BridgeOutcome::AlreadyVersioned);
        Ok(())
    }

    #[test]
    fn bridge_maps_ancient_installations_to_default_version() -> Result<(), MigrationError> {
        let conn = MemoryConnection::new();
        let service = VersionService::new(&conn)?;
        seed_legacy(&conn, 5)?;

        migrate_legacy_version(&service)?;
        assert_eq!(service.current_version()?.schema_version, "1.0.0");
        Ok(())
    }

    #[test]
    fn bridge_is_a_noop_without_legacy_keys() -> Result<(), MigrationError> {
        let conn = MemoryConnection::new();
        let service = VersionService::new(&conn)?;

        assert_eq!(migrate_legacy_version(&service)?, BridgeOutcome::NoLegacyData);
        assert!(service.try_current_version()?.is_none());
        Ok(())
    }

    #[test]
    fn unknown_legacy_version_persists_nothing() -> Result<(), MigrationError> {
        let conn = MemoryConnection::new();
        let service = VersionService::new(&conn)?;
        seed_legacy(&conn, 45)?;

        assert!(matches!(
            migrate_legacy_version(&service),
            Err(MigrationError::UnknownLegacyVersion(45))
        ));
        assert!(service.try_current_version()?.is_none());
        assert!(conn.contains_key(BUCKET_NAME, LEGACY_DB_VERSION_KEY)?);
        Ok(())
    }

    #[test]
    fn missing_edition_is_a_read_failure() -> Result<(), MigrationError> {
        let conn = MemoryConnection::new();
        let service = VersionService::new(&conn)?;
        conn.update_object(BUCKET_NAME, LEGACY_DB_VERSION_KEY, &json!(30))?;

        assert!(matches!(
            migrate_legacy_version(&service),
            Err(MigrationError::MissingLegacyKey(LEGACY_EDITION_KEY))
        ));
        Ok(())
    }

    #[test]
    fn failed_record_write_keeps_every_legacy_key() -> Result<(), MigrationError> {
        let conn = UnwritableRecordConnection(MemoryConnection::new());
        let service = VersionService::new(&conn)?;
        seed_legacy(&conn.0, 30)?;

        assert!(matches!(
            migrate_legacy_version(&service),
            Err(MigrationError::PersistFailure { key: VERSION_KEY, .. })
        ));
        for key in LEGACY_KEYS {
            assert!(conn.contains_key(BUCKET_NAME, key)?, "{key} should be kept");
        }
        assert!(service.try_current_version()?.is_none());
        Ok(())
    }

    #[test]
    fn failed_cleanup_still_imports_and_keys_are_ignored_later() -> Result<(), MigrationError> {
        let conn = UndeletableConnection(MemoryConnection::new());
        let service = VersionService::new(&conn)?;
        seed_legacy(&conn.0, 30)?;

        let outcome = migrate_legacy_version(&service)?;
        assert!(matches!(outcome, BridgeOutcome::Imported(_)));
        assert!(conn.contains_key(BUCKET_NAME, LEGACY_DB_VERSION_KEY)?);

        assert_eq!(migrate_legacy_version(&service)?, BridgeOutcome::AlreadyVersioned);
        assert_eq!(service.current_version()?.schema_version, "2.6.0");
        Ok(())
    }
}
