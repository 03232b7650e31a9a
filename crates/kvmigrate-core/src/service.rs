use crate::connection::{Connection, ConnectionExt};
use crate::error::{MigrationError, StoreError};
use crate::version::{Edition, VersionRecord, BUCKET_NAME, UPDATING_KEY, VERSION_KEY};

/// Reads and writes the version record and updating flag in the `version` bucket.
#[derive(Clone, Copy)]
pub struct VersionService<'a> {
    conn: &'a dyn Connection,
}

impl<'a> VersionService<'a> {
    /// # Errors
    /// Returns an error when the `version` bucket cannot be created.
    pub fn new(conn: &'a dyn Connection) -> Result<Self, StoreError> {
        conn.ensure_bucket(BUCKET_NAME)?;
        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &'a dyn Connection {
        self.conn
    }

    /// The stored record, or `None` on a store that was never migrated.
    ///
    /// # Errors
    /// Returns an error when the read or decoding fails.
    pub fn try_current_version(&self) -> Result<Option<VersionRecord>, StoreError> {
        self.conn.get_typed(BUCKET_NAME, VERSION_KEY)
    }

    /// # Errors
    /// Returns [`MigrationError::MissingVersionRecord`] when no record exists yet.
    pub fn current_version(&self) -> Result<VersionRecord, MigrationError> {
        self.try_current_version()?.ok_or(MigrationError::MissingVersionRecord)
    }

    /// # Errors
    /// Returns an error when the record is missing or unreadable.
    pub fn edition(&self) -> Result<Edition, MigrationError> {
        Ok(self.current_version()?.edition)
    }

    /// # Errors
    /// Returns an error when the record is missing or unreadable.
    pub fn instance_id(&self) -> Result<String, MigrationError> {
        Ok(self.current_version()?.instance_id)
    }

    /// Whether a migration run is in progress or was interrupted. An absent flag reads
    /// as `false`.
    ///
    /// # Errors
    /// Returns an error when the read or decoding fails.
    pub fn is_updating(&self) -> Result<bool, StoreError> {
        Ok(self.conn.get_typed::<bool>(BUCKET_NAME, UPDATING_KEY)?.unwrap_or(false))
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub fn store_is_updating(&self, is_updating: bool) -> Result<(), StoreError> {
        self.conn.put_typed(BUCKET_NAME, UPDATING_KEY, &is_updating)
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub fn update_version(&self, record: &VersionRecord) -> Result<(), StoreError> {
        self.conn.put_typed(BUCKET_NAME, VERSION_KEY, record)
    }

    /// # Errors
    /// Returns an error when the record is missing or the write fails.
    pub fn store_instance_id(&self, instance_id: &str) -> Result<VersionRecord, MigrationError> {
        let mut record = self.current_version()?;
        record.instance_id = instance_id.to_string();
        self.update_version(&record).map_err(|source| MigrationError::PersistFailure {
            key: VERSION_KEY,
            source,
        })?;
        Ok(record)
    }
}
