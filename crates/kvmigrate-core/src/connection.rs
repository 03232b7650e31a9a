use std::cell::RefCell;
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;

/// Bucket-scoped object access to the embedded store.
///
/// Objects cross this boundary as JSON values; how they are laid out on disk is up to the
/// implementation.
pub trait Connection {
    /// Create the bucket if it does not exist yet.
    ///
    /// # Errors
    /// Returns an error when the backend rejects the write.
    fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    /// # Errors
    /// Returns an error when the backend read or decoding fails.
    fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Insert or overwrite one object.
    ///
    /// # Errors
    /// Returns an error when the backend rejects the write.
    fn update_object(&self, bucket: &str, key: &str, value: &Value) -> Result<(), StoreError>;

    /// Delete one object; deleting an absent key is not an error.
    ///
    /// # Errors
    /// Returns an error when the backend rejects the delete.
    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError>;

    /// Keys of every object in the bucket, in ascending order.
    ///
    /// # Errors
    /// Returns an error when the backend read fails.
    fn list_keys(&self, bucket: &str) -> Result<Vec<String>, StoreError>;
}

/// Typed helpers over [`Connection`].
pub trait ConnectionExt: Connection {
    /// # Errors
    /// Returns an error when the read fails or the stored object has another shape.
    fn get_typed<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Result<Option<T>, StoreError> {
        match self.get_object(bucket, key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| StoreError::encoding(bucket, key, err)),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when encoding or the write fails.
    fn put_typed<T: Serialize>(&self, bucket: &str, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value).map_err(|err| StoreError::encoding(bucket, key, err))?;
        self.update_object(bucket, key, &value)
    }

    /// # Errors
    /// Returns an error when the backend read fails.
    fn contains_key(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.get_object(bucket, key)?.is_some())
    }
}

impl<C: Connection + ?Sized> ConnectionExt for C {}

/// In-process store used by tests and embedders that keep their data in memory.
#[derive(Debug, Default)]
pub struct MemoryConnection {
    buckets: RefCell<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl MemoryConnection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently stored in `bucket`.
    #[must_use]
    pub fn len(&self, bucket: &str) -> usize {
        self.buckets.borrow().get(bucket).map_or(0, BTreeMap::len)
    }

    #[must_use]
    pub fn is_empty(&self, bucket: &str) -> bool {
        self.len(bucket) == 0
    }
}

impl Connection for MemoryConnection {
    fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.buckets.borrow_mut().entry(bucket.to_string()).or_default();
        Ok(())
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.buckets.borrow().get(bucket).and_then(|objects| objects.get(key)).cloned())
    }

    fn update_object(&self, bucket: &str, key: &str, value: &Value) -> Result<(), StoreError> {
        self.buckets
            .borrow_mut()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        if let Some(objects) = self.buckets.borrow_mut().get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    fn list_keys(&self, bucket: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .buckets
            .borrow()
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_connection_round_trips_typed_objects() -> Result<(), StoreError> {
        let conn = MemoryConnection::new();
        conn.ensure_bucket("settings")?;
        assert!(conn.is_empty("settings"));

        conn.put_typed("settings", "SETTINGS", &serde_json::json!({"LogoURL": ""}))?;
        conn.put_typed("settings", "DB_UPDATING", &true)?;

        assert_eq!(conn.get_typed::<bool>("settings", "DB_UPDATING")?, Some(true));
        assert_eq!(conn.list_keys("settings")?, vec!["DB_UPDATING", "SETTINGS"]);
        assert!(conn.contains_key("settings", "SETTINGS")?);

        conn.delete_object("settings", "SETTINGS")?;
        conn.delete_object("settings", "SETTINGS")?;
        conn.delete_object("missing", "SETTINGS")?;
        assert_eq!(conn.len("settings"), 1);
        Ok(())
    }

    #[test]
    fn mismatched_shape_is_an_encoding_error() -> Result<(), StoreError> {
        let conn = MemoryConnection::new();
        conn.put_typed("version", "DB_VERSION", &"twenty")?;
        assert!(matches!(
            conn.get_typed::<i64>("version", "DB_VERSION"),
            Err(StoreError::Encoding { .. })
        ));
        assert_eq!(conn.get_typed::<i64>("version", "EDITION")?, None);
        Ok(())
    }
}
