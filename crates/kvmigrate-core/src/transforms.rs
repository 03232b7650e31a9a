//! Idempotent step builders over JSON records.
//!
//! Every builder inspects the stored object before touching it and only writes when the
//! record actually changes, so a step can be replayed any number of times. Records that
//! are not JSON objects are left alone.

use serde_json::{Map, Value};
use tracing::debug;

use crate::connection::Connection;
use crate::error::BoxError;
use crate::registry::MigrationStep;

/// Set `field` to `default` on every object in `bucket` that lacks it.
#[must_use]
pub fn backfill_field(name: &str, bucket: &str, field: &str, default: Value) -> MigrationStep {
    let bucket = bucket.to_string();
    let field = field.to_string();
    MigrationStep::new(name, move |conn| {
        rewrite_objects(conn, &bucket, |object| {
            if object.contains_key(&field) {
                return false;
            }
            object.insert(field.clone(), default.clone());
            true
        })
    })
}

/// Move `from` to `to` on every object in `bucket`. When both are present `to` wins and
/// `from` is dropped.
#[must_use]
pub fn rename_field(name: &str, bucket: &str, from: &str, to: &str) -> MigrationStep {
    let bucket = bucket.to_string();
    let from = from.to_string();
    let to = to.to_string();
    MigrationStep::new(name, move |conn| {
        rewrite_objects(conn, &bucket, |object| {
            let Some(value) = object.remove(&from) else {
                return false;
            };
            object.entry(to.clone()).or_insert(value);
            true
        })
    })
}

#[must_use]
pub fn drop_field(name: &str, bucket: &str, field: &str) -> MigrationStep {
    let bucket = bucket.to_string();
    let field = field.to_string();
    MigrationStep::new(name, move |conn| {
        rewrite_objects(conn, &bucket, |object| object.remove(&field).is_some())
    })
}

/// Remove a single key from `bucket`; an absent key is fine.
#[must_use]
pub fn delete_key(name: &str, bucket: &str, key: &str) -> MigrationStep {
    let bucket = bucket.to_string();
    let key = key.to_string();
    MigrationStep::new(name, move |conn| {
        conn.ensure_bucket(&bucket)?;
        conn.delete_object(&bucket, &key)?;
        Ok(())
    })
}

fn rewrite_objects<F>(conn: &dyn Connection, bucket: &str, mut rewrite: F) -> Result<(), BoxError>
where
    F: FnMut(&mut Map<String, Value>) -> bool,
{
    conn.ensure_bucket(bucket)?;
    let mut changed = 0_usize;
    for key in conn.list_keys(bucket)? {
        let Some(Value::Object(mut object)) = conn.get_object(bucket, &key)? else {
            continue;
        };
        if rewrite(&mut object) {
            conn.update_object(bucket, &key, &Value::Object(object))?;
            changed += 1;
        }
    }
    debug!(bucket, changed, "rewrote records");
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::connection::MemoryConnection;

    fn seeded() -> Result<MemoryConnection, BoxError> {
        let conn = MemoryConnection::new();
        conn.update_object("endpoints", "1", &json!({"Name": "local", "TLS": false}))?;
        conn.update_object("endpoints", "2", &json!({"Name": "edge", "EdgeKey": "k"}))?;
        conn.update_object("endpoints", "3", &json!("not an object"))?;
        Ok(conn)
    }

    #[test]
    fn backfill_only_touches_records_missing_the_field() -> Result<(), BoxError> {
        let conn = seeded()?;
        conn.update_object("endpoints", "2", &json!({"Name": "edge", "TLS": true}))?;
        let step = backfill_field("endpoints_tls", "endpoints", "TLS", json!(false));

        step.run(&conn)?;
        step.run(&conn)?;

        assert_eq!(conn.get_object("endpoints", "1")?, Some(json!({"Name": "local", "TLS": false})));
        assert_eq!(conn.get_object("endpoints", "2")?, Some(json!({"Name": "edge", "TLS": true})));
        assert_eq!(conn.get_object("endpoints", "3")?, Some(json!("not an object")));
        Ok(())
    }

    #[test]
    fn rename_is_stable_when_replayed() -> Result<(), BoxError> {
        let conn = seeded()?;
        conn.update_object("endpoints", "4", &json!({"EdgeKey": "old", "EdgeID": "new"}))?;
        let step = rename_field("endpoints_edge_id", "endpoints", "EdgeKey", "EdgeID");

        step.run(&conn)?;
        let once = conn.get_object("endpoints", "2")?;
        step.run(&conn)?;

        assert_eq!(once, Some(json!({"Name": "edge", "EdgeID": "k"})));
        assert_eq!(conn.get_object("endpoints", "2")?, once);
        assert_eq!(conn.get_object("endpoints", "4")?, Some(json!({"EdgeID": "new"})));
        Ok(())
    }

    #[test]
    fn drop_and_delete_tolerate_absent_data() -> Result<(), BoxError> {
        let conn = seeded()?;
        drop_field("endpoints_tls_drop", "endpoints", "TLS").run(&conn)?;
        drop_field("endpoints_tls_drop", "endpoints", "TLS").run(&conn)?;
        delete_key("remove_edge", "endpoints", "2").run(&conn)?;
        delete_key("remove_edge", "endpoints", "2").run(&conn)?;
        delete_key("remove_missing", "schedules", "1").run(&conn)?;

        assert_eq!(conn.get_object("endpoints", "1")?, Some(json!({"Name": "local"})));
        assert_eq!(conn.list_keys("endpoints")?, vec!["1", "3"]);
        Ok(())
    }
}
