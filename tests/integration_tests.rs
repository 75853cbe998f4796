//! Integration tests for the storage bridge
//!
//! These tests drive the adapters through the shared contract:
//! - Key-value round trips and idempotent deletes on every keyed adapter
//! - Transaction rollback and error wrapping
//! - Aggregation agreement between the SQL and in-memory engines
//! - Live queries and key management end to end

use rust_storage_bridge::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Contract checks every keyed adapter must pass
async fn exercise_key_value<A: KeyValueAdapter>(store: &A) {
    store.write("alpha", &1i64).await.expect("write failed");
    assert_eq!(store.read("alpha", 0i64).await.expect("read failed"), 1);
    assert_eq!(store.read("never", 99i64).await.expect("read failed"), 99);

    store.delete("alpha").await.expect("first delete failed");
    store.delete("alpha").await.expect("second delete failed");
    assert!(!store.contains("alpha").await.expect("contains failed"));

    let entries: Vec<(String, i64)> = vec![
        ("c".to_string(), 3),
        ("a".to_string(), 1),
        ("b".to_string(), 2),
    ];
    store.write_many(&entries).await.expect("write_many failed");
    let all: BTreeMap<String, i64> = store.read_all().await.expect("read_all failed");
    assert_eq!(all.len(), 3);
    assert_eq!(all["a"], 1);
    assert_eq!(store.count().await.expect("count failed"), 3);

    assert_eq!(store.delete_all().await.expect("delete_all failed"), 3);
    assert_eq!(store.count().await.expect("count failed"), 0);
}

#[tokio::test]
async fn test_secure_store_contract() {
    let store = SecureStore::new(Arc::new(MemoryVault::new()), Default::default());
    store.open().await.expect("Failed to open");
    exercise_key_value(&store).await;
}

#[cfg(feature = "embedded")]
mod embedded_tests {
    use super::*;
    use rust_storage_bridge::core::KeyValueConfig;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Employee {
        dept: String,
        age: i64,
    }

    impl StoredObject for Employee {
        const TYPE_NAME: &'static str = "employee";
        const FIELDS: &'static [&'static str] = &["dept", "age"];
    }

    #[tokio::test]
    async fn test_key_value_store_contract() {
        let store = KeyValueStore::temporary("contract");
        store.open().await.expect("Failed to open");
        exercise_key_value(&store).await;
    }

    #[tokio::test]
    async fn test_encrypted_box_with_managed_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault_key = EncryptionKey::generate();
        let vault: Arc<dyn SecretVault> =
            Arc::new(FileVault::new(dir.path().join("vault.json"), &vault_key));

        let manager = KeyManager::new(Arc::clone(&vault));
        let key = manager.load_or_create_key("box-key").await.expect("key");
        let again = manager.load_or_create_key("box-key").await.expect("key");
        assert_eq!(key.as_bytes(), again.as_bytes());

        let config = KeyValueConfig::at(dir.path().join("kv"), "private");
        let store = KeyValueStore::encrypted(config, &key);
        store.open().await.expect("Failed to open");
        exercise_key_value(&store).await;
    }

    #[tokio::test]
    async fn test_object_aggregation_matches_documented_values() {
        let store = ObjectStore::temporary();
        store.open().await.expect("Failed to open");
        store
            .put_many(&[
                Employee { dept: "A".into(), age: 10 },
                Employee { dept: "A".into(), age: 20 },
                Employee { dept: "B".into(), age: 5 },
            ])
            .await
            .expect("put_many failed");

        let spec = AggregationSpec::new()
            .group_by(["dept"])
            .aggregate("avg_age", Aggregate::Avg("age".into()));
        let mut rows = store.aggregate("employee", &spec).await.expect("aggregate");
        rows.sort_by_key(|row| row["dept"].as_string());
        assert_eq!(rows[0]["avg_age"].as_double(), Some(15.0));
        assert_eq!(rows[1]["avg_age"].as_double(), Some(5.0));

        let nobody = record_predicate(|r| r.get("age").and_then(FieldValue::as_long) > Some(100));
        assert_eq!(
            store.aggregate_count("employee", Some(Arc::clone(&nobody))).await.unwrap(),
            0
        );
        assert_eq!(
            store.aggregate_avg("employee", "age", Some(nobody)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_object_watch_has_no_emission_after_cancel() {
        let store = ObjectStore::temporary();
        store.open().await.expect("Failed to open");

        let adults = object_filter(|e: &Employee| e.age >= 18);
        let mut stream = store.watch::<Employee>(Some(adults), vec![], Page::all());
        assert!(stream.next().await.unwrap().unwrap().is_empty());

        store
            .put(&Employee { dept: "A".into(), age: 30 })
            .await
            .expect("put failed");
        let snapshot = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out")
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.len(), 1);

        stream.cancel();
        store
            .put(&Employee { dept: "B".into(), age: 40 })
            .await
            .expect("put failed");
        assert!(stream.next().await.is_none());
    }
}

#[cfg(feature = "sqlite")]
mod sqlite_tests {
    use super::*;
    use std::time::Duration;

    async fn people_db() -> SqliteDatabase {
        let db = SqliteDatabase::in_memory();
        db.open().await.expect("Failed to open");
        db.execute("CREATE TABLE people (id INTEGER PRIMARY KEY, dept TEXT, age INTEGER)")
            .await
            .expect("Failed to create table");
        db
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let db = people_db().await;

        let mut handles = vec![];
        for i in 0..10i64 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                let params = vec![FieldValue::Long(i), FieldValue::Long(i * 10)];
                db.execute_with_params("INSERT INTO people (id, age) VALUES (?, ?)", &params)
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("Task panicked").expect("Insert failed");
        }

        assert_eq!(RecordAdapter::count(&db, "people", None).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_failed_scope_leaves_no_trace() {
        let db = people_db().await;
        db.execute("INSERT INTO people (id, dept, age) VALUES (1, 'A', 10)")
            .await
            .unwrap();

        let ops = vec![
            SqlOperation::insert("people", record([("id", 2i64), ("age", 20)])),
            SqlOperation::insert("people", record([("id", 3i64), ("age", 30)])),
            SqlOperation::insert("people", record([("id", 1i64), ("age", 99)])),
        ];
        let err = db.run_atomic(ops).await.expect_err("duplicate key must fail");
        assert_eq!(err.kind(), ErrorKind::NativeOperation);
        let cause = err.cause().expect("cause must be kept").to_string();
        assert!(cause.contains("UNIQUE"), "unexpected cause: {}", cause);

        assert_eq!(RecordAdapter::count(&db, "people", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scalar_aggregates_on_documented_rows() {
        let db = people_db().await;
        for age in [10, 20, 30] {
            db.insert("people", &record([("age", age)])).await.unwrap();
        }

        assert_eq!(db.aggregate_count("people", None).await.unwrap(), 3);
        assert_eq!(db.aggregate_sum("people", "age", None).await.unwrap(), Some(60.0));
        assert_eq!(db.aggregate_avg("people", "age", None).await.unwrap(), Some(20.0));
        assert_eq!(db.aggregate_min("people", "age", None).await.unwrap().as_long(), Some(10));
        assert_eq!(db.aggregate_max("people", "age", None).await.unwrap().as_long(), Some(30));

        let none = SqlPredicate::raw("age > 100");
        assert_eq!(db.aggregate_count("people", Some(none.clone())).await.unwrap(), 0);
        assert_eq!(db.aggregate_sum("people", "age", Some(none.clone())).await.unwrap(), None);
        assert!(db.aggregate_min("people", "age", Some(none)).await.unwrap().is_null());
    }

    #[tokio::test]
    async fn test_unknown_aggregation_column_is_rejected() {
        let db = people_db().await;
        let spec = AggregationSpec::new().aggregate("total", Aggregate::Sum("salary".into()));
        let err = db.aggregate("people", &spec).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Message {
        id: Option<i64>,
        body: String,
        read: bool,
    }

    impl TableRow for Message {
        const TABLE: &'static str = "messages";
        const PRIMARY_KEY: &'static str = "id";
        const COLUMNS: &'static [ColumnDef] = &[
            ColumnDef::new("id", ColumnType::Integer),
            ColumnDef::new("body", ColumnType::Text),
            ColumnDef::new("read", ColumnType::Boolean),
        ];
    }

    #[tokio::test]
    async fn test_reactive_store_notifies_after_commit_only() {
        let store = ReactiveSqlStore::in_memory();
        store.open().await.expect("Failed to open");
        store.register::<Message>().await.expect("register");

        let unread = SqlPredicate::eq("read", false).unwrap();
        let mut stream = store.watch::<Message>(Some(unread), vec![], Page::all());
        assert!(stream.next().await.unwrap().unwrap().is_empty());

        store
            .transaction(|s| {
                Box::pin(async move {
                    s.insert(&Message { id: None, body: "hi".into(), read: false }).await?;
                    s.insert(&Message { id: None, body: "yo".into(), read: true }).await?;
                    Ok(())
                })
            })
            .await
            .expect("transaction failed");

        let snapshot = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out")
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].body, "hi");
    }
}
