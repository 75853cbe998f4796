//! Basic storage bridge usage
//!
//! This example walks through the same contract on three backends:
//! - Raw SQL and record operations on SQLite
//! - Grouped aggregation
//! - A key-value box and a secure store sharing one calling convention
//!
//! Run with: cargo run --example basic_usage

use rust_storage_bridge::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Rust Storage Bridge - Basic Usage Example ===\n");

    // Relational adapter over an in-memory database
    println!("1. Opening SQLite...");
    let db = SqliteDatabase::in_memory();
    db.open().await?;
    db.execute(
        "CREATE TABLE users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL,
            dept TEXT NOT NULL,
            age INTEGER
        )",
    )
    .await?;
    println!("   ✓ Table created\n");

    println!("2. Inserting records...");
    let users = vec![
        ("alice", "eng", 30),
        ("bob", "eng", 25),
        ("charlie", "ops", 35),
        ("diana", "ops", 28),
    ];
    for (username, dept, age) in users {
        let id = db
            .insert(
                "users",
                &record([
                    ("username", FieldValue::from(username)),
                    ("dept", dept.into()),
                    ("age", age.into()),
                ]),
            )
            .await?;
        println!("   ✓ Inserted {} as id {}", username, id);
    }
    println!();

    println!("3. Querying engineers by age...");
    let engineers = SqlPredicate::eq("dept", "eng")?;
    let rows = RecordAdapter::query(
        &db,
        "users",
        Some(&engineers),
        &[OrderBy::asc("age")],
        Page::all(),
    )
    .await?;
    for row in &rows {
        println!(
            "   {} ({})",
            row.get("username").map(FieldValue::as_string).unwrap_or_default(),
            row.get("age").and_then(FieldValue::as_long).unwrap_or_default()
        );
    }
    println!();

    println!("4. Average age per department...");
    let spec = AggregationSpec::new()
        .group_by(["dept"])
        .aggregate("avg_age", Aggregate::Avg("age".into()))
        .aggregate("people", Aggregate::Count)
        .order_by(OrderBy::asc("dept"));
    for row in db.aggregate("users", &spec).await? {
        println!(
            "   {}: {:.1} over {} people",
            row["dept"].as_string(),
            row["avg_age"].as_double().unwrap_or_default(),
            row["people"].as_long().unwrap_or_default()
        );
    }
    db.close().await?;
    println!();

    // Key-value adapters share one contract
    println!("5. Key-value boxes...");
    let settings = KeyValueStore::temporary("settings");
    settings.open().await?;
    describe(&settings, "settings box").await?;
    settings.close().await?;

    let secure = SecureStore::new(Arc::new(MemoryVault::new()), Default::default());
    secure.open().await?;
    describe(&secure, "secure store").await?;

    println!("\n=== Example completed successfully! ===");
    Ok(())
}

/// Exercise one keyed adapter through the shared contract
async fn describe<A: KeyValueAdapter>(store: &A, label: &str) -> Result<()> {
    store.write("theme", &"dark").await?;
    store
        .write_many(&[("volume".to_string(), 7i64), ("retries".to_string(), 3)])
        .await?;

    let theme: String = store.read("theme", "light".to_string()).await?;
    let missing: i64 = store.read("missing", -1).await?;
    println!("   {}: theme = {}, missing = {}", label, theme, missing);

    let numbers: BTreeMap<String, serde_json::Value> = store.read_all().await?;
    println!("   {}: {} entries", label, numbers.len());

    store.delete("theme").await?;
    store.delete("theme").await?;
    println!("   ✓ {} has {} entries after delete", label, store.count().await?);
    Ok(())
}
