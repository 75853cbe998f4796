//! Transaction example
//!
//! This example contrasts the two batch contracts:
//! - Native all-or-nothing scopes on SQLite and the object store
//! - Best-effort batches on a secure store, which report how far they got
//!
//! Run with: cargo run --example transactions

use rust_storage_bridge::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Invoice {
    customer: String,
    amount: f64,
}

impl StoredObject for Invoice {
    const TYPE_NAME: &'static str = "invoice";
    const FIELDS: &'static [&'static str] = &["customer", "amount"];
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Rust Storage Bridge - Transaction Example ===\n");

    let db = SqliteDatabase::in_memory();
    db.open().await?;

    println!("1. Setting up accounts table...");
    db.execute(
        "CREATE TABLE accounts (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            balance REAL NOT NULL CHECK(balance >= 0)
        )",
    )
    .await?;
    for (id, name, balance) in [(1, "Alice", 1000.0), (2, "Bob", 500.0)] {
        db.execute_with_params(
            "INSERT INTO accounts (id, name, balance) VALUES (?, ?, ?)",
            &[id.into(), name.into(), balance.into()],
        )
        .await?;
    }
    print_balances(&db).await?;

    println!("\n2. Successful transfer (Alice -> Bob: $100)");
    match db
        .transaction(|db| Box::pin(async move { transfer(db, 1, 2, 100.0).await }))
        .await
    {
        Ok(()) => println!("   ✓ Transaction committed"),
        Err(e) => println!("   ✗ Transaction rolled back: {}", e),
    }
    print_balances(&db).await?;

    println!("\n3. Failed transfer (Bob -> Alice: $10000)");
    match db
        .transaction(|db| Box::pin(async move { transfer(db, 2, 1, 10_000.0).await }))
        .await
    {
        Ok(()) => println!("   ✓ Transaction committed"),
        Err(e) => println!("   ✗ Transaction rolled back: {}", e),
    }
    print_balances(&db).await?;

    println!("\n4. Atomic batch with a constraint violation");
    let batch = vec![
        SqlOperation::execute("UPDATE accounts SET balance = balance + 50 WHERE id = 1", vec![]),
        SqlOperation::execute("UPDATE accounts SET balance = -1 WHERE id = 2", vec![]),
    ];
    if let Err(e) = db.run_atomic(batch).await {
        println!("   ✗ Batch rolled back ({:?}): {}", e.kind(), e);
        if let Some(cause) = e.cause() {
            println!("     native cause: {}", cause);
        }
    }
    print_balances(&db).await?;
    db.close().await?;

    println!("\n5. Atomic batch across object types");
    let store = ObjectStore::temporary();
    store.open().await?;
    let outcomes = store
        .run_atomic(vec![
            ObjectOp::put(&Invoice { customer: "alice".into(), amount: 120.0 })?,
            ObjectOp::put(&Invoice { customer: "bob".into(), amount: 80.0 })?,
        ])
        .await?;
    println!("   ✓ Stored {} invoices", outcomes.len());
    let spec = AggregationSpec::new().aggregate("total", Aggregate::Sum("amount".into()));
    let rows = store.aggregate("invoice", &spec).await?;
    let total = rows
        .first()
        .and_then(|row| row.get("total"))
        .and_then(FieldValue::as_double)
        .unwrap_or_default();
    println!("   Invoice total: {:.2}", total);
    store.close().await?;

    println!("\n6. Best-effort batch on a secure store");
    let secure = SecureStore::new(Arc::new(MemoryVault::new()), Default::default());
    secure.open().await?;
    let operations = vec![
        KvOperation::write("first", &1)?,
        KvOperation::write("", &2)?,
        KvOperation::write("third", &3)?,
    ];
    match secure.run_best_effort(operations).await {
        Ok(outcomes) => println!("   ✓ Applied {} operations", outcomes.len()),
        Err(BridgeError::BatchAborted {
            index, completed, source,
        }) => {
            println!(
                "   ✗ Stopped at operation {} after {} applied: {}",
                index,
                completed.len(),
                source
            );
        }
        Err(e) => return Err(e),
    }
    println!("   Keys left behind: {:?}", secure.keys().await?);

    println!("\n=== Example completed successfully! ===");
    Ok(())
}

/// Move `amount` between accounts, failing on insufficient funds
async fn transfer(db: &SqliteDatabase, from_id: i64, to_id: i64, amount: f64) -> Result<()> {
    let affected = db
        .execute_with_params(
            "UPDATE accounts SET balance = balance - ? WHERE id = ? AND balance >= ?",
            &[amount.into(), from_id.into(), amount.into()],
        )
        .await?;
    if affected == 0 {
        return Err(BridgeError::validation("insufficient funds or invalid account"));
    }

    db.execute_with_params(
        "UPDATE accounts SET balance = balance + ? WHERE id = ?",
        &[amount.into(), to_id.into()],
    )
    .await?;
    Ok(())
}

/// Print all account balances
async fn print_balances(db: &SqliteDatabase) -> Result<()> {
    for row in db.query("SELECT name, balance FROM accounts ORDER BY id").await? {
        println!(
            "   {:<8} ${:>9.2}",
            row["name"].as_string(),
            row["balance"].as_double().unwrap_or_default()
        );
    }
    Ok(())
}
