//! Table contract tests run against every backend.
//!
//! Each scenario is parameterised over the in-memory and `SQLite` tables, so
//! both backends are held to the same observable behaviour.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use futures_util::TryStreamExt;
use futures_util::future::join_all;
use queuelite::{
    ConnectionManager, Connector, Error, Filter, GeneratorRegistry, MemoryTable, SqliteTable,
    Table, TableColumn, TableRecord, TableSchema, Value, Values, field,
};
use std::sync::Arc;
use test_case::test_case;

#[derive(Debug, Clone, Copy)]
enum Backend {
    Memory,
    Sqlite,
}

fn persons() -> Arc<TableSchema> {
    TableSchema::builder("persons")
        .column(TableColumn::new("id", "INTEGER").primary())
        .column(TableColumn::new("name", "TEXT").not_null())
        .column(TableColumn::new("age", "INTEGER").default_value(0))
        .build()
        .unwrap()
}

fn tokens() -> Arc<TableSchema> {
    TableSchema::builder("tokens")
        .column(TableColumn::new("id", "TEXT").primary().not_null().generated("uuid4"))
        .column(TableColumn::new("label", "TEXT"))
        .build()
        .unwrap()
}

fn pairs() -> Arc<TableSchema> {
    TableSchema::builder("pairs")
        .column(TableColumn::new("a", "INTEGER").primary())
        .column(TableColumn::new("b", "INTEGER").primary())
        .column(TableColumn::new("note", "TEXT"))
        .build()
        .unwrap()
}

fn lines() -> Arc<TableSchema> {
    TableSchema::builder("lines")
        .column(TableColumn::new("line", "TEXT"))
        .column(TableColumn::new("count", "INTEGER"))
        .build()
        .unwrap()
}

async fn open(backend: Backend, schema: Arc<TableSchema>) -> Box<dyn Table> {
    let generators = Arc::new(GeneratorRegistry::with_builtins());
    match backend {
        Backend::Memory => {
            let table = MemoryTable::with_generators(schema, generators);
            table.start().await.unwrap();
            Box::new(table)
        },
        Backend::Sqlite => {
            let manager = ConnectionManager::new(Connector::memory()).unwrap();
            let table = SqliteTable::with_registries(
                schema,
                manager,
                Arc::new(queuelite::CodecRegistry::with_builtins()),
                generators,
            );
            table.start().await.unwrap();
            table.create(true).await.unwrap();
            Box::new(table)
        },
    }
}

fn person(id: i64, name: &str) -> Values {
    Values::new().set("id", id).set("name", name)
}

fn by_id(id: i64) -> Filter {
    field("id").eq(id).into()
}

fn name_of(record: &TableRecord) -> &str {
    record.value("name").and_then(Value::as_str).unwrap()
}

// ============================================================================
// Insert
// ============================================================================

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_insert_fills_defaults(backend: Backend) {
    let table = open(backend, persons()).await;

    let alice = table.insert(person(1, "Alice"), false).await.unwrap();

    assert_eq!(alice.value("id"), Some(&Value::Integer(1)));
    assert_eq!(alice.value("name"), Some(&Value::from("Alice")));
    assert_eq!(alice.value("age"), Some(&Value::Integer(0)));
    assert_eq!(table.length().await.unwrap(), 1);
    assert!(table.contains(&alice).await.unwrap());
    table.stop().await.unwrap();
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_insert_replaces_same_identity(backend: Backend) {
    let table = open(backend, persons()).await;

    table.insert(person(1, "Alice"), false).await.unwrap();
    table
        .insert(person(1, "Alicia").set("age", 31), false)
        .await
        .unwrap();

    assert_eq!(table.length().await.unwrap(), 1);
    let stored = table.select_one(by_id(1)).await.unwrap().unwrap();
    assert_eq!(name_of(&stored), "Alicia");
    assert_eq!(stored.value("age"), Some(&Value::Integer(31)));
    table.stop().await.unwrap();
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_insert_ignore_existing(backend: Backend) {
    let table = open(backend, persons()).await;

    table.insert(person(1, "Alice"), false).await.unwrap();
    let ignored = table.insert(person(1, "Mallory"), true).await.unwrap();

    assert_eq!(name_of(&ignored), "Mallory");
    assert_eq!(table.length().await.unwrap(), 1);
    let stored = table.select_one(Filter::all()).await.unwrap().unwrap();
    assert_eq!(name_of(&stored), "Alice");
    table.stop().await.unwrap();
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_insert_missing_required_column(backend: Backend) {
    let table = open(backend, persons()).await;

    let err = table
        .insert(Values::new().set("id", 1), false)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ConstraintViolation(_)));
    assert_eq!(table.length().await.unwrap(), 0);
    table.stop().await.unwrap();
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_insert_unknown_column(backend: Backend) {
    let table = open(backend, persons()).await;
    let err = table
        .insert(person(1, "Alice").set("email", "a@example.com"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    table.stop().await.unwrap();
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_generated_defaults_are_fresh(backend: Backend) {
    let table = open(backend, tokens()).await;

    let a = table
        .insert(Values::new().set("label", "a"), false)
        .await
        .unwrap();
    let b = table
        .insert(Values::new().set("label", "b"), false)
        .await
        .unwrap();

    assert_ne!(a.value("id"), b.value("id"));
    assert_eq!(a.value("id").and_then(Value::as_str).unwrap().len(), 36);
    assert_eq!(table.length().await.unwrap(), 2);
    table.stop().await.unwrap();
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_insert_many_is_lazy(backend: Backend) {
    let table = open(backend, persons()).await;

    let pending = table.insert_many(vec![person(1, "a"), person(2, "b"), person(3, "c")], false);
    assert_eq!(table.length().await.unwrap(), 0);
    drop(pending);
    assert_eq!(table.length().await.unwrap(), 0);

    let mut partial = table.insert_many(vec![person(1, "a"), person(2, "b"), person(3, "c")], false);
    let first = partial.try_next().await.unwrap().unwrap();
    assert_eq!(name_of(&first), "a");
    drop(partial);
    assert_eq!(table.length().await.unwrap(), 1);

    let all: Vec<_> = table
        .insert_many(vec![person(2, "b"), person(3, "c")], false)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(table.length().await.unwrap(), 3);
    table.stop().await.unwrap();
}

// ============================================================================
// Select and count
// ============================================================================

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_select_filters_and_counts(backend: Backend) {
    let table = open(backend, persons()).await;
    for (id, name, age) in [(1, "Ann", 17), (2, "Ben", 30), (3, "Cid", 45)] {
        table
            .insert(person(id, name).set("age", age), false)
            .await
            .unwrap();
    }

    let adults: Vec<_> = table
        .select(field("age").ge(18).into())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    let names: Vec<_> = adults.iter().map(name_of).collect();
    assert_eq!(names, vec!["Ben", "Cid"]);

    assert_eq!(table.count(Filter::all()).await.unwrap(), 3);
    assert_eq!(table.count(field("age").lt(40).into()).await.unwrap(), 2);
    let async_filter = Filter::from_async(|r: TableRecord| async move {
        r.value("name").and_then(Value::as_str) == Some("Cid")
    });
    assert_eq!(table.count(async_filter).await.unwrap(), 1);
    assert!(table.select_one(by_id(9)).await.unwrap().is_none());
    table.stop().await.unwrap();
}

#[tokio::test]
async fn test_memory_select_is_a_snapshot() {
    let table = open(Backend::Memory, persons()).await;
    table.insert(person(1, "a"), false).await.unwrap();
    table.insert(person(2, "b"), false).await.unwrap();

    let snapshot = table.select(Filter::all()).await.unwrap();
    table.delete(Filter::all()).await.unwrap();
    table.insert(person(3, "c"), false).await.unwrap();

    let seen: Vec<_> = snapshot.try_collect().await.unwrap();
    assert_eq!(seen.iter().map(name_of).collect::<Vec<_>>(), vec!["a", "b"]);
    table.stop().await.unwrap();
}

// ============================================================================
// Update
// ============================================================================

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_update_then_select(backend: Backend) {
    let table = open(backend, persons()).await;
    table.insert(person(1, "Alice"), false).await.unwrap();
    table.insert(person(2, "Carol"), false).await.unwrap();

    let changed = table
        .update(by_id(1), Values::new().set("name", "Bob"))
        .await
        .unwrap();

    assert_eq!(changed, 1);
    let bob = table.select_one(by_id(1)).await.unwrap().unwrap();
    assert_eq!(name_of(&bob), "Bob");
    let carol = table.select_one(by_id(2)).await.unwrap().unwrap();
    assert_eq!(name_of(&carol), "Carol");
    table.stop().await.unwrap();
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_updated_is_lazy(backend: Backend) {
    let table = open(backend, persons()).await;
    table.insert(person(1, "Alice"), false).await.unwrap();

    let pending = table.updated(Filter::all(), Values::new().set("age", 99));
    drop(pending);
    let alice = table.select_one(by_id(1)).await.unwrap().unwrap();
    assert_eq!(alice.value("age"), Some(&Value::Integer(0)));

    let updated = table
        .update_one(Filter::all(), Values::new().set("age", 99))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.value("age"), Some(&Value::Integer(99)));
    table.stop().await.unwrap();
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_update_identity_collision(backend: Backend) {
    let table = open(backend, persons()).await;
    table.insert(person(1, "Alice"), false).await.unwrap();
    table.insert(person(2, "Bob"), false).await.unwrap();

    let err = table
        .update(by_id(1), Values::new().set("id", 2))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::DuplicateIdentity(_)));
    assert_eq!(table.length().await.unwrap(), 2);
    let alice = table.select_one(by_id(1)).await.unwrap().unwrap();
    assert_eq!(name_of(&alice), "Alice");
    table.stop().await.unwrap();
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_update_rejects_null_in_required_column(backend: Backend) {
    let table = open(backend, persons()).await;
    table.insert(person(1, "Alice"), false).await.unwrap();

    let err = table
        .update_one(by_id(1), Values::new().set("name", Value::Null))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ConstraintViolation(_)));
    let alice = table.select_one(by_id(1)).await.unwrap().unwrap();
    assert_eq!(name_of(&alice), "Alice");
    table.stop().await.unwrap();
}

// ============================================================================
// Delete
// ============================================================================

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_delete_then_select_is_empty(backend: Backend) {
    let table = open(backend, persons()).await;
    for (id, age) in [(1, 10), (2, 20), (3, 30)] {
        table
            .insert(person(id, "x").set("age", age), false)
            .await
            .unwrap();
    }

    let removed = table.delete(field("age").ge(20).into()).await.unwrap();

    assert_eq!(removed, 2);
    let left: Vec<_> = table
        .select(field("age").ge(20).into())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert!(left.is_empty());
    assert_eq!(table.length().await.unwrap(), 1);
    table.stop().await.unwrap();
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_delete_one_and_delete_all(backend: Backend) {
    let table = open(backend, persons()).await;
    for id in 1..=4 {
        table.insert(person(id, "x"), false).await.unwrap();
    }

    let first = table.delete_one(Filter::all()).await.unwrap().unwrap();
    assert!(!table.contains(&first).await.unwrap());
    assert_eq!(table.length().await.unwrap(), 3);

    let pending = table.deleted(Filter::all());
    drop(pending);
    assert_eq!(table.length().await.unwrap(), 3);

    let rest: Vec<_> = table.deleted(Filter::all()).try_collect().await.unwrap();
    assert_eq!(rest.len(), 3);
    assert_eq!(table.length().await.unwrap(), 0);
    assert!(table.delete_one(Filter::all()).await.unwrap().is_none());
    table.stop().await.unwrap();
}

// ============================================================================
// Identity
// ============================================================================

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_composite_key_addresses_one_record(backend: Backend) {
    let table = open(backend, pairs()).await;
    for (b, note) in [(1, "x"), (2, "y")] {
        table
            .insert(Values::new().set("a", 1).set("b", b).set("note", note), false)
            .await
            .unwrap();
    }

    let updated = table
        .update_one(field("b").eq(2).into(), Values::new().set("note", "z"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.value("note"), Some(&Value::from("z")));
    let untouched = table.select_one(field("b").eq(1).into()).await.unwrap().unwrap();
    assert_eq!(untouched.value("note"), Some(&Value::from("x")));

    let removed = table.delete_one(field("b").eq(2).into()).await.unwrap().unwrap();
    assert_eq!(removed.value("b"), Some(&Value::Integer(2)));
    assert_eq!(table.length().await.unwrap(), 1);
    assert!(table.contains(&untouched).await.unwrap());
    table.stop().await.unwrap();
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_table_without_identity_keys_on_every_column(backend: Backend) {
    let table = open(backend, lines()).await;

    let first = table.insert(Values::new().set("line", "x"), false).await.unwrap();
    table.insert(Values::new().set("line", "x"), true).await.unwrap();
    assert_eq!(table.length().await.unwrap(), 1);
    table.insert(Values::new().set("line", "x"), false).await.unwrap();
    assert_eq!(table.length().await.unwrap(), 1);
    assert!(table.contains(&first).await.unwrap());

    table
        .insert(Values::new().set("line", "x").set("count", 2), true)
        .await
        .unwrap();
    assert_eq!(table.length().await.unwrap(), 2);

    let removed = table.delete_one(field("count").is_null().into()).await.unwrap();
    assert_eq!(removed, Some(first));
    assert_eq!(table.length().await.unwrap(), 1);
    table.stop().await.unwrap();
}

// ============================================================================
// Lifecycle and concurrency
// ============================================================================

#[tokio::test]
async fn test_failed_write_does_not_undo_others_on_shared_connection() {
    let manager = ConnectionManager::new(Connector::memory()).unwrap();
    let people = SqliteTable::new(persons(), Arc::clone(&manager));
    let missing = SqliteTable::new(
        TableSchema::builder("missing")
            .column(TableColumn::new("id", "INTEGER").primary())
            .build()
            .unwrap(),
        Arc::clone(&manager),
    );
    people.start().await.unwrap();
    missing.start().await.unwrap();
    people.create(true).await.unwrap();

    let (stored, failed) = tokio::join!(
        people.insert(person(1, "a"), false),
        missing.insert(Values::new().set("id", 2), false),
    );
    assert!(stored.is_ok());
    assert!(matches!(failed, Err(Error::ResourceError { .. })));
    assert_eq!(people.length().await.unwrap(), 1);

    // Uncommitted work issued directly on the connection survives a failed table write.
    manager
        .execute(
            "INSERT INTO persons (id, name, age) VALUES (?, ?, ?)",
            queuelite::Params::positional([Value::Integer(2), Value::from("b"), Value::Integer(0)]),
        )
        .await
        .unwrap();
    let failed = people.update(by_id(1), Values::new().set("id", 2)).await;
    assert!(matches!(failed, Err(Error::DuplicateIdentity(_))));
    manager.commit().await.unwrap();
    assert_eq!(people.length().await.unwrap(), 2);
    assert_eq!(
        name_of(&people.select_one(by_id(1)).await.unwrap().unwrap()),
        "a"
    );

    missing.stop().await.unwrap();
    people.stop().await.unwrap();
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test]
async fn test_stopped_table_is_not_ready(backend: Backend) {
    let table = open(backend, persons()).await;
    table.stop().await.unwrap();

    assert!(!table.is_operational());
    assert!(matches!(table.length().await, Err(Error::NotReady(_))));
    assert!(matches!(
        table.insert(person(1, "a"), false).await,
        Err(Error::NotReady(_))
    ));
    assert!(matches!(
        table.select(Filter::all()).await.map(|_| ()),
        Err(Error::NotReady(_))
    ));
    assert!(matches!(
        table.delete(Filter::all()).await,
        Err(Error::NotReady(_))
    ));
}

#[tokio::test]
async fn test_scoped_table() {
    let table = MemoryTable::new(persons());
    let length = queuelite::table::scoped(&table, |t| async move {
        t.insert(person(1, "a"), false).await?;
        t.length().await
    })
    .await
    .unwrap();
    assert_eq!(length, 1);
    assert!(!table.is_operational());
}

#[test_case(Backend::Memory; "memory")]
#[test_case(Backend::Sqlite; "sqlite")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts(backend: Backend) {
    let table = open(backend, persons()).await;

    let results = join_all((0..64).map(|id| table.insert(person(id, "n"), false))).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(table.length().await.unwrap(), 64);
    table.stop().await.unwrap();
}
