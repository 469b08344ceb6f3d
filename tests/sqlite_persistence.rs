//! File-backed databases: shared managers, persistence across restarts, and
//! schema reflection.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use futures_util::TryStreamExt;
use queuelite::{
    CodecRegistry, ColumnDefault, ConnectionRegistry, ConnectionSettings, Connector, Error,
    Filter, GeneratorRegistry, Params, SqliteTable, Table, TableColumn, TableSchema, Value, Values,
    field,
};
use std::sync::Arc;
use tempfile::TempDir;

fn notes() -> Arc<TableSchema> {
    TableSchema::builder("notes")
        .column(TableColumn::new("id", "TEXT").primary().not_null().generated("uuid7"))
        .column(TableColumn::new("title", "TEXT").unique().not_null())
        .column(TableColumn::new("pinned", "BOOL").not_null().default_value(false))
        .column(TableColumn::new("tags", "SET"))
        .build()
        .unwrap()
}

fn registries() -> (Arc<CodecRegistry>, Arc<GeneratorRegistry>) {
    (
        Arc::new(CodecRegistry::with_builtins()),
        Arc::new(GeneratorRegistry::with_builtins()),
    )
}

// ============================================================================
// Shared managers
// ============================================================================

#[tokio::test]
async fn test_tables_on_one_file_share_a_manager() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    std::fs::File::create(&path).unwrap();
    let registry = ConnectionRegistry::new();

    let first = registry.get_or_create(Connector::file(&path)).unwrap();
    let second = registry
        .get_or_create(Connector::file(dir.path().join(".").join("shared.db")))
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len(), 1);

    let (codecs, generators) = registries();
    let notes_table = SqliteTable::with_registries(notes(), first, Arc::clone(&codecs), Arc::clone(&generators));
    let other = SqliteTable::with_registries(
        TableSchema::builder("other")
            .column(TableColumn::new("n", "INTEGER").primary())
            .build()
            .unwrap(),
        second,
        codecs,
        generators,
    );

    notes_table.start().await.unwrap();
    other.start().await.unwrap();
    assert_eq!(notes_table.manager().refs(), 2);
    notes_table.create(true).await.unwrap();
    other.create(true).await.unwrap();

    notes_table.stop().await.unwrap();
    assert!(other.is_operational());
    assert!(!notes_table.is_operational());
    other.stop().await.unwrap();
    assert!(!other.manager().is_running());

    other.manager().remove().await.unwrap();
    other.manager().remove().await.unwrap();
    assert!(registry.is_empty());
}

// ============================================================================
// Persistence and codecs
// ============================================================================

#[tokio::test]
async fn test_records_persist_across_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("notes.db");
    let registry = ConnectionRegistry::new();
    let (codecs, generators) = registries();
    let connector = Connector::from_settings(path.as_path(), &ConnectionSettings::default());
    let manager = registry.get_or_create(connector).unwrap();

    let table = SqliteTable::with_registries(notes(), Arc::clone(&manager), Arc::clone(&codecs), Arc::clone(&generators));
    table.start().await.unwrap();
    table.create(true).await.unwrap();
    let inserted = table
        .insert(
            Values::new()
                .set("title", "groceries")
                .set("pinned", true)
                .set("tags", "[\"home\", \"food\", \"home\"]"),
            false,
        )
        .await
        .unwrap();
    table
        .insert(Values::new().set("title", "taxes"), false)
        .await
        .unwrap();
    table.stop().await.unwrap();

    table.start().await.unwrap();
    assert_eq!(table.length().await.unwrap(), 2);
    let groceries = table
        .select_one(field("title").eq("groceries").into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(groceries.value("id"), inserted.value("id"));
    assert_eq!(groceries.value("pinned"), Some(&Value::Integer(1)));
    assert_eq!(groceries.value("tags"), Some(&Value::from("[\"food\",\"home\"]")));

    let taxes = table
        .select_one(field("title").eq("taxes").into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(taxes.value("pinned"), Some(&Value::Integer(0)));
    assert!(taxes.value("tags").unwrap().is_null());
    table.stop().await.unwrap();
    manager.remove().await.unwrap();
}

#[tokio::test]
async fn test_unique_column_locates_rows() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionRegistry::new()
        .get_or_create(Connector::file(dir.path().join("unique.db")))
        .unwrap();
    let (codecs, generators) = registries();
    let table = SqliteTable::with_registries(notes(), manager, codecs, generators);
    table.start().await.unwrap();
    table.create(true).await.unwrap();

    let a = table
        .insert(Values::new().set("title", "a"), false)
        .await
        .unwrap();
    let err = table
        .insert(Values::new().set("id", a.value("id").unwrap().clone()).set("title", "b"), false)
        .await;
    assert!(err.is_ok(), "same primary key replaces: {err:?}");
    assert_eq!(table.length().await.unwrap(), 1);

    table
        .insert(Values::new().set("title", "c"), false)
        .await
        .unwrap();
    let moved = table
        .update(field("title").eq("c").into(), Values::new().set("title", "b"))
        .await;
    assert!(matches!(moved, Err(Error::DuplicateIdentity(_))));

    let pinned = table
        .update(Filter::all(), Values::new().set("pinned", true))
        .await
        .unwrap();
    assert_eq!(pinned, 2);
    let all: Vec<_> = table
        .select(field("pinned").eq(1).into())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    table.stop().await.unwrap();
}

// ============================================================================
// Reflection
// ============================================================================

#[tokio::test]
async fn test_from_database_matches_created_schema() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionRegistry::new()
        .get_or_create(Connector::file(dir.path().join("reflect.db")))
        .unwrap();
    let (codecs, generators) = registries();
    let created = SqliteTable::with_registries(notes(), Arc::clone(&manager), Arc::clone(&codecs), Arc::clone(&generators));
    created.start().await.unwrap();
    created.create(false).await.unwrap();
    assert!(matches!(created.create(false).await, Err(Error::ResourceError { .. })));

    let reflected = SqliteTable::from_database("notes", Arc::clone(&manager), codecs, generators)
        .await
        .unwrap();
    let schema = reflected.schema();
    assert_eq!(schema.width(), 4);
    assert_eq!(schema.identity(), &[0, 1]);
    assert_eq!(
        schema.column("id").unwrap().default,
        ColumnDefault::Generated("uuid7".into())
    );
    assert_eq!(
        schema.column("pinned").unwrap().default,
        ColumnDefault::Value(Value::Integer(0))
    );
    assert_eq!(schema.column("tags").unwrap().typename, "SET");

    reflected.start().await.unwrap();
    let note = reflected
        .insert(Values::new().set("title", "reflected"), false)
        .await
        .unwrap();
    assert!(created.contains(&note).await.unwrap());

    created.drop(false).await.unwrap();
    assert!(!created.exists().await.unwrap());
    created.drop(true).await.unwrap();
    reflected.stop().await.unwrap();
    created.stop().await.unwrap();
}

#[tokio::test]
async fn test_raw_statements_share_the_worker() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionRegistry::new()
        .get_or_create(Connector::file(dir.path().join("raw.db")))
        .unwrap();
    let (codecs, generators) = registries();
    let table = SqliteTable::with_registries(notes(), Arc::clone(&manager), codecs, generators);
    table.start().await.unwrap();
    table.create(true).await.unwrap();

    manager
        .execute_batch(
            "INSERT INTO notes (id, title, pinned) VALUES (?, ?, 0)",
            vec![
                Params::positional(["n1", "one"]),
                Params::positional(["n2", "two"]),
            ],
        )
        .await
        .unwrap();
    manager.commit().await.unwrap();

    assert_eq!(table.length().await.unwrap(), 2);
    let cursor = manager
        .execute("SELECT title FROM notes ORDER BY title", Params::None)
        .await
        .unwrap();
    let rows = cursor.fetch(0, None, 1).await.unwrap();
    assert_eq!(rows, vec![vec![Value::from("one")], vec![Value::from("two")]]);
    table.stop().await.unwrap();
}
