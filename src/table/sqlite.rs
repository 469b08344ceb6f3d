//! Table persisted in an `SQLite` database.

use super::{RecordStream, Table, filter_stream, not_ready, sql};
use crate::codec::{CodecRegistry, global_codecs};
use crate::connection::{ConnectionManager, Params, Row, WriteStatement};
use crate::generator::{GeneratorRegistry, global_generators};
use crate::models::{TableColumn, TableRecord, TableSchema, Values};
use crate::observability::observe;
use crate::predicate::Filter;
use crate::{Error, Result, Value};
use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::{StreamExt, TryStreamExt};
use rusqlite::Connection;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{info, instrument};

const BACKEND: &str = "sqlite";

/// A [`Table`] stored as one row per record in an `SQLite` table.
///
/// Tables addressing the same database share its [`ConnectionManager`], so
/// their operations are serialized on one connection. Values pass through
/// the [`CodecRegistry`] on the way in and out, keyed by each column's
/// declared type.
///
/// Single-record writes locate their row by a column that is unique on its
/// own, else by the whole primary key, else by matching every column. Each
/// write runs and commits as one job on the connection worker, before the
/// next element of a stream is produced.
///
/// A table without primary or unique columns has no constraint to resolve
/// conflicts, so an insert first checks for an identical row in the same job.
#[derive(Debug)]
pub struct SqliteTable {
    schema: Arc<TableSchema>,
    manager: Arc<ConnectionManager>,
    codecs: Arc<CodecRegistry>,
    generators: Arc<GeneratorRegistry>,
    refs: AtomicUsize,
}

impl SqliteTable {
    /// A table over `manager` using the process-wide codecs and generators.
    pub fn new(schema: Arc<TableSchema>, manager: Arc<ConnectionManager>) -> Self {
        Self::with_registries(
            schema,
            manager,
            Arc::clone(global_codecs()),
            Arc::clone(global_generators()),
        )
    }

    /// A table over `manager` with explicit registries.
    pub fn with_registries(
        schema: Arc<TableSchema>,
        manager: Arc<ConnectionManager>,
        codecs: Arc<CodecRegistry>,
        generators: Arc<GeneratorRegistry>,
    ) -> Self {
        Self {
            schema,
            manager,
            codecs,
            generators,
            refs: AtomicUsize::new(0),
        }
    }

    /// Reads the schema of an existing table from the database.
    ///
    /// Column types, `NOT NULL`, literal and generated defaults, the primary
    /// key, and single-column unique indexes are recovered. `manager` must be
    /// running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the table does not exist.
    #[instrument(skip(manager, codecs, generators), fields(key = %manager.key()))]
    pub async fn from_database(
        name: &str,
        manager: Arc<ConnectionManager>,
        codecs: Arc<CodecRegistry>,
        generators: Arc<GeneratorRegistry>,
    ) -> Result<Self> {
        let table = name.to_string();
        let columns = manager.submit(move |conn| reflect_columns(conn, &table)).await?;
        if columns.is_empty() {
            return Err(Error::InvalidInput(format!(
                "table '{name}' does not exist in {}",
                manager.key()
            )));
        }
        let schema = TableSchema::new(name, columns)?;
        Ok(Self::with_registries(schema, manager, codecs, generators))
    }

    /// The connection manager this table runs on.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Whether the table exists in the database.
    pub async fn exists(&self) -> Result<bool> {
        self.ensure_operational()?;
        let cursor = self
            .manager
            .execute(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
                Params::positional([self.schema.name()]),
            )
            .await?;
        Ok(cursor.fetch_one().await?.is_some())
    }

    /// Creates the table.
    #[instrument(skip(self), fields(table = %self.schema.name()))]
    pub async fn create(&self, if_not_exists: bool) -> Result<()> {
        self.ensure_operational()?;
        self.manager
            .execute_script(&self.schema.to_sql(if_not_exists))
            .await?;
        info!("table created");
        Ok(())
    }

    /// Drops the table.
    #[instrument(skip(self), fields(table = %self.schema.name()))]
    pub async fn drop(&self, if_exists: bool) -> Result<()> {
        self.ensure_operational()?;
        let statement = format!(
            "DROP TABLE {}{}",
            if if_exists { "IF EXISTS " } else { "" },
            sql::quote_identifier(self.schema.name())
        );
        self.manager.execute_script(&statement).await?;
        info!("table dropped");
        Ok(())
    }

    fn ensure_operational(&self) -> Result<()> {
        if self.is_operational() {
            Ok(())
        } else {
            Err(not_ready(&self.schema))
        }
    }

    fn decode(&self, row: Row) -> Result<TableRecord> {
        let values = self.codecs.decode_row(&self.schema, row)?;
        TableRecord::from_row(Arc::clone(&self.schema), values)
    }

    /// Runs one write that returns at most the affected row, and commits it.
    ///
    /// A failed write is undone without touching anything else pending on
    /// the shared connection.
    async fn write_one(
        &self,
        statement: String,
        params: Vec<Value>,
        unless_exists: Option<(String, Params)>,
    ) -> Result<Option<TableRecord>> {
        let written = self
            .manager
            .write(WriteStatement {
                statement,
                params: Params::Positional(params),
                unless_exists,
            })
            .await?;
        written.map(|row| self.decode(row)).transpose()
    }

    async fn update_record(&self, record: TableRecord, changes: &Values) -> Result<Option<TableRecord>> {
        let updated = record.replace(changes)?;
        let positions: Vec<usize> = changes
            .names()
            .filter_map(|name| self.schema.position(name))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        if positions.is_empty() {
            return Ok(Some(record));
        }
        let stored = self.codecs.encode_row(&self.schema, record.values())?;
        let fresh = self.codecs.encode_row(&self.schema, updated.values())?;
        let (clause, selector) = sql::selector(&self.schema, &stored);
        let mut params: Vec<Value> = positions.iter().map(|&i| fresh[i].clone()).collect();
        params.extend(selector);
        let statement = sql::update(&self.schema, &positions, Some(&clause), true);
        self.write_one(statement, params, None).await
    }

    async fn delete_record(&self, record: TableRecord) -> Result<Option<TableRecord>> {
        let stored = self.codecs.encode_row(&self.schema, record.values())?;
        let (clause, params) = sql::selector(&self.schema, &stored);
        let statement = sql::delete(&self.schema, Some(&clause), true);
        self.write_one(statement, params, None).await
    }

    /// Every row, decoded, as produced by a single `SELECT`.
    async fn rows(&self) -> Result<RecordStream<'_>> {
        self.ensure_operational()?;
        let cursor = self
            .manager
            .execute(&sql::select(&self.schema), Params::None)
            .await?;
        Ok(cursor
            .into_stream()
            .and_then(move |row| future::ready(self.decode(row)))
            .boxed())
    }

    /// Matching records, snapshotted when the stream is first polled.
    fn matching<'a>(&'a self, filter: Filter) -> RecordStream<'a> {
        let snapshot = async move {
            let rows: Vec<TableRecord> = self.rows().await?.try_collect().await?;
            Ok::<_, Error>(rows)
        };
        super::filtered(snapshot, filter)
    }
}

#[async_trait]
impl Table for SqliteTable {
    fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    async fn start(&self) -> Result<()> {
        self.manager.start().await?;
        self.refs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let released = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if released {
            self.manager.stop().await?;
        }
        Ok(())
    }

    fn is_operational(&self) -> bool {
        self.refs.load(Ordering::SeqCst) > 0 && self.manager.is_running()
    }

    #[instrument(skip(self), fields(table = %self.schema.name(), backend = BACKEND))]
    async fn length(&self) -> Result<u64> {
        let start = Instant::now();
        let result = async {
            self.ensure_operational()?;
            let cursor = self
                .manager
                .execute(&sql::count(&self.schema), Params::None)
                .await?;
            let count = cursor
                .fetch_one()
                .await?
                .and_then(|row| row.first().and_then(Value::as_i64))
                .unwrap_or(0);
            Ok::<_, Error>(u64::try_from(count).unwrap_or(0))
        }
        .await;
        observe(BACKEND, "length", start, result)
    }

    #[instrument(skip_all, fields(table = %self.schema.name(), backend = BACKEND))]
    async fn contains(&self, record: &TableRecord) -> Result<bool> {
        let start = Instant::now();
        let result = async {
            self.ensure_operational()?;
            let stored = self.codecs.encode_row(&self.schema, record.values())?;
            let (clause, params) = sql::selector(&self.schema, &stored);
            let cursor = self
                .manager
                .execute(&sql::exists_row(&self.schema, &clause), Params::Positional(params))
                .await?;
            Ok::<_, Error>(cursor.fetch_one().await?.is_some())
        }
        .await;
        observe(BACKEND, "contains", start, result)
    }

    #[instrument(skip(self, values), fields(table = %self.schema.name(), backend = BACKEND))]
    async fn insert(&self, values: Values, ignore_existing: bool) -> Result<TableRecord> {
        let start = Instant::now();
        let result = async {
            self.ensure_operational()?;
            let record = TableRecord::build(&self.schema, values, &self.generators).await?;
            let stored = self.codecs.encode_row(&self.schema, record.values())?;
            let unless_exists = if self.schema.has_identity() {
                None
            } else {
                let (clause, params) = sql::selector(&self.schema, &stored);
                Some((sql::exists_row(&self.schema, &clause), Params::Positional(params)))
            };
            self.write_one(sql::insert(&self.schema, ignore_existing), stored, unless_exists)
                .await?;
            Ok::<_, Error>(record)
        }
        .await;
        observe(BACKEND, "insert", start, result)
    }

    #[instrument(skip_all, fields(table = %self.schema.name(), backend = BACKEND))]
    async fn select<'a>(&'a self, filter: Filter) -> Result<RecordStream<'a>> {
        let start = Instant::now();
        let rows = observe(BACKEND, "select", start, self.rows().await)?;
        Ok(filter_stream(rows, filter))
    }

    fn updated<'a>(&'a self, filter: Filter, changes: Values) -> RecordStream<'a> {
        let changes = Arc::new(changes);
        self.matching(filter)
            .try_filter_map(move |record| {
                let changes = Arc::clone(&changes);
                async move {
                    let start = Instant::now();
                    observe(BACKEND, "update", start, self.update_record(record, &changes).await)
                }
            })
            .boxed()
    }

    fn deleted<'a>(&'a self, filter: Filter) -> RecordStream<'a> {
        self.matching(filter)
            .try_filter_map(move |record| async move {
                let start = Instant::now();
                observe(BACKEND, "delete", start, self.delete_record(record).await)
            })
            .boxed()
    }
}

/// Columns of `table` as declared in the database; empty if it does not exist.
fn reflect_columns(conn: &Connection, table: &str) -> Result<Vec<TableColumn>> {
    let map = |e: rusqlite::Error| crate::connection::map_sqlite_error("reflect_table", e);

    let mut unique = HashSet::new();
    let mut indexes = conn
        .prepare(r#"SELECT name FROM pragma_index_list(?1) WHERE "unique" = 1 AND origin != 'pk'"#)
        .map_err(map)?;
    let names = indexes
        .query_map([table], |row| row.get::<_, String>(0))
        .map_err(map)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(map)?;
    let mut info = conn
        .prepare("SELECT name FROM pragma_index_info(?1)")
        .map_err(map)?;
    for index in names {
        let columns = info
            .query_map([&index], |row| row.get::<_, String>(0))
            .map_err(map)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map)?;
        if let [column] = columns.as_slice() {
            unique.insert(column.clone());
        }
    }

    let mut stmt = conn
        .prepare(
            r#"SELECT name, type, "notnull", dflt_value, pk
               FROM pragma_table_info(?1) ORDER BY cid"#,
        )
        .map_err(map)?;
    let columns = stmt
        .query_map([table], |row| {
            let name: String = row.get(0)?;
            let mut column = TableColumn::new(name, row.get::<_, String>(1)?);
            column.nullable = !row.get::<_, bool>(2)?;
            column.default = sql::parse_default(row.get::<_, Option<String>>(3)?.as_deref());
            column.primary = row.get::<_, i64>(4)? > 0;
            Ok(column)
        })
        .map_err(map)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(map)?;

    Ok(columns
        .into_iter()
        .map(|mut column| {
            column.unique = unique.contains(&column.name);
            column
        })
        .collect())
}
