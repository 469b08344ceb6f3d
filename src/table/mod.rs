//! Record stores.
//!
//! [`Table`] is the CRUD surface shared by every backend:
//!
//! | Backend | Storage | Worker |
//! |---------|---------|--------|
//! | [`MemoryTable`] | insertion-ordered set of records | own [`SerializedExecutor`](crate::SerializedExecutor) |
//! | [`SqliteTable`] | one row per record | shared [`ConnectionManager`](crate::ConnectionManager) |
//!
//! Both run every read and write on a single worker, so operations on one
//! table complete in the order they were issued. Operations that return a
//! [`RecordStream`] are lazy: nothing is inserted, updated, or deleted until
//! the stream is polled, and dropping a stream half way leaves the earlier
//! elements applied.

mod keyed;
mod memory;
pub mod sql;
mod sqlite;

pub use keyed::KeyedTable;
pub use memory::MemoryTable;
pub use sqlite::SqliteTable;

use crate::models::{TableRecord, TableSchema, Values};
use crate::predicate::Filter;
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::future::Future;
use std::sync::Arc;

/// A lazily evaluated sequence of records.
pub type RecordStream<'a> = BoxStream<'a, Result<TableRecord>>;

/// CRUD over records of one [`TableSchema`].
///
/// Every operation requires the table to be operational (between
/// [`Table::start`] and the matching [`Table::stop`]) and fails with
/// [`Error::NotReady`] otherwise. Streams report that error on first poll.
#[async_trait]
pub trait Table: Send + Sync {
    /// Column layout of the records.
    fn schema(&self) -> &Arc<TableSchema>;

    /// Table name.
    fn name(&self) -> &str {
        self.schema().name()
    }

    /// Starts the worker. Calls nest; each needs a matching [`Table::stop`].
    async fn start(&self) -> Result<()>;

    /// Releases one [`Table::start`]; the last release drains pending work.
    async fn stop(&self) -> Result<()>;

    /// Whether CRUD operations are currently accepted.
    fn is_operational(&self) -> bool;

    /// Number of stored records.
    async fn length(&self) -> Result<u64>;

    /// Whether a record with the same identity is stored.
    async fn contains(&self, record: &TableRecord) -> Result<bool>;

    /// Stores one record built from `values`, defaults, and generators.
    ///
    /// A record with the same identity is replaced, unless
    /// `ignore_existing` is set: then the stored record stays and the
    /// freshly built one is returned without being persisted.
    ///
    /// # Errors
    ///
    /// [`Error::ConstraintViolation`] if a non-nullable column ends up
    /// without a value.
    async fn insert(&self, values: Values, ignore_existing: bool) -> Result<TableRecord>;

    /// Inserts each element of `rows` as the stream reaches it.
    fn insert_many<'a>(&'a self, rows: Vec<Values>, ignore_existing: bool) -> RecordStream<'a> {
        stream::iter(rows)
            .then(move |values| self.insert(values, ignore_existing))
            .boxed()
    }

    /// Records matching `filter`, snapshotted when this call completes.
    ///
    /// The filter itself runs lazily as the stream is consumed.
    async fn select<'a>(&'a self, filter: Filter) -> Result<RecordStream<'a>>;

    /// First record matching `filter`.
    async fn select_one(&self, filter: Filter) -> Result<Option<TableRecord>> {
        self.select(filter).await?.try_next().await
    }

    /// Number of records matching `filter`.
    async fn count(&self, filter: Filter) -> Result<u64> {
        if filter.is_all() {
            return self.length().await;
        }
        self.select(filter)
            .await?
            .try_fold(0u64, |n, _| async move { Ok(n + 1) })
            .await
    }

    /// Applies `changes` to each matching record as the stream reaches it,
    /// yielding the updated records.
    ///
    /// # Errors
    ///
    /// Yields [`Error::DuplicateIdentity`] when an update would give a record
    /// the identity of another stored record; that record is left unchanged.
    fn updated<'a>(&'a self, filter: Filter, changes: Values) -> RecordStream<'a>;

    /// Updates every matching record and returns how many changed.
    async fn update(&self, filter: Filter, changes: Values) -> Result<u64> {
        drain(self.updated(filter, changes)).await
    }

    /// Updates the first matching record.
    async fn update_one(&self, filter: Filter, changes: Values) -> Result<Option<TableRecord>> {
        self.updated(filter, changes).try_next().await
    }

    /// Removes each matching record as the stream reaches it, yielding it.
    fn deleted<'a>(&'a self, filter: Filter) -> RecordStream<'a>;

    /// Removes every matching record and returns how many were removed.
    async fn delete(&self, filter: Filter) -> Result<u64> {
        drain(self.deleted(filter)).await
    }

    /// Removes the first matching record.
    async fn delete_one(&self, filter: Filter) -> Result<Option<TableRecord>> {
        self.deleted(filter).try_next().await
    }
}

/// Starts `table`, runs `body`, and stops the table even if `body` failed.
///
/// The body's error takes precedence over an error from stopping.
pub async fn scoped<'a, T, F, Fut, R>(table: &'a T, body: F) -> Result<R>
where
    T: Table + ?Sized,
    F: FnOnce(&'a T) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    table.start().await?;
    let outcome = body(table).await;
    let stopped = table.stop().await;
    let value = outcome?;
    stopped?;
    Ok(value)
}

async fn drain(records: RecordStream<'_>) -> Result<u64> {
    records.try_fold(0u64, |n, _| async move { Ok(n + 1) }).await
}

pub(crate) fn not_ready(schema: &TableSchema) -> Error {
    Error::NotReady(format!("table '{}' is not operational", schema.name()))
}

/// Records of `snapshot` that pass `filter`, evaluated lazily.
///
/// `snapshot` runs on first poll.
pub(crate) fn filtered<'a, S>(snapshot: S, filter: Filter) -> RecordStream<'a>
where
    S: Future<Output = Result<Vec<TableRecord>>> + Send + 'a,
{
    let records = stream::once(snapshot)
        .map_ok(|records| stream::iter(records.into_iter().map(Ok)))
        .try_flatten()
        .boxed();
    filter_stream(records, filter)
}

/// Drops the records of `records` that fail `filter`.
pub(crate) fn filter_stream(records: RecordStream<'_>, filter: Filter) -> RecordStream<'_> {
    if filter.is_all() {
        return records;
    }
    records
        .try_filter(move |record| {
            let filter = filter.clone();
            let record = record.clone();
            async move { filter.matches(&record).await }
        })
        .boxed()
}
