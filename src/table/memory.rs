//! In-process table backed by an insertion-ordered record set.

use super::{RecordStream, Table, filtered, not_ready};
use crate::executor::{SerializedExecutor, WorkerState};
use crate::generator::{GeneratorRegistry, global_generators};
use crate::models::{TableRecord, TableSchema, Values};
use crate::observability::observe;
use crate::predicate::Filter;
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::stream::{StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

const BACKEND: &str = "memory";

/// Records keyed by identity, plus their insertion order.
///
/// A replaced record keeps the position of the one it replaced.
#[derive(Debug, Default)]
struct MemoryStore {
    records: HashMap<TableRecord, u64>,
    order: BTreeMap<u64, TableRecord>,
    next_seq: u64,
}

impl WorkerState for MemoryStore {}

impl MemoryStore {
    fn len(&self) -> u64 {
        u64::try_from(self.order.len()).unwrap_or(u64::MAX)
    }

    fn snapshot(&self) -> Vec<TableRecord> {
        self.order.values().cloned().collect()
    }

    /// Stores `record`; returns `false` when an existing record was kept.
    fn put(&mut self, record: TableRecord, ignore_existing: bool) -> bool {
        let seq = match self.records.get(&record).copied() {
            Some(_) if ignore_existing => return false,
            Some(seq) => {
                // The map keeps its old key on insert, so evict it first.
                self.records.remove(&record);
                seq
            },
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                seq
            },
        };
        self.records.insert(record.clone(), seq);
        self.order.insert(seq, record);
        true
    }

    /// Removes the record with the identity of `record`.
    fn remove(&mut self, record: &TableRecord) -> Option<TableRecord> {
        let (stored, seq) = self.records.remove_entry(record)?;
        self.order.remove(&seq);
        Some(stored)
    }

    /// Applies `changes` to the stored record with the identity of `record`.
    fn update(&mut self, record: &TableRecord, changes: &Values) -> Result<Option<TableRecord>> {
        let Some((stored, &seq)) = self.records.get_key_value(record) else {
            return Ok(None);
        };
        let updated = stored.replace(changes)?;
        if updated != *stored && self.records.contains_key(&updated) {
            return Err(Error::DuplicateIdentity(format!(
                "table '{}' already holds a record with identity {:?}",
                updated.schema().name(),
                updated.identity()
            )));
        }
        self.records.remove(record);
        self.records.insert(updated.clone(), seq);
        self.order.insert(seq, updated.clone());
        Ok(Some(updated))
    }
}

/// A [`Table`] kept in memory and owned by its own worker thread.
///
/// Iteration follows insertion order. Nothing is persisted; the records live
/// as long as the table and survive `stop()`/`start()` cycles.
///
/// ```rust,ignore
/// let table = MemoryTable::new(schema);
/// table.start().await?;
/// let alice = table.insert(Values::new().set("id", 1).set("name", "Alice"), false).await?;
/// assert!(table.contains(&alice).await?);
/// ```
#[derive(Debug)]
pub struct MemoryTable {
    schema: Arc<TableSchema>,
    executor: SerializedExecutor<MemoryStore>,
    generators: Arc<GeneratorRegistry>,
}

impl MemoryTable {
    /// A stopped, empty table using the process-wide generators.
    pub fn new(schema: Arc<TableSchema>) -> Self {
        Self::with_generators(schema, Arc::clone(global_generators()))
    }

    /// A stopped, empty table resolving generated defaults from `generators`.
    pub fn with_generators(schema: Arc<TableSchema>, generators: Arc<GeneratorRegistry>) -> Self {
        let executor = SerializedExecutor::new(format!("memory:{}", schema.name()), MemoryStore::default());
        Self {
            schema,
            executor,
            generators,
        }
    }

    fn ensure_operational(&self) -> Result<()> {
        if self.executor.is_running() {
            Ok(())
        } else {
            Err(not_ready(&self.schema))
        }
    }

    async fn snapshot(&self) -> Result<Vec<TableRecord>> {
        self.ensure_operational()?;
        self.executor.submit(|store| Ok(store.snapshot())).await
    }
}

#[async_trait]
impl Table for MemoryTable {
    fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    async fn start(&self) -> Result<()> {
        self.executor.start().await.map(|_| ())
    }

    async fn stop(&self) -> Result<()> {
        self.executor.stop().await.map(|_| ())
    }

    fn is_operational(&self) -> bool {
        self.executor.is_running()
    }

    #[instrument(skip(self), fields(table = %self.schema.name(), backend = BACKEND))]
    async fn length(&self) -> Result<u64> {
        let start = Instant::now();
        let result = match self.ensure_operational() {
            Ok(()) => self.executor.submit(|store| Ok(store.len())).await,
            Err(e) => Err(e),
        };
        observe(BACKEND, "length", start, result)
    }

    #[instrument(skip_all, fields(table = %self.schema.name(), backend = BACKEND))]
    async fn contains(&self, record: &TableRecord) -> Result<bool> {
        let start = Instant::now();
        let record = record.clone();
        let result = match self.ensure_operational() {
            Ok(()) => {
                self.executor
                    .submit(move |store| Ok(store.records.contains_key(&record)))
                    .await
            },
            Err(e) => Err(e),
        };
        observe(BACKEND, "contains", start, result)
    }

    #[instrument(skip(self, values), fields(table = %self.schema.name(), backend = BACKEND))]
    async fn insert(&self, values: Values, ignore_existing: bool) -> Result<TableRecord> {
        let start = Instant::now();
        let result = async {
            self.ensure_operational()?;
            let record = TableRecord::build(&self.schema, values, &self.generators).await?;
            let stored = record.clone();
            let written = self
                .executor
                .submit(move |store| Ok(store.put(stored, ignore_existing)))
                .await?;
            if !written {
                debug!(record = ?record, "kept existing record");
            }
            Ok::<_, Error>(record)
        }
        .await;
        observe(BACKEND, "insert", start, result)
    }

    #[instrument(skip_all, fields(table = %self.schema.name(), backend = BACKEND))]
    async fn select<'a>(&'a self, filter: Filter) -> Result<RecordStream<'a>> {
        let start = Instant::now();
        let snapshot = observe(BACKEND, "select", start, self.snapshot().await)?;
        Ok(filtered(std::future::ready(Ok(snapshot)), filter))
    }

    fn updated<'a>(&'a self, filter: Filter, changes: Values) -> RecordStream<'a> {
        let changes = Arc::new(changes);
        filtered(self.snapshot(), filter)
            .try_filter_map(move |record| {
                let changes = Arc::clone(&changes);
                let start = Instant::now();
                let handle = self
                    .executor
                    .submit(move |store| store.update(&record, &changes));
                async move { observe(BACKEND, "update", start, handle.await) }
            })
            .boxed()
    }

    fn deleted<'a>(&'a self, filter: Filter) -> RecordStream<'a> {
        filtered(self.snapshot(), filter)
            .try_filter_map(move |record| {
                let start = Instant::now();
                let handle = self.executor.submit(move |store| Ok(store.remove(&record)));
                async move { observe(BACKEND, "delete", start, handle.await) }
            })
            .boxed()
    }
}
