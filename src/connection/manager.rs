//! One serialized worker per database connection.

use super::connector::{Connector, ResourceKey};
use super::cursor::CursorManager;
use super::registry::ConnectionRegistry;
use crate::executor::{SerializedExecutor, TaskHandle, WorkerState, acquire_read, acquire_write};
use crate::models::Value;
use crate::{Error, Result};
use rusqlite::{Connection, Statement};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, info, instrument, warn};

/// One result row, in statement column order.
pub type Row = Vec<Value>;

/// Statement parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
    /// No parameters.
    #[default]
    None,
    /// `?` / `?NNN` parameters in order.
    Positional(Vec<Value>),
    /// `:name` parameters. A name without a sigil gets `:` prepended.
    Named(Vec<(String, Value)>),
}

impl Params {
    /// Positional parameters from anything convertible to [`Value`].
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::Positional(values.into_iter().map(Into::into).collect())
    }

    /// Named parameters from `(name, value)` pairs.
    pub fn named<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self::Named(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Positional(values) => values.len(),
            Self::Named(pairs) => pairs.len(),
        }
    }

    fn bind(&self, stmt: &mut Statement<'_>) -> Result<()> {
        let expected = stmt.parameter_count();
        if self.len() != expected {
            return Err(Error::InvalidInput(format!(
                "statement expects {expected} parameters, {} supplied",
                self.len()
            )));
        }
        match self {
            Self::None => {},
            Self::Positional(values) => {
                for (i, value) in values.iter().enumerate() {
                    stmt.raw_bind_parameter(i + 1, value)
                        .map_err(|e| Error::resource("bind_parameter", e))?;
                }
            },
            Self::Named(pairs) => {
                for (name, value) in pairs {
                    let key = if name.starts_with([':', '@', '$']) {
                        name.clone()
                    } else {
                        format!(":{name}")
                    };
                    let index = stmt
                        .parameter_index(&key)
                        .map_err(|e| Error::resource("bind_parameter", e))?
                        .ok_or_else(|| {
                            Error::InvalidInput(format!("statement has no parameter named '{key}'"))
                        })?;
                    stmt.raw_bind_parameter(index, value)
                        .map_err(|e| Error::resource("bind_parameter", e))?;
                }
            },
        }
        Ok(())
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        if values.is_empty() {
            Self::None
        } else {
            Self::Positional(values)
        }
    }
}

/// Outcome of one statement, as seen by the cursor that reports it.
#[derive(Debug)]
pub(crate) struct Executed {
    pub(crate) cursor: Option<u64>,
    pub(crate) columns: Vec<String>,
    pub(crate) rows_affected: u64,
    pub(crate) last_insert_rowid: i64,
}

/// One table write, run and committed as a single queued job.
#[derive(Debug)]
pub(crate) struct WriteStatement {
    pub(crate) statement: String,
    pub(crate) params: Params,
    /// When this query finds a row, the write is skipped.
    pub(crate) unless_exists: Option<(String, Params)>,
}

const WRITE_SAVEPOINT: &str = "queuelite_write";

/// State owned by a connection worker: the connection and parked cursor rows.
#[derive(Debug)]
pub struct ConnectionState {
    connector: Connector,
    connection: Option<Connection>,
    cursors: HashMap<u64, VecDeque<Row>>,
    next_cursor: u64,
}

impl WorkerState for ConnectionState {
    fn on_start(&mut self) -> Result<()> {
        self.connection = Some(self.connector.open()?);
        debug!(database = ?self.connector.database(), "connection opened");
        Ok(())
    }

    fn on_stop(&mut self) -> Result<()> {
        self.cursors.clear();
        let Some(conn) = self.connection.take() else {
            return Ok(());
        };
        let committed = commit_pending(&conn);
        let closed = conn
            .close()
            .map_err(|(_, e)| Error::resource("close_sqlite", e));
        debug!(database = ?self.connector.database(), "connection closed");
        committed.and(closed)
    }
}

impl ConnectionState {
    fn new(connector: Connector) -> Self {
        Self {
            connector,
            connection: None,
            cursors: HashMap::new(),
            next_cursor: 0,
        }
    }

    /// The open connection. Only reachable from the worker.
    pub fn connection(&self) -> Result<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| Error::ResourceClosed("connection is not open".to_string()))
    }

    fn execute(&mut self, sql: &str, params: &Params) -> Result<Executed> {
        let begin = self.connector.mode().begin_statement();
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(sql).map_err(|e| map_sqlite_error("prepare", e))?;
        params.bind(&mut stmt)?;

        if !stmt.readonly() {
            if let Some(begin) = begin {
                if conn.is_autocommit() {
                    conn.execute_batch(begin)
                        .map_err(|e| map_sqlite_error("begin_transaction", e))?;
                }
            }
        }

        let readonly = stmt.readonly();
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        if columns.is_empty() {
            let affected = stmt.raw_execute().map_err(|e| map_sqlite_error("execute", e))?;
            return Ok(Executed {
                cursor: None,
                columns,
                rows_affected: u64::try_from(affected).unwrap_or(u64::MAX),
                last_insert_rowid: conn.last_insert_rowid(),
            });
        }

        let width = columns.len();
        let mut buffer = VecDeque::new();
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next().map_err(|e| map_sqlite_error("step", e))? {
            let values = (0..width)
                .map(|i| row.get::<_, Value>(i))
                .collect::<rusqlite::Result<Row>>()
                .map_err(|e| map_sqlite_error("read_row", e))?;
            buffer.push_back(values);
        }
        drop(rows);
        drop(stmt);

        let rows_affected = if readonly { 0 } else { conn.changes() };
        let last_insert_rowid = conn.last_insert_rowid();
        let id = self.next_cursor;
        self.next_cursor += 1;
        self.cursors.insert(id, buffer);
        Ok(Executed {
            cursor: Some(id),
            columns,
            rows_affected,
            last_insert_rowid,
        })
    }

    fn execute_batch(&self, sql: &str, batch: &[Params]) -> Result<u64> {
        let begin = self.connector.mode().begin_statement();
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(sql).map_err(|e| map_sqlite_error("prepare", e))?;
        if stmt.column_count() > 0 {
            return Err(Error::InvalidInput(
                "execute_batch cannot run a statement that returns rows".to_string(),
            ));
        }
        if let Some(begin) = begin {
            if !stmt.readonly() && conn.is_autocommit() {
                conn.execute_batch(begin)
                    .map_err(|e| map_sqlite_error("begin_transaction", e))?;
            }
        }
        let mut total = 0u64;
        for params in batch {
            params.bind(&mut stmt)?;
            let affected = stmt.raw_execute().map_err(|e| map_sqlite_error("execute", e))?;
            total += u64::try_from(affected).unwrap_or(u64::MAX);
        }
        Ok(total)
    }

    fn execute_script(&self, sql: &str) -> Result<()> {
        let conn = self.connection()?;
        commit_pending(conn)?;
        conn.execute_batch(sql).map_err(|e| map_sqlite_error("execute_script", e))
    }

    /// Runs `write` inside a savepoint and commits, all within the current job.
    ///
    /// On failure only the savepoint is rolled back, so work that other
    /// callers left pending on the connection survives. Returns the first row
    /// the statement produced.
    fn write(&self, write: &WriteStatement) -> Result<Option<Row>> {
        let conn = self.connection()?;
        conn.execute_batch(&format!("SAVEPOINT {WRITE_SAVEPOINT}"))
            .map_err(|e| map_sqlite_error("savepoint", e))?;
        let written = run_write(conn, write).and_then(|row| {
            conn.execute_batch(&format!("RELEASE {WRITE_SAVEPOINT}"))
                .map_err(|e| map_sqlite_error("release_savepoint", e))?;
            Ok(row)
        });
        match written {
            Ok(row) => {
                if let Err(e) = commit_pending(conn) {
                    if let Err(undo) = conn.execute_batch("ROLLBACK") {
                        warn!(error = %undo, "rollback after failed commit failed");
                    }
                    return Err(e);
                }
                Ok(row)
            },
            Err(e) => {
                let undo = format!("ROLLBACK TO {WRITE_SAVEPOINT}; RELEASE {WRITE_SAVEPOINT}");
                if let Err(undo) = conn.execute_batch(&undo) {
                    warn!(error = %undo, "rollback of failed write failed");
                }
                Err(e)
            },
        }
    }

    fn rollback(&self) -> Result<()> {
        let conn = self.connection()?;
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")
                .map_err(|e| map_sqlite_error("rollback", e))?;
        }
        Ok(())
    }

    fn cursor_rows(&mut self, id: u64) -> Result<&mut VecDeque<Row>> {
        self.cursors
            .get_mut(&id)
            .ok_or_else(|| Error::ResourceClosed(format!("cursor {id} is no longer open")))
    }

    pub(crate) fn fetch_one(&mut self, cursor: Option<u64>) -> Result<Option<Row>> {
        match cursor {
            Some(id) => Ok(self.cursor_rows(id)?.pop_front()),
            None => Ok(None),
        }
    }

    pub(crate) fn fetch_many(&mut self, cursor: Option<u64>, limit: Option<usize>) -> Result<Vec<Row>> {
        let Some(id) = cursor else {
            return Ok(Vec::new());
        };
        let rows = self.cursor_rows(id)?;
        let take = limit.map_or(rows.len(), |n| n.min(rows.len()));
        Ok(rows.drain(..take).collect())
    }

    pub(crate) fn close_cursor(&mut self, id: u64) {
        self.cursors.remove(&id);
    }
}

fn run_write(conn: &Connection, write: &WriteStatement) -> Result<Option<Row>> {
    if let Some((query, params)) = &write.unless_exists {
        let mut stmt = conn.prepare_cached(query).map_err(|e| map_sqlite_error("prepare", e))?;
        params.bind(&mut stmt)?;
        let found = stmt
            .raw_query()
            .next()
            .map_err(|e| map_sqlite_error("step", e))?
            .is_some();
        if found {
            return Ok(None);
        }
    }

    let mut stmt = conn
        .prepare_cached(&write.statement)
        .map_err(|e| map_sqlite_error("prepare", e))?;
    write.params.bind(&mut stmt)?;
    let width = stmt.column_count();
    let mut rows = stmt.raw_query();
    let mut first = None;
    // Step to the end so every affected row is written.
    while let Some(row) = rows.next().map_err(|e| map_sqlite_error("step", e))? {
        if first.is_none() && width > 0 {
            let values = (0..width)
                .map(|i| row.get::<_, Value>(i))
                .collect::<rusqlite::Result<Row>>()
                .map_err(|e| map_sqlite_error("read_row", e))?;
            first = Some(values);
        }
    }
    Ok(first)
}

fn commit_pending(conn: &Connection) -> Result<()> {
    if !conn.is_autocommit() {
        conn.execute_batch("COMMIT")
            .map_err(|e| map_sqlite_error("commit", e))?;
    }
    Ok(())
}

/// Maps a rusqlite error onto the crate taxonomy.
///
/// UNIQUE and PRIMARY KEY failures become [`Error::DuplicateIdentity`], other
/// constraint failures [`Error::ConstraintViolation`], everything else
/// [`Error::ResourceError`] tagged with `operation`.
pub(crate) fn map_sqlite_error(operation: &str, error: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(failure, ref message) = error {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation {
            let detail = message.clone().unwrap_or_else(|| failure.to_string());
            return match failure.extended_code {
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => Error::DuplicateIdentity(detail),
                _ => Error::ConstraintViolation(detail),
            };
        }
    }
    Error::resource(operation, error)
}

/// Serialized access to one `SQLite` database.
///
/// Every statement, commit, and cursor fetch is queued on the same worker, so
/// operations against one database complete strictly in submission order
/// while managers for different databases run in parallel.
///
/// Managers are normally obtained from a [`ConnectionRegistry`], which hands
/// out the same `Arc` for every connector that resolves to the same
/// [`ResourceKey`]. `start()`/`stop()` are reference counted so each table
/// sharing the manager can bracket its own use.
///
/// # Example
///
/// ```rust,ignore
/// use queuelite::{Connector, Params, global_registry};
///
/// let manager = global_registry().get_or_create(Connector::file("app.db"))?;
/// manager.start().await?;
/// manager.execute_script("CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v TEXT)").await?;
/// manager.execute("INSERT INTO kv VALUES (?, ?)", Params::positional(["a", "1"])).await?;
/// manager.commit().await?;
/// let rows = manager.execute("SELECT v FROM kv", Params::None).await?.fetch_all().await?;
/// manager.stop().await?;
/// ```
pub struct ConnectionManager {
    key: RwLock<ResourceKey>,
    executor: SerializedExecutor<ConnectionState>,
    registry: Weak<ConnectionRegistry>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("key", &self.key())
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates a manager that is not tracked by any registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the connector's resource key cannot be resolved.
    pub fn new(connector: Connector) -> Result<Arc<Self>> {
        let key = connector.resource_key()?;
        Ok(Arc::new(Self::build(key, connector, Weak::new())))
    }

    pub(crate) fn build(key: ResourceKey, connector: Connector, registry: Weak<ConnectionRegistry>) -> Self {
        Self {
            executor: SerializedExecutor::new(format!("sqlite:{key}"), ConnectionState::new(connector)),
            key: RwLock::new(key),
            registry,
        }
    }

    /// The key this manager is registered under.
    pub fn key(&self) -> ResourceKey {
        acquire_read(&self.key).clone()
    }

    /// The current connector.
    pub async fn connector(&self) -> Result<Connector> {
        self.executor.with_state(|state| Ok(state.connector.clone())).await
    }

    /// Opens the connection if this is the first outstanding `start()`.
    pub async fn start(&self) -> Result<bool> {
        self.executor.start().await
    }

    /// Releases one `start()`; the last one commits, closes, and joins the worker.
    ///
    /// Cursors produced before the worker stops become unusable.
    pub async fn stop(&self) -> Result<bool> {
        self.executor.stop().await
    }

    /// Returns `true` while the connection is open.
    pub fn is_running(&self) -> bool {
        self.executor.is_running()
    }

    /// Number of outstanding `start()` calls.
    pub fn refs(&self) -> usize {
        self.executor.refs()
    }

    /// Queues arbitrary work against the raw connection.
    ///
    /// The closure runs on the worker thread, in order with every other
    /// operation on this database.
    pub fn submit<F, T>(&self, func: F) -> TaskHandle<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.executor.submit(move |state| func(state.connection()?))
    }

    pub(crate) fn submit_state<F, T>(&self, func: F) -> TaskHandle<T>
    where
        F: FnOnce(&mut ConnectionState) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.executor.submit(func)
    }

    /// Runs one statement and returns a cursor over its rows.
    ///
    /// Outside autocommit mode a write statement issued with no open
    /// transaction first opens one; call [`ConnectionManager::commit`] to make
    /// it durable.
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] if the manager is stopped
    /// - [`Error::InvalidInput`] if the parameter count does not match
    /// - [`Error::DuplicateIdentity`] / [`Error::ConstraintViolation`] on constraint failures
    /// - [`Error::ResourceError`] for any other `SQLite` failure
    #[instrument(skip(self, params), fields(key = %self.key()))]
    pub async fn execute(self: &Arc<Self>, sql: &str, params: Params) -> Result<CursorManager> {
        let sql = sql.to_string();
        let executed = self
            .executor
            .submit(move |state| state.execute(&sql, &params))
            .await?;
        Ok(CursorManager::new(Arc::clone(self), executed))
    }

    /// Runs one row-less statement once per parameter set and returns the total rows affected.
    #[instrument(skip(self, batch), fields(key = %self.key(), batch = batch.len()))]
    pub async fn execute_batch(&self, sql: &str, batch: Vec<Params>) -> Result<u64> {
        let sql = sql.to_string();
        self.executor
            .submit(move |state| state.execute_batch(&sql, &batch))
            .await
    }

    /// Commits pending work, then runs a multi-statement script.
    #[instrument(skip(self, script), fields(key = %self.key()))]
    pub async fn execute_script(&self, script: &str) -> Result<()> {
        let script = script.to_string();
        self.executor
            .submit(move |state| state.execute_script(&script))
            .await
    }

    /// Runs one table write and commits it in a single queued job.
    pub(crate) async fn write(&self, write: WriteStatement) -> Result<Option<Row>> {
        self.executor.submit(move |state| state.write(&write)).await
    }

    /// Commits the open transaction, if any.
    pub async fn commit(&self) -> Result<()> {
        self.executor
            .submit(|state| commit_pending(state.connection()?))
            .await
    }

    /// Rolls back the open transaction, if any.
    pub async fn rollback(&self) -> Result<()> {
        self.executor.submit(|state| state.rollback()).await
    }

    /// Replaces the connector.
    ///
    /// When the new connector resolves to the same key this is a
    /// configuration update: pragmas are re-applied to the open connection
    /// and no queued work is interrupted. When the key changes, the worker is
    /// drained and stopped, the manager moves to the new key in its registry,
    /// and a worker for the new database is started with the same number of
    /// references the old one had.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if another manager already owns the new
    /// key, or any error from stopping the old or opening the new connection.
    #[instrument(skip(self, connector), fields(key = %self.key()))]
    pub async fn set_connector(&self, connector: Connector) -> Result<()> {
        let new_key = connector.resource_key()?;
        let old_key = self.key();

        if new_key == old_key {
            return self
                .executor
                .with_state(move |state| {
                    if let Some(conn) = &state.connection {
                        connector.configure(conn)?;
                    }
                    state.connector = connector;
                    Ok(())
                })
                .await;
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.rekey(&old_key, &new_key, self)?;
        }
        let refs = self.executor.halt().await?;
        self.executor
            .with_state(move |state| {
                state.connector = connector;
                Ok(())
            })
            .await?;
        *acquire_write(&self.key) = new_key.clone();
        info!(from = %old_key, to = %new_key, "connection moved to new database");
        self.executor.resume(refs).await.map(|_| ())
    }

    /// Stops the worker regardless of outstanding references and leaves the registry.
    ///
    /// Removing an already removed manager is a no-op.
    pub async fn remove(&self) -> Result<()> {
        let halted = self.executor.halt().await;
        let key = self.key();
        if let Some(registry) = self.registry.upgrade() {
            if registry.deregister(&key, self) {
                info!(key = %key, "connection manager removed");
            }
        }
        if let Err(e) = &halted {
            warn!(key = %key, error = %e, "connection did not close cleanly");
        }
        halted.map(|_| ())
    }
}
