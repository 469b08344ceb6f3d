//! # Queuelite
//!
//! Ordered, single-worker async access to blocking `SQLite` connections, with a
//! typed record-store layer on top.
//!
//! Every resource (a database connection, or an in-memory record set) is owned
//! by exactly one dedicated worker thread. Callers on any number of tasks submit
//! closures to that worker and await the result; submissions run one at a time
//! in the order they were made.
//!
//! ## Layers
//!
//! - [`executor`]: [`TaskExecutor`] for unordered blocking calls and
//!   [`SerializedExecutor`] for FIFO, mutually exclusive execution
//! - [`connection`]: [`ConnectionManager`] (one per database, shared through a
//!   [`ConnectionRegistry`]) and [`CursorManager`]
//! - [`models`]: [`Value`], [`TableColumn`], [`TableSchema`], [`TableRecord`]
//! - [`table`]: the [`Table`] contract with [`MemoryTable`] and [`SqliteTable`]
//!   backends, plus the [`KeyedTable`] view
//! - [`predicate`]: [`Filter`] and the [`Expr`] builder used to select records
//! - [`codec`] and [`generator`]: value conversion per column type and named
//!   default-value producers
//!
//! ## Example
//!
//! ```rust,ignore
//! use queuelite::{MemoryTable, Table, TableColumn, TableSchema, Values, Filter};
//!
//! let schema = TableSchema::builder("persons")
//!     .column(TableColumn::new("id", "INTEGER").primary())
//!     .column(TableColumn::new("name", "TEXT").not_null())
//!     .column(TableColumn::new("age", "INTEGER").default_value(0))
//!     .build()?;
//! let table = MemoryTable::new(schema);
//! table.start().await?;
//! let alice = table.insert(Values::new().set("id", 1).set("name", "Alice"), false).await?;
//! assert_eq!(alice.value("age"), Some(&0.into()));
//! table.stop().await?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

pub mod codec;
pub mod config;
pub mod connection;
pub mod executor;
pub mod generator;
pub mod models;
pub mod observability;
pub mod predicate;
pub mod table;

pub use codec::{Codec, CodecRegistry, global_codecs};
pub use config::{ConnectionSettings, LoggingSettings, QueueliteConfig};
pub use connection::{
    ConnectionManager, ConnectionRegistry, Connector, CursorManager, Database, Params,
    ResourceKey, Row, TransactionMode, global_registry,
};
pub use executor::{SerializedExecutor, TaskExecutor, TaskHandle, WorkerState};
pub use generator::{Generator, GeneratorRegistry, global_generators};
pub use models::{ColumnDefault, TableColumn, TableRecord, TableSchema, Value, Values};
pub use predicate::{CompareOp, Expr, Filter, Predicate, field, lit};
pub use table::{KeyedTable, MemoryTable, RecordStream, SqliteTable, Table};

/// Error type for queuelite operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `NotReady` | Work submitted to a stopped executor, CRUD on a stopped table |
/// | `ResourceClosed` | Cursor used after its connection manager stopped |
/// | `ConstraintViolation` | Non-nullable column left empty, unknown generator, rejected codec value |
/// | `DuplicateIdentity` | An update or insert collides with another record's identity |
/// | `ResourceError` | `SQLite` or I/O failure, malformed statement |
/// | `InvalidInput` | Unknown column, wrong parameter count, malformed schema |
/// | `TaskFailed` | A submitted task panicked or could not be joined |
#[derive(Debug, ThisError)]
pub enum Error {
    /// The executor or table is not running.
    ///
    /// Raised when:
    /// - A closure is submitted to a stopped [`SerializedExecutor`]
    /// - Any [`Table`] operation is called before `start()` or after `stop()`
    #[error("not ready: {0}")]
    NotReady(String),

    /// A cursor or connection was used after its manager stopped.
    #[error("resource closed: {0}")]
    ResourceClosed(String),

    /// A column constraint was violated.
    ///
    /// Raised when:
    /// - A non-nullable column has no value, default, or generator
    /// - A column default references a generator that is not registered
    /// - A codec rejects a value for its column type
    /// - `SQLite` reports a NOT NULL or CHECK failure
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// A record's identity collides with a different stored record.
    #[error("duplicate identity: {0}")]
    DuplicateIdentity(String),

    /// The underlying blocking resource failed.
    ///
    /// Raised when:
    /// - `SQLite` cannot open the database or run a statement
    /// - Filesystem I/O fails (config, log files, database files)
    /// - The worker thread cannot be spawned
    #[error("operation '{operation}' failed: {cause}")]
    ResourceError {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A submitted task panicked or its join failed.
    #[error("task failed: {0}")]
    TaskFailed(String),
}

impl Error {
    /// Builds a [`Error::ResourceError`] from an operation name and any displayable cause.
    pub fn resource(operation: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::ResourceError {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for queuelite operations.
pub type Result<T> = std::result::Result<T, Error>;
