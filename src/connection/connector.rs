//! Open parameters for one `SQLite` database and the identity derived from them.

use crate::config::ConnectionSettings;
use crate::{Error, Result};
use rusqlite::{Connection, OpenFlags};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Where a connection points.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Database {
    /// A database file. Created on first open unless the connector is read-only.
    File(PathBuf),
    /// A private in-memory database.
    Memory,
}

impl Database {
    /// A file database at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }
}

impl From<&str> for Database {
    fn from(value: &str) -> Self {
        if value == MEMORY_KEY {
            Self::Memory
        } else {
            Self::File(PathBuf::from(value))
        }
    }
}

impl From<&Path> for Database {
    fn from(value: &Path) -> Self {
        Self::File(value.to_path_buf())
    }
}

impl From<PathBuf> for Database {
    fn from(value: PathBuf) -> Self {
        Self::File(value)
    }
}

const MEMORY_KEY: &str = ":memory:";

/// How write statements are grouped into transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransactionMode {
    /// Every statement commits on its own.
    Autocommit,
    /// `BEGIN DEFERRED` before the first write outside a transaction.
    #[default]
    Deferred,
    /// `BEGIN IMMEDIATE` before the first write outside a transaction.
    Immediate,
    /// `BEGIN EXCLUSIVE` before the first write outside a transaction.
    Exclusive,
}

impl TransactionMode {
    /// The statement that opens an implicit transaction, if any.
    #[must_use]
    pub const fn begin_statement(self) -> Option<&'static str> {
        match self {
            Self::Autocommit => None,
            Self::Deferred => Some("BEGIN DEFERRED"),
            Self::Immediate => Some("BEGIN IMMEDIATE"),
            Self::Exclusive => Some("BEGIN EXCLUSIVE"),
        }
    }

    /// Lower-case name, as used in config files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Autocommit => "autocommit",
            Self::Deferred => "deferred",
            Self::Immediate => "immediate",
            Self::Exclusive => "exclusive",
        }
    }
}

impl FromStr for TransactionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "autocommit" | "none" => Ok(Self::Autocommit),
            "deferred" | "" => Ok(Self::Deferred),
            "immediate" => Ok(Self::Immediate),
            "exclusive" => Ok(Self::Exclusive),
            other => Err(Error::InvalidInput(format!(
                "unknown transaction mode '{other}'"
            ))),
        }
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a physical database: at most one [`ConnectionManager`] exists
/// per key in a registry.
///
/// [`ConnectionManager`]: super::ConnectionManager
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// The key of the in-memory database.
    #[must_use]
    pub fn memory() -> Self {
        Self(MEMORY_KEY.to_string())
    }

    /// Returns the key as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to open and configure a connection.
///
/// # Example
///
/// ```rust,ignore
/// use queuelite::{Connector, TransactionMode};
/// use std::time::Duration;
///
/// let connector = Connector::file("app.db")
///     .busy_timeout(Duration::from_secs(2))
///     .transaction_mode(TransactionMode::Immediate);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connector {
    database: Database,
    busy_timeout: Duration,
    journal_mode: Option<String>,
    synchronous: Option<String>,
    cached_statements: usize,
    read_only: bool,
    uri: bool,
    transaction_mode: TransactionMode,
}

impl Connector {
    /// A connector with default settings for `database`.
    pub fn new(database: impl Into<Database>) -> Self {
        Self::from_settings(database, &ConnectionSettings::default())
    }

    /// A connector for a database file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(Database::File(path.into()))
    }

    /// A connector for an in-memory database.
    #[must_use]
    pub fn memory() -> Self {
        Self::new(Database::Memory)
    }

    /// A connector for `database` using configured settings.
    pub fn from_settings(database: impl Into<Database>, settings: &ConnectionSettings) -> Self {
        let non_empty = |s: &str| (!s.trim().is_empty()).then(|| s.trim().to_uppercase());
        Self {
            database: database.into(),
            busy_timeout: Duration::from_millis(settings.busy_timeout_ms),
            journal_mode: non_empty(&settings.journal_mode),
            synchronous: non_empty(&settings.synchronous),
            cached_statements: settings.cached_statements,
            read_only: false,
            uri: false,
            transaction_mode: settings.transaction_mode,
        }
    }

    /// Sets the busy timeout.
    #[must_use]
    pub const fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Sets `PRAGMA journal_mode`; `None` leaves the database default.
    #[must_use]
    pub fn journal_mode(mut self, mode: Option<&str>) -> Self {
        self.journal_mode = mode.map(str::to_uppercase);
        self
    }

    /// Sets `PRAGMA synchronous`; `None` leaves the database default.
    #[must_use]
    pub fn synchronous(mut self, level: Option<&str>) -> Self {
        self.synchronous = level.map(str::to_uppercase);
        self
    }

    /// Sets the prepared statement cache capacity.
    #[must_use]
    pub const fn cached_statements(mut self, capacity: usize) -> Self {
        self.cached_statements = capacity;
        self
    }

    /// Opens the database read-only.
    #[must_use]
    pub const fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Interprets the file path as an `SQLite` URI.
    #[must_use]
    pub const fn uri(mut self, uri: bool) -> Self {
        self.uri = uri;
        self
    }

    /// Sets the transaction mode.
    #[must_use]
    pub const fn transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }

    /// The target database.
    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.database
    }

    /// The configured transaction mode.
    #[must_use]
    pub const fn mode(&self) -> TransactionMode {
        self.transaction_mode
    }

    /// Whether the connection is opened read-only.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Derives the registry key.
    ///
    /// File paths are canonicalized when the file exists and made absolute
    /// otherwise, so `./db.sqlite` and its absolute spelling share a key. URI
    /// connectors use the URI text verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceError`] if the current directory cannot be
    /// determined for a relative path.
    pub fn resource_key(&self) -> Result<ResourceKey> {
        match &self.database {
            Database::Memory => Ok(ResourceKey::memory()),
            Database::File(path) if self.uri => Ok(ResourceKey(path.to_string_lossy().into_owned())),
            Database::File(path) => {
                let resolved = match path.canonicalize() {
                    Ok(canonical) => canonical,
                    Err(_) => std::path::absolute(path)
                        .map_err(|e| Error::resource("resolve_database_path", e))?,
                };
                Ok(ResourceKey(resolved.to_string_lossy().into_owned()))
            },
        }
    }

    /// Opens and configures a connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceError`] if the database cannot be opened or a
    /// pragma is rejected.
    pub fn open(&self) -> Result<Connection> {
        let mut flags = OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if self.read_only {
            flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
        } else {
            flags |= OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= OpenFlags::SQLITE_OPEN_URI;
        }

        let conn = match &self.database {
            Database::Memory => Connection::open_in_memory_with_flags(flags),
            Database::File(path) => Connection::open_with_flags(path, flags),
        }
        .map_err(|e| Error::resource("open_sqlite", e))?;

        self.configure(&conn)?;
        Ok(conn)
    }

    /// Applies timeouts, pragmas, and cache size to an open connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceError`] if a pragma is rejected.
    pub fn configure(&self, conn: &Connection) -> Result<()> {
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| Error::resource("set_busy_timeout", e))?;
        conn.set_prepared_statement_cache_capacity(self.cached_statements);

        // journal_mode answers with the resulting mode, so it has to be read
        // back. In-memory and read-only databases keep their own mode.
        if let (Some(mode), Database::File(_), false) =
            (&self.journal_mode, &self.database, self.read_only)
        {
            let applied: String = conn
                .pragma_update_and_check(None, "journal_mode", mode, |row| row.get(0))
                .map_err(|e| Error::resource("set_journal_mode", e))?;
            if !applied.eq_ignore_ascii_case(mode) {
                tracing::debug!(requested = %mode, applied = %applied, "journal mode not applied");
            }
        }
        if let Some(level) = &self.synchronous {
            conn.pragma_update(None, "synchronous", level)
                .map_err(|e| Error::resource("set_synchronous", e))?;
        }
        Ok(())
    }
}
