//! Configuration management.
//!
//! Configuration comes from three layers, later layers winning:
//!
//! 1. Built-in defaults
//! 2. A TOML file (`load_from_file`, or the first file found by `load_default`)
//! 3. `QUEUELITE_*` environment variables
//!
//! ```toml
//! [connection]
//! busy_timeout_ms = 5000
//! journal_mode = "WAL"
//! synchronous = "NORMAL"
//! cached_statements = 128
//! transaction_mode = "deferred"
//!
//! [logging]
//! filter = "queuelite=debug"
//! format = "json"
//! file = "/var/log/queuelite.log"
//! ```

use crate::connection::TransactionMode;
use crate::observability::LogFormat;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable overriding [`ConnectionSettings::busy_timeout_ms`].
pub const ENV_BUSY_TIMEOUT_MS: &str = "QUEUELITE_BUSY_TIMEOUT_MS";
/// Environment variable overriding [`ConnectionSettings::journal_mode`].
pub const ENV_JOURNAL_MODE: &str = "QUEUELITE_JOURNAL_MODE";
/// Environment variable overriding [`ConnectionSettings::synchronous`].
pub const ENV_SYNCHRONOUS: &str = "QUEUELITE_SYNCHRONOUS";
/// Environment variable overriding [`ConnectionSettings::cached_statements`].
pub const ENV_CACHED_STATEMENTS: &str = "QUEUELITE_CACHED_STATEMENTS";
/// Environment variable overriding [`ConnectionSettings::transaction_mode`].
pub const ENV_TRANSACTION_MODE: &str = "QUEUELITE_TRANSACTION_MODE";
/// Environment variable overriding [`LoggingSettings::filter`].
pub const ENV_LOG: &str = "QUEUELITE_LOG";
/// Environment variable overriding [`LoggingSettings::format`].
pub const ENV_LOG_FORMAT: &str = "QUEUELITE_LOG_FORMAT";

/// Main configuration for queuelite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueliteConfig {
    /// Defaults applied to new database connections.
    pub connection: ConnectionSettings,
    /// Logging subscriber settings.
    pub logging: LoggingSettings,
}

/// Open parameters shared by every connection built from settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// How long `SQLite` waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    /// `PRAGMA journal_mode` for file databases.
    pub journal_mode: String,
    /// `PRAGMA synchronous`.
    pub synchronous: String,
    /// Capacity of the prepared statement cache.
    pub cached_statements: usize,
    /// How write statements are wrapped in transactions.
    pub transaction_mode: TransactionMode,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            cached_statements: 128,
            transaction_mode: TransactionMode::Deferred,
        }
    }
}

/// Logging subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    /// `EnvFilter` directive string.
    pub filter: String,
    /// Output format.
    pub format: LogFormat,
    /// Optional log file; stderr when unset.
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Connection section.
    pub connection: Option<ConfigFileConnection>,
    /// Logging section.
    pub logging: Option<ConfigFileLogging>,
}

/// `[connection]` section in the config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileConnection {
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: Option<u64>,
    /// Journal mode.
    pub journal_mode: Option<String>,
    /// Synchronous level.
    pub synchronous: Option<String>,
    /// Statement cache capacity.
    pub cached_statements: Option<usize>,
    /// Transaction mode name.
    pub transaction_mode: Option<String>,
}

/// `[logging]` section in the config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileLogging {
    /// Filter directives.
    pub filter: Option<String>,
    /// `pretty` or `json`.
    pub format: Option<String>,
    /// Log file path.
    pub file: Option<String>,
}

impl QueueliteConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceError`] if the file cannot be read or parsed,
    /// and [`Error::InvalidInput`] for an unknown transaction mode or log format.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| Error::resource("read_config_file", e))?;
        Self::parse_toml(&contents)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Same as [`QueueliteConfig::load_from_file`], minus the I/O.
    pub fn parse_toml(contents: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| Error::resource("parse_config_file", e))?;
        Self::from_config_file(file)
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the following paths in order:
    /// 1. Platform-specific config dir (`~/Library/Application Support/queuelite/` on macOS)
    /// 2. XDG config dir (`~/.config/queuelite/` for Unix compatibility)
    ///
    /// Returns default configuration if no config file is found. Environment
    /// overrides are not applied; see [`QueueliteConfig::with_env_overrides`].
    #[must_use]
    pub fn load_default() -> Self {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default();
        };

        let candidates = [
            base_dirs.config_dir().join("queuelite").join("config.toml"),
            base_dirs
                .home_dir()
                .join(".config")
                .join("queuelite")
                .join("config.toml"),
        ];
        for path in candidates.iter().filter(|p| p.exists()) {
            match Self::load_from_file(path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config file");
                },
            }
        }

        Self::default()
    }

    /// Applies `QUEUELITE_*` variables from the process environment.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    /// Applies overrides from an arbitrary key lookup.
    ///
    /// Values that fail to parse are logged and ignored so a typo in one
    /// variable never discards the rest of the configuration.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_BUSY_TIMEOUT_MS) {
            match raw.trim().parse() {
                Ok(ms) => self.connection.busy_timeout_ms = ms,
                Err(_) => warn_unparsable(ENV_BUSY_TIMEOUT_MS, &raw),
            }
        }
        if let Some(raw) = lookup(ENV_JOURNAL_MODE) {
            self.connection.journal_mode = raw.trim().to_uppercase();
        }
        if let Some(raw) = lookup(ENV_SYNCHRONOUS) {
            self.connection.synchronous = raw.trim().to_uppercase();
        }
        if let Some(raw) = lookup(ENV_CACHED_STATEMENTS) {
            match raw.trim().parse() {
                Ok(n) => self.connection.cached_statements = n,
                Err(_) => warn_unparsable(ENV_CACHED_STATEMENTS, &raw),
            }
        }
        if let Some(raw) = lookup(ENV_TRANSACTION_MODE) {
            match raw.parse() {
                Ok(mode) => self.connection.transaction_mode = mode,
                Err(_) => warn_unparsable(ENV_TRANSACTION_MODE, &raw),
            }
        }
        if let Some(raw) = lookup(ENV_LOG) {
            self.logging.filter = raw;
        }
        if let Some(raw) = lookup(ENV_LOG_FORMAT) {
            match raw.parse() {
                Ok(format) => self.logging.format = format,
                Err(_) => warn_unparsable(ENV_LOG_FORMAT, &raw),
            }
        }
    }

    fn from_config_file(file: ConfigFile) -> Result<Self> {
        let mut config = Self::default();

        if let Some(connection) = file.connection {
            if let Some(ms) = connection.busy_timeout_ms {
                config.connection.busy_timeout_ms = ms;
            }
            if let Some(mode) = connection.journal_mode {
                config.connection.journal_mode = mode.to_uppercase();
            }
            if let Some(level) = connection.synchronous {
                config.connection.synchronous = level.to_uppercase();
            }
            if let Some(n) = connection.cached_statements {
                config.connection.cached_statements = n;
            }
            if let Some(mode) = connection.transaction_mode {
                config.connection.transaction_mode = mode.parse()?;
            }
        }
        if let Some(logging) = file.logging {
            if let Some(filter) = logging.filter {
                config.logging.filter = filter;
            }
            if let Some(format) = logging.format {
                config.logging.format = format.parse()?;
            }
            config.logging.file = logging.file.map(PathBuf::from);
        }

        Ok(config)
    }
}

fn warn_unparsable(variable: &str, value: &str) {
    tracing::warn!(variable, value, "ignoring unparsable environment override");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = QueueliteConfig::new();
        assert_eq!(config.connection.busy_timeout_ms, 5000);
        assert_eq!(config.connection.journal_mode, "WAL");
        assert_eq!(config.connection.synchronous, "NORMAL");
        assert_eq!(config.connection.cached_statements, 128);
        assert_eq!(config.connection.transaction_mode, TransactionMode::Deferred);
        assert_eq!(config.logging.filter, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn test_parse_toml_sections() {
        let config = QueueliteConfig::parse_toml(
            r#"
            [connection]
            busy_timeout_ms = 250
            journal_mode = "delete"
            transaction_mode = "immediate"

            [logging]
            format = "json"
            file = "/tmp/queuelite.log"
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.busy_timeout_ms, 250);
        assert_eq!(config.connection.journal_mode, "DELETE");
        assert_eq!(config.connection.synchronous, "NORMAL");
        assert_eq!(config.connection.transaction_mode, TransactionMode::Immediate);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/queuelite.log")));
    }

    #[test]
    fn test_parse_toml_rejects_unknown_mode() {
        let result = QueueliteConfig::parse_toml("[connection]\ntransaction_mode = \"sometimes\"\n");
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_parse_toml_rejects_unknown_key() {
        let result = QueueliteConfig::parse_toml("[connection]\npool_size = 4\n");
        assert!(matches!(result, Err(Error::ResourceError { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[connection]\ncached_statements = 16\n").unwrap();

        let config = QueueliteConfig::load_from_file(&path).unwrap();
        assert_eq!(config.connection.cached_statements, 16);

        let missing = QueueliteConfig::load_from_file(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(Error::ResourceError { .. })));
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut config = QueueliteConfig::parse_toml("[connection]\nbusy_timeout_ms = 10\n").unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_BUSY_TIMEOUT_MS, "900"),
            (ENV_SYNCHRONOUS, "full"),
            (ENV_TRANSACTION_MODE, "autocommit"),
            (ENV_LOG, "queuelite=trace"),
            (ENV_LOG_FORMAT, "json"),
        ]);
        config.apply_overrides(|key| env.get(key).map(ToString::to_string));

        assert_eq!(config.connection.busy_timeout_ms, 900);
        assert_eq!(config.connection.synchronous, "FULL");
        assert_eq!(config.connection.transaction_mode, TransactionMode::Autocommit);
        assert_eq!(config.logging.filter, "queuelite=trace");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_unparsable_override_is_ignored() {
        let mut config = QueueliteConfig::new();
        config.apply_overrides(|key| (key == ENV_CACHED_STATEMENTS).then(|| "many".to_string()));
        assert_eq!(config.connection.cached_statements, 128);
    }
}
