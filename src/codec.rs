//! Value conversion at the storage boundary, keyed by declared column type.
//!
//! A codec turns the value an application works with into the value that is
//! stored (`encode`) and back (`decode`). Codecs can chain: a codec whose
//! storage type is itself a codec type hands its output on, so a `SET`
//! column is normalized by the `SET` codec and then by the `JSON` codec
//! before it reaches the database as `TEXT`. Type names without a codec pass
//! values through untouched, as does `NULL`.

use crate::executor::{acquire_read, acquire_write};
use crate::models::{TableSchema, Value};
use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

/// Longest codec chain followed before giving up.
pub const MAX_CHAIN_DEPTH: usize = 8;

type CodecFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// A pair of conversions registered for one or more type names.
#[derive(Clone)]
pub struct Codec {
    name: String,
    typenames: Vec<String>,
    storage: Option<String>,
    encode: CodecFn,
    decode: CodecFn,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("name", &self.name)
            .field("typenames", &self.typenames)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl Codec {
    /// A codec for `typenames` whose output is stored directly.
    pub fn new<I, S, E, D>(name: impl Into<String>, typenames: I, encode: E, decode: D) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        E: Fn(Value) -> Result<Value> + Send + Sync + 'static,
        D: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            typenames: typenames.into_iter().map(|t| normalize(t.as_ref())).collect(),
            storage: None,
            encode: Arc::new(encode),
            decode: Arc::new(decode),
        }
    }

    /// Passes encoded values on to the codec registered for `typename`.
    #[must_use]
    pub fn stored_as(mut self, typename: &str) -> Self {
        self.storage = Some(normalize(typename));
        self
    }

    /// Codec name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized type names this codec serves.
    pub fn typenames(&self) -> &[String] {
        &self.typenames
    }

    /// Type name of the encoded form, when it is itself a codec type.
    pub fn storage(&self) -> Option<&str> {
        self.storage.as_deref()
    }
}

fn normalize(typename: &str) -> String {
    typename.trim().to_uppercase()
}

/// Codecs by type name.
#[derive(Debug, Default)]
pub struct CodecRegistry {
    codecs: RwLock<HashMap<String, Codec>>,
}

impl CodecRegistry {
    /// An empty registry: every value passes through.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `BOOL`, `JSON`, `SET`, `LIST`, `DATETIME`, and `DATE`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for codec in builtin_codecs() {
            registry.register(codec);
        }
        registry
    }

    /// Registers `codec` for each of its type names, replacing earlier codecs.
    pub fn register(&self, codec: Codec) {
        let mut codecs = acquire_write(&self.codecs);
        for typename in &codec.typenames {
            codecs.insert(typename.clone(), codec.clone());
        }
    }

    /// The codec serving `typename`.
    ///
    /// Parameterized types such as `VARCHAR(20)` fall back to their base name.
    pub fn resolve(&self, typename: &str) -> Option<Codec> {
        let key = normalize(typename);
        let codecs = acquire_read(&self.codecs);
        codecs
            .get(&key)
            .or_else(|| {
                key.split_once('(')
                    .and_then(|(base, _)| codecs.get(base.trim_end()))
            })
            .cloned()
    }

    fn chain(&self, typename: &str) -> Result<Vec<Codec>> {
        let mut chain = Vec::new();
        let mut next = self.resolve(typename);
        while let Some(codec) = next {
            if chain.len() == MAX_CHAIN_DEPTH {
                return Err(Error::InvalidInput(format!(
                    "codec chain for '{typename}' exceeds {MAX_CHAIN_DEPTH} steps"
                )));
            }
            next = codec.storage.as_deref().and_then(|t| self.resolve(t));
            chain.push(codec);
        }
        Ok(chain)
    }

    /// Converts an application value for storage in a `typename` column.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConstraintViolation`] if a codec rejects the value and
    /// [`Error::InvalidInput`] for a chain deeper than [`MAX_CHAIN_DEPTH`].
    pub fn encode(&self, typename: &str, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(value);
        }
        self.chain(typename)?
            .iter()
            .try_fold(value, |value, codec| (codec.encode)(value))
    }

    /// Converts a stored value back for a `typename` column.
    ///
    /// # Errors
    ///
    /// Same as [`CodecRegistry::encode`].
    pub fn decode(&self, typename: &str, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(value);
        }
        self.chain(typename)?
            .iter()
            .rev()
            .try_fold(value, |value, codec| (codec.decode)(value))
    }

    /// Encodes a full row in column order.
    pub fn encode_row(&self, schema: &TableSchema, row: &[Value]) -> Result<Vec<Value>> {
        schema
            .columns()
            .iter()
            .zip(row)
            .map(|(column, value)| self.encode(&column.typename, value.clone()))
            .collect()
    }

    /// Decodes a full row in column order.
    pub fn decode_row(&self, schema: &TableSchema, row: Vec<Value>) -> Result<Vec<Value>> {
        schema
            .columns()
            .iter()
            .zip(row)
            .map(|(column, value)| self.decode(&column.typename, value))
            .collect()
    }
}

static GLOBAL_CODECS: OnceLock<Arc<CodecRegistry>> = OnceLock::new();

/// Returns the process-wide codec registry, with builtins, initializing it on first use.
#[must_use]
pub fn global_codecs() -> &'static Arc<CodecRegistry> {
    GLOBAL_CODECS.get_or_init(|| Arc::new(CodecRegistry::with_builtins()))
}

fn rejected(codec: &str, value: &Value) -> Error {
    Error::ConstraintViolation(format!(
        "{codec} codec cannot convert {} value '{value}'",
        value.kind()
    ))
}

fn builtin_codecs() -> Vec<Codec> {
    vec![
        Codec::new("bool", ["BOOL", "BOOLEAN"], to_bool, to_bool),
        Codec::new("json", ["JSON"], to_json, to_json),
        Codec::new("set", ["SET"], to_set, to_set).stored_as("JSON"),
        Codec::new("list", ["LIST"], to_list, to_list).stored_as("JSON"),
        Codec::new("datetime", ["DATETIME", "TIMESTAMP"], encode_datetime, decode_datetime),
        Codec::new("date", ["DATE"], to_date, to_date),
    ]
}

fn to_bool(value: Value) -> Result<Value> {
    let truth = match &value {
        Value::Integer(i) => *i != 0,
        Value::Real(r) => *r != 0.0,
        Value::Text(s) => match s.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => return Err(rejected("bool", &value)),
        },
        _ => return Err(rejected("bool", &value)),
    };
    Ok(Value::from(truth))
}

fn parse_json(value: &Value) -> Result<serde_json::Value> {
    match value {
        Value::Text(s) => serde_json::from_str(s).map_err(|_| rejected("json", value)),
        Value::Integer(i) => Ok(serde_json::Value::from(*i)),
        Value::Real(r) => Ok(serde_json::Value::from(*r)),
        _ => Err(rejected("json", value)),
    }
}

fn json_text(json: &serde_json::Value) -> Result<Value> {
    serde_json::to_string(json)
        .map(Value::Text)
        .map_err(|e| Error::ConstraintViolation(format!("json codec: {e}")))
}

fn to_json(value: Value) -> Result<Value> {
    json_text(&parse_json(&value)?)
}

fn json_array(codec: &str, value: &Value) -> Result<Vec<serde_json::Value>> {
    match parse_json(value) {
        Ok(serde_json::Value::Array(items)) => Ok(items),
        _ => Err(rejected(codec, value)),
    }
}

fn to_list(value: Value) -> Result<Value> {
    json_text(&serde_json::Value::Array(json_array("list", &value)?))
}

fn to_set(value: Value) -> Result<Value> {
    let mut items: Vec<(String, serde_json::Value)> = json_array("set", &value)?
        .into_iter()
        .map(|item| (item.to_string(), item))
        .collect();
    items.sort_by(|a, b| a.0.cmp(&b.0));
    items.dedup_by(|a, b| a.0 == b.0);
    json_text(&serde_json::Value::Array(items.into_iter().map(|(_, item)| item).collect()))
}

const STORED_DATETIME: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn parse_datetime(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::Text(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| {
                NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S%.f")
                    .map(|naive| Utc.from_utc_datetime(&naive))
            })
            .map_err(|_| rejected("datetime", value)),
        Value::Integer(secs) => Utc
            .timestamp_opt(*secs, 0)
            .single()
            .ok_or_else(|| rejected("datetime", value)),
        _ => Err(rejected("datetime", value)),
    }
}

fn encode_datetime(value: Value) -> Result<Value> {
    Ok(Value::Text(parse_datetime(&value)?.format(STORED_DATETIME).to_string()))
}

fn decode_datetime(value: Value) -> Result<Value> {
    Ok(Value::Text(
        parse_datetime(&value)?.to_rfc3339_opts(SecondsFormat::Micros, true),
    ))
}

fn to_date(value: Value) -> Result<Value> {
    let date = match &value {
        Value::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .or_else(|_| parse_datetime(&value).map(|dt| dt.date_naive()))
            .map_err(|_| rejected("date", &value))?,
        _ => return Err(rejected("date", &value)),
    };
    Ok(Value::Text(date.format("%Y-%m-%d").to_string()))
}
