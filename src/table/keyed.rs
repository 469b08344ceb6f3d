//! Key-value view over a table.

use super::Table;
use crate::models::{TableRecord, Values};
use crate::predicate::{Filter, field};
use crate::{Error, Result, Value};

/// Addresses records of a [`Table`] by the value of one key column.
///
/// ```rust,ignore
/// let users = KeyedTable::new(table, "id")?;
/// users.add(7, Values::new().set("name", "Ada"), false).await?;
/// users.set(7, Values::new().set("name", "Ada L.")).await?;
/// let ada = users.pop(7).await?;
/// ```
#[derive(Debug)]
pub struct KeyedTable<T> {
    table: T,
    key: String,
}

impl<T: Table> KeyedTable<T> {
    /// Wraps `table`, keyed by column `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the table has no such column.
    pub fn new(table: T, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if table.schema().position(&key).is_none() {
            return Err(Error::InvalidInput(format!(
                "table '{}' has no key column '{key}'",
                table.name()
            )));
        }
        Ok(Self { table, key })
    }

    /// The wrapped table.
    pub const fn table(&self) -> &T {
        &self.table
    }

    /// Name of the key column.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Unwraps the table.
    pub fn into_inner(self) -> T {
        self.table
    }

    fn matching(&self, key: impl Into<Value>) -> Filter {
        field(self.key.as_str()).eq(key).into()
    }

    /// Whether a record with this key is stored.
    pub async fn contains(&self, key: impl Into<Value>) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// The record with this key.
    pub async fn get(&self, key: impl Into<Value>) -> Result<Option<TableRecord>> {
        self.table.select_one(self.matching(key)).await
    }

    /// Applies `changes` to the record with this key; `None` if there is none.
    pub async fn set(&self, key: impl Into<Value>, changes: Values) -> Result<Option<TableRecord>> {
        self.table.update_one(self.matching(key), changes).await
    }

    /// Inserts a record under this key; the key overrides any key in `values`.
    pub async fn add(
        &self,
        key: impl Into<Value>,
        values: Values,
        ignore_existing: bool,
    ) -> Result<TableRecord> {
        self.table
            .insert(values.set(self.key.as_str(), key), ignore_existing)
            .await
    }

    /// Removes the record with this key; returns whether one was stored.
    pub async fn remove(&self, key: impl Into<Value>) -> Result<bool> {
        Ok(self.pop(key).await?.is_some())
    }

    /// Removes and returns the record with this key.
    pub async fn pop(&self, key: impl Into<Value>) -> Result<Option<TableRecord>> {
        self.table.delete_one(self.matching(key)).await
    }
}
