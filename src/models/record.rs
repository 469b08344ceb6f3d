//! Immutable records and the value sets used to build or change them.

use super::{ColumnDefault, TableSchema, Value};
use crate::generator::GeneratorRegistry;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Column values by name, in the order they were set.
///
/// ```rust,ignore
/// let values = Values::new().set("id", 1).set("name", "Alice");
/// let same: Values = [("id", Value::from(1)), ("name", Value::from("Alice"))].into();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Values(Vec<(String, Value)>);

impl Values {
    /// An empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Sets `name`, replacing an earlier value for the same column.
    #[must_use]
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// In-place form of [`Values::set`].
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    /// The value set for `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Column names in the order they were set.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    /// `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of columns set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Values {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut values = Self::new();
        for (k, v) in iter {
            values.insert(k, v);
        }
        values
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for Values {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl IntoIterator for Values {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// One row of a table: values aligned to the table's schema.
///
/// Records are immutable and cheap to clone. Equality and hashing use only the
/// primary/unique columns when the schema has any, otherwise every column, so
/// a set of records behaves like the table's own uniqueness rules.
#[derive(Clone)]
pub struct TableRecord {
    schema: Arc<TableSchema>,
    values: Arc<[Value]>,
}

impl TableRecord {
    /// Wraps a full row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the row width does not match the schema.
    pub fn from_row(schema: Arc<TableSchema>, values: Vec<Value>) -> Result<Self> {
        if values.len() != schema.width() {
            return Err(Error::InvalidInput(format!(
                "table '{}' has {} columns, row has {}",
                schema.name(),
                schema.width(),
                values.len()
            )));
        }
        Ok(Self {
            schema,
            values: values.into(),
        })
    }

    /// Builds a record for insertion.
    ///
    /// Each column takes, in order of preference: the supplied value, a fresh
    /// value from its generator, its literal default, or `NULL` if nullable.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if `values` names a column the schema lacks
    /// - [`Error::ConstraintViolation`] if a non-nullable column ends up `NULL`,
    ///   or its generator is not registered
    pub async fn build(
        schema: &Arc<TableSchema>,
        values: Values,
        generators: &GeneratorRegistry,
    ) -> Result<Self> {
        let mut supplied: HashMap<String, Value> = HashMap::with_capacity(values.len());
        for (name, value) in values {
            if schema.position(&name).is_none() {
                return Err(unknown_column(schema, &name));
            }
            supplied.insert(name, value);
        }

        let mut row = Vec::with_capacity(schema.width());
        for column in schema.columns() {
            let value = match supplied.remove(&column.name) {
                Some(value) => value,
                None => match &column.default {
                    ColumnDefault::Generated(generator) => generators.produce(generator).await?,
                    ColumnDefault::Value(value) => value.clone(),
                    ColumnDefault::None => Value::Null,
                },
            };
            if value.is_null() && !column.nullable {
                return Err(Error::ConstraintViolation(format!(
                    "column '{}.{}' is not nullable and has no value",
                    schema.name(),
                    column.name
                )));
            }
            row.push(value);
        }
        Self::from_row(Arc::clone(schema), row)
    }

    /// The schema this record follows.
    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Value at column position `index`.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the column called `name`.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.schema.position(name).map(|i| &self.values[i])
    }

    /// All values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// `(column, value)` pairs in column order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.schema
            .columns()
            .iter()
            .map(|c| c.name.as_str())
            .zip(self.values.iter())
    }

    /// The record as a name-to-value map.
    pub fn to_map(&self) -> HashMap<String, Value> {
        self.fields()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    /// Values of the identity columns, or of every column without any.
    pub fn identity(&self) -> Vec<&Value> {
        if self.schema.has_identity() {
            self.schema.identity().iter().map(|&i| &self.values[i]).collect()
        } else {
            self.values.iter().collect()
        }
    }

    /// Returns a copy with `changes` applied.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for a column the schema lacks
    /// - [`Error::ConstraintViolation`] for `NULL` in a non-nullable column
    pub fn replace(&self, changes: &Values) -> Result<Self> {
        let mut row = self.values.to_vec();
        for (name, value) in changes.iter() {
            let index = self
                .schema
                .position(name)
                .ok_or_else(|| unknown_column(&self.schema, name))?;
            if value.is_null() && !self.schema.columns()[index].nullable {
                return Err(Error::ConstraintViolation(format!(
                    "column '{}.{name}' is not nullable",
                    self.schema.name()
                )));
            }
            row[index] = value.clone();
        }
        Self::from_row(Arc::clone(&self.schema), row)
    }
}

fn unknown_column(schema: &TableSchema, name: &str) -> Error {
    Error::InvalidInput(format!("table '{}' has no column '{name}'", schema.name()))
}

impl PartialEq for TableRecord {
    fn eq(&self, other: &Self) -> bool {
        (Arc::ptr_eq(&self.schema, &other.schema) || self.schema.name() == other.schema.name())
            && self.identity() == other.identity()
    }
}

impl Eq for TableRecord {}

impl Hash for TableRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for value in self.identity() {
            value.hash(state);
        }
    }
}

impl fmt::Debug for TableRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.schema.name())?;
        f.debug_map().entries(self.fields()).finish()
    }
}
