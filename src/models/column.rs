//! Column definitions and the fixed, ordered schema of a table.

use super::Value;
use crate::table::sql::{GENERATED_PREFIX, quote_identifier, render_literal};
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// What fills a column that an insert leaves out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ColumnDefault {
    /// Nothing: nullable columns become `NULL`, others must be supplied.
    #[default]
    None,
    /// A literal value.
    Value(Value),
    /// A fresh value from the named generator, produced on every insert.
    Generated(String),
}

/// One column of a table.
///
/// ```rust,ignore
/// let id = TableColumn::new("id", "TEXT").primary().generated("uuid4");
/// let age = TableColumn::new("age", "INTEGER").default_value(0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    /// Column name.
    pub name: String,
    /// Declared type name; also selects the codec for the column.
    pub typename: String,
    /// Value used when an insert omits the column.
    pub default: ColumnDefault,
    /// Part of the primary key.
    pub primary: bool,
    /// Carries a uniqueness constraint.
    pub unique: bool,
    /// Accepts `NULL`.
    pub nullable: bool,
}

impl TableColumn {
    /// A nullable column with no default.
    pub fn new(name: impl Into<String>, typename: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            typename: typename.into(),
            default: ColumnDefault::None,
            primary: false,
            unique: false,
            nullable: true,
        }
    }

    /// Marks the column as (part of) the primary key.
    #[must_use]
    pub const fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    /// Marks the column unique.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Rejects `NULL`.
    #[must_use]
    pub const fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Fills omitted values with `value`.
    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = ColumnDefault::Value(value.into());
        self
    }

    /// Fills omitted values from the generator registered as `generator`.
    #[must_use]
    pub fn generated(mut self, generator: impl Into<String>) -> Self {
        self.default = ColumnDefault::Generated(generator.into());
        self
    }

    /// Whether the column takes part in record identity.
    pub const fn is_identity(&self) -> bool {
        self.primary || self.unique
    }

    /// Renders the column definition for `CREATE TABLE`.
    ///
    /// Primary keys are rendered at table level by [`TableSchema::to_sql`] so
    /// composite keys work; a lone column definition therefore omits them.
    #[must_use]
    pub fn to_sql(&self) -> String {
        let mut sql = quote_identifier(&self.name);
        if !self.typename.is_empty() {
            let _ = write!(sql, " {}", self.typename);
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        match &self.default {
            ColumnDefault::None => {},
            ColumnDefault::Value(value) => {
                let _ = write!(sql, " DEFAULT {}", render_literal(value));
            },
            ColumnDefault::Generated(name) => {
                let sentinel = Value::Text(format!("{GENERATED_PREFIX}{name}"));
                let _ = write!(sql, " DEFAULT {}", render_literal(&sentinel));
            },
        }
        sql
    }
}

/// Name and ordered columns of a table.
///
/// Built once and shared as `Arc<TableSchema>` by the table and every record
/// it yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    name: String,
    columns: Vec<TableColumn>,
    identity: Vec<usize>,
    positions: HashMap<String, usize>,
}

impl TableSchema {
    /// Starts a schema for table `name`.
    pub fn builder(name: impl Into<String>) -> TableSchemaBuilder {
        TableSchemaBuilder {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Builds a schema from a column list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty table name, no columns, an
    /// empty column name, or a repeated column name.
    pub fn new(name: impl Into<String>, columns: Vec<TableColumn>) -> Result<Arc<Self>> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("table name cannot be empty".to_string()));
        }
        if columns.is_empty() {
            return Err(Error::InvalidInput(format!("table '{name}' has no columns")));
        }
        let mut positions = HashMap::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            if column.name.trim().is_empty() {
                return Err(Error::InvalidInput(format!(
                    "column {i} of table '{name}' has no name"
                )));
            }
            if positions.insert(column.name.clone(), i).is_some() {
                return Err(Error::InvalidInput(format!(
                    "column '{}' appears twice in table '{name}'",
                    column.name
                )));
            }
        }
        let identity = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_identity())
            .map(|(i, _)| i)
            .collect();
        Ok(Arc::new(Self {
            name,
            columns,
            identity,
            positions,
        }))
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Columns in declaration order.
    pub fn columns(&self) -> &[TableColumn] {
        &self.columns
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Position of the column called `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    /// The column called `name`.
    pub fn column(&self, name: &str) -> Option<&TableColumn> {
        self.position(name).map(|i| &self.columns[i])
    }

    /// Positions of the primary/unique columns.
    pub fn identity(&self) -> &[usize] {
        &self.identity
    }

    /// Whether any column is primary or unique.
    pub fn has_identity(&self) -> bool {
        !self.identity.is_empty()
    }

    /// Renders `CREATE TABLE`.
    #[must_use]
    pub fn to_sql(&self, if_not_exists: bool) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(TableColumn::to_sql).collect();
        let primary: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.primary)
            .map(|c| quote_identifier(&c.name))
            .collect();
        if !primary.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", primary.join(", ")));
        }
        format!(
            "CREATE TABLE {}{} ({})",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            quote_identifier(&self.name),
            parts.join(", ")
        )
    }
}

/// Incremental [`TableSchema`] construction.
#[derive(Debug, Clone)]
pub struct TableSchemaBuilder {
    name: String,
    columns: Vec<TableColumn>,
}

impl TableSchemaBuilder {
    /// Appends a column.
    #[must_use]
    pub fn column(mut self, column: TableColumn) -> Self {
        self.columns.push(column);
        self
    }

    /// Appends several columns.
    #[must_use]
    pub fn columns(mut self, columns: impl IntoIterator<Item = TableColumn>) -> Self {
        self.columns.extend(columns);
        self
    }

    /// Validates and freezes the schema.
    ///
    /// # Errors
    ///
    /// See [`TableSchema::new`].
    pub fn build(self) -> Result<Arc<TableSchema>> {
        TableSchema::new(self.name, self.columns)
    }
}
