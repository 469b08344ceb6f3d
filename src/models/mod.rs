//! Data models for queuelite.
//!
//! [`Value`] is the unit of storage, [`TableColumn`] and [`TableSchema`]
//! describe a table, and [`TableRecord`] is one immutable row of it.

mod column;
mod record;
mod value;

pub use column::{ColumnDefault, TableColumn, TableSchema, TableSchemaBuilder};
pub use record::{TableRecord, Values};
pub use value::Value;
