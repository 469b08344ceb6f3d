//! Serialized `SQLite` connections.
//!
//! A [`ConnectionManager`] owns one connection on one worker thread; a
//! [`ConnectionRegistry`] guarantees there is only one manager per database;
//! a [`CursorManager`] reads the rows a statement produced, through the same
//! worker.

mod connector;
mod cursor;
mod manager;
mod registry;

pub use connector::{Connector, Database, ResourceKey, TransactionMode};
pub use cursor::CursorManager;
pub use manager::{ConnectionManager, ConnectionState, Params, Row};
pub(crate) use manager::{WriteStatement, map_sqlite_error};
pub use registry::{ConnectionRegistry, global_registry};
