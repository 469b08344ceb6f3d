//! Cursors over rows produced by a [`ConnectionManager`].

use super::manager::{ConnectionManager, Executed, Row};
use crate::{Error, Result};
use futures_util::stream::{self, BoxStream};
use std::sync::Arc;

/// Rows of one executed statement.
///
/// The statement already ran on the connection worker; its rows wait in a
/// worker-owned buffer. Every fetch is queued on the same worker as all other
/// operations on the database, so advancing a cursor is ordered with respect
/// to writes issued around it.
///
/// A cursor is tied to the worker that produced it. Once the manager stops,
/// every fetch fails with [`Error::ResourceClosed`], even after a restart.
pub struct CursorManager {
    manager: Arc<ConnectionManager>,
    id: Option<u64>,
    columns: Arc<[String]>,
    rows_affected: u64,
    last_insert_rowid: i64,
}

impl std::fmt::Debug for CursorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorManager")
            .field("key", &self.manager.key())
            .field("id", &self.id)
            .field("columns", &self.columns)
            .field("rows_affected", &self.rows_affected)
            .finish_non_exhaustive()
    }
}

impl CursorManager {
    pub(crate) fn new(manager: Arc<ConnectionManager>, executed: Executed) -> Self {
        Self {
            manager,
            id: executed.cursor,
            columns: executed.columns.into(),
            rows_affected: executed.rows_affected,
            last_insert_rowid: executed.last_insert_rowid,
        }
    }

    /// Result column names; empty for statements that return no rows.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows changed by the statement.
    pub const fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// `rowid` of the most recent successful insert on the connection.
    pub const fn last_insert_rowid(&self) -> i64 {
        self.last_insert_rowid
    }

    /// Returns the next row, or `None` once the cursor is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceClosed`] if the manager stopped since this
    /// cursor was produced.
    pub async fn fetch_one(&self) -> Result<Option<Row>> {
        let id = self.id;
        self.manager
            .submit_state(move |state| state.fetch_one(id))
            .await
            .map_err(closed)
    }

    /// Fetches rows with sequence-slice semantics over the remaining rows.
    ///
    /// `start` and `stop` may be negative to count from the end, and an
    /// omitted `stop` means "to the end". Rows skipped by `step` or before
    /// `start` are consumed. When both bounds are non-negative only rows up to
    /// `stop` are consumed; otherwise the cursor is drained.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `step` is zero and
    /// [`Error::ResourceClosed`] if the manager stopped.
    pub async fn fetch(&self, start: isize, stop: Option<isize>, step: usize) -> Result<Vec<Row>> {
        if step == 0 {
            return Err(Error::InvalidInput("slice step cannot be zero".to_string()));
        }
        let limit = match stop {
            Some(stop) if start >= 0 && stop >= 0 => Some(stop.unsigned_abs()),
            _ => None,
        };
        let id = self.id;
        let rows = self
            .manager
            .submit_state(move |state| state.fetch_many(id, limit))
            .await
            .map_err(closed)?;
        Ok(slice(rows, start, stop, step))
    }

    /// Fetches every remaining row.
    pub async fn fetch_all(&self) -> Result<Vec<Row>> {
        self.fetch(0, None, 1).await
    }

    /// Turns the cursor into a stream of rows, one queued fetch per row.
    pub fn into_stream(self) -> BoxStream<'static, Result<Row>> {
        Box::pin(stream::try_unfold(self, |cursor| async move {
            Ok(cursor.fetch_one().await?.map(|row| (row, cursor)))
        }))
    }
}

impl Drop for CursorManager {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            if self.manager.is_running() {
                // Fire and forget; the buffer goes away with the worker anyway.
                drop(self.manager.submit_state(move |state| {
                    state.close_cursor(id);
                    Ok(())
                }));
            }
        }
    }
}

fn closed(error: Error) -> Error {
    match error {
        Error::NotReady(message) => Error::ResourceClosed(message),
        other => other,
    }
}

/// Resolves slice bounds against `len` the way sequence slicing does for a positive step.
pub(crate) fn slice_bounds(len: usize, start: isize, stop: Option<isize>) -> (usize, usize) {
    let resolve = |bound: isize| -> usize {
        if bound < 0 {
            len.saturating_sub(bound.unsigned_abs())
        } else {
            bound.unsigned_abs().min(len)
        }
    };
    let begin = resolve(start);
    let end = stop.map_or(len, resolve);
    (begin, end.max(begin))
}

fn slice<T>(items: Vec<T>, start: isize, stop: Option<isize>, step: usize) -> Vec<T> {
    let (begin, end) = slice_bounds(items.len(), start, stop);
    items
        .into_iter()
        .skip(begin)
        .take(end - begin)
        .step_by(step)
        .collect()
}
