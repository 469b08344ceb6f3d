//! Table operation metrics.
//!
//! Metrics go through the `metrics` facade; the crate never installs a
//! recorder, so they cost nothing until the application installs one.

use crate::Result;
use std::time::Instant;

/// Records the count and latency of one table operation.
///
/// Emits `table_operations_total` and `table_operation_duration_ms`, both
/// labelled by `backend`, `operation`, and `status`.
///
/// # Examples
///
/// ```ignore
/// use std::time::Instant;
/// use queuelite::observability::record_operation_metrics;
///
/// let start = Instant::now();
/// // ... perform operation ...
/// record_operation_metrics("memory", "insert", start, "success");
/// ```
pub fn record_operation_metrics(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    status: &'static str,
) {
    metrics::counter!(
        "table_operations_total",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "table_operation_duration_ms",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Records an operation outcome and hands the result back unchanged.
pub fn observe<T>(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    result: Result<T>,
) -> Result<T> {
    let status = if result.is_ok() { "success" } else { "error" };
    record_operation_metrics(backend, operation, start, status);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_record_without_recorder() {
        // No recorder is installed; recording must still be a no-op.
        record_operation_metrics("memory", "insert", Instant::now(), "success");
    }

    #[test]
    fn test_observe_passes_result_through() {
        let ok = observe("sqlite", "count", Instant::now(), Ok(3));
        assert_eq!(ok.unwrap(), 3);

        let err: Result<()> = observe(
            "sqlite",
            "count",
            Instant::now(),
            Err(Error::NotReady("stopped".into())),
        );
        assert!(matches!(err, Err(Error::NotReady(_))));
    }
}
