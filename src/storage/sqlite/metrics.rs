//! Storage metrics recording.

use crate::Result;
use std::time::Instant;

/// Records `storage_operations_total` and `storage_operation_duration_ms`.
///
/// * `component` - Kernel component (e.g., "memory", "patterns")
/// * `operation` - Operation name (e.g., "store", "search", "vote")
/// * `start` - Operation start time
/// * `status` - "success" or "error"
pub fn record_operation_metrics(
    component: &'static str,
    operation: &'static str,
    start: Instant,
    status: &'static str,
) {
    metrics::counter!(
        "storage_operations_total",
        "component" => component,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "storage_operation_duration_ms",
        "component" => component,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Records metrics for a finished operation and passes the result through.
pub fn observe<T>(
    component: &'static str,
    operation: &'static str,
    start: Instant,
    result: Result<T>,
) -> Result<T> {
    let status = if result.is_ok() { "success" } else { "error" };
    record_operation_metrics(component, operation, start, status);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_record_without_recorder_is_noop() {
        let start = Instant::now();
        record_operation_metrics("memory", "store", start, "success");
        record_operation_metrics("memory", "store", start, "error");
    }

    #[test]
    fn test_observe_passes_result_through() {
        let ok: Result<u32> = observe("memory", "get", Instant::now(), Ok(3));
        assert_eq!(ok.unwrap(), 3);

        let err: Result<u32> = observe(
            "memory",
            "get",
            Instant::now(),
            Err(Error::Validation("bad".into())),
        );
        assert!(err.is_err());
    }
}
