//! Shared pieces for per-check metric bundles.

/// Buckets sized for network round trips: dense below one second, sparse up
/// to half a minute for struggling targets.
pub(crate) const DURATION_SEC_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Log a failed labelled-series delete at debug level. Deleting a series
/// that never existed is expected during config diffs.
pub(crate) fn log_series_delete(result: Result<(), prometheus::Error>, metric: &str, target: &str) {
    if let Err(e) = result {
        tracing::debug!(metric, target, error = %e, "no labelled series to delete");
    }
}
