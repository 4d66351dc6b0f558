//! Metrics seam. Hosts that export Prometheus counters implement this trait
//! over their registry; the session calls it once per emitted sample.

/// Per-service symbol-resolution counters. Implementations must be cheap and
/// thread-safe.
pub trait Metrics: Send + Sync {
    fn known_symbols(&self, service_name: &str, count: u64);

    fn unknown_symbols(&self, service_name: &str, count: u64);

    fn unknown_modules(&self, service_name: &str, count: u64);

    /// A harvested stack whose unknown frames outnumber the known ones.
    fn unknown_stack(&self, service_name: &str);
}
