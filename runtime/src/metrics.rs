//! Prometheus metrics for catchups, distributors and retries.
//!
//! Components record through the small recorder types below
//! ([`CatchupMetrics`], [`DistributorMetrics`], [`RetryMetrics`]). Nothing is
//! exported until a recorder is installed, which [`MetricsExporter::install`]
//! does with the Prometheus exporter. Serving the rendered text is left to
//! the host application's HTTP surface.
//!
//! # Example
//!
//! ```rust,no_run
//! use alluvial_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//!
//! if let Some(text) = exporter.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics exporter.
///
/// Installs the global recorder and renders the Prometheus text format.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// An exporter that has not installed a recorder yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// An already installed recorder is not an error.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                register_metrics();
                tracing::info!("Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if message.contains("already") {
                    tracing::warn!("Metrics recorder already installed, skipping");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this exporter did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Catchup
    describe_counter!("catchup_batches_total", "Batches fetched by catchups");
    describe_counter!(
        "catchup_items_applied_total",
        "Items applied to projections by catchups"
    );
    describe_counter!(
        "catchup_aggregation_errors_total",
        "Aggregation failures, handled or not"
    );
    describe_histogram!(
        "catchup_batch_duration_seconds",
        "Time taken to fetch and apply one batch"
    );

    // Distributor
    describe_counter!("distributor_leases_granted_total", "Leases granted to receivers");
    describe_counter!(
        "distributor_leases_expired_total",
        "Leases that expired before their receiver finished"
    );
    describe_counter!(
        "distributor_receiver_errors_total",
        "Receiver callbacks that failed or panicked"
    );
    describe_counter!(
        "distributor_broker_errors_total",
        "Lease broker acquire or release failures"
    );
    describe_gauge!("distributor_active_leases", "Leases currently held");

    // Retry
    describe_counter!("retry_attempts_total", "Retry attempts");
    describe_counter!("retry_successes_total", "Operations that succeeded after retrying");
    describe_counter!("retry_exhausted_total", "Operations that exhausted their retries");
}

fn as_count(items: usize) -> u64 {
    u64::try_from(items).unwrap_or(u64::MAX)
}

/// Catchup metrics recorder.
pub struct CatchupMetrics;

impl CatchupMetrics {
    /// Record a fetched batch and how many items were applied from it.
    pub fn record_batch(applied: usize, duration: Duration) {
        counter!("catchup_batches_total").increment(1);
        counter!("catchup_items_applied_total").increment(as_count(applied));
        histogram!("catchup_batch_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an aggregation failure.
    pub fn record_aggregation_error() {
        counter!("catchup_aggregation_errors_total").increment(1);
    }
}

/// Distributor metrics recorder.
pub struct DistributorMetrics;

impl DistributorMetrics {
    /// Record a granted lease.
    pub fn record_granted() {
        counter!("distributor_leases_granted_total").increment(1);
    }

    /// Record a lease that expired while its receiver was still running.
    pub fn record_expired() {
        counter!("distributor_leases_expired_total").increment(1);
    }

    /// Record a failed receiver.
    pub fn record_receiver_error() {
        counter!("distributor_receiver_errors_total").increment(1);
    }

    /// Record a broker failure.
    pub fn record_broker_error() {
        counter!("distributor_broker_errors_total").increment(1);
    }

    /// Record the number of leases currently held.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_active(active: usize) {
        gauge!("distributor_active_leases").set(active as f64);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn exporter_starts_without_a_handle() {
        let exporter = MetricsExporter::new();
        assert!(exporter.handle().is_none());
        assert!(exporter.render().is_none());
    }

    #[test]
    fn renders_recorded_metrics() {
        let mut exporter = MetricsExporter::new();
        exporter.install().unwrap();

        CatchupMetrics::record_batch(3, Duration::from_millis(20));
        CatchupMetrics::record_aggregation_error();
        DistributorMetrics::record_granted();
        DistributorMetrics::record_active(2);

        // another test in this binary may have installed the recorder first
        if let Some(rendered) = exporter.render() {
            assert!(rendered.contains("catchup_batches_total"));
            assert!(rendered.contains("catchup_items_applied_total"));
            assert!(rendered.contains("distributor_leases_granted_total"));
            assert!(rendered.contains("distributor_active_leases"));
        }
    }
}
