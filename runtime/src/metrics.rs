//! Prometheus metrics for the consumption pipeline.
//!
//! Every recorder labels its series with the receive queue name:
//! - Message outcomes (consumed, faulted, skipped) and consume latency
//! - In-flight invocations
//! - Scope disposal and observer failures
//! - Drain timeouts during `stop`
//!
//! # Example
//!
//! ```rust,no_run
//! use scopebus_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

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

/// Prometheus metrics server.
///
/// Installs the global recorder and renders the scrape payload.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe the pipeline metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// A recorder that is already installed (several buses in one test binary) is
    /// tolerated: a warning is logged and `handle()` stays `None`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "bus_messages_consumed_total",
        "Total number of messages consumed successfully"
    );
    describe_counter!(
        "bus_messages_faulted_total",
        "Total number of messages whose consumption faulted"
    );
    describe_counter!(
        "bus_messages_skipped_total",
        "Total number of messages with no consumer binding"
    );
    describe_histogram!(
        "bus_consume_duration_seconds",
        "Time from scope open to scope close for one message"
    );
    describe_gauge!(
        "bus_in_flight",
        "Number of invocations admitted and not yet released"
    );
    describe_counter!(
        "bus_scope_disposal_errors_total",
        "Total number of scope closes that reported failures"
    );
    describe_counter!(
        "bus_observer_errors_total",
        "Total number of observer failures outside the pre-consume phase"
    );
    describe_counter!(
        "bus_drain_timeouts_total",
        "Total number of stops that abandoned in-flight messages"
    );
    describe_counter!(
        "bus_faults_total",
        "Total number of reports published to the fault channel"
    );
}

/// Pipeline metrics recorder.
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Record a message consumed successfully.
    pub fn record_consumed(queue: &str, duration: Duration) {
        counter!("bus_messages_consumed_total", "queue" => queue.to_owned()).increment(1);
        histogram!("bus_consume_duration_seconds", "queue" => queue.to_owned())
            .record(duration.as_secs_f64());
    }

    /// Record a faulted message.
    pub fn record_faulted(queue: &str, kind: &'static str, duration: Option<Duration>) {
        counter!("bus_messages_faulted_total", "queue" => queue.to_owned(), "kind" => kind)
            .increment(1);
        if let Some(duration) = duration {
            histogram!("bus_consume_duration_seconds", "queue" => queue.to_owned())
                .record(duration.as_secs_f64());
        }
    }

    /// Record a message without a binding.
    pub fn record_skipped(queue: &str) {
        counter!("bus_messages_skipped_total", "queue" => queue.to_owned()).increment(1);
    }

    /// Record the current number of in-flight invocations.
    #[allow(clippy::cast_precision_loss)] // in-flight counts stay far below 2^52
    pub fn record_in_flight(queue: &str, in_flight: usize) {
        gauge!("bus_in_flight", "queue" => queue.to_owned()).set(in_flight as f64);
    }

    /// Record a fault channel report, by [`FaultKind`](crate::faults::FaultKind) label.
    pub fn record_fault(queue: &str, kind: &'static str) {
        counter!("bus_faults_total", "queue" => queue.to_owned(), "kind" => kind).increment(1);
        match kind {
            "disposal" | "root_release" => {
                counter!("bus_scope_disposal_errors_total", "queue" => queue.to_owned())
                    .increment(1);
            },
            "observer" => {
                counter!("bus_observer_errors_total", "queue" => queue.to_owned()).increment(1);
            },
            "drain_timeout" => {
                counter!("bus_drain_timeouts_total", "queue" => queue.to_owned()).increment(1);
            },
            _ => {},
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn test_pipeline_metrics() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        PipelineMetrics::record_consumed("input_queue", Duration::from_millis(20));
        PipelineMetrics::record_faulted("input_queue", "handler", Some(Duration::from_millis(5)));
        PipelineMetrics::record_skipped("input_queue");
        PipelineMetrics::record_in_flight("input_queue", 3);
        PipelineMetrics::record_fault("input_queue", "disposal");

        // Another test may have installed the recorder first; metrics still record.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("bus_messages_consumed_total"));
            assert!(rendered.contains("bus_messages_faulted_total"));
            assert!(rendered.contains("bus_scope_disposal_errors_total"));
        }
    }
}
