//! Self-telemetry of the exporter
//!
//! Besides the PowerDNS metrics the exporter reports on itself: how long
//! collection cycles take, how they end and how many HTTP requests it served.
//! These go through the [`metrics`] facade. When [`install`] has been called
//! they are rendered by a Prometheus recorder and appended to every metrics
//! response, otherwise recording them is a no-op.

use std::time::Duration;

use metrics::{Unit, counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Duration of collection cycles, labeled by outcome.
pub const CYCLE_DURATION: &str = "powerdns_exporter_collection_duration_seconds";
/// Collection cycles, labeled by outcome.
pub const CYCLES: &str = "powerdns_exporter_collections_total";
/// HTTP requests served, labeled by handler.
pub const HTTP_REQUESTS: &str = "powerdns_exporter_http_requests_total";

const CYCLE_DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Errors produced by [`install`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper around [`BuildError`].
    #[error("Failed to install telemetry recorder: {0}")]
    Build(#[from] BuildError),
}

/// How a collection cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every expected statistic was present
    Complete,
    /// The scrape succeeded but some statistics were missing
    MissingKeys,
    /// The statistics could not be fetched
    ScrapeFailed,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Complete => "complete",
            Outcome::MissingKeys => "missing_keys",
            Outcome::ScrapeFailed => "scrape_failed",
        }
    }
}

/// Install the global telemetry recorder.
///
/// # Errors
///
/// Returns an error if the recorder cannot be built or a global recorder is
/// already installed.
pub fn install() -> Result<PrometheusHandle, Error> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(CYCLE_DURATION.to_string()),
            CYCLE_DURATION_BUCKETS,
        )?
        .install_recorder()?;

    describe_histogram!(
        CYCLE_DURATION,
        Unit::Seconds,
        "Duration of PowerDNS collection cycles."
    );
    describe_counter!(CYCLES, "PowerDNS collection cycles by outcome.");
    describe_counter!(HTTP_REQUESTS, "HTTP requests served by handler.");

    Ok(handle)
}

/// Record the end of one collection cycle.
pub fn record_cycle(outcome: Outcome, elapsed: Duration) {
    let outcome = outcome.as_str();
    counter!(CYCLES, "outcome" => outcome).increment(1);
    histogram!(CYCLE_DURATION, "outcome" => outcome).record(elapsed.as_secs_f64());
}

/// Record one served HTTP request.
pub fn record_request(handler: &'static str) {
    counter!(HTTP_REQUESTS, "handler" => handler).increment(1);
}
