//! Metrics recorded by the core.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! embedding binary installs a recorder.

use metrics::{counter, gauge};
use orbit_transport::{Method, RequestHook, StatusCode, Uri};

/// Metric names.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "orbit_http_requests_total";
    pub const HTTP_PIPELINE_ERRORS_TOTAL: &str = "orbit_http_pipeline_errors_total";
    pub const STREAM_MESSAGES_TOTAL: &str = "orbit_stream_messages_total";
    pub const STREAM_OUTPUTS_BUFFERED_TOTAL: &str = "orbit_stream_outputs_buffered_total";
    pub const IDLE_MILLISECONDS_TOTAL: &str = "orbit_idle_milliseconds_total";
    pub const ROUTES_BOUND: &str = "orbit_routes_bound";
}

/// Stream message outcome: published or buffered for publishing.
pub const PROCESSED: &str = "processed";
/// Stream message outcome: lost to a failed stage or a missing producer.
pub const DROPPED: &str = "dropped";

/// Describe every metric the core records.
pub fn describe() {
    metrics::describe_counter!(names::HTTP_REQUESTS_TOTAL, "HTTP requests answered, by status");
    metrics::describe_counter!(
        names::HTTP_PIPELINE_ERRORS_TOTAL,
        "Sync pipeline failures, by route and stage"
    );
    metrics::describe_counter!(
        names::STREAM_MESSAGES_TOTAL,
        "Stream messages handled, by route and outcome"
    );
    metrics::describe_counter!(
        names::STREAM_OUTPUTS_BUFFERED_TOTAL,
        "Stream outputs held while the producer was not ready"
    );
    metrics::describe_counter!(
        names::IDLE_MILLISECONDS_TOTAL,
        "Accumulated idle time in milliseconds"
    );
    metrics::describe_gauge!(names::ROUTES_BOUND, "Routes currently bound");
}

pub fn record_request(status: StatusCode) {
    counter!(names::HTTP_REQUESTS_TOTAL, "status" => status.as_u16().to_string()).increment(1);
}

pub fn record_pipeline_error(route: &str, stage: &str) {
    counter!(
        names::HTTP_PIPELINE_ERRORS_TOTAL,
        "route" => route.to_string(),
        "stage" => stage.to_string()
    )
    .increment(1);
}

pub fn record_stream_message(route: &str, outcome: &'static str) {
    counter!(
        names::STREAM_MESSAGES_TOTAL,
        "route" => route.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_output_buffered(route: &str) {
    counter!(names::STREAM_OUTPUTS_BUFFERED_TOTAL, "route" => route.to_string()).increment(1);
}

/// Publish the monitor's running idle total.
pub fn record_idle(total_ms: u64) {
    counter!(names::IDLE_MILLISECONDS_TOTAL).absolute(total_ms);
}

pub fn set_routes_bound(count: usize) {
    gauge!(names::ROUTES_BOUND).set(count as f64);
}

/// Counts every answered HTTP request by status.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestMetrics;

impl RequestHook for RequestMetrics {
    fn on_request(&self, _method: &Method, _uri: &Uri) {}

    fn on_response(&self, _method: &Method, _uri: &Uri, status: StatusCode) {
        record_request(status);
    }
}
