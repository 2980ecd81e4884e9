//! Prometheus export of the store metrics.
//!
//! [`install_metrics`] installs a process-wide recorder and
//! [`metrics_router`] serves its contents at `GET /metrics` in the text
//! exposition format.

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderValue, header};
use axum::response::IntoResponse;
use axum::routing::get;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::{EVENT_STORE_NAMESPACE, SNAPSHOT_STORE_NAMESPACE, SOURCED_NAMESPACE, STORE_NAMESPACE};

const AGGREGATE_OPERATIONS: [&str; 4] = ["new_aggregate", "load", "hydrate", "save"];

/// Install the global Prometheus recorder and describe the store metrics.
///
/// # Errors
///
/// Returns [`BuildError`] if a global recorder is already installed.
pub fn install_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_store_metrics();
    Ok(handle)
}

/// Router serving the rendered metrics of `handle` at `/metrics`.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(handle)
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

fn describe_store_metrics() {
    for namespace in [STORE_NAMESPACE, SOURCED_NAMESPACE] {
        for operation in AGGREGATE_OPERATIONS {
            describe(namespace, operation, "account store");
        }
    }
    for operation in ["append", "read"] {
        describe(EVENT_STORE_NAMESPACE, operation, "account event store");
    }
    for operation in ["write", "read_latest"] {
        describe(SNAPSHOT_STORE_NAMESPACE, operation, "account snapshot store");
    }
}

fn describe(namespace: &str, operation: &str, layer: &str) {
    describe_counter!(
        format!("{namespace}_{operation}_total"),
        format!("Calls to {operation} on the {layer}, by outcome.")
    );
    describe_histogram!(
        format!("{namespace}_{operation}_duration_seconds"),
        metrics::Unit::Seconds,
        format!("Latency of {operation} on the {layer}, by outcome.")
    );
}
