//! Prometheus metrics for the fulfillment pipeline.
//!
//! Counters are process-global and registered against [`REGISTRY`] on first
//! use. The CLI renders them in the Prometheus text format.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref EVENTS_EMITTED: IntCounterVec = register(IntCounterVec::new(
        Opts::new("saylogix_events_emitted_total", "Events appended to the log"),
        &["event_type", "source"]
    )
    .expect("metric can be created"));

    pub static ref HANDLER_FAILURES: IntCounterVec = register(IntCounterVec::new(
        Opts::new("saylogix_handler_failures_total", "Event handler invocations that failed"),
        &["handler", "kind"]
    )
    .expect("metric can be created"));

    pub static ref ORDER_EXCEPTIONS: IntCounterVec = register(IntCounterVec::new(
        Opts::new("saylogix_order_exceptions_total", "Orders moved into exception"),
        &["category"]
    )
    .expect("metric can be created"));

    pub static ref ORDERS_READY: IntCounter = register(IntCounter::new(
        "saylogix_orders_ready_total",
        "Orders released to the warehouse"
    )
    .expect("metric can be created"));

    pub static ref PENDING_VERIFICATIONS: IntGauge = register(IntGauge::new(
        "saylogix_pending_address_verifications",
        "Address verifications waiting on a customer reply"
    )
    .expect("metric can be created"));

    pub static ref MANIFESTS_GENERATED: IntCounterVec = register(IntCounterVec::new(
        Opts::new("saylogix_manifests_generated_total", "Courier manifests generated"),
        &["trigger"]
    )
    .expect("metric can be created"));

    pub static ref DELIVERY_OUTCOMES: IntCounterVec = register(IntCounterVec::new(
        Opts::new("saylogix_delivery_outcomes_total", "Recorded delivery attempts"),
        &["outcome"]
    )
    .expect("metric can be created"));

    pub static ref NOTIFICATION_FAILURES: IntCounterVec = register(IntCounterVec::new(
        Opts::new("saylogix_notification_failures_total", "Outbound messages that exhausted retries"),
        &["purpose"]
    )
    .expect("metric can be created"));
}

fn register<C>(collector: C) -> C
where
    C: prometheus::core::Collector + Clone + 'static,
{
    if let Err(e) = REGISTRY.register(Box::new(collector.clone())) {
        tracing::warn!(error = %e, "metric registration failed");
    }
    collector
}

/// Renders every registered metric in the Prometheus text exposition format.
pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
