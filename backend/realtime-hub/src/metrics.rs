//! Hub metrics for observability

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

static METRICS: OnceLock<HubMetricsInner> = OnceLock::new();

struct HubMetricsInner {
    live_connections: IntGauge,
    deliveries: CounterVec,
    delivery_failures: CounterVec,
    broadcast_latency: HistogramVec,
    relay_errors: CounterVec,
    presence_errors: CounterVec,
}

impl HubMetricsInner {
    fn new() -> Self {
        Self {
            live_connections: IntGauge::new(
                "realtime_hub_live_connections",
                "Connections currently registered on this instance",
            )
            .expect("valid metric definition"),
            deliveries: CounterVec::new(
                Opts::new(
                    "realtime_hub_deliveries_total",
                    "Payloads written to a connection",
                ),
                &["target"],
            )
            .expect("valid metric definition"),
            delivery_failures: CounterVec::new(
                Opts::new(
                    "realtime_hub_delivery_failures_total",
                    "Writes that failed and unregistered their connection",
                ),
                &["target"],
            )
            .expect("valid metric definition"),
            broadcast_latency: HistogramVec::new(
                HistogramOpts::new(
                    "realtime_hub_broadcast_duration_seconds",
                    "Time to deliver one broadcast to every resolved connection",
                )
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
                &["target"],
            )
            .expect("valid metric definition"),
            relay_errors: CounterVec::new(
                Opts::new(
                    "realtime_hub_relay_errors_total",
                    "Cross-instance relay failures",
                ),
                &["operation"],
            )
            .expect("valid metric definition"),
            presence_errors: CounterVec::new(
                Opts::new(
                    "realtime_hub_presence_errors_total",
                    "Presence store and status bus failures",
                ),
                &["operation"],
            )
            .expect("valid metric definition"),
        }
    }

    fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.live_connections.clone()))?;
        registry.register(Box::new(self.deliveries.clone()))?;
        registry.register(Box::new(self.delivery_failures.clone()))?;
        registry.register(Box::new(self.broadcast_latency.clone()))?;
        registry.register(Box::new(self.relay_errors.clone()))?;
        registry.register(Box::new(self.presence_errors.clone()))?;
        Ok(())
    }
}

fn get_metrics() -> &'static HubMetricsInner {
    METRICS.get_or_init(HubMetricsInner::new)
}

/// Register hub metrics with a Prometheus registry
pub fn register(registry: &Registry) -> Result<(), prometheus::Error> {
    get_metrics().register(registry)
}

/// Render `registry` in the Prometheus text exposition format.
pub fn gather_text(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

pub fn connection_opened() {
    get_metrics().live_connections.inc();
}

pub fn connection_closed() {
    get_metrics().live_connections.dec();
}

pub fn record_delivery(target: &str, delivered: usize, failed: usize, elapsed: Duration) {
    let metrics = get_metrics();
    metrics
        .deliveries
        .with_label_values(&[target])
        .inc_by(delivered as f64);
    if failed > 0 {
        metrics
            .delivery_failures
            .with_label_values(&[target])
            .inc_by(failed as f64);
    }
    metrics
        .broadcast_latency
        .with_label_values(&[target])
        .observe(elapsed.as_secs_f64());
}

pub fn record_relay_error(operation: &str) {
    get_metrics()
        .relay_errors
        .with_label_values(&[operation])
        .inc();
}

pub fn record_presence_error(operation: &str) {
    get_metrics()
        .presence_errors
        .with_label_values(&[operation])
        .inc();
}
