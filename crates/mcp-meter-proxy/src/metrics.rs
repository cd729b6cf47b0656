use prometheus::{
    core::Collector, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry,
};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Inbound protocol messages by kind (handshake, tool_call, other)
pub static INVOCATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("mcp_meter_invocations_total", "Inbound protocol messages"),
        &["kind"],
    )
    .unwrap()
});

// Settlement counters
pub static SETTLEMENTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mcp_meter_settlements_total",
        "Total number of successful settlements",
    )
    .unwrap()
});

pub static SETTLEMENTS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mcp_meter_settlements_failed",
        "Total number of failed settlements",
    )
    .unwrap()
});

pub static PROVIDERS_REGISTERED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mcp_meter_providers_registered",
        "Total number of providers registered",
    )
    .unwrap()
});

pub static FORWARD_LATENCY: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "mcp_meter_forward_latency_seconds",
            "Time until the upstream answers a forwarded message",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .unwrap()
});

// Per-provider counters
pub static PROVIDER_PAYMENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "mcp_meter_provider_payments_total",
            "Successful payments per provider",
        ),
        &["provider"],
    )
    .unwrap()
});

pub static PROVIDER_REVENUE: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "mcp_meter_provider_revenue_minor_units_total",
            "Revenue in minor currency units per provider",
        ),
        &["provider"],
    )
    .unwrap()
});

pub static ACTIVE_STREAMS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("mcp_meter_active_streams", "Open server-push relays").unwrap()
});

pub static AUDIT_WRITE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mcp_meter_audit_write_failures_total",
        "Payment audit rows that could not be written",
    )
    .unwrap()
});

/// Register all metrics with the registry
pub fn register_metrics() {
    let collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(INVOCATIONS_TOTAL.clone()),
        Box::new(SETTLEMENTS_TOTAL.clone()),
        Box::new(SETTLEMENTS_FAILED.clone()),
        Box::new(PROVIDERS_REGISTERED.clone()),
        Box::new(FORWARD_LATENCY.clone()),
        Box::new(PROVIDER_PAYMENTS.clone()),
        Box::new(PROVIDER_REVENUE.clone()),
        Box::new(ACTIVE_STREAMS.clone()),
        Box::new(AUDIT_WRITE_FAILURES.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            tracing::warn!(error = %e, "metric registration skipped");
        }
    }
}
