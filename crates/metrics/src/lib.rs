//! Process-global storage metrics
//!
//! Prometheus instrumentation for the SQL issued by the inbox and outbox
//! storages. Metrics live in the default registry and are registered once
//! per process; [`disable`] turns recording into a no-op for tests.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts};
use tracing::warn;

const MS_BUCKETS: &[f64] = &[
    10.0, 50.0, 100.0, 200.0, 300.0, 500.0, 1000.0, 1500.0, 3000.0, 5000.0, 7000.0, 10000.0,
    20000.0, 60000.0,
];

static ENABLED: AtomicBool = AtomicBool::new(true);

struct StorageMetrics {
    counter: IntCounterVec,
    latency: HistogramVec,
}

fn storage_metrics() -> &'static StorageMetrics {
    static METRICS: OnceLock<StorageMetrics> = OnceLock::new();

    METRICS.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new(
                "relaybox_storage_sql_total",
                "SQL statements issued by relaybox storages",
            ),
            &["sql_query", "query_status"],
        )
        .expect("valid metric opts for relaybox_storage_sql_total");

        let latency = HistogramVec::new(
            HistogramOpts::new(
                "relaybox_storage_sql_latency_ms",
                "Latency of SQL statements issued by relaybox storages",
            )
            .buckets(MS_BUCKETS.to_vec()),
            &["sql_query", "query_status"],
        )
        .expect("valid metric opts for relaybox_storage_sql_latency_ms");

        let registry = prometheus::default_registry();

        for collector in [
            Box::new(counter.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(latency.clone()),
        ] {
            if let Err(err) = registry.register(collector) {
                warn!("failed to register storage metric: {err}");
            }
        }

        StorageMetrics { counter, latency }
    })
}

/// Record one executed statement.
///
/// `query` is collapsed to single-space whitespace before being used as a
/// label value, so multiline statements produce stable label sets.
pub fn observe(query: &str, started: Instant, ok: bool) {
    if !ENABLED.load(Ordering::Relaxed) {
        return;
    }

    let metrics = storage_metrics();

    let query = collapse_whitespace(query);
    let status = if ok { "ok" } else { "error" };

    metrics.counter.with_label_values(&[&query, status]).inc();

    let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
    metrics
        .latency
        .with_label_values(&[&query, status])
        .observe(elapsed_ms);
}

/// Stop recording. Meant for tests that must not touch global state.
pub fn disable() {
    ENABLED.store(false, Ordering::Relaxed);
}

/// Resume recording after [`disable`].
pub fn enable() {
    ENABLED.store(true, Ordering::Relaxed);
}

fn collapse_whitespace(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}
