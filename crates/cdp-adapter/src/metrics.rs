//! Adapter counters
//!
//! Each observation lands twice: in process-wide atomics summarised by [`snapshot`] at the end of
//! a run, and in prometheus collectors that [`register_metrics`] attaches to a registry for a
//! text dump.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    core::Collector, histogram_opts, Encoder, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};
use tracing::error;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterMetricsSnapshot {
    pub commands: u64,
    pub command_failures: u64,
    pub events: u64,
    pub navigation_failures: u64,
    pub binding_calls: u64,
}

static COMMANDS: AtomicU64 = AtomicU64::new(0);
static COMMAND_FAILURES: AtomicU64 = AtomicU64::new(0);
static EVENTS: AtomicU64 = AtomicU64::new(0);
static NAVIGATION_FAILURES: AtomicU64 = AtomicU64::new(0);
static BINDING_CALLS: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref COMMANDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("autopilot_cdp_commands_total", "CDP commands sent, by method"),
        &["method"]
    )
    .unwrap();
    static ref COMMAND_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "autopilot_cdp_command_failures_total",
            "CDP commands that returned an error, by method"
        ),
        &["method"]
    )
    .unwrap();
    static ref COMMAND_SECONDS: HistogramVec = HistogramVec::new(
        histogram_opts!(
            "autopilot_cdp_command_seconds",
            "Round trip of successful CDP commands",
            vec![0.005, 0.025, 0.1, 0.5, 2.0, 10.0]
        ),
        &["method"]
    )
    .unwrap();
    static ref EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("autopilot_cdp_events_total", "Protocol events received, by method"),
        &["method"]
    )
    .unwrap();
    static ref NAVIGATION_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "autopilot_navigation_failures_total",
        "Navigations rejected with an error text"
    )
    .unwrap();
    static ref BINDING_CALLS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "autopilot_binding_calls_total",
            "Page binding invocations, by binding name"
        ),
        &["name"]
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector)) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register adapter metric");
        }
    }
}

/// Attach every adapter collector to `registry`. Registering twice is harmless.
pub fn register_metrics(registry: &Registry) {
    register(registry, COMMANDS_TOTAL.clone());
    register(registry, COMMAND_FAILURES_TOTAL.clone());
    register(registry, COMMAND_SECONDS.clone());
    register(registry, EVENTS_TOTAL.clone());
    register(registry, NAVIGATION_FAILURES_TOTAL.clone());
    register(registry, BINDING_CALLS_TOTAL.clone());
}

/// Prometheus text exposition of everything registered in `registry`.
pub fn encode(registry: &Registry) -> String {
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        error!(?err, "failed to encode adapter metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_command(method: &str, elapsed: Duration, succeeded: bool) {
    COMMANDS.fetch_add(1, Ordering::Relaxed);
    COMMANDS_TOTAL.with_label_values(&[method]).inc();
    if succeeded {
        COMMAND_SECONDS
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());
    } else {
        COMMAND_FAILURES.fetch_add(1, Ordering::Relaxed);
        COMMAND_FAILURES_TOTAL.with_label_values(&[method]).inc();
    }
}

pub fn record_event(method: &str) {
    EVENTS.fetch_add(1, Ordering::Relaxed);
    EVENTS_TOTAL.with_label_values(&[method]).inc();
}

pub fn record_navigation_failure() {
    NAVIGATION_FAILURES.fetch_add(1, Ordering::Relaxed);
    NAVIGATION_FAILURES_TOTAL.inc();
}

pub fn record_binding_call(name: &str) {
    BINDING_CALLS.fetch_add(1, Ordering::Relaxed);
    BINDING_CALLS_TOTAL.with_label_values(&[name]).inc();
}

pub fn snapshot() -> AdapterMetricsSnapshot {
    AdapterMetricsSnapshot {
        commands: COMMANDS.load(Ordering::Relaxed),
        command_failures: COMMAND_FAILURES.load(Ordering::Relaxed),
        events: EVENTS.load(Ordering::Relaxed),
        navigation_failures: NAVIGATION_FAILURES.load(Ordering::Relaxed),
        binding_calls: BINDING_CALLS.load(Ordering::Relaxed),
    }
}
