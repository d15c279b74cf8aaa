//! Prometheus metrics collection for ripmond
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-6: Audit Record Review - Metrics available for analysis
//! - SI-4: System Monitoring - Receiver and trie health metrics

use prometheus::{Counter, Gauge, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for ripmond
///
/// # NIST Controls
/// - SI-4: System Monitoring - Centralized metrics collection
#[derive(Clone)]
pub struct MetricsCollector {
    // Counters
    pub datagrams_received_total: Counter,
    pub decode_errors_total: Counter,
    pub route_changes_total: Counter,
    pub routes_purged_total: Counter,

    // Gauges
    pub trie_population: Gauge,
    pub receiver_running: Gauge,

    // Histograms
    pub decode_latency_seconds: Histogram,

    // Registry for export
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let datagrams_received_total = Counter::with_opts(Opts::new(
            "ripmond_datagrams_received_total",
            "Total number of RIP datagrams received",
        ))?;
        registry.register(Box::new(datagrams_received_total.clone()))?;

        let decode_errors_total = Counter::with_opts(Opts::new(
            "ripmond_decode_errors_total",
            "Total number of datagrams dropped as malformed",
        ))?;
        registry.register(Box::new(decode_errors_total.clone()))?;

        let route_changes_total = Counter::with_opts(Opts::new(
            "ripmond_route_changes_total",
            "Total number of route metric changes",
        ))?;
        registry.register(Box::new(route_changes_total.clone()))?;

        let routes_purged_total = Counter::with_opts(Opts::new(
            "ripmond_routes_purged_total",
            "Total number of routes expired by the purge timer",
        ))?;
        registry.register(Box::new(routes_purged_total.clone()))?;

        let trie_population = Gauge::with_opts(Opts::new(
            "ripmond_trie_population",
            "Weighted route population of the routing trie",
        ))?;
        registry.register(Box::new(trie_population.clone()))?;

        let receiver_running = Gauge::with_opts(Opts::new(
            "ripmond_receiver_running",
            "Receiver status (1=receiving, 0=stopped)",
        ))?;
        registry.register(Box::new(receiver_running.clone()))?;

        let decode_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "ripmond_decode_latency_seconds",
                "Datagram decode and apply latency in seconds",
            )
            .buckets(vec![
                0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1,
            ]),
        )?;
        registry.register(Box::new(decode_latency_seconds.clone()))?;

        Ok(Self {
            datagrams_received_total,
            decode_errors_total,
            route_changes_total,
            routes_purged_total,
            trie_population,
            receiver_running,
            decode_latency_seconds,
            registry: Arc::new(registry),
        })
    }

    /// Record a successfully decoded datagram
    pub fn record_datagram(&self, changes: usize, latency_secs: f64) {
        self.datagrams_received_total.inc();
        self.route_changes_total.inc_by(changes as f64);
        self.decode_latency_seconds.observe(latency_secs);
    }

    /// Record a datagram dropped by the decoder
    pub fn record_decode_error(&self) {
        self.datagrams_received_total.inc();
        self.decode_errors_total.inc();
    }

    pub fn record_purged(&self, routes: usize) {
        self.routes_purged_total.inc_by(routes as f64);
    }

    pub fn set_population(&self, population: f64) {
        self.trie_population.set(population);
    }

    /// Update receiver status
    pub fn set_receiver_running(&self, running: bool) {
        self.receiver_running.set(if running { 1.0 } else { 0.0 });
    }
}
