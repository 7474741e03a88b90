use prometheus::{
    register_counter_with_registry, register_gauge_with_registry, register_histogram_with_registry,
    Counter, Gauge, Histogram, Registry,
};
use std::sync::Arc;

pub struct RelayMetrics {
    pub agents_total: Gauge,
    pub contacts_total: Gauge,
    pub groups_total: Gauge,
    pub requests_total: Counter,
    pub broadcasts_total: Counter,
    pub revocations_total: Counter,
    pub rate_limit_hits: Counter,
    pub request_latency: Histogram,
    pub error_counts: Counter,
    pub registry: Arc<Registry>,
}

impl RelayMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let agents_total = register_gauge_with_registry!(
            "cc_relay_agents_total",
            "Number of registered agents",
            registry
        )?;

        let contacts_total = register_gauge_with_registry!(
            "cc_relay_contacts_total",
            "Number of active contact pairs",
            registry
        )?;

        let groups_total = register_gauge_with_registry!(
            "cc_relay_groups_total",
            "Number of active groups",
            registry
        )?;

        let requests_total = register_counter_with_registry!(
            "cc_relay_requests_total",
            "Total number of HTTP requests handled",
            registry
        )?;

        let broadcasts_total = register_counter_with_registry!(
            "cc_relay_broadcasts_total",
            "Total number of admin broadcasts created",
            registry
        )?;

        let revocations_total = register_counter_with_registry!(
            "cc_relay_revocations_total",
            "Total number of agent revocations",
            registry
        )?;

        let rate_limit_hits = register_counter_with_registry!(
            "cc_relay_rate_limit_hits_total",
            "Total number of rate limit trips",
            registry
        )?;

        let request_latency = register_histogram_with_registry!(
            "cc_relay_request_latency_seconds",
            "Request latency in seconds",
            registry
        )?;

        let error_counts = register_counter_with_registry!(
            "cc_relay_errors_total",
            "Total number of handler errors",
            registry
        )?;

        Ok(Self {
            agents_total,
            contacts_total,
            groups_total,
            requests_total,
            broadcasts_total,
            revocations_total,
            rate_limit_hits,
            request_latency,
            error_counts,
            registry,
        })
    }

    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .expect("prometheus encoding never fails for registered metrics");
        String::from_utf8(buffer).expect("prometheus text output is always valid utf-8")
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new().expect("static metric registration never fails")
    }
}
