use std::sync::Arc;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the coordinator.
pub struct Metrics {
    // -- leases --
    pub lease_acquisitions: Counter,
    pub lease_retries: Counter,
    pub lease_timeouts: Counter,
    pub lease_releases: Counter,

    // -- failover --
    pub store_outages: Counter,
    pub recovery_probes: Counter,

    // -- cancellation --
    pub waiter_aborts: Counter,
    pub registered_waiters: Gauge,

    // -- dedup --
    pub dedup_admitted: Counter,
    pub dedup_suppressed: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let lease_acquisitions = Counter::default();
        registry.register(
            "leasegate_lease_acquisitions",
            "Leases granted through a conditional write",
            lease_acquisitions.clone(),
        );

        let lease_retries = Counter::default();
        registry.register(
            "leasegate_lease_retries",
            "Lease attempts that found the key already held",
            lease_retries.clone(),
        );

        let lease_timeouts = Counter::default();
        registry.register(
            "leasegate_lease_timeouts",
            "Leases force-acquired after exhausting retries",
            lease_timeouts.clone(),
        );

        let lease_releases = Counter::default();
        registry.register(
            "leasegate_lease_releases",
            "Lease releases",
            lease_releases.clone(),
        );

        let store_outages = Counter::default();
        registry.register(
            "leasegate_store_outages",
            "Distinct shared store outages (failure generations)",
            store_outages.clone(),
        );

        let recovery_probes = Counter::default();
        registry.register(
            "leasegate_recovery_probes",
            "Write probes attempted while recovering",
            recovery_probes.clone(),
        );

        let waiter_aborts = Counter::default();
        registry.register(
            "leasegate_waiter_aborts",
            "Waiters aborted by a timeout notification",
            waiter_aborts.clone(),
        );

        let registered_waiters: Gauge = Gauge::default();
        registry.register(
            "leasegate_registered_waiters",
            "Units of work currently registered for cancellation",
            registered_waiters.clone(),
        );

        let dedup_admitted = Counter::default();
        registry.register(
            "leasegate_dedup_admitted",
            "Bus messages admitted on first delivery",
            dedup_admitted.clone(),
        );

        let dedup_suppressed = Counter::default();
        registry.register(
            "leasegate_dedup_suppressed",
            "Bus messages suppressed as re-deliveries",
            dedup_suppressed.clone(),
        );

        Self {
            lease_acquisitions,
            lease_retries,
            lease_timeouts,
            lease_releases,
            store_outages,
            recovery_probes,
            waiter_aborts,
            registered_waiters,
            dedup_admitted,
            dedup_suppressed,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all coordinator metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
