use std::sync::Arc;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by a stagger process.
pub struct Metrics {
    // -- coordinator --
    pub resync_ticks: Counter,
    pub resync_failures: Counter,
    pub resync_panics: Counter,
    pub rebalances: Counter,
    pub live_instances: Gauge,
    pub instance_position: Gauge,
    pub offset_seconds: Gauge,

    // -- scheduler --
    pub schedule_generations: Counter,
    pub action_invocations: Counter,
    pub action_timeouts: Counter,
    pub action_panics: Counter,
    pub action_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let resync_ticks = Counter::default();
        registry.register(
            "stagger_resync_ticks",
            "Completed coordinator resync ticks",
            resync_ticks.clone(),
        );

        let resync_failures = Counter::default();
        registry.register(
            "stagger_resync_failures",
            "Coordinator loop runs that ended with a store error",
            resync_failures.clone(),
        );

        let resync_panics = Counter::default();
        registry.register(
            "stagger_resync_panics",
            "Coordinator ticks that panicked",
            resync_panics.clone(),
        );

        let rebalances = Counter::default();
        registry.register(
            "stagger_rebalances",
            "Instance list resets triggered by fleet shrinkage",
            rebalances.clone(),
        );

        let live_instances: Gauge = Gauge::default();
        registry.register(
            "stagger_live_instances",
            "Live fleet members observed on the last tick",
            live_instances.clone(),
        );

        let instance_position: Gauge = Gauge::default();
        registry.register(
            "stagger_instance_position",
            "This instance's rank in the shared list (-1 when unregistered)",
            instance_position.clone(),
        );

        let offset_seconds: Gauge = Gauge::default();
        registry.register(
            "stagger_offset_seconds",
            "This instance's phase inside the cadence window",
            offset_seconds.clone(),
        );

        let schedule_generations = Counter::default();
        registry.register(
            "stagger_schedule_generations",
            "Schedules armed after an offset change",
            schedule_generations.clone(),
        );

        let action_invocations = Counter::default();
        registry.register(
            "stagger_action_invocations",
            "Action invocations started",
            action_invocations.clone(),
        );

        let action_timeouts = Counter::default();
        registry.register(
            "stagger_action_timeouts",
            "Action invocations that exceeded their timeout",
            action_timeouts.clone(),
        );

        let action_panics = Counter::default();
        registry.register(
            "stagger_action_panics",
            "Action invocations that panicked",
            action_panics.clone(),
        );

        let action_duration_seconds = Histogram::new(exponential_buckets(0.05, 2.0, 12));
        registry.register(
            "stagger_action_duration_seconds",
            "Action invocation latency in seconds",
            action_duration_seconds.clone(),
        );

        Self {
            resync_ticks,
            resync_failures,
            resync_panics,
            rebalances,
            live_instances,
            instance_position,
            offset_seconds,
            schedule_generations,
            action_invocations,
            action_timeouts,
            action_panics,
            action_duration_seconds,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Cloneable handle over the registry and its metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
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
