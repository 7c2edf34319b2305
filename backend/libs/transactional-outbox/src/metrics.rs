use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Backlog gauges and publish counters for one service's ledger.
#[derive(Clone)]
pub struct OutboxMetrics {
    pub pending: IntGauge,
    pub oldest_pending_age_seconds: IntGauge,
    pub exhausted_pending: IntGauge,
    pub published: IntCounter,
    pub failed: IntCounter,
    pub exhausted: IntCounter,
}

impl OutboxMetrics {
    pub fn new(service: &str, registry: &Registry) -> Result<Self, prometheus::Error> {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help).const_label("service", service.to_string())
        };

        let pending = IntGauge::with_opts(opts(
            "outbox_pending_count",
            "Number of unpublished outbox events still eligible for publishing",
        ))?;
        let oldest_pending_age_seconds = IntGauge::with_opts(opts(
            "outbox_oldest_pending_age_seconds",
            "Age in seconds of the oldest unpublished outbox event",
        ))?;
        let exhausted_pending = IntGauge::with_opts(opts(
            "outbox_exhausted_count",
            "Unpublished outbox events that reached the delivery attempt ceiling",
        ))?;
        let published = IntCounter::with_opts(opts(
            "outbox_published_total",
            "Total number of outbox events marked as published",
        ))?;
        let failed = IntCounter::with_opts(opts(
            "outbox_publish_failures_total",
            "Total number of failed publish attempts",
        ))?;
        let exhausted = IntCounter::with_opts(opts(
            "outbox_exhausted_total",
            "Total number of events that hit the delivery attempt ceiling",
        ))?;

        registry.register(Box::new(pending.clone()))?;
        registry.register(Box::new(oldest_pending_age_seconds.clone()))?;
        registry.register(Box::new(exhausted_pending.clone()))?;
        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(failed.clone()))?;
        registry.register(Box::new(exhausted.clone()))?;

        Ok(Self {
            pending,
            oldest_pending_age_seconds,
            exhausted_pending,
            published,
            failed,
            exhausted,
        })
    }
}
