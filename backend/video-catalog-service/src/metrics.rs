//! Metrics for the catalog service.
//!
//! Services and the projection applier take a [`MetricsReporter`] at
//! construction time instead of writing to process-wide collectors.

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::time::Duration;

pub trait MetricsReporter: Send + Sync + 'static {
    /// A command or stage operation finished with `outcome` (`ok` or an error kind).
    fn command_completed(&self, operation: &str, outcome: &str, elapsed: Duration);

    fn event_appended(&self, event_type: &str);

    /// `outcome` is `applied`, `skipped_<reason>` or `failed`.
    fn projection_applied(&self, event_type: &str, outcome: &str);

    /// Processing time minus `occurred_at` of the applied event.
    fn projection_lag(&self, lag: Duration);

    /// A delivery gave up after its last redelivery or was poison.
    fn delivery_dropped(&self);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl MetricsReporter for NoopReporter {
    fn command_completed(&self, _operation: &str, _outcome: &str, _elapsed: Duration) {}
    fn event_appended(&self, _event_type: &str) {}
    fn projection_applied(&self, _event_type: &str, _outcome: &str) {}
    fn projection_lag(&self, _lag: Duration) {}
    fn delivery_dropped(&self) {}
}

#[derive(Clone)]
pub struct PrometheusReporter {
    commands_total: IntCounterVec,
    command_duration_seconds: HistogramVec,
    events_appended_total: IntCounterVec,
    projection_events_total: IntCounterVec,
    projection_lag_seconds: HistogramVec,
    deliveries_dropped_total: IntCounter,
}

impl PrometheusReporter {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let commands_total = IntCounterVec::new(
            Opts::new(
                "video_catalog_commands_total",
                "Catalog commands segmented by operation and outcome",
            ),
            &["operation", "outcome"],
        )?;
        let command_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "video_catalog_command_duration_seconds",
                "Catalog command latency including the transaction",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["operation"],
        )?;
        let events_appended_total = IntCounterVec::new(
            Opts::new(
                "video_catalog_events_appended_total",
                "Domain events appended to the outbox",
            ),
            &["event_type"],
        )?;
        let projection_events_total = IntCounterVec::new(
            Opts::new(
                "video_projection_events_total",
                "Events seen by the projection applier segmented by outcome",
            ),
            &["event_type", "outcome"],
        )?;
        let projection_lag_seconds = HistogramVec::new(
            HistogramOpts::new(
                "video_projection_lag_seconds",
                "Delay between event occurrence and projection apply",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
            &[],
        )?;
        let deliveries_dropped_total = IntCounter::with_opts(Opts::new(
            "video_projection_deliveries_dropped_total",
            "Deliveries abandoned after exhausting redeliveries or failing to decode",
        ))?;

        registry.register(Box::new(commands_total.clone()))?;
        registry.register(Box::new(command_duration_seconds.clone()))?;
        registry.register(Box::new(events_appended_total.clone()))?;
        registry.register(Box::new(projection_events_total.clone()))?;
        registry.register(Box::new(projection_lag_seconds.clone()))?;
        registry.register(Box::new(deliveries_dropped_total.clone()))?;

        Ok(Self {
            commands_total,
            command_duration_seconds,
            events_appended_total,
            projection_events_total,
            projection_lag_seconds,
            deliveries_dropped_total,
        })
    }
}

impl MetricsReporter for PrometheusReporter {
    fn command_completed(&self, operation: &str, outcome: &str, elapsed: Duration) {
        self.commands_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.command_duration_seconds
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    fn event_appended(&self, event_type: &str) {
        self.events_appended_total
            .with_label_values(&[event_type])
            .inc();
    }

    fn projection_applied(&self, event_type: &str, outcome: &str) {
        self.projection_events_total
            .with_label_values(&[event_type, outcome])
            .inc();
    }

    fn projection_lag(&self, lag: Duration) {
        self.projection_lag_seconds
            .with_label_values(&[])
            .observe(lag.as_secs_f64());
    }

    fn delivery_dropped(&self) {
        self.deliveries_dropped_total.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_reporter_registers_and_counts() {
        let registry = Registry::new();
        let reporter = PrometheusReporter::new(&registry).unwrap();

        reporter.command_completed("create_video", "ok", Duration::from_millis(3));
        reporter.projection_applied("video.created", "applied");
        reporter.projection_lag(Duration::from_millis(120));

        let families = registry.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"video_catalog_commands_total"));
        assert!(names.contains(&"video_projection_lag_seconds"));
        assert_eq!(
            reporter
                .commands_total
                .with_label_values(&["create_video", "ok"])
                .get(),
            1
        );
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        PrometheusReporter::new(&registry).unwrap();
        assert!(PrometheusReporter::new(&registry).is_err());
    }
}
