use idempotent_consumer::{IdempotencyError, IdempotencyGuard, ProcessedEventStore, ProcessingResult};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::decode::{Delivery, InboundEvent};
use super::projection::{ApplyOutcome, ProjectionApplier};
use crate::clock::Clock;
use crate::db::ProjectionStore;
use crate::metrics::MetricsReporter;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Concurrent workers; one aggregate always maps to the same worker
    pub workers: usize,
    /// Retry ceiling for deliveries another consumer holds a claim on.
    /// Storage failures are retried without a ceiling.
    pub max_redeliveries: u32,
    /// First retry delay; doubles per attempt
    pub redelivery_delay: Duration,
    pub max_redelivery_delay: Duration,
    /// How long workers keep retrying queued deliveries after shutdown
    pub shutdown_grace: Duration,
    /// Per-worker queue depth
    pub worker_queue: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_redeliveries: 10,
            redelivery_delay: Duration::from_millis(500),
            max_redelivery_delay: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            worker_queue: 256,
        }
    }
}

impl ConsumerConfig {
    /// `redelivery_delay * 2^attempt`, capped at `max_redelivery_delay`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.redelivery_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_redelivery_delay)
    }
}

/// What became of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Processed(ApplyOutcome),
    /// Already applied under this event id
    Duplicate,
    /// Storage failed; retry until it succeeds
    Retry(String),
    /// Another consumer holds the claim on this event id
    InFlight,
    /// Can never succeed; dropped
    Poison(String),
}

/// Projection side of the pipeline: decode, deduplicate by event id, apply.
pub struct ProjectionConsumer<S, P>
where
    S: ProcessedEventStore + 'static,
    P: ProjectionStore,
{
    guard: IdempotencyGuard<S>,
    applier: ProjectionApplier<P>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsReporter>,
    config: ConsumerConfig,
}

impl<S, P> ProjectionConsumer<S, P>
where
    S: ProcessedEventStore + 'static,
    P: ProjectionStore,
{
    pub fn new(
        guard: IdempotencyGuard<S>,
        applier: ProjectionApplier<P>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsReporter>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            guard,
            applier,
            clock,
            metrics,
            config,
        }
    }

    pub fn guard(&self) -> &IdempotencyGuard<S> {
        &self.guard
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Handle one delivery. The projection write runs at most once per
    /// event id however often the transport delivers it.
    pub async fn handle(&self, delivery: &Delivery) -> DeliveryOutcome {
        let event = match InboundEvent::decode(delivery, self.clock.now()) {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, attempt = delivery.attempt, "Dropping undecodable delivery");
                return DeliveryOutcome::Poison(e.to_string());
            }
        };

        let metadata = serde_json::json!({
            "event_type": event.event_type,
            "aggregate_id": event.aggregate_id,
            "version": event.version,
        });

        let mut applied = None;
        let mut retryable = true;
        let (applied_slot, retryable_slot) = (&mut applied, &mut retryable);
        let applier = &self.applier;
        let event_ref = &event;
        let result = self
            .guard
            .process_with_metadata(&event.event_id, Some(metadata), move || async move {
                match applier.apply(event_ref).await {
                    Ok(outcome) => {
                        *applied_slot = Some(outcome);
                        Ok(())
                    }
                    Err(e) => {
                        *retryable_slot = e.is_retryable();
                        Err(anyhow::Error::new(e))
                    }
                }
            })
            .await;

        match result {
            Ok(ProcessingResult::Success) => {
                DeliveryOutcome::Processed(applied.unwrap_or(ApplyOutcome::Applied))
            }
            Ok(ProcessingResult::AlreadyProcessed) => {
                debug!(event_id = %event.event_id, "Duplicate delivery ignored");
                DeliveryOutcome::Duplicate
            }
            Ok(ProcessingResult::InFlight) => DeliveryOutcome::InFlight,
            Ok(ProcessingResult::Failed(message)) if retryable => DeliveryOutcome::Retry(message),
            Ok(ProcessingResult::Failed(message)) => DeliveryOutcome::Poison(message),
            Err(IdempotencyError::InvalidEventId(message)) => DeliveryOutcome::Poison(message),
            // The dedup ledger lives in the same database as the read model.
            Err(e) => DeliveryOutcome::Retry(e.to_string()),
        }
    }

    /// Consume `deliveries` until `shutdown` flips to `true` or the channel closes.
    ///
    /// On shutdown the intake is closed and everything already queued is
    /// still handed to the workers, which retry for up to `shutdown_grace`.
    pub async fn run(
        self: Arc<Self>,
        mut deliveries: mpsc::Receiver<Delivery>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let workers = self.config.workers.max(1);
        info!(
            workers,
            max_redeliveries = self.config.max_redeliveries,
            "Projection consumer starting"
        );

        let mut lanes = Vec::with_capacity(workers);
        let mut tasks = JoinSet::new();
        for lane in 0..workers {
            let (tx, rx) = mpsc::channel(self.config.worker_queue.max(1));
            tasks.spawn(Arc::clone(&self).work(lane, rx, shutdown.clone()));
            lanes.push(tx);
        }

        loop {
            tokio::select! {
                maybe = deliveries.recv() => {
                    let Some(delivery) = maybe else { break };
                    if !dispatch(&lanes, delivery).await {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        deliveries.close();
                        let mut drained = 0usize;
                        while let Some(delivery) = deliveries.recv().await {
                            if !dispatch(&lanes, delivery).await {
                                break;
                            }
                            drained += 1;
                        }
                        info!(drained, "Projection consumer intake closed");
                        break;
                    }
                }
            }
        }

        drop(lanes);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Projection worker panicked");
            }
        }
        info!("Projection consumer stopped");
    }

    async fn work(
        self: Arc<Self>,
        lane: usize,
        mut rx: mpsc::Receiver<Delivery>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut give_up_at = None;
        while let Some(delivery) = rx.recv().await {
            self.deliver(lane, delivery, &mut shutdown, &mut give_up_at)
                .await;
        }
    }

    /// Handle `delivery` until it is applied or can never be. The lane waits
    /// meanwhile, so later events of the same aggregate stay behind it.
    async fn deliver(
        &self,
        lane: usize,
        mut delivery: Delivery,
        shutdown: &mut watch::Receiver<bool>,
        give_up_at: &mut Option<Instant>,
    ) {
        loop {
            let reason = match self.handle(&delivery).await {
                DeliveryOutcome::Processed(_) | DeliveryOutcome::Duplicate => return,
                DeliveryOutcome::Poison(reason) => {
                    self.metrics.delivery_dropped();
                    error!(lane, reason = %reason, "Poison delivery dropped");
                    return;
                }
                DeliveryOutcome::InFlight if delivery.attempt >= self.config.max_redeliveries => {
                    self.metrics.delivery_dropped();
                    error!(
                        lane,
                        attempts = delivery.attempt + 1,
                        "Delivery abandoned, event stayed claimed by another consumer"
                    );
                    return;
                }
                DeliveryOutcome::InFlight => "claimed by another consumer".to_string(),
                DeliveryOutcome::Retry(reason) => reason,
            };

            let stopping = *shutdown.borrow() || shutdown.has_changed().is_err();
            let mut delay = self.config.backoff_for(delivery.attempt);
            if stopping {
                let deadline =
                    *give_up_at.get_or_insert_with(|| Instant::now() + self.config.shutdown_grace);
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    self.metrics.delivery_dropped();
                    error!(
                        lane,
                        attempts = delivery.attempt + 1,
                        reason = %reason,
                        "Delivery left unapplied at shutdown; replay it from the outbox"
                    );
                    return;
                }
                delay = delay.min(remaining);
            }

            warn!(
                lane,
                attempt = delivery.attempt + 1,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Retrying delivery"
            );
            if stopping {
                tokio::time::sleep(delay).await;
            } else {
                // Wake early on shutdown so the grace period starts counting.
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
            delivery.attempt = delivery.attempt.saturating_add(1);
        }
    }
}

/// Route `delivery` to the lane owning its aggregate.
async fn dispatch(lanes: &[mpsc::Sender<Delivery>], delivery: Delivery) -> bool {
    let lane = lane_for(delivery.partition_key(), lanes.len());
    if lanes[lane].send(delivery).await.is_err() {
        warn!(lane, "Worker lane closed, stopping dispatch");
        return false;
    }
    true
}

fn lane_for(key: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

/// Delete dedup entries past retention every `interval` until shutdown.
pub async fn run_dedup_cleanup<S: ProcessedEventStore + 'static>(
    guard: IdempotencyGuard<S>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = guard.cleanup_old_events().await {
                    warn!(error = %e, "Dedup cleanup failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_is_capped() {
        let config = ConsumerConfig {
            redelivery_delay: Duration::from_millis(100),
            max_redelivery_delay: Duration::from_secs(1),
            ..Default::default()
        };

        assert_eq!(config.backoff_for(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(400));
        assert_eq!(config.backoff_for(4), Duration::from_secs(1));
        assert_eq!(config.backoff_for(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_lane_is_stable_and_in_range() {
        for workers in 1..8 {
            let lane = lane_for("aggregate-1", workers);
            assert!(lane < workers);
            assert_eq!(lane, lane_for("aggregate-1", workers));
        }
    }
}
