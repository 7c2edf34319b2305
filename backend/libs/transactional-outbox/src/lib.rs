//! # Transactional Outbox
//!
//! Ledger rows are written in the same database transaction as the aggregate
//! mutation they describe, so a row exists if and only if the mutation
//! committed. A background [`OutboxProcessor`] later drains unpublished rows
//! and hands them to an [`OutboxPublisher`].
//!
//! Delivery is **at-least-once**:
//! - a row is marked published only after the publisher acknowledged it
//! - a failed publish pushes `available_at` forward with exponential backoff
//! - after `max_attempts` the row is no longer picked up, but it stays in the
//!   table with its `last_error` so an operator can inspect or requeue it
//!
//! Rows of the same aggregate are published in ledger order. An earlier row
//! that is still backing off holds back the rows behind it, mirroring a
//! partition keyed by `aggregate_id`.
//!
//! ## Appending inside a transaction
//!
//! ```rust,no_run
//! use transactional_outbox::{OutboxEvent, SqlxOutboxRepository};
//! use sqlx::PgPool;
//! use std::collections::BTreeMap;
//! use uuid::Uuid;
//! use chrono::Utc;
//!
//! async fn rename(pool: &PgPool, repo: &SqlxOutboxRepository, video_id: Uuid)
//!     -> Result<(), Box<dyn std::error::Error>>
//! {
//!     let mut tx = pool.begin().await?;
//!
//!     sqlx::query("UPDATE videos SET title = $2 WHERE video_id = $1")
//!         .bind(video_id)
//!         .bind("new title")
//!         .execute(&mut *tx)
//!         .await?;
//!
//!     let event = OutboxEvent::new(
//!         Uuid::new_v4(),
//!         "video",
//!         video_id,
//!         "video.updated",
//!         br#"{"title":"new title"}"#.to_vec(),
//!         BTreeMap::new(),
//!         Utc::now(),
//!     );
//!     repo.insert(&mut tx, &event).await?;
//!
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod error;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};

/// A row of the `outbox_events` ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Event identifier; downstream consumers use it as the idempotency key
    pub id: Uuid,

    /// Aggregate family, e.g. "video"
    pub aggregate_type: String,

    /// Aggregate the event belongs to; also the ordering key
    pub aggregate_id: Uuid,

    /// Fully qualified event type, e.g. "video.updated"
    pub event_type: String,

    /// Opaque encoded payload
    pub payload: Vec<u8>,

    /// Routing and trace attributes forwarded to the transport
    pub headers: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,

    /// Earliest time the processor may (re)try publishing this row
    pub available_at: DateTime<Utc>,

    /// Number of failed publish attempts so far
    pub delivery_attempts: i32,

    /// Error from the most recent failed attempt
    pub last_error: Option<String>,

    /// Set once the publisher acknowledged the row (None = unpublished)
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Build a fresh, unpublished ledger row that is immediately due.
    pub fn new(
        id: Uuid,
        aggregate_type: impl Into<String>,
        aggregate_id: Uuid,
        event_type: impl Into<String>,
        payload: Vec<u8>,
        headers: BTreeMap<String, String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            event_type: event_type.into(),
            payload,
            headers,
            created_at,
            available_at: created_at,
            delivery_attempts: 0,
            last_error: None,
            published_at: None,
        }
    }

    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }

    /// True once the row hit the attempt ceiling and needs an operator.
    pub fn is_exhausted(&self, max_attempts: i32) -> bool {
        self.published_at.is_none() && self.delivery_attempts >= max_attempts
    }
}

/// Snapshot of the ledger backlog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingStats {
    /// Unpublished rows still eligible for publishing
    pub pending: i64,
    /// Age of the oldest unpublished row in seconds, 0 if none
    pub oldest_age_seconds: i64,
    /// Unpublished rows that reached the attempt ceiling
    pub exhausted: i64,
}

/// Drain-side access to the ledger used by [`OutboxProcessor`].
///
/// Appending is not part of this trait: it always happens inside the
/// caller's own transaction (see [`SqlxOutboxRepository::insert`]).
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Unpublished rows that are due at `now`, below the attempt ceiling and
    /// not held back by an earlier row of the same aggregate, oldest first.
    ///
    /// An earlier unpublished row holds back its aggregate while it is backing
    /// off or sits at the attempt ceiling.
    async fn fetch_due(
        &self,
        limit: i64,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> OutboxResult<Vec<OutboxEvent>>;

    /// Record a successful publish.
    async fn mark_published(&self, event_id: Uuid) -> OutboxResult<()>;

    /// Record a failed publish and reschedule the row.
    async fn mark_failed(
        &self,
        event_id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> OutboxResult<()>;

    async fn pending_stats(&self, max_attempts: i32) -> OutboxResult<PendingStats>;
}

/// PostgreSQL ledger.
#[derive(Clone)]
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a row inside the caller's transaction.
    ///
    /// Must run in the same transaction as the aggregate write it describes;
    /// rolling that transaction back discards the row as well.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id,
                aggregate_type,
                aggregate_id,
                event_type,
                payload,
                headers,
                created_at,
                available_at,
                delivery_attempts,
                last_error,
                published_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.id)
        .bind(&event.aggregate_type)
        .bind(event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(Json(&event.headers))
        .bind(event.created_at)
        .bind(event.available_at)
        .bind(event.delivery_attempts)
        .bind(&event.last_error)
        .bind(event.published_at)
        .execute(&mut **tx)
        .await?;

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            "Event appended to outbox"
        );

        Ok(())
    }

    /// Make rows that hit the attempt ceiling eligible again.
    pub async fn requeue_exhausted(&self, max_attempts: i32) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_events
            SET delivery_attempts = 0,
                available_at = NOW()
            WHERE published_at IS NULL
              AND delivery_attempts >= $1
            "#,
        )
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    /// Reset rows created since `ts` so they are published again.
    pub async fn replay_since(&self, ts: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_events
            SET published_at = NULL,
                delivery_attempts = 0,
                last_error = NULL,
                available_at = NOW()
            WHERE created_at >= $1
            "#,
        )
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    fn row_to_event(row: PgRow) -> Result<OutboxEvent, sqlx::Error> {
        let headers: Json<BTreeMap<String, String>> = row.try_get("headers")?;
        Ok(OutboxEvent {
            id: row.try_get("id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            headers: headers.0,
            created_at: row.try_get("created_at")?,
            available_at: row.try_get("available_at")?,
            delivery_attempts: row.try_get("delivery_attempts")?,
            last_error: row.try_get("last_error")?,
            published_at: row.try_get("published_at")?,
        })
    }
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn fetch_due(
        &self,
        limit: i64,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        // `seq` is the insertion order; `created_at` can tie for rows written
        // by the same transaction.
        let rows = sqlx::query(
            r#"
            SELECT
                o.id,
                o.aggregate_type,
                o.aggregate_id,
                o.event_type,
                o.payload,
                o.headers,
                o.created_at,
                o.available_at,
                o.delivery_attempts,
                o.last_error,
                o.published_at
            FROM outbox_events o
            WHERE o.published_at IS NULL
              AND o.delivery_attempts < $2
              AND o.available_at <= $3
              AND NOT EXISTS (
                  SELECT 1 FROM outbox_events earlier
                  WHERE earlier.aggregate_id = o.aggregate_id
                    AND earlier.seq < o.seq
                    AND earlier.published_at IS NULL
                    AND (earlier.delivery_attempts >= $2 OR earlier.available_at > $3)
              )
            ORDER BY o.seq ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .bind(max_attempts)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let events = rows
            .into_iter()
            .map(Self::row_to_event)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        debug!(count = events.len(), "Fetched due outbox events");

        Ok(events)
    }

    async fn mark_published(&self, event_id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET published_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(event_id = %event_id, "Event not found when marking as published");
            return Err(OutboxError::EventNotFound(event_id));
        }

        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET
                delivery_attempts = delivery_attempts + 1,
                last_error = $2,
                available_at = $3
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(event_id = %event_id, "Event not found when marking as failed");
            return Err(OutboxError::EventNotFound(event_id));
        }

        Ok(())
    }

    async fn pending_stats(&self, max_attempts: i32) -> OutboxResult<PendingStats> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE delivery_attempts < $1)::BIGINT AS pending,
                COUNT(*) FILTER (WHERE delivery_attempts >= $1)::BIGINT AS exhausted,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_events
            WHERE published_at IS NULL
            "#,
        )
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await?;

        Ok(PendingStats {
            pending: rec.try_get("pending")?,
            oldest_age_seconds: rec.try_get("age_seconds")?,
            exhausted: rec.try_get("exhausted")?,
        })
    }
}

/// Hands ledger rows to a message transport.
///
/// Implementations must tolerate the same row being published more than once.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()>;
}

/// Tuning knobs for [`OutboxProcessor`].
#[derive(Debug, Clone)]
pub struct OutboxProcessorConfig {
    /// Rows fetched per polling cycle
    pub batch_size: i64,
    /// Sleep between cycles when the ledger is drained
    pub poll_interval: Duration,
    /// Attempt ceiling; rows at the ceiling are left for an operator
    pub max_attempts: i32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Aggregates published concurrently within one batch
    pub workers: usize,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            max_attempts: 10,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            workers: 4,
        }
    }
}

impl OutboxProcessorConfig {
    /// `base_backoff * 2^attempts`, capped at `max_backoff`.
    pub fn backoff_for(&self, delivery_attempts: i32) -> Duration {
        let exponent = delivery_attempts.clamp(0, 20) as u32;
        self.base_backoff
            .checked_mul(2u32.pow(exponent))
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Outcome of one polling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub published: usize,
    pub failed: usize,
}

impl BatchReport {
    fn merge(self, other: BatchReport) -> BatchReport {
        BatchReport {
            published: self.published + other.published,
            failed: self.failed + other.failed,
        }
    }
}

/// Background loop that drains the ledger.
///
/// Rows are grouped by aggregate; groups are published concurrently up to
/// `workers`, rows inside a group strictly in ledger order. The first failure
/// in a group stops that group for the cycle so later rows never overtake it.
pub struct OutboxProcessor<R: OutboxRepository, P: OutboxPublisher> {
    repository: Arc<R>,
    publisher: Arc<P>,
    config: OutboxProcessorConfig,
    metrics: Option<crate::metrics::OutboxMetrics>,
}

impl<R: OutboxRepository, P: OutboxPublisher> OutboxProcessor<R, P> {
    pub fn new(repository: Arc<R>, publisher: Arc<P>, config: OutboxProcessorConfig) -> Self {
        Self {
            repository,
            publisher,
            config,
            metrics: None,
        }
    }

    /// Also update the backlog gauges every cycle.
    pub fn with_metrics(mut self, metrics: crate::metrics::OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &OutboxProcessorConfig {
        &self.config
    }

    /// Run until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> OutboxResult<()> {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_attempts = self.config.max_attempts,
            workers = self.config.workers,
            "Outbox processor starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = match self.process_batch().await {
                Ok(report) => {
                    if report.published > 0 || report.failed > 0 {
                        info!(
                            published = report.published,
                            failed = report.failed,
                            "Outbox batch processed"
                        );
                    }
                    report
                }
                Err(e) => {
                    error!(error = %e, "Outbox processor error");
                    BatchReport::default()
                }
            };

            self.refresh_gauges().await;

            // A full batch usually means more rows are waiting.
            if report.published as i64 >= self.config.batch_size {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Outbox processor stopped");
        Ok(())
    }

    /// Publish one batch of due rows.
    pub async fn process_batch(&self) -> OutboxResult<BatchReport> {
        let events = self
            .repository
            .fetch_due(self.config.batch_size, self.config.max_attempts, Utc::now())
            .await?;

        if events.is_empty() {
            return Ok(BatchReport::default());
        }

        let groups = group_by_aggregate(events);
        let workers = self.config.workers.max(1);

        let report = stream::iter(groups)
            .map(|group| self.publish_group(group))
            .buffer_unordered(workers)
            .fold(BatchReport::default(), |acc, r| async move { acc.merge(r) })
            .await;

        Ok(report)
    }

    async fn publish_group(&self, group: Vec<OutboxEvent>) -> BatchReport {
        let mut report = BatchReport::default();

        for event in group {
            match self.publisher.publish(&event).await {
                Ok(()) => {
                    if let Err(e) = self.repository.mark_published(event.id).await {
                        // Delivered but not recorded: the row will be published
                        // again and the consumer's dedup ledger absorbs it.
                        error!(
                            event_id = %event.id,
                            error = %e,
                            "Failed to mark event as published"
                        );
                        break;
                    }
                    report.published += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.published.inc();
                    }
                }
                Err(e) => {
                    let attempts = event.delivery_attempts + 1;
                    let delay = self.config.backoff_for(event.delivery_attempts);
                    let next_attempt_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(300));

                    if attempts >= self.config.max_attempts {
                        warn!(
                            event_id = %event.id,
                            event_type = %event.event_type,
                            attempts,
                            error = %e,
                            "Event reached max delivery attempts, leaving it for manual intervention"
                        );
                        if let Some(metrics) = &self.metrics {
                            metrics.exhausted.inc();
                        }
                    } else {
                        warn!(
                            event_id = %event.id,
                            event_type = %event.event_type,
                            attempts,
                            backoff_ms = delay.as_millis() as u64,
                            error = %e,
                            "Failed to publish event, rescheduled"
                        );
                    }

                    if let Err(mark_err) = self
                        .repository
                        .mark_failed(event.id, &e.to_string(), next_attempt_at)
                        .await
                    {
                        error!(
                            event_id = %event.id,
                            error = %mark_err,
                            "Failed to mark event as failed"
                        );
                    }

                    report.failed += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.failed.inc();
                    }
                    break;
                }
            }
        }

        report
    }

    async fn refresh_gauges(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        match self.repository.pending_stats(self.config.max_attempts).await {
            Ok(stats) => {
                metrics.pending.set(stats.pending);
                metrics.oldest_pending_age_seconds.set(stats.oldest_age_seconds);
                metrics.exhausted_pending.set(stats.exhausted);
            }
            Err(e) => debug!(error = %e, "Failed to refresh outbox gauges"),
        }
    }
}

/// Split a ledger-ordered batch into per-aggregate groups, keeping order.
fn group_by_aggregate(events: Vec<OutboxEvent>) -> Vec<Vec<OutboxEvent>> {
    let mut index: BTreeMap<Uuid, usize> = BTreeMap::new();
    let mut groups: Vec<Vec<OutboxEvent>> = Vec::new();

    for event in events {
        match index.get(&event.aggregate_id) {
            Some(&i) => groups[i].push(event),
            None => {
                index.insert(event.aggregate_id, groups.len());
                groups.push(vec![event]);
            }
        }
    }

    groups
}
