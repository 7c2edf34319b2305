//! # Idempotent Consumer
//!
//! Turns at-least-once delivery into effectively exactly-once processing by
//! keeping a dedup ledger keyed by `event_id`.
//!
//! ```text
//! transport → consumer → IdempotencyGuard → handler → projection store
//!                              ↓
//!                     processed_events ledger
//! ```
//!
//! Each delivery goes through a claim lifecycle:
//!
//! 1. **claim**: atomically insert `in_progress` for the event id. Only one
//!    consumer wins the claim; the rest see `AlreadyProcessed` (the event
//!    succeeded before) or `InFlight` (someone else holds the claim).
//! 2. **run** the handler.
//! 3. **complete** (`succeeded`) or **fail** (`failed`, with the error). Failed
//!    events can be claimed again by a redelivery.
//!
//! A claim older than the lease is considered abandoned (crashed consumer)
//! and can be taken over.
//!
//! ## Usage
//!
//! ```ignore
//! use idempotent_consumer::{IdempotencyGuard, PgProcessedEventStore, ProcessingResult};
//! use std::time::Duration;
//!
//! let guard = IdempotencyGuard::new(
//!     PgProcessedEventStore::new(pool),
//!     Duration::from_secs(7 * 86400),
//! );
//!
//! match guard.process_if_new("event-123", || async {
//!     apply_to_projection().await?;
//!     Ok(())
//! }).await? {
//!     ProcessingResult::Success => {}
//!     ProcessingResult::AlreadyProcessed => {}
//!     ProcessingResult::InFlight => { /* redeliver later */ }
//!     ProcessingResult::Failed(err) => { /* redeliver later */ }
//! }
//! ```
//!
//! Run [`IdempotencyGuard::cleanup_old_events`] periodically so the ledger
//! does not grow without bound; ids older than the retention window may be
//! processed again if the transport redelivers them that late.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

mod error;

pub use error::{IdempotencyError, IdempotencyResult};

/// Result of processing an event with idempotency check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// Event was processed successfully (first time)
    Success,

    /// Event was already processed before (duplicate)
    AlreadyProcessed,

    /// Another consumer currently holds the claim
    InFlight,

    /// Event processing failed with error message
    Failed(String),
}

impl ProcessingResult {
    /// Check if processing was successful (either first time or already processed)
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            ProcessingResult::Success | ProcessingResult::AlreadyProcessed
        )
    }

    /// Check if the delivery should be retried later
    pub fn needs_redelivery(&self) -> bool {
        matches!(self, ProcessingResult::InFlight | ProcessingResult::Failed(_))
    }
}

/// Lifecycle state of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::InProgress => "in_progress",
            ProcessingStatus::Succeeded => "succeeded",
            ProcessingStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> IdempotencyResult<Self> {
        match value {
            "in_progress" => Ok(ProcessingStatus::InProgress),
            "succeeded" => Ok(ProcessingStatus::Succeeded),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(IdempotencyError::Other(anyhow::anyhow!(
                "unknown processing status: {other}"
            ))),
        }
    }
}

/// A dedup ledger entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    /// Unique event identifier (from transport header or payload)
    pub event_id: String,

    pub status: ProcessingStatus,

    /// Number of claims taken on this event
    pub attempts: i32,

    pub last_error: Option<String>,

    pub claimed_at: DateTime<Utc>,

    /// Set when the handler succeeded
    pub processed_at: Option<DateTime<Utc>>,

    /// Optional metadata about processing (consumer group, partition, ...)
    pub metadata: Option<serde_json::Value>,
}

/// Outcome of trying to claim an event id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyProcessed,
    InFlight,
}

/// Storage for the dedup ledger
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    /// Atomically claim `event_id`. A new id, a failed id, or an
    /// `in_progress` claim older than `lease` can be claimed.
    async fn try_claim(
        &self,
        event_id: &str,
        lease: Duration,
        metadata: Option<serde_json::Value>,
    ) -> IdempotencyResult<ClaimOutcome>;

    async fn complete(&self, event_id: &str) -> IdempotencyResult<()>;

    async fn fail(&self, event_id: &str, error: &str) -> IdempotencyResult<()>;

    async fn is_processed(&self, event_id: &str) -> IdempotencyResult<bool>;

    /// Remove succeeded entries processed before `cutoff`.
    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> IdempotencyResult<u64>;
}

/// PostgreSQL dedup ledger (`processed_events` table)
#[derive(Clone)]
pub struct PgProcessedEventStore {
    pool: PgPool,
}

impl PgProcessedEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedEventStore for PgProcessedEventStore {
    async fn try_claim(
        &self,
        event_id: &str,
        lease: Duration,
        metadata: Option<serde_json::Value>,
    ) -> IdempotencyResult<ClaimOutcome> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);

        // ON CONFLICT ... WHERE only takes over failed or abandoned claims;
        // a concurrent claimer sees zero returned rows.
        let claimed = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, status, attempts, claimed_at, metadata)
            VALUES ($1, 'in_progress', 1, NOW(), $2)
            ON CONFLICT (event_id) DO UPDATE
            SET status = 'in_progress',
                attempts = processed_events.attempts + 1,
                claimed_at = NOW()
            WHERE processed_events.status = 'failed'
               OR (processed_events.status = 'in_progress'
                   AND processed_events.claimed_at < NOW() - ($3::BIGINT * INTERVAL '1 millisecond'))
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(&metadata)
        .bind(lease_ms)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim event")?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let row = sqlx::query("SELECT status FROM processed_events WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read claim status")?;

        let status = match row {
            Some(row) => ProcessingStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
            // Cleaned up between the two statements; treat as in flight and
            // let the redelivery claim it.
            None => return Ok(ClaimOutcome::InFlight),
        };

        Ok(match status {
            ProcessingStatus::Succeeded => ClaimOutcome::AlreadyProcessed,
            ProcessingStatus::InProgress | ProcessingStatus::Failed => ClaimOutcome::InFlight,
        })
    }

    async fn complete(&self, event_id: &str) -> IdempotencyResult<()> {
        sqlx::query(
            r#"
            UPDATE processed_events
            SET status = 'succeeded', processed_at = NOW(), last_error = NULL
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark event as processed")?;
        Ok(())
    }

    async fn fail(&self, event_id: &str, error: &str) -> IdempotencyResult<()> {
        sqlx::query(
            r#"
            UPDATE processed_events
            SET status = 'failed', last_error = $2
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to mark event as failed")?;
        Ok(())
    }

    async fn is_processed(&self, event_id: &str) -> IdempotencyResult<bool> {
        let result = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM processed_events
                WHERE event_id = $1 AND status = 'succeeded'
            ) AS exists
            "#,
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check if event is processed")?;

        Ok(result.try_get("exists")?)
    }

    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> IdempotencyResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM processed_events
            WHERE status = 'succeeded' AND processed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to cleanup old events")?;

        Ok(result.rows_affected())
    }
}

/// In-process dedup ledger for tests and single-node runs
#[derive(Debug, Clone, Default)]
pub struct InMemoryProcessedEventStore {
    entries: Arc<Mutex<HashMap<String, ProcessedEvent>>>,
}

impl InMemoryProcessedEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, event_id: &str) -> Option<ProcessedEvent> {
        self.lock().get(event_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProcessedEvent>> {
        // A panic while holding the lock cannot leave an entry half-written.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ProcessedEventStore for InMemoryProcessedEventStore {
    async fn try_claim(
        &self,
        event_id: &str,
        lease: Duration,
        metadata: Option<serde_json::Value>,
    ) -> IdempotencyResult<ClaimOutcome> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let mut entries = self.lock();

        match entries.get_mut(event_id) {
            None => {
                entries.insert(
                    event_id.to_string(),
                    ProcessedEvent {
                        event_id: event_id.to_string(),
                        status: ProcessingStatus::InProgress,
                        attempts: 1,
                        last_error: None,
                        claimed_at: now,
                        processed_at: None,
                        metadata,
                    },
                );
                Ok(ClaimOutcome::Claimed)
            }
            Some(entry) => match entry.status {
                ProcessingStatus::Succeeded => Ok(ClaimOutcome::AlreadyProcessed),
                ProcessingStatus::InProgress if now - entry.claimed_at < lease => {
                    Ok(ClaimOutcome::InFlight)
                }
                ProcessingStatus::InProgress | ProcessingStatus::Failed => {
                    entry.status = ProcessingStatus::InProgress;
                    entry.attempts += 1;
                    entry.claimed_at = now;
                    Ok(ClaimOutcome::Claimed)
                }
            },
        }
    }

    async fn complete(&self, event_id: &str) -> IdempotencyResult<()> {
        if let Some(entry) = self.lock().get_mut(event_id) {
            entry.status = ProcessingStatus::Succeeded;
            entry.processed_at = Some(Utc::now());
            entry.last_error = None;
        }
        Ok(())
    }

    async fn fail(&self, event_id: &str, error: &str) -> IdempotencyResult<()> {
        if let Some(entry) = self.lock().get_mut(event_id) {
            entry.status = ProcessingStatus::Failed;
            entry.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn is_processed(&self, event_id: &str) -> IdempotencyResult<bool> {
        Ok(self
            .lock()
            .get(event_id)
            .map(|e| e.status == ProcessingStatus::Succeeded)
            .unwrap_or(false))
    }

    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> IdempotencyResult<u64> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| {
            !(e.status == ProcessingStatus::Succeeded
                && e.processed_at.map(|t| t < cutoff).unwrap_or(false))
        });
        Ok((before - entries.len()) as u64)
    }
}

/// Idempotency guard for event processing
///
/// Cheap to clone; share it across consumer workers.
pub struct IdempotencyGuard<S: ProcessedEventStore> {
    store: Arc<S>,
    retention_duration: Duration,
    lease: Duration,
}

impl<S: ProcessedEventStore> Clone for IdempotencyGuard<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            retention_duration: self.retention_duration,
            lease: self.lease,
        }
    }
}

impl<S: ProcessedEventStore> IdempotencyGuard<S> {
    /// Create a new idempotency guard
    ///
    /// # Retention Guidelines
    ///
    /// - **7 days**: Typical for high-volume systems (10k+ events/day)
    /// - **30 days**: Low-volume or audit requirements
    /// - **1 day**: Extreme volume (>1M events/day)
    pub fn new(store: S, retention_duration: Duration) -> Self {
        Self {
            store: Arc::new(store),
            retention_duration,
            lease: Duration::from_secs(60),
        }
    }

    /// How long a claim may stay `in_progress` before another consumer may take it over.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn is_processed(&self, event_id: &str) -> IdempotencyResult<bool> {
        Self::validate_event_id(event_id)?;
        self.store.is_processed(event_id).await
    }

    /// Process event only if it hasn't been processed before
    ///
    /// # Concurrency Safety
    ///
    /// If 10 consumers process the same event_id concurrently:
    /// - Only 1 will execute the processing function
    /// - The others return `InFlight` (or `AlreadyProcessed` once it succeeded)
    pub async fn process_if_new<F, Fut>(
        &self,
        event_id: &str,
        f: F,
    ) -> IdempotencyResult<ProcessingResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), anyhow::Error>>,
    {
        self.process_with_metadata(event_id, None, f).await
    }

    /// Same as [`process_if_new`](Self::process_if_new), storing `metadata`
    /// with the claim.
    pub async fn process_with_metadata<F, Fut>(
        &self,
        event_id: &str,
        metadata: Option<serde_json::Value>,
        f: F,
    ) -> IdempotencyResult<ProcessingResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), anyhow::Error>>,
    {
        Self::validate_event_id(event_id)?;

        match self.store.try_claim(event_id, self.lease, metadata).await? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyProcessed => {
                debug!(event_id = %event_id, "Event already processed, skipping");
                return Ok(ProcessingResult::AlreadyProcessed);
            }
            ClaimOutcome::InFlight => {
                debug!(event_id = %event_id, "Event claimed by another consumer");
                return Ok(ProcessingResult::InFlight);
            }
        }

        match f().await {
            Ok(()) => {
                self.store.complete(event_id).await?;
                Ok(ProcessingResult::Success)
            }
            Err(e) => {
                warn!(
                    event_id = %event_id,
                    error = ?e,
                    "Event processing failed"
                );
                let message = format!("{e:#}");
                self.store.fail(event_id, &message).await?;
                Ok(ProcessingResult::Failed(message))
            }
        }
    }

    /// Delete succeeded entries older than the retention window
    pub async fn cleanup_old_events(&self) -> IdempotencyResult<u64> {
        let cutoff_time = Utc::now()
            - chrono::Duration::from_std(self.retention_duration).map_err(|e| {
                IdempotencyError::Other(anyhow::anyhow!("Invalid retention duration: {}", e))
            })?;

        let deleted_count = self.store.cleanup_before(cutoff_time).await?;

        if deleted_count > 0 {
            info!(
                deleted_count = deleted_count,
                cutoff_time = %cutoff_time,
                "Cleaned up old processed events"
            );
        } else {
            debug!("No old events to cleanup");
        }

        Ok(deleted_count)
    }

    /// Validate event_id format
    fn validate_event_id(event_id: &str) -> IdempotencyResult<()> {
        if event_id.is_empty() {
            return Err(IdempotencyError::InvalidEventId(
                "Event ID cannot be empty".to_string(),
            ));
        }

        if event_id.len() > 255 {
            return Err(IdempotencyError::InvalidEventId(format!(
                "Event ID too long: {} characters (max 255)",
                event_id.len()
            )));
        }

        Ok(())
    }
}

impl IdempotencyGuard<PgProcessedEventStore> {
    /// Guard backed by the `processed_events` table
    pub fn postgres(pool: PgPool, retention_duration: Duration) -> Self {
        Self::new(PgProcessedEventStore::new(pool), retention_duration)
    }
}
