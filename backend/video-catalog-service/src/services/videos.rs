use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use super::context::RequestContext;
use super::processing::{compute_overall_status, latest_transition};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::CatalogStore;
use crate::error::{AppError, Result};
use crate::events::{
    build_changed, build_created, build_deleted, build_processing_failed, ChangeKind, DomainEvent,
};
use crate::metrics::MetricsReporter;
use crate::models::{OverallStatus, Patch, Stage, StageStatus, VideoAggregate, VideoChanges};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct CreateVideoRequest {
    /// Caller-chosen id; makes a retried create fail with a conflict instead
    /// of registering the upload twice
    pub video_id: Option<Uuid>,
    pub event_id: Option<Uuid>,
    pub upload_user_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub title: String,
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    #[validate(length(min = 1, max = 1024))]
    pub raw_file_reference: String,
}

/// Generic update. Enum fields arrive as strings and are parsed here.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateVideoRequest {
    pub video_id: Uuid,
    pub event_id: Option<Uuid>,
    /// Reject the update unless the stored version still matches
    pub expected_version: Option<i64>,

    #[validate(length(min = 1, max = 255))]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Patch<String>,

    pub overall_status: Option<String>,
    pub media_status: Option<String>,
    pub analysis_status: Option<String>,

    #[serde(default)]
    pub duration_seconds: Patch<i32>,
    #[serde(default)]
    pub resolution: Patch<String>,
    #[serde(default)]
    pub bitrate_kbps: Patch<i32>,
    #[serde(default)]
    pub thumbnail_url: Patch<String>,
    #[serde(default)]
    pub playlist_url: Patch<String>,
    #[serde(default)]
    pub difficulty: Patch<String>,
    #[serde(default)]
    pub summary: Patch<String>,
    #[serde(default)]
    pub tags: Patch<Vec<String>>,
    #[serde(default)]
    pub subtitle_url: Patch<String>,
    #[serde(default)]
    pub error_message: Patch<String>,
}

impl UpdateVideoRequest {
    fn into_changes(self) -> Result<VideoChanges> {
        self.validate()?;
        if self.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(AppError::validation("title must not be blank"));
        }
        non_negative("duration_seconds", self.duration_seconds.as_set().copied())?;
        non_negative("bitrate_kbps", self.bitrate_kbps.as_set().copied())?;

        let overall_status: Option<OverallStatus> =
            self.overall_status.as_deref().map(str::parse).transpose()?;
        if let Some(target) = overall_status.filter(|s| s.is_visibility_target()) {
            return Err(AppError::validation(format!(
                "overall_status {target} is set through update_visibility"
            )));
        }

        let changes = VideoChanges {
            title: self.title.map(|t| t.trim().to_string()),
            description: self.description,
            overall_status,
            media_status: self.media_status.as_deref().map(str::parse).transpose()?,
            analysis_status: self.analysis_status.as_deref().map(str::parse).transpose()?,
            duration_seconds: self.duration_seconds,
            resolution: self.resolution,
            bitrate_kbps: self.bitrate_kbps,
            thumbnail_url: self.thumbnail_url,
            playlist_url: self.playlist_url,
            difficulty: self.difficulty,
            summary: self.summary,
            tags: self.tags,
            subtitle_url: self.subtitle_url,
            error_message: self.error_message,
            ..Default::default()
        };

        if changes.is_empty() {
            return Err(AppError::validation("no fields to update"));
        }
        Ok(changes)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct DeleteVideoRequest {
    pub video_id: Uuid,
    pub event_id: Option<Uuid>,
    pub expected_version: Option<i64>,
    #[validate(length(max = 1000))]
    pub reason: Option<String>,
}

pub(crate) fn non_negative(field: &str, value: Option<i32>) -> Result<()> {
    match value {
        Some(v) if v < 0 => Err(AppError::validation(format!(
            "{field} must not be negative"
        ))),
        _ => Ok(()),
    }
}

/// Identity of an event appended by a command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRef {
    pub event_id: Uuid,
    pub event_type: String,
    pub version: i64,
    pub occurred_at: DateTime<Utc>,
}

impl From<&DomainEvent> for EventRef {
    fn from(event: &DomainEvent) -> Self {
        Self {
            event_id: event.event_id,
            event_type: event.event_type().to_string(),
            version: event.version,
            occurred_at: event.occurred_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoCreated {
    pub video_id: Uuid,
    pub overall_status: OverallStatus,
    pub media_status: StageStatus,
    pub analysis_status: StageStatus,
    pub created_at: DateTime<Utc>,
    pub event: EventRef,
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoUpdated {
    pub video_id: Uuid,
    pub overall_status: OverallStatus,
    pub media_status: StageStatus,
    pub analysis_status: StageStatus,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    pub event: EventRef,
    /// Set when a stage newly moved to failed
    pub failure_event: Option<EventRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoDeleted {
    pub video_id: Uuid,
    pub event: EventRef,
}

/// A stage that moved to failed in this mutation.
#[derive(Debug, Clone)]
pub(crate) struct StageFailure {
    pub stage: Stage,
    pub job_id: Option<String>,
    pub error_message: Option<String>,
}

/// One aggregate mutation as requested by the update paths.
#[derive(Debug, Clone)]
pub(crate) struct ChangeRequest {
    pub video_id: Uuid,
    pub event_id: Option<Uuid>,
    pub expected_version: Option<i64>,
    pub kind: ChangeKind,
    pub changes: VideoChanges,
    pub failure: Option<StageFailure>,
    /// Derive `overall_status` from stage changes when the request did not set it
    pub derive_overall: bool,
}

/// Create, update and delete videos. Each call is one transaction pairing
/// the aggregate write with its outbox rows.
pub struct VideoCommandService<C: CatalogStore> {
    store: Arc<C>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsReporter>,
    timeout: Duration,
}

impl<C: CatalogStore> Clone for VideoCommandService<C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            metrics: Arc::clone(&self.metrics),
            timeout: self.timeout,
        }
    }
}

impl<C: CatalogStore> VideoCommandService<C> {
    pub fn new(store: Arc<C>, clock: Arc<dyn Clock>, metrics: Arc<dyn MetricsReporter>) -> Self {
        Self {
            store,
            clock,
            metrics,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Service using the command timeout from `config`.
    pub fn from_config(
        store: Arc<C>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsReporter>,
        config: &Config,
    ) -> Self {
        Self::new(store, clock, metrics).with_timeout(config.command_timeout())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<C> {
        &self.store
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Committed state of one video.
    pub async fn get_video(&self, video_id: Uuid) -> Result<VideoAggregate> {
        self.store
            .get_video(video_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("video {video_id}")))
    }

    pub async fn create_video(
        &self,
        ctx: &RequestContext,
        req: CreateVideoRequest,
    ) -> Result<VideoCreated> {
        self.run(ctx, "create_video", self.create_inner(ctx, req))
            .await
    }

    pub async fn update_video(
        &self,
        ctx: &RequestContext,
        req: UpdateVideoRequest,
    ) -> Result<VideoUpdated> {
        self.run(ctx, "update_video", async {
            let video_id = req.video_id;
            let event_id = req.event_id;
            let expected_version = req.expected_version;
            let changes = req.into_changes()?;
            self.apply_change(
                ctx,
                ChangeRequest {
                    video_id,
                    event_id,
                    expected_version,
                    kind: ChangeKind::Updated,
                    changes,
                    failure: None,
                    derive_overall: true,
                },
            )
            .await
        })
        .await
    }

    pub async fn delete_video(
        &self,
        ctx: &RequestContext,
        req: DeleteVideoRequest,
    ) -> Result<VideoDeleted> {
        self.run(ctx, "delete_video", self.delete_inner(ctx, req))
            .await
    }

    /// Run `operation` under the caller's deadline and record its outcome.
    ///
    /// When the deadline expires the future is dropped, which drops any open
    /// transaction and rolls it back.
    pub(crate) async fn run<T>(
        &self,
        ctx: &RequestContext,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let started = Instant::now();
        let budget = ctx.budget(self.timeout);

        let result = if budget.is_zero() {
            Err(AppError::Timeout(budget))
        } else {
            match tokio::time::timeout(budget, fut).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout(budget)),
            }
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind().as_str(),
        };
        self.metrics
            .command_completed(operation, outcome, started.elapsed());

        if let Err(err) = &result {
            match err {
                AppError::Internal(_) | AppError::Timeout(_) => {
                    warn!(operation, error = %err, "Command failed")
                }
                _ => debug!(operation, error = %err, "Command rejected"),
            }
        }
        result
    }

    async fn create_inner(
        &self,
        ctx: &RequestContext,
        req: CreateVideoRequest,
    ) -> Result<VideoCreated> {
        req.validate()?;
        if req.upload_user_id.is_nil() {
            return Err(AppError::validation("upload_user_id is required"));
        }
        let title = req.title.trim();
        if title.is_empty() {
            return Err(AppError::validation("title must not be blank"));
        }
        let raw_file_reference = req.raw_file_reference.trim();
        if raw_file_reference.is_empty() {
            return Err(AppError::validation("raw_file_reference must not be blank"));
        }
        let event_id = fresh_event_id(req.event_id)?;
        let video_id = match req.video_id {
            Some(id) if id.is_nil() => return Err(AppError::validation("video_id must not be nil")),
            Some(id) => id,
            None => Uuid::new_v4(),
        };

        let now = self.clock.now();
        let mut video = VideoAggregate::new_upload(
            video_id,
            req.upload_user_id,
            title.to_string(),
            req.description.filter(|d| !d.trim().is_empty()),
            raw_file_reference.to_string(),
            now,
        );
        let event = build_created(Some(&video), event_id, now)?
            .with_correlation_id(ctx.correlation_id());
        video.version = event.version;

        let mut tx = self.store.begin().await?;
        let result = async {
            self.store.insert_video(&mut tx, &video).await?;
            self.store
                .append_event(&mut tx, &event.to_outbox_event()?)
                .await?;
            Ok::<_, AppError>(())
        }
        .await;
        self.finish(tx, result).await?;
        self.metrics.event_appended(event.event_type());

        info!(
            video_id = %video.video_id,
            event_id = %event.event_id,
            "Video created"
        );

        Ok(VideoCreated {
            video_id: video.video_id,
            overall_status: video.overall_status,
            media_status: video.media_status,
            analysis_status: video.analysis_status,
            created_at: video.created_at,
            event: EventRef::from(&event),
        })
    }

    /// Apply one changeset in its own transaction. Not instrumented; callers
    /// wrap it in [`run`](Self::run).
    pub(crate) async fn apply_change(
        &self,
        ctx: &RequestContext,
        change: ChangeRequest,
    ) -> Result<VideoUpdated> {
        let event_id = fresh_event_id(change.event_id)?;
        let mut tx = self.store.begin().await?;
        let result = self.apply_in_tx(ctx, &mut tx, change, event_id).await;
        let (updated, events) = self.finish(tx, result).await?;

        for event in &events {
            self.metrics.event_appended(event.event_type());
        }
        info!(
            video_id = %updated.video_id,
            version = updated.version,
            events = events.len(),
            "Video updated"
        );

        let mut events = events.iter().map(EventRef::from);
        let event = events
            .next()
            .ok_or_else(|| AppError::Internal("update emitted no event".to_string()))?;

        Ok(VideoUpdated {
            video_id: updated.video_id,
            overall_status: updated.overall_status,
            media_status: updated.media_status,
            analysis_status: updated.analysis_status,
            version: updated.version,
            updated_at: updated.updated_at,
            event,
            failure_event: events.next(),
        })
    }

    async fn apply_in_tx(
        &self,
        ctx: &RequestContext,
        tx: &mut C::Tx,
        change: ChangeRequest,
        event_id: Uuid,
    ) -> Result<(VideoAggregate, Vec<DomainEvent>)> {
        let current = self
            .store
            .load_video(tx, change.video_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("video {}", change.video_id)))?;

        if let Some(expected) = change.expected_version {
            if expected != current.version {
                return Err(AppError::conflict(format!(
                    "video {} is at version {}, expected {}",
                    current.video_id, current.version, expected
                )));
            }
        }

        let mut changes = change.changes;
        if change.derive_overall && changes.overall_status.is_none() {
            derive_overall_status(&current, &mut changes);
        }

        let now = self.clock.now();
        let event = build_changed(Some(&current), change.kind, changes.clone(), event_id, now)?
            .with_correlation_id(ctx.correlation_id());

        let mut updated = current.clone();
        changes.apply_to(&mut updated);
        updated.updated_at = now;
        updated.version = event.version;

        let mut events = vec![event];
        if let Some(failure) = change.failure {
            let failed = build_processing_failed(
                Some(&updated),
                failure.stage,
                failure.job_id,
                failure.error_message,
                Uuid::new_v4(),
                now,
            )?
            .with_correlation_id(ctx.correlation_id());
            updated.version = failed.version;
            events.push(failed);
        }

        if !self
            .store
            .update_video(tx, &updated, current.version)
            .await?
        {
            return Err(AppError::conflict(format!(
                "video {} was modified concurrently",
                current.video_id
            )));
        }
        for event in &events {
            self.store
                .append_event(tx, &event.to_outbox_event()?)
                .await?;
        }

        debug!(
            video_id = %updated.video_id,
            fields = ?changes.changed_fields(),
            "Changeset staged"
        );
        Ok((updated, events))
    }

    async fn delete_inner(
        &self,
        ctx: &RequestContext,
        req: DeleteVideoRequest,
    ) -> Result<VideoDeleted> {
        req.validate()?;
        let event_id = fresh_event_id(req.event_id)?;

        let mut tx = self.store.begin().await?;
        let result = async {
            let current = self
                .store
                .load_video(&mut tx, req.video_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("video {}", req.video_id)))?;

            if let Some(expected) = req.expected_version {
                if expected != current.version {
                    return Err(AppError::conflict(format!(
                        "video {} is at version {}, expected {}",
                        current.video_id, current.version, expected
                    )));
                }
            }

            let event = build_deleted(Some(&current), event_id, self.clock.now(), req.reason)?
                .with_correlation_id(ctx.correlation_id());

            if !self
                .store
                .delete_video(&mut tx, current.video_id, current.version)
                .await?
            {
                return Err(AppError::conflict(format!(
                    "video {} was modified concurrently",
                    current.video_id
                )));
            }
            self.store
                .append_event(&mut tx, &event.to_outbox_event()?)
                .await?;
            Ok::<_, AppError>(event)
        }
        .await;
        let event = self.finish(tx, result).await?;
        self.metrics.event_appended(event.event_type());

        info!(video_id = %event.aggregate_id, "Video deleted");

        Ok(VideoDeleted {
            video_id: event.aggregate_id,
            event: EventRef::from(&event),
        })
    }

    /// Commit on success, roll back on failure.
    async fn finish<T>(&self, tx: C::Tx, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.store.commit(tx).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback(tx).await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        }
    }
}

fn fresh_event_id(requested: Option<Uuid>) -> Result<Uuid> {
    match requested {
        Some(id) if id.is_nil() => Err(AppError::validation("event_id must not be nil")),
        Some(id) => Ok(id),
        None => Ok(Uuid::new_v4()),
    }
}

/// Recompute `overall_status` for a generic update that moved stage statuses.
fn derive_overall_status(current: &VideoAggregate, changes: &mut VideoChanges) {
    let media = changes.media_status.unwrap_or(current.media_status);
    let analysis = changes.analysis_status.unwrap_or(current.analysis_status);
    let Some(latest) = latest_transition(changes.media_status, changes.analysis_status) else {
        return;
    };

    let overall = compute_overall_status(current.overall_status, media, analysis, latest);
    if overall != current.overall_status {
        changes.overall_status = Some(overall);
    }
}
