//! Stage state machine shared by the processing-status, media-info and
//! AI-attributes services.
//!
//! A stage report carries the pipeline job that produced it and when that
//! job emitted it. Reports are checked against what the aggregate already
//! recorded for the stage so an older job can never overwrite a newer one.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use super::context::RequestContext;
use super::videos::{ChangeRequest, StageFailure, VideoCommandService, VideoUpdated};
use crate::db::CatalogStore;
use crate::error::{AppError, Result};
use crate::events::ChangeKind;
use crate::models::{OverallStatus, Patch, Stage, StageStatus, VideoAggregate, VideoChanges};

/// Overall status after a stage transition.
///
/// `latest` is the stage status the triggering transition moved to.
pub fn compute_overall_status(
    current: OverallStatus,
    media: StageStatus,
    analysis: StageStatus,
    latest: StageStatus,
) -> OverallStatus {
    if latest == StageStatus::Failed {
        return OverallStatus::Failed;
    }
    if media.is_in_progress() || analysis.is_in_progress() {
        if current == OverallStatus::Published {
            return current;
        }
        return OverallStatus::Processing;
    }
    if media == StageStatus::Ready && analysis == StageStatus::Ready {
        if current == OverallStatus::Published {
            return current;
        }
        return OverallStatus::Ready;
    }
    if current == OverallStatus::Failed {
        return OverallStatus::Processing;
    }
    current
}

/// The transition that drives the overall status when one change moves
/// both stages: a failure wins.
pub(crate) fn latest_transition(
    media: Option<StageStatus>,
    analysis: Option<StageStatus>,
) -> Option<StageStatus> {
    if media == Some(StageStatus::Failed) || analysis == Some(StageStatus::Failed) {
        return Some(StageStatus::Failed);
    }
    analysis.or(media)
}

/// Reject a stage report that is older than, or interferes with, the job
/// already recorded for `stage`.
pub(crate) fn check_stage_report(
    video: &VideoAggregate,
    stage: Stage,
    job_id: Option<&str>,
    emitted_at: Option<DateTime<Utc>>,
) -> Result<()> {
    let Some(emitted_at) = emitted_at else {
        return Ok(());
    };
    let recorded_at = video.stage_emitted_at(stage);

    if let Some(recorded_at) = recorded_at {
        if emitted_at < recorded_at {
            return Err(AppError::conflict(format!(
                "stale {stage} report: emitted at {emitted_at}, already have {recorded_at}"
            )));
        }
    }

    if let (Some(recorded_job), Some(job_id), Some(recorded_at)) =
        (video.stage_job_id(stage), job_id, recorded_at)
    {
        if !recorded_job.is_empty() && recorded_job != job_id && emitted_at <= recorded_at {
            return Err(AppError::conflict(format!(
                "{stage} is owned by job {recorded_job}; report from {job_id} does not advance it"
            )));
        }
    }

    Ok(())
}

/// A requested stage transition.
#[derive(Debug, Clone)]
pub(crate) struct StageTransition {
    pub stage: Stage,
    pub new_status: StageStatus,
    pub job_id: Option<String>,
    pub emitted_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Fold `transition` into `changes`, deriving the overall status and the
/// error message. Returns the failure to announce when the stage newly failed.
pub(crate) fn apply_stage_transition(
    video: &VideoAggregate,
    transition: StageTransition,
    changes: &mut VideoChanges,
) -> Option<StageFailure> {
    let StageTransition {
        stage,
        new_status,
        job_id,
        emitted_at,
        error_message,
    } = transition;

    changes.set_stage_status(stage, new_status);
    if let (Some(job_id), Some(emitted_at)) = (job_id.clone(), emitted_at) {
        changes.set_stage_job(stage, job_id, emitted_at);
    }

    let (media, analysis) = match stage {
        Stage::Media => (new_status, video.analysis_status),
        Stage::Analysis => (video.media_status, new_status),
    };
    let overall = compute_overall_status(video.overall_status, media, analysis, new_status);
    if overall != video.overall_status {
        changes.overall_status = Some(overall);
    }

    if new_status == StageStatus::Failed {
        let message = error_message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("{stage} processing failed"));
        changes.error_message = Patch::Set(message.clone());

        if video.stage_status(stage) != StageStatus::Failed {
            return Some(StageFailure {
                stage,
                job_id,
                error_message: Some(message),
            });
        }
    } else if video.overall_status == OverallStatus::Failed && overall != OverallStatus::Failed {
        changes.error_message = Patch::Clear;
    }

    None
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateProcessingStatusRequest {
    pub video_id: Uuid,
    pub event_id: Option<Uuid>,
    /// `media` or `analysis`
    pub stage: String,
    /// Fail with a conflict unless the stage is currently in this status
    pub expected_status: Option<String>,
    pub new_status: String,
    #[validate(length(min = 1, max = 255))]
    pub job_id: String,
    pub emitted_at: DateTime<Utc>,
    #[validate(length(max = 2000))]
    pub error_message: Option<String>,
}

/// Moves a media or analysis stage through its state machine.
pub struct ProcessingStatusService<C: CatalogStore> {
    commands: Arc<VideoCommandService<C>>,
}

impl<C: CatalogStore> ProcessingStatusService<C> {
    pub fn new(commands: Arc<VideoCommandService<C>>) -> Self {
        Self { commands }
    }

    pub async fn update_processing_status(
        &self,
        ctx: &RequestContext,
        req: UpdateProcessingStatusRequest,
    ) -> Result<VideoUpdated> {
        self.commands
            .run(ctx, "update_processing_status", self.update_inner(ctx, req))
            .await
    }

    async fn update_inner(
        &self,
        ctx: &RequestContext,
        req: UpdateProcessingStatusRequest,
    ) -> Result<VideoUpdated> {
        req.validate()?;
        let stage: Stage = req.stage.parse()?;
        let new_status: StageStatus = req.new_status.parse()?;
        let expected_status: Option<StageStatus> =
            req.expected_status.as_deref().map(str::parse).transpose()?;

        let video = self.commands.get_video(req.video_id).await?;
        let current_status = video.stage_status(stage);

        if let Some(expected) = expected_status {
            if expected != current_status {
                return Err(AppError::conflict(format!(
                    "{stage} status is {current_status}, expected {expected}"
                )));
            }
        }
        check_stage_report(&video, stage, Some(&req.job_id), Some(req.emitted_at))?;

        let mut changes = VideoChanges::default();
        let failure = apply_stage_transition(
            &video,
            StageTransition {
                stage,
                new_status,
                job_id: Some(req.job_id.clone()),
                emitted_at: Some(req.emitted_at),
                error_message: req.error_message,
            },
            &mut changes,
        );

        info!(
            video_id = %video.video_id,
            stage = %stage,
            from = %current_status,
            to = %new_status,
            job_id = %req.job_id,
            "Stage transition"
        );

        self.commands
            .apply_change(
                ctx,
                ChangeRequest {
                    video_id: video.video_id,
                    event_id: req.event_id,
                    expected_version: Some(video.version),
                    kind: ChangeKind::Updated,
                    changes,
                    failure,
                    derive_overall: false,
                },
            )
            .await
    }
}
