use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use validator::Validate;

use super::context::RequestContext;
use super::processing::{apply_stage_transition, check_stage_report, StageTransition};
use super::videos::{ChangeRequest, VideoCommandService, VideoUpdated};
use crate::db::CatalogStore;
use crate::error::{AppError, Result};
use crate::events::ChangeKind;
use crate::models::{Stage, StageStatus, VideoChanges};

/// Artifacts reported by the transcoding pipeline.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateMediaInfoRequest {
    pub video_id: Uuid,
    pub event_id: Option<Uuid>,
    #[validate(range(min = 0))]
    pub duration_seconds: Option<i32>,
    #[validate(length(min = 1, max = 32))]
    pub resolution: Option<String>,
    #[validate(range(min = 0))]
    pub bitrate_kbps: Option<i32>,
    #[validate(length(min = 1, max = 2048))]
    pub thumbnail_url: Option<String>,
    #[validate(length(min = 1, max = 2048))]
    pub playlist_url: Option<String>,
    /// Optional stage transition reported with the artifacts
    pub media_status: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub job_id: Option<String>,
    pub emitted_at: Option<DateTime<Utc>>,
    #[validate(length(max = 2000))]
    pub error_message: Option<String>,
}

pub struct MediaInfoService<C: CatalogStore> {
    commands: Arc<VideoCommandService<C>>,
}

impl<C: CatalogStore> MediaInfoService<C> {
    pub fn new(commands: Arc<VideoCommandService<C>>) -> Self {
        Self { commands }
    }

    pub async fn update_media_info(
        &self,
        ctx: &RequestContext,
        req: UpdateMediaInfoRequest,
    ) -> Result<VideoUpdated> {
        self.commands
            .run(ctx, "update_media_info", self.update_inner(ctx, req))
            .await
    }

    async fn update_inner(
        &self,
        ctx: &RequestContext,
        req: UpdateMediaInfoRequest,
    ) -> Result<VideoUpdated> {
        req.validate()?;
        if req.job_id.is_some() != req.emitted_at.is_some() {
            return Err(AppError::validation(
                "job_id and emitted_at must be provided together",
            ));
        }
        let media_status: Option<StageStatus> =
            req.media_status.as_deref().map(str::parse).transpose()?;

        let mut changes = VideoChanges {
            duration_seconds: req.duration_seconds.into(),
            resolution: req.resolution.into(),
            bitrate_kbps: req.bitrate_kbps.into(),
            thumbnail_url: req.thumbnail_url.into(),
            playlist_url: req.playlist_url.into(),
            ..Default::default()
        };
        if changes.is_empty() && media_status.is_none() {
            return Err(AppError::validation("no fields to update"));
        }

        let video = self.commands.get_video(req.video_id).await?;
        check_stage_report(
            &video,
            Stage::Media,
            req.job_id.as_deref(),
            req.emitted_at,
        )?;

        let mut failure = None;
        let mut kind = ChangeKind::Updated;
        match media_status {
            Some(status) => {
                failure = apply_stage_transition(
                    &video,
                    StageTransition {
                        stage: Stage::Media,
                        new_status: status,
                        job_id: req.job_id,
                        emitted_at: req.emitted_at,
                        error_message: req.error_message,
                    },
                    &mut changes,
                );
                if status == StageStatus::Ready && video.media_status != StageStatus::Ready {
                    kind = ChangeKind::MediaReady;
                }
            }
            None => {
                if let (Some(job_id), Some(emitted_at)) = (req.job_id, req.emitted_at) {
                    changes.set_stage_job(Stage::Media, job_id, emitted_at);
                }
            }
        }

        debug!(
            video_id = %video.video_id,
            fields = ?changes.changed_fields(),
            "Media info update"
        );

        self.commands
            .apply_change(
                ctx,
                ChangeRequest {
                    video_id: video.video_id,
                    event_id: req.event_id,
                    expected_version: Some(video.version),
                    kind,
                    changes,
                    failure,
                    derive_overall: false,
                },
            )
            .await
    }
}

