use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use super::context::RequestContext;
use super::videos::{ChangeRequest, VideoCommandService, VideoUpdated};
use crate::db::CatalogStore;
use crate::error::{AppError, Result};
use crate::events::ChangeKind;
use crate::models::{OverallStatus, Patch, VideoChanges};

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateVisibilityRequest {
    pub video_id: Uuid,
    pub event_id: Option<Uuid>,
    /// `published`, `rejected` or `archived`
    pub target: String,
    /// Stored as the error message on rejection
    #[validate(length(max = 2000))]
    pub reason: Option<String>,
}

/// Publish, reject or archive a video.
pub struct VisibilityService<C: CatalogStore> {
    commands: Arc<VideoCommandService<C>>,
}

impl<C: CatalogStore> VisibilityService<C> {
    pub fn new(commands: Arc<VideoCommandService<C>>) -> Self {
        Self { commands }
    }

    pub async fn update_visibility(
        &self,
        ctx: &RequestContext,
        req: UpdateVisibilityRequest,
    ) -> Result<VideoUpdated> {
        self.commands
            .run(ctx, "update_visibility", self.update_inner(ctx, req))
            .await
    }

    async fn update_inner(
        &self,
        ctx: &RequestContext,
        req: UpdateVisibilityRequest,
    ) -> Result<VideoUpdated> {
        req.validate()?;
        let target: OverallStatus = req.target.parse()?;
        if !target.is_visibility_target() {
            return Err(AppError::validation(format!(
                "visibility target must be published, rejected or archived, got {target}"
            )));
        }

        let video = self.commands.get_video(req.video_id).await?;
        if video.overall_status == target {
            return Err(AppError::conflict(format!(
                "video {} is already {target}",
                video.video_id
            )));
        }
        if target == OverallStatus::Published && !video.both_stages_ready() {
            return Err(AppError::conflict(format!(
                "video {} cannot be published: media is {}, analysis is {}",
                video.video_id, video.media_status, video.analysis_status
            )));
        }

        let mut changes = VideoChanges {
            overall_status: Some(target),
            ..Default::default()
        };
        if target == OverallStatus::Rejected {
            if let Some(reason) = req.reason.filter(|r| !r.trim().is_empty()) {
                changes.error_message = Patch::Set(reason);
            }
        }

        info!(
            video_id = %video.video_id,
            from = %video.overall_status,
            to = %target,
            "Visibility change"
        );

        self.commands
            .apply_change(
                ctx,
                ChangeRequest {
                    video_id: video.video_id,
                    event_id: req.event_id,
                    expected_version: Some(video.version),
                    kind: ChangeKind::VisibilityChanged,
                    changes,
                    failure: None,
                    derive_overall: false,
                },
            )
            .await
    }
}
