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

const MAX_TAGS: usize = 50;

/// Attributes produced by the analysis pipeline.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateAiAttributesRequest {
    pub video_id: Uuid,
    pub event_id: Option<Uuid>,
    #[validate(length(min = 1, max = 32))]
    pub difficulty: Option<String>,
    #[validate(length(max = 10000))]
    pub summary: Option<String>,
    pub tags: Option<Vec<String>>,
    #[validate(length(min = 1, max = 2048))]
    pub subtitle_url: Option<String>,
    pub analysis_status: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub job_id: Option<String>,
    pub emitted_at: Option<DateTime<Utc>>,
    #[validate(length(max = 2000))]
    pub error_message: Option<String>,
}

fn normalize_tags(tags: Vec<String>) -> Result<Vec<String>> {
    if tags.len() > MAX_TAGS {
        return Err(AppError::validation(format!(
            "at most {MAX_TAGS} tags are allowed"
        )));
    }
    let mut normalized: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(AppError::validation("tags must not be blank"));
        }
        if !normalized.iter().any(|t| t == tag) {
            normalized.push(tag.to_string());
        }
    }
    Ok(normalized)
}

pub struct AiAttributesService<C: CatalogStore> {
    commands: Arc<VideoCommandService<C>>,
}

impl<C: CatalogStore> AiAttributesService<C> {
    pub fn new(commands: Arc<VideoCommandService<C>>) -> Self {
        Self { commands }
    }

    pub async fn update_ai_attributes(
        &self,
        ctx: &RequestContext,
        req: UpdateAiAttributesRequest,
    ) -> Result<VideoUpdated> {
        self.commands
            .run(ctx, "update_ai_attributes", self.update_inner(ctx, req))
            .await
    }

    async fn update_inner(
        &self,
        ctx: &RequestContext,
        req: UpdateAiAttributesRequest,
    ) -> Result<VideoUpdated> {
        req.validate()?;
        if req.job_id.is_some() != req.emitted_at.is_some() {
            return Err(AppError::validation(
                "job_id and emitted_at must be provided together",
            ));
        }
        let analysis_status: Option<StageStatus> =
            req.analysis_status.as_deref().map(str::parse).transpose()?;
        let tags = req.tags.map(normalize_tags).transpose()?;

        let mut changes = VideoChanges {
            difficulty: req.difficulty.into(),
            summary: req.summary.into(),
            tags: tags.into(),
            subtitle_url: req.subtitle_url.into(),
            ..Default::default()
        };
        if changes.is_empty() && analysis_status.is_none() {
            return Err(AppError::validation("no fields to update"));
        }

        let video = self.commands.get_video(req.video_id).await?;
        check_stage_report(
            &video,
            Stage::Analysis,
            req.job_id.as_deref(),
            req.emitted_at,
        )?;

        let mut failure = None;
        let mut kind = ChangeKind::Updated;
        match analysis_status {
            Some(status) => {
                failure = apply_stage_transition(
                    &video,
                    StageTransition {
                        stage: Stage::Analysis,
                        new_status: status,
                        job_id: req.job_id,
                        emitted_at: req.emitted_at,
                        error_message: req.error_message,
                    },
                    &mut changes,
                );
                if status == StageStatus::Ready && video.analysis_status != StageStatus::Ready {
                    kind = ChangeKind::AiEnriched;
                }
            }
            None => {
                if let (Some(job_id), Some(emitted_at)) = (req.job_id, req.emitted_at) {
                    changes.set_stage_job(Stage::Analysis, job_id, emitted_at);
                }
            }
        }

        debug!(
            video_id = %video.video_id,
            fields = ?changes.changed_fields(),
            "AI attributes update"
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
