use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::{OverallStatus, Stage, StageStatus};

/// Authoritative video state (`videos` table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoAggregate {
    pub video_id: Uuid,
    pub upload_user_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    /// Storage key of the uploaded source file
    pub raw_file_reference: String,

    pub overall_status: OverallStatus,
    pub media_status: StageStatus,
    pub analysis_status: StageStatus,

    pub media_job_id: Option<String>,
    pub media_emitted_at: Option<DateTime<Utc>>,
    pub analysis_job_id: Option<String>,
    pub analysis_emitted_at: Option<DateTime<Utc>>,

    // Media artifacts
    pub duration_seconds: Option<i32>,
    pub resolution: Option<String>, // e.g. "1920x1080"
    pub bitrate_kbps: Option<i32>,
    pub thumbnail_url: Option<String>,
    pub playlist_url: Option<String>, // HLS master playlist

    // AI artifacts
    pub difficulty: Option<String>,
    pub summary: Option<String>,
    pub tags: Option<Vec<String>>,
    pub subtitle_url: Option<String>,

    /// Last failure reason
    pub error_message: Option<String>,

    /// Version of the last event emitted for this video
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VideoAggregate {
    /// Freshly registered upload: both stages pending, nothing processed yet.
    pub fn new_upload(
        video_id: Uuid,
        upload_user_id: Uuid,
        title: String,
        description: Option<String>,
        raw_file_reference: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            video_id,
            upload_user_id,
            title,
            description,
            raw_file_reference,
            overall_status: OverallStatus::PendingUpload,
            media_status: StageStatus::Pending,
            analysis_status: StageStatus::Pending,
            media_job_id: None,
            media_emitted_at: None,
            analysis_job_id: None,
            analysis_emitted_at: None,
            duration_seconds: None,
            resolution: None,
            bitrate_kbps: None,
            thumbnail_url: None,
            playlist_url: None,
            difficulty: None,
            summary: None,
            tags: None,
            subtitle_url: None,
            error_message: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::Media => self.media_status,
            Stage::Analysis => self.analysis_status,
        }
    }

    pub fn stage_job_id(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Media => self.media_job_id.as_deref(),
            Stage::Analysis => self.analysis_job_id.as_deref(),
        }
    }

    pub fn stage_emitted_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Media => self.media_emitted_at,
            Stage::Analysis => self.analysis_emitted_at,
        }
    }

    pub fn both_stages_ready(&self) -> bool {
        self.media_status == StageStatus::Ready && self.analysis_status == StageStatus::Ready
    }
}

/// Full query-facing state carried by a `created` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSnapshot {
    pub upload_user_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub overall_status: OverallStatus,
    pub media_status: StageStatus,
    pub analysis_status: StageStatus,
    #[serde(default)]
    pub duration_seconds: Option<i32>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub bitrate_kbps: Option<i32>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub playlist_url: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub subtitle_url: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&VideoAggregate> for VideoSnapshot {
    fn from(video: &VideoAggregate) -> Self {
        Self {
            upload_user_id: video.upload_user_id,
            title: video.title.clone(),
            description: video.description.clone(),
            overall_status: video.overall_status,
            media_status: video.media_status,
            analysis_status: video.analysis_status,
            duration_seconds: video.duration_seconds,
            resolution: video.resolution.clone(),
            bitrate_kbps: video.bitrate_kbps,
            thumbnail_url: video.thumbnail_url.clone(),
            playlist_url: video.playlist_url.clone(),
            difficulty: video.difficulty.clone(),
            summary: video.summary.clone(),
            tags: video.tags.clone(),
            subtitle_url: video.subtitle_url.clone(),
            error_message: video.error_message.clone(),
            created_at: video.created_at,
            updated_at: video.updated_at,
        }
    }
}
