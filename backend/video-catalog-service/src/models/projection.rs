use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::{OverallStatus, StageStatus};
use super::video::VideoSnapshot;

/// Read-model row (`video_projection` table), written only by the projection consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRow {
    pub video_id: Uuid,
    pub upload_user_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub overall_status: OverallStatus,
    pub media_status: StageStatus,
    pub analysis_status: StageStatus,
    pub duration_seconds: Option<i32>,
    pub resolution: Option<String>,
    pub bitrate_kbps: Option<i32>,
    pub thumbnail_url: Option<String>,
    pub playlist_url: Option<String>,
    pub difficulty: Option<String>,
    pub summary: Option<String>,
    pub tags: Option<Vec<String>>,
    pub subtitle_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Version of the last applied event
    pub version: i64,
    /// `occurred_at` of the last applied event
    pub occurred_at: DateTime<Utc>,
}

impl ProjectionRow {
    pub fn from_snapshot(
        video_id: Uuid,
        snapshot: &VideoSnapshot,
        version: i64,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            video_id,
            upload_user_id: snapshot.upload_user_id,
            title: snapshot.title.clone(),
            description: snapshot.description.clone(),
            overall_status: snapshot.overall_status,
            media_status: snapshot.media_status,
            analysis_status: snapshot.analysis_status,
            duration_seconds: snapshot.duration_seconds,
            resolution: snapshot.resolution.clone(),
            bitrate_kbps: snapshot.bitrate_kbps,
            thumbnail_url: snapshot.thumbnail_url.clone(),
            playlist_url: snapshot.playlist_url.clone(),
            difficulty: snapshot.difficulty.clone(),
            summary: snapshot.summary.clone(),
            tags: snapshot.tags.clone(),
            subtitle_url: snapshot.subtitle_url.clone(),
            error_message: snapshot.error_message.clone(),
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            version,
            occurred_at,
        }
    }
}
