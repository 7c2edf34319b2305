use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::patch::Patch;
use super::projection::ProjectionRow;
use super::status::{OverallStatus, Stage, StageStatus};
use super::video::VideoAggregate;

/// Sparse changeset: only the fields that are set travel in an update event
/// and get merged onto the projection.
///
/// Non-nullable fields are `Option` (absent or new value); nullable fields
/// are [`Patch`] so they can also be cleared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub description: Patch<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_status: Option<OverallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_status: Option<StageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_status: Option<StageStatus>,

    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub media_job_id: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub media_emitted_at: Patch<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub analysis_job_id: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub analysis_emitted_at: Patch<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub duration_seconds: Patch<i32>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub resolution: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub bitrate_kbps: Patch<i32>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub thumbnail_url: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub playlist_url: Patch<String>,

    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub difficulty: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub summary: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub tags: Patch<Vec<String>>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub subtitle_url: Patch<String>,

    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub error_message: Patch<String>,
}

impl VideoChanges {
    pub fn is_empty(&self) -> bool {
        self.changed_fields().is_empty()
    }

    /// Names of the fields this changeset touches, for logs.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        let mut push = |changed: bool, name: &'static str| {
            if changed {
                fields.push(name);
            }
        };

        push(self.title.is_some(), "title");
        push(self.description.is_changed(), "description");
        push(self.overall_status.is_some(), "overall_status");
        push(self.media_status.is_some(), "media_status");
        push(self.analysis_status.is_some(), "analysis_status");
        push(self.media_job_id.is_changed(), "media_job_id");
        push(self.media_emitted_at.is_changed(), "media_emitted_at");
        push(self.analysis_job_id.is_changed(), "analysis_job_id");
        push(self.analysis_emitted_at.is_changed(), "analysis_emitted_at");
        push(self.duration_seconds.is_changed(), "duration_seconds");
        push(self.resolution.is_changed(), "resolution");
        push(self.bitrate_kbps.is_changed(), "bitrate_kbps");
        push(self.thumbnail_url.is_changed(), "thumbnail_url");
        push(self.playlist_url.is_changed(), "playlist_url");
        push(self.difficulty.is_changed(), "difficulty");
        push(self.summary.is_changed(), "summary");
        push(self.tags.is_changed(), "tags");
        push(self.subtitle_url.is_changed(), "subtitle_url");
        push(self.error_message.is_changed(), "error_message");

        fields
    }

    /// Set the status of `stage`.
    pub fn set_stage_status(&mut self, stage: Stage, status: StageStatus) {
        match stage {
            Stage::Media => self.media_status = Some(status),
            Stage::Analysis => self.analysis_status = Some(status),
        }
    }

    /// Record the job and emission time reported for `stage`.
    pub fn set_stage_job(&mut self, stage: Stage, job_id: String, emitted_at: DateTime<Utc>) {
        match stage {
            Stage::Media => {
                self.media_job_id = Patch::Set(job_id);
                self.media_emitted_at = Patch::Set(emitted_at);
            }
            Stage::Analysis => {
                self.analysis_job_id = Patch::Set(job_id);
                self.analysis_emitted_at = Patch::Set(emitted_at);
            }
        }
    }

    pub fn apply_to(&self, video: &mut VideoAggregate) {
        if let Some(title) = &self.title {
            video.title = title.clone();
        }
        self.description.apply(&mut video.description);
        if let Some(status) = self.overall_status {
            video.overall_status = status;
        }
        if let Some(status) = self.media_status {
            video.media_status = status;
        }
        if let Some(status) = self.analysis_status {
            video.analysis_status = status;
        }
        self.media_job_id.apply(&mut video.media_job_id);
        self.media_emitted_at.apply(&mut video.media_emitted_at);
        self.analysis_job_id.apply(&mut video.analysis_job_id);
        self.analysis_emitted_at.apply(&mut video.analysis_emitted_at);
        self.duration_seconds.apply(&mut video.duration_seconds);
        self.resolution.apply(&mut video.resolution);
        self.bitrate_kbps.apply(&mut video.bitrate_kbps);
        self.thumbnail_url.apply(&mut video.thumbnail_url);
        self.playlist_url.apply(&mut video.playlist_url);
        self.difficulty.apply(&mut video.difficulty);
        self.summary.apply(&mut video.summary);
        self.tags.apply(&mut video.tags);
        self.subtitle_url.apply(&mut video.subtitle_url);
        self.error_message.apply(&mut video.error_message);
    }

    /// Merge onto a read-model row. Job bookkeeping is not projected.
    pub fn apply_to_projection(&self, row: &mut ProjectionRow) {
        if let Some(title) = &self.title {
            row.title = title.clone();
        }
        self.description.apply(&mut row.description);
        if let Some(status) = self.overall_status {
            row.overall_status = status;
        }
        if let Some(status) = self.media_status {
            row.media_status = status;
        }
        if let Some(status) = self.analysis_status {
            row.analysis_status = status;
        }
        self.duration_seconds.apply(&mut row.duration_seconds);
        self.resolution.apply(&mut row.resolution);
        self.bitrate_kbps.apply(&mut row.bitrate_kbps);
        self.thumbnail_url.apply(&mut row.thumbnail_url);
        self.playlist_url.apply(&mut row.playlist_url);
        self.difficulty.apply(&mut row.difficulty);
        self.summary.apply(&mut row.summary);
        self.tags.apply(&mut row.tags);
        self.subtitle_url.apply(&mut row.subtitle_url);
        self.error_message.apply(&mut row.error_message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_default_is_empty() {
        assert!(VideoChanges::default().is_empty());
    }

    #[test]
    fn test_clear_counts_as_change() {
        let changes = VideoChanges {
            description: Patch::Clear,
            ..Default::default()
        };
        assert!(!changes.is_empty());
        assert_eq!(changes.changed_fields(), vec!["description"]);
    }

    #[test]
    fn test_apply_only_touches_set_fields() {
        let now = Utc::now();
        let mut video = VideoAggregate::new_upload(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "T".to_string(),
            Some("d".to_string()),
            "raw/key".to_string(),
            now,
        );
        let changes = VideoChanges {
            media_status: Some(StageStatus::Ready),
            summary: Patch::Set(String::new()),
            ..Default::default()
        };

        changes.apply_to(&mut video);

        assert_eq!(video.media_status, StageStatus::Ready);
        assert_eq!(video.summary.as_deref(), Some(""));
        assert_eq!(video.title, "T");
        assert_eq!(video.description.as_deref(), Some("d"));
    }

    #[test]
    fn test_wire_form_carries_only_changed_fields() {
        let mut changes = VideoChanges::default();
        changes.set_stage_status(Stage::Analysis, StageStatus::Processing);
        changes.thumbnail_url = Patch::Clear;

        let json = serde_json::to_value(&changes).unwrap();

        assert_eq!(
            json,
            serde_json::json!({ "analysis_status": "processing", "thumbnail_url": null })
        );
        let decoded: VideoChanges = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, changes);
    }
}
