//! Domain events emitted for every committed video mutation.
//!
//! Events are built by the pure functions in [`builder`], encoded into an
//! outbox row in the same transaction as the mutation, and decoded again by
//! the projection consumer.
//!
//! Wire payload (JSON):
//!
//! ```json
//! {
//!   "event_id": "…", "event_type": "video.updated", "video_id": "…",
//!   "version": 1718000000123456, "occurred_at": "2024-06-10T06:13:20.123456Z",
//!   "data": { "media_status": "ready" }
//! }
//! ```

pub mod builder;

pub use builder::{
    build_changed, build_created, build_deleted, build_processing_failed, build_updated,
    next_version, ChangeKind, EventBuildError, CREATED_VERSION,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use transactional_outbox::OutboxEvent;
use uuid::Uuid;

use crate::models::{Stage, VideoChanges, VideoSnapshot};

pub const AGGREGATE_TYPE: &str = "video";

pub const VIDEO_CREATED: &str = "video.created";
pub const VIDEO_UPDATED: &str = "video.updated";
pub const VIDEO_DELETED: &str = "video.deleted";
pub const VIDEO_MEDIA_READY: &str = "video.media_ready";
pub const VIDEO_AI_ENRICHED: &str = "video.ai_enriched";
pub const VIDEO_VISIBILITY_CHANGED: &str = "video.visibility_changed";
pub const VIDEO_PROCESSING_FAILED: &str = "video.processing_failed";

/// Header names set on outbox rows.
pub mod headers {
    pub const EVENT_ID: &str = "event_id";
    pub const EVENT_TYPE: &str = "event_type";
    pub const EVENT_VERSION: &str = "event_version";
    pub const AGGREGATE_ID: &str = "aggregate_id";
    pub const CORRELATION_ID: &str = "correlation_id";
}

/// Closed set of event kinds. Consumers match on it exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Created(VideoSnapshot),
    Updated(VideoChanges),
    Deleted {
        reason: Option<String>,
    },
    MediaReady(VideoChanges),
    AiEnriched(VideoChanges),
    VisibilityChanged(VideoChanges),
    ProcessingFailed {
        stage: Stage,
        job_id: Option<String>,
        error_message: Option<String>,
    },
}

#[derive(Serialize, Deserialize)]
struct DeletedBody {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ProcessingFailedBody {
    stage: Stage,
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::Created(_) => VIDEO_CREATED,
            EventKind::Updated(_) => VIDEO_UPDATED,
            EventKind::Deleted { .. } => VIDEO_DELETED,
            EventKind::MediaReady(_) => VIDEO_MEDIA_READY,
            EventKind::AiEnriched(_) => VIDEO_AI_ENRICHED,
            EventKind::VisibilityChanged(_) => VIDEO_VISIBILITY_CHANGED,
            EventKind::ProcessingFailed { .. } => VIDEO_PROCESSING_FAILED,
        }
    }

    /// The changeset carried by change-style kinds.
    pub fn changes(&self) -> Option<&VideoChanges> {
        match self {
            EventKind::Updated(changes)
            | EventKind::MediaReady(changes)
            | EventKind::AiEnriched(changes)
            | EventKind::VisibilityChanged(changes) => Some(changes),
            EventKind::Created(_) | EventKind::Deleted { .. } | EventKind::ProcessingFailed { .. } => {
                None
            }
        }
    }

    fn to_data(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            EventKind::Created(snapshot) => serde_json::to_value(snapshot),
            EventKind::Updated(changes)
            | EventKind::MediaReady(changes)
            | EventKind::AiEnriched(changes)
            | EventKind::VisibilityChanged(changes) => serde_json::to_value(changes),
            EventKind::Deleted { reason } => serde_json::to_value(DeletedBody {
                reason: reason.clone(),
            }),
            EventKind::ProcessingFailed {
                stage,
                job_id,
                error_message,
            } => serde_json::to_value(ProcessingFailedBody {
                stage: *stage,
                job_id: job_id.clone(),
                error_message: error_message.clone(),
            }),
        }
    }

    /// Decode the `data` body for `event_type`. `Ok(None)` for types this
    /// build does not know.
    pub fn from_wire(
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<Option<Self>, serde_json::Error> {
        let kind = match event_type {
            VIDEO_CREATED => EventKind::Created(serde_json::from_value(data)?),
            VIDEO_UPDATED => EventKind::Updated(serde_json::from_value(data)?),
            VIDEO_MEDIA_READY => EventKind::MediaReady(serde_json::from_value(data)?),
            VIDEO_AI_ENRICHED => EventKind::AiEnriched(serde_json::from_value(data)?),
            VIDEO_VISIBILITY_CHANGED => EventKind::VisibilityChanged(serde_json::from_value(data)?),
            VIDEO_DELETED => {
                // Older producers sent no body at all.
                let body: DeletedBody = if data.is_null() {
                    DeletedBody { reason: None }
                } else {
                    serde_json::from_value(data)?
                };
                EventKind::Deleted {
                    reason: body.reason,
                }
            }
            VIDEO_PROCESSING_FAILED => {
                let body: ProcessingFailedBody = serde_json::from_value(data)?;
                EventKind::ProcessingFailed {
                    stage: body.stage,
                    job_id: body.job_id,
                    error_message: body.error_message,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(kind))
    }
}

/// JSON payload stored in the outbox row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub video_id: Uuid,
    pub version: i64,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Immutable event record for one committed mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    /// Strictly increasing per aggregate
    pub version: i64,
    pub occurred_at: DateTime<Utc>,
    pub kind: EventKind,
    pub headers: BTreeMap<String, String>,
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(self, correlation_id: Option<&str>) -> Self {
        match correlation_id {
            Some(id) if !id.is_empty() => self.with_header(headers::CORRELATION_ID, id),
            _ => self,
        }
    }

    pub fn envelope(&self) -> Result<EventEnvelope, serde_json::Error> {
        Ok(EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type().to_string(),
            video_id: self.aggregate_id,
            version: self.version,
            occurred_at: self.occurred_at,
            data: self.kind.to_data()?,
        })
    }

    /// Encode as an unpublished outbox row.
    pub fn to_outbox_event(&self) -> Result<OutboxEvent, serde_json::Error> {
        let payload = serde_json::to_vec(&self.envelope()?)?;

        let mut attrs = self.headers.clone();
        attrs.insert(headers::EVENT_ID.to_string(), self.event_id.to_string());
        attrs.insert(headers::EVENT_TYPE.to_string(), self.event_type().to_string());
        attrs.insert(headers::EVENT_VERSION.to_string(), self.version.to_string());
        attrs.insert(headers::AGGREGATE_ID.to_string(), self.aggregate_id.to_string());

        Ok(OutboxEvent::new(
            self.event_id,
            AGGREGATE_TYPE,
            self.aggregate_id,
            self.event_type(),
            payload,
            attrs,
            self.occurred_at,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Patch, StageStatus};

    fn sample_event(kind: EventKind) -> DomainEvent {
        DomainEvent {
            event_id: Uuid::new_v4(),
            aggregate_id: Uuid::new_v4(),
            version: 42,
            occurred_at: Utc::now(),
            kind,
            headers: BTreeMap::new(),
        }
    }

    #[test]
    fn test_outbox_row_carries_routing_headers() {
        let event = sample_event(EventKind::Deleted { reason: None })
            .with_correlation_id(Some("req-1"));

        let row = event.to_outbox_event().unwrap();

        assert_eq!(row.id, event.event_id);
        assert_eq!(row.aggregate_type, "video");
        assert_eq!(row.aggregate_id, event.aggregate_id);
        assert_eq!(row.event_type, "video.deleted");
        assert_eq!(row.headers.get("event_version").map(String::as_str), Some("42"));
        assert_eq!(row.headers.get("correlation_id").map(String::as_str), Some("req-1"));
        assert!(!row.is_published());
        assert_eq!(row.delivery_attempts, 0);
    }

    #[test]
    fn test_update_payload_keeps_cleared_fields() {
        let changes = VideoChanges {
            media_status: Some(StageStatus::Ready),
            error_message: Patch::Clear,
            ..Default::default()
        };
        let event = sample_event(EventKind::MediaReady(changes.clone()));

        let row = event.to_outbox_event().unwrap();
        let envelope: EventEnvelope = serde_json::from_slice(&row.payload).unwrap();

        assert_eq!(envelope.event_type, "video.media_ready");
        assert_eq!(envelope.version, 42);
        assert_eq!(
            envelope.data,
            serde_json::json!({ "media_status": "ready", "error_message": null })
        );
        assert_eq!(
            EventKind::from_wire(&envelope.event_type, envelope.data).unwrap(),
            Some(EventKind::MediaReady(changes))
        );
    }

    #[test]
    fn test_unknown_event_type_is_not_an_error() {
        let decoded = EventKind::from_wire("video.liked", serde_json::json!({"x": 1})).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_deleted_accepts_missing_body() {
        let decoded = EventKind::from_wire(VIDEO_DELETED, serde_json::Value::Null).unwrap();
        assert_eq!(decoded, Some(EventKind::Deleted { reason: None }));
    }
}
