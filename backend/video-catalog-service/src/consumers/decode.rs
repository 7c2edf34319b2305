use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;
use transactional_outbox::OutboxEvent;
use uuid::Uuid;

use crate::db::StoreError;
use crate::events::{headers, EventKind};

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The delivery cannot be interpreted at all; redelivering it will not help
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Projection store error: {0}")]
    Store(#[from] StoreError),
}

impl ProjectionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProjectionError::MalformedEvent(_) => false,
            ProjectionError::Store(_) => true,
        }
    }
}

/// One message as handed over by the transport.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Vec<u8>,
    /// Transport attributes; the outbox row headers
    pub attributes: BTreeMap<String, String>,
    /// Redeliveries so far
    pub attempt: u32,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, attributes: BTreeMap<String, String>) -> Self {
        Self {
            payload,
            attributes,
            attempt: 0,
        }
    }

    pub fn from_outbox(event: &OutboxEvent) -> Self {
        let mut attributes = event.headers.clone();
        attributes
            .entry(headers::EVENT_ID.to_string())
            .or_insert_with(|| event.id.to_string());
        attributes
            .entry(headers::EVENT_TYPE.to_string())
            .or_insert_with(|| event.event_type.clone());
        attributes
            .entry(headers::AGGREGATE_ID.to_string())
            .or_insert_with(|| event.aggregate_id.to_string());
        Self::new(event.payload.clone(), attributes)
    }

    /// Routing key that keeps one aggregate on one worker.
    pub fn partition_key(&self) -> &str {
        self.attributes
            .get(headers::AGGREGATE_ID)
            .or_else(|| self.attributes.get(headers::EVENT_ID))
            .map(String::as_str)
            .unwrap_or("")
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Lenient view of the payload: every field optional so that whatever
/// parses can still be combined with the transport attributes.
#[derive(Debug, Default, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default, alias = "aggregate_id")]
    video_id: Option<Uuid>,
    #[serde(default)]
    version: Option<i64>,
    #[serde(default)]
    occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    data: serde_json::Value,
}

/// A delivery decoded into what the projection applier needs.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Dedup key
    pub event_id: String,
    pub event_type: String,
    pub aggregate_id: Uuid,
    pub version: i64,
    pub occurred_at: DateTime<Utc>,
    /// `None` for event types this build does not know
    pub kind: Option<EventKind>,
}

impl InboundEvent {
    /// Decode `delivery`, taking each field from the payload first and the
    /// transport attributes second. A missing `occurred_at` defaults to `now`.
    pub fn decode(delivery: &Delivery, now: DateTime<Utc>) -> Result<Self, ProjectionError> {
        let raw = match serde_json::from_slice::<RawEnvelope>(&delivery.payload) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Event payload did not parse, falling back to attributes");
                RawEnvelope::default()
            }
        };

        let event_id = raw
            .event_id
            .filter(|id| !id.is_empty())
            .or_else(|| delivery.attribute(headers::EVENT_ID).map(str::to_string))
            .ok_or_else(|| ProjectionError::MalformedEvent("missing event id".to_string()))?;

        let event_type = raw
            .event_type
            .filter(|t| !t.is_empty())
            .or_else(|| delivery.attribute(headers::EVENT_TYPE).map(str::to_string))
            .ok_or_else(|| ProjectionError::MalformedEvent("missing event type".to_string()))?;

        let aggregate_id = match raw.video_id {
            Some(id) => id,
            None => delivery
                .attribute(headers::AGGREGATE_ID)
                .and_then(|v| v.parse::<Uuid>().ok())
                .ok_or_else(|| {
                    ProjectionError::MalformedEvent(format!(
                        "missing aggregate id for event {event_id}"
                    ))
                })?,
        };
        if aggregate_id.is_nil() {
            return Err(ProjectionError::MalformedEvent(format!(
                "nil aggregate id for event {event_id}"
            )));
        }

        let kind = EventKind::from_wire(&event_type, raw.data).map_err(|e| {
            ProjectionError::MalformedEvent(format!("undecodable {event_type} body: {e}"))
        })?;

        let version = match raw.version.or_else(|| {
            delivery
                .attribute(headers::EVENT_VERSION)
                .and_then(|v| v.parse().ok())
        }) {
            Some(version) => version,
            // Unknown types are skipped anyway; their version is irrelevant.
            None if kind.is_none() => 0,
            None => {
                return Err(ProjectionError::MalformedEvent(format!(
                    "missing version for event {event_id}"
                )))
            }
        };

        Ok(Self {
            event_id,
            event_type,
            aggregate_id,
            version,
            occurred_at: raw.occurred_at.unwrap_or(now),
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{VIDEO_DELETED, VIDEO_UPDATED};
    use serde_json::json;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_payload_fields_win_over_attributes() {
        let video_id = Uuid::new_v4();
        let payload = json!({
            "event_id": "e-1",
            "event_type": VIDEO_UPDATED,
            "video_id": video_id,
            "version": 7,
            "occurred_at": "2024-06-01T12:00:00Z",
            "data": { "title": "New" }
        });
        let delivery = Delivery::new(
            serde_json::to_vec(&payload).unwrap(),
            attrs(&[(headers::EVENT_ID, "other")]),
        );

        let event = InboundEvent::decode(&delivery, Utc::now()).unwrap();

        assert_eq!(event.event_id, "e-1");
        assert_eq!(event.aggregate_id, video_id);
        assert_eq!(event.version, 7);
        assert!(matches!(event.kind, Some(EventKind::Updated(_))));
    }

    #[test]
    fn test_attributes_fill_in_unparseable_payload() {
        let video_id = Uuid::new_v4();
        let delivery = Delivery::new(
            b"not json".to_vec(),
            attrs(&[
                (headers::EVENT_ID, "e-2"),
                (headers::EVENT_TYPE, VIDEO_DELETED),
                (headers::AGGREGATE_ID, &video_id.to_string()),
                (headers::EVENT_VERSION, "12"),
            ]),
        );
        let now = Utc::now();

        let event = InboundEvent::decode(&delivery, now).unwrap();

        assert_eq!(event.aggregate_id, video_id);
        assert_eq!(event.version, 12);
        assert_eq!(event.occurred_at, now);
        assert_eq!(event.kind, Some(EventKind::Deleted { reason: None }));
    }

    #[test]
    fn test_missing_aggregate_id_is_malformed() {
        let payload = json!({ "event_id": "e-3", "event_type": VIDEO_DELETED, "version": 2 });
        let delivery = Delivery::new(serde_json::to_vec(&payload).unwrap(), BTreeMap::new());

        let err = InboundEvent::decode(&delivery, Utc::now()).unwrap_err();

        assert!(matches!(err, ProjectionError::MalformedEvent(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unknown_type_decodes_without_kind() {
        let payload = json!({
            "event_id": "e-4",
            "event_type": "video.transcoded_v2",
            "video_id": Uuid::new_v4(),
            "data": { "anything": true }
        });
        let delivery = Delivery::new(serde_json::to_vec(&payload).unwrap(), BTreeMap::new());

        let event = InboundEvent::decode(&delivery, Utc::now()).unwrap();

        assert!(event.kind.is_none());
    }
}
