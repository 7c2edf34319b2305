//! Pure construction of [`DomainEvent`]s. Nothing here touches storage;
//! callers append the result to the outbox themselves.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use super::{DomainEvent, EventKind};
use crate::models::{Stage, VideoAggregate, VideoChanges, VideoSnapshot};

/// Every aggregate starts at version 1.
pub const CREATED_VERSION: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventBuildError {
    #[error("video aggregate is missing")]
    NilAggregate,

    #[error("event id must not be nil")]
    InvalidEventId,

    #[error("changeset has no fields set")]
    EmptyChangeset,
}

/// Change-carrying event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Updated,
    MediaReady,
    AiEnriched,
    VisibilityChanged,
}

impl ChangeKind {
    fn into_kind(self, changes: VideoChanges) -> EventKind {
        match self {
            ChangeKind::Updated => EventKind::Updated(changes),
            ChangeKind::MediaReady => EventKind::MediaReady(changes),
            ChangeKind::AiEnriched => EventKind::AiEnriched(changes),
            ChangeKind::VisibilityChanged => EventKind::VisibilityChanged(changes),
        }
    }
}

/// Version for the event following `previous`: the occurrence time in
/// microseconds, bumped past `previous` if the clock did not advance.
pub fn next_version(previous: i64, occurred_at: DateTime<Utc>) -> i64 {
    occurred_at.timestamp_micros().max(previous.saturating_add(1))
}

fn check(
    video: Option<&VideoAggregate>,
    event_id: Uuid,
) -> Result<&VideoAggregate, EventBuildError> {
    let video = video.ok_or(EventBuildError::NilAggregate)?;
    if event_id.is_nil() {
        return Err(EventBuildError::InvalidEventId);
    }
    Ok(video)
}

fn event(
    video: &VideoAggregate,
    event_id: Uuid,
    version: i64,
    occurred_at: DateTime<Utc>,
    kind: EventKind,
) -> DomainEvent {
    DomainEvent {
        event_id,
        aggregate_id: video.video_id,
        version,
        occurred_at,
        kind,
        headers: BTreeMap::new(),
    }
}

/// `created` event carrying the full snapshot; always version 1.
pub fn build_created(
    video: Option<&VideoAggregate>,
    event_id: Uuid,
    occurred_at: DateTime<Utc>,
) -> Result<DomainEvent, EventBuildError> {
    let video = check(video, event_id)?;
    Ok(event(
        video,
        event_id,
        CREATED_VERSION,
        occurred_at,
        EventKind::Created(VideoSnapshot::from(video)),
    ))
}

/// `updated` event carrying only the changed fields.
pub fn build_updated(
    video: Option<&VideoAggregate>,
    changes: VideoChanges,
    event_id: Uuid,
    occurred_at: DateTime<Utc>,
) -> Result<DomainEvent, EventBuildError> {
    build_changed(video, ChangeKind::Updated, changes, event_id, occurred_at)
}

/// Like [`build_updated`] for the specialized change kinds.
///
/// `video.version` is the version of the last event already emitted for it.
pub fn build_changed(
    video: Option<&VideoAggregate>,
    kind: ChangeKind,
    changes: VideoChanges,
    event_id: Uuid,
    occurred_at: DateTime<Utc>,
) -> Result<DomainEvent, EventBuildError> {
    let video = check(video, event_id)?;
    if changes.is_empty() {
        return Err(EventBuildError::EmptyChangeset);
    }
    Ok(event(
        video,
        event_id,
        next_version(video.version, occurred_at),
        occurred_at,
        kind.into_kind(changes),
    ))
}

pub fn build_deleted(
    video: Option<&VideoAggregate>,
    event_id: Uuid,
    occurred_at: DateTime<Utc>,
    reason: Option<String>,
) -> Result<DomainEvent, EventBuildError> {
    let video = check(video, event_id)?;
    Ok(event(
        video,
        event_id,
        next_version(video.version, occurred_at),
        occurred_at,
        EventKind::Deleted {
            reason: reason.filter(|r| !r.trim().is_empty()),
        },
    ))
}

/// Informational event emitted next to the update that moved `stage` to failed.
pub fn build_processing_failed(
    video: Option<&VideoAggregate>,
    stage: Stage,
    job_id: Option<String>,
    error_message: Option<String>,
    event_id: Uuid,
    occurred_at: DateTime<Utc>,
) -> Result<DomainEvent, EventBuildError> {
    let video = check(video, event_id)?;
    Ok(event(
        video,
        event_id,
        next_version(video.version, occurred_at),
        occurred_at,
        EventKind::ProcessingFailed {
            stage,
            job_id,
            error_message,
        },
    ))
}
