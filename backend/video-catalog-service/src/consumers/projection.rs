//! Applies decoded events to the read model.
//!
//! Every write is version-guarded at the store, so applying an event twice or
//! out of order leaves the same row as applying it once, in order.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::decode::{InboundEvent, ProjectionError};
use crate::clock::Clock;
use crate::db::ProjectionStore;
use crate::events::EventKind;
use crate::metrics::MetricsReporter;
use crate::models::{ProjectionRow, VideoChanges};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The stored row is already at this version or newer
    Stale,
    /// An update arrived before the row was created
    MissingProjection,
    /// Delete found no row at or below its version
    NothingToDelete,
    UnknownEventType,
    /// Event kinds that carry no projected state
    Informational,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Stale => "stale",
            SkipReason::MissingProjection => "missing_projection",
            SkipReason::NothingToDelete => "nothing_to_delete",
            SkipReason::UnknownEventType => "unknown_event_type",
            SkipReason::Informational => "informational",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Skipped(SkipReason),
}

impl ApplyOutcome {
    fn label(&self) -> String {
        match self {
            ApplyOutcome::Applied => "applied".to_string(),
            ApplyOutcome::Skipped(reason) => format!("skipped_{}", reason.as_str()),
        }
    }
}

pub struct ProjectionApplier<P: ProjectionStore> {
    store: Arc<P>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsReporter>,
}

impl<P: ProjectionStore> ProjectionApplier<P> {
    pub fn new(store: Arc<P>, clock: Arc<dyn Clock>, metrics: Arc<dyn MetricsReporter>) -> Self {
        Self {
            store,
            clock,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<P> {
        &self.store
    }

    pub async fn apply(&self, event: &InboundEvent) -> Result<ApplyOutcome, ProjectionError> {
        let result = self.dispatch(event).await;

        match &result {
            Ok(outcome) => {
                self.metrics
                    .projection_applied(&event.event_type, &outcome.label());
                if *outcome == ApplyOutcome::Applied {
                    let lag = (self.clock.now() - event.occurred_at)
                        .to_std()
                        .unwrap_or_default();
                    self.metrics.projection_lag(lag);
                }
            }
            Err(e) => {
                self.metrics.projection_applied(&event.event_type, "failed");
                warn!(
                    event_id = %event.event_id,
                    video_id = %event.aggregate_id,
                    error = %e,
                    "Projection apply failed"
                );
            }
        }

        result
    }

    async fn dispatch(&self, event: &InboundEvent) -> Result<ApplyOutcome, ProjectionError> {
        let Some(kind) = &event.kind else {
            warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Skipping unknown event type"
            );
            return Ok(ApplyOutcome::Skipped(SkipReason::UnknownEventType));
        };

        match kind {
            EventKind::Created(snapshot) => {
                let row = ProjectionRow::from_snapshot(
                    event.aggregate_id,
                    snapshot,
                    event.version,
                    event.occurred_at,
                );
                if self.store.upsert_created(&row).await? {
                    info!(video_id = %event.aggregate_id, "Projection created");
                    Ok(ApplyOutcome::Applied)
                } else {
                    Ok(ApplyOutcome::Skipped(SkipReason::Stale))
                }
            }
            EventKind::Updated(changes)
            | EventKind::MediaReady(changes)
            | EventKind::AiEnriched(changes)
            | EventKind::VisibilityChanged(changes) => self.merge(event, changes).await,
            EventKind::Deleted { reason } => {
                if self
                    .store
                    .delete_if_not_newer(event.aggregate_id, event.version)
                    .await?
                {
                    info!(
                        video_id = %event.aggregate_id,
                        reason = reason.as_deref().unwrap_or(""),
                        "Projection deleted"
                    );
                    Ok(ApplyOutcome::Applied)
                } else {
                    debug!(
                        video_id = %event.aggregate_id,
                        version = event.version,
                        "Delete found no row at or below its version"
                    );
                    Ok(ApplyOutcome::Skipped(SkipReason::NothingToDelete))
                }
            }
            EventKind::ProcessingFailed { stage, .. } => {
                debug!(
                    video_id = %event.aggregate_id,
                    stage = %stage,
                    "Processing failure noted; state arrives with the paired update"
                );
                Ok(ApplyOutcome::Skipped(SkipReason::Informational))
            }
        }
    }

    async fn merge(
        &self,
        event: &InboundEvent,
        changes: &VideoChanges,
    ) -> Result<ApplyOutcome, ProjectionError> {
        let Some(mut row) = self.store.get(event.aggregate_id).await? else {
            info!(
                video_id = %event.aggregate_id,
                event_id = %event.event_id,
                "No projection row yet, skipping update"
            );
            return Ok(ApplyOutcome::Skipped(SkipReason::MissingProjection));
        };

        if event.version <= row.version {
            debug!(
                video_id = %event.aggregate_id,
                incoming = event.version,
                stored = row.version,
                "Stale update skipped"
            );
            return Ok(ApplyOutcome::Skipped(SkipReason::Stale));
        }

        changes.apply_to_projection(&mut row);
        row.version = event.version;
        row.occurred_at = event.occurred_at;
        row.updated_at = event.occurred_at;

        if self.store.update_if_newer(&row).await? {
            Ok(ApplyOutcome::Applied)
        } else {
            // A newer write landed between the read and the guarded update.
            Ok(ApplyOutcome::Skipped(SkipReason::Stale))
        }
    }
}
