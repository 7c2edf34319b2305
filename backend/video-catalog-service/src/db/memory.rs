//! In-process stores with the same semantics as the PostgreSQL ones.
//!
//! Used for `CATALOG_STORAGE=memory` runs and throughout the tests. Both
//! stores support failure injection so callers can exercise their rollback
//! and redelivery paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use transactional_outbox::{
    OutboxError, OutboxEvent, OutboxRepository, OutboxResult, PendingStats,
};
use uuid::Uuid;

use super::{CatalogStore, ProjectionStore, StoreError};
use crate::models::{ProjectionRow, VideoAggregate};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Writers never leave the maps half-updated, so a poisoned lock is still consistent.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct CatalogState {
    videos: HashMap<Uuid, VideoAggregate>,
    /// Ledger in insertion order
    outbox: Vec<OutboxEvent>,
    /// Every row before this index is published; drain-side scans start here.
    unpublished_from: usize,
}

impl CatalogState {
    fn unpublished(&self) -> &[OutboxEvent] {
        &self.outbox[self.unpublished_from..]
    }

    fn advance_cursor(&mut self) {
        while self
            .outbox
            .get(self.unpublished_from)
            .is_some_and(OutboxEvent::is_published)
        {
            self.unpublished_from += 1;
        }
    }
}

#[derive(Debug, Clone)]
enum StagedWrite {
    Insert(VideoAggregate),
    Update {
        video: VideoAggregate,
        expected_version: i64,
    },
    Delete {
        video_id: Uuid,
        expected_version: i64,
    },
}

impl StagedWrite {
    fn video_id(&self) -> Uuid {
        match self {
            StagedWrite::Insert(video) | StagedWrite::Update { video, .. } => video.video_id,
            StagedWrite::Delete { video_id, .. } => *video_id,
        }
    }

    fn resulting(&self) -> Option<&VideoAggregate> {
        match self {
            StagedWrite::Insert(video) | StagedWrite::Update { video, .. } => Some(video),
            StagedWrite::Delete { .. } => None,
        }
    }
}

/// Writes buffered until commit. Dropping it discards them.
#[derive(Debug, Default)]
pub struct MemoryTx {
    writes: Vec<StagedWrite>,
    events: Vec<OutboxEvent>,
}

/// In-memory catalog and outbox ledger.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<Mutex<CatalogState>>,
    fail_appends: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `append_event` fail until switched off.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Delay every transactional call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Committed ledger rows in insertion order.
    pub fn outbox_events(&self) -> Vec<OutboxEvent> {
        lock(&self.state).outbox.clone()
    }

    pub fn video_count(&self) -> usize {
        lock(&self.state).videos.len()
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Latest state of `video_id` as seen from inside `tx`.
    fn current(&self, tx: &MemoryTx, video_id: Uuid) -> Option<VideoAggregate> {
        match tx.writes.iter().rev().find(|w| w.video_id() == video_id) {
            Some(write) => write.resulting().cloned(),
            None => lock(&self.state).videos.get(&video_id).cloned(),
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        self.simulate_latency().await;
        Ok(MemoryTx::default())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut state = lock(&self.state);

        // Validate every precondition against committed state before applying any write.
        let mut seen: HashMap<Uuid, Option<i64>> = HashMap::new();
        for write in &tx.writes {
            let id = write.video_id();
            let current = match seen.get(&id) {
                Some(version) => *version,
                None => state.videos.get(&id).map(|v| v.version),
            };
            let ok = match write {
                StagedWrite::Insert(_) => current.is_none(),
                StagedWrite::Update {
                    expected_version, ..
                }
                | StagedWrite::Delete {
                    expected_version, ..
                } => current == Some(*expected_version),
            };
            if !ok {
                return Err(StoreError::WriteConflict(format!(
                    "video {id} changed before commit"
                )));
            }
            seen.insert(id, write.resulting().map(|v| v.version));
        }

        for write in tx.writes {
            match write {
                StagedWrite::Insert(video) | StagedWrite::Update { video, .. } => {
                    state.videos.insert(video.video_id, video);
                }
                StagedWrite::Delete { video_id, .. } => {
                    state.videos.remove(&video_id);
                }
            }
        }
        state.outbox.extend(tx.events);
        Ok(())
    }

    async fn rollback(&self, _tx: Self::Tx) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load_video(
        &self,
        tx: &mut Self::Tx,
        video_id: Uuid,
    ) -> Result<Option<VideoAggregate>, StoreError> {
        self.simulate_latency().await;
        Ok(self.current(tx, video_id))
    }

    async fn insert_video(
        &self,
        tx: &mut Self::Tx,
        video: &VideoAggregate,
    ) -> Result<(), StoreError> {
        self.simulate_latency().await;
        if self.current(tx, video.video_id).is_some() {
            return Err(StoreError::Duplicate(format!("video {}", video.video_id)));
        }
        tx.writes.push(StagedWrite::Insert(video.clone()));
        Ok(())
    }

    async fn update_video(
        &self,
        tx: &mut Self::Tx,
        video: &VideoAggregate,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        self.simulate_latency().await;
        match self.current(tx, video.video_id) {
            Some(current) if current.version == expected_version => {
                tx.writes.push(StagedWrite::Update {
                    video: video.clone(),
                    expected_version,
                });
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_video(
        &self,
        tx: &mut Self::Tx,
        video_id: Uuid,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        self.simulate_latency().await;
        match self.current(tx, video_id) {
            Some(current) if current.version == expected_version => {
                tx.writes.push(StagedWrite::Delete {
                    video_id,
                    expected_version,
                });
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_event(&self, tx: &mut Self::Tx, event: &OutboxEvent) -> Result<(), StoreError> {
        self.simulate_latency().await;
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "outbox append failed (injected)".to_string(),
            ));
        }
        tx.events.push(event.clone());
        Ok(())
    }

    async fn get_video(&self, video_id: Uuid) -> Result<Option<VideoAggregate>, StoreError> {
        Ok(lock(&self.state).videos.get(&video_id).cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for MemoryCatalog {
    async fn fetch_due(
        &self,
        limit: i64,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let state = lock(&self.state);
        let mut held_back: HashSet<Uuid> = HashSet::new();
        let mut due = Vec::new();

        for event in state.unpublished() {
            if due.len() as i64 >= limit {
                break;
            }
            if event.is_published() {
                continue;
            }
            if event.delivery_attempts >= max_attempts || event.available_at > now {
                held_back.insert(event.aggregate_id);
                continue;
            }
            if held_back.contains(&event.aggregate_id) {
                continue;
            }
            due.push(event.clone());
        }

        Ok(due)
    }

    async fn mark_published(&self, event_id: Uuid) -> OutboxResult<()> {
        let mut state = lock(&self.state);
        let start = state.unpublished_from;
        let event = state.outbox[start..]
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or(OutboxError::EventNotFound(event_id))?;
        if event.published_at.is_none() {
            event.published_at = Some(Utc::now());
        }
        state.advance_cursor();
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> OutboxResult<()> {
        let mut state = lock(&self.state);
        let start = state.unpublished_from;
        let event = state.outbox[start..]
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or(OutboxError::EventNotFound(event_id))?;
        event.delivery_attempts += 1;
        event.last_error = Some(error.to_string());
        event.available_at = next_attempt_at;
        Ok(())
    }

    async fn pending_stats(&self, max_attempts: i32) -> OutboxResult<PendingStats> {
        let state = lock(&self.state);
        let now = Utc::now();
        let mut stats = PendingStats::default();

        for event in state.unpublished().iter().filter(|e| !e.is_published()) {
            if event.delivery_attempts >= max_attempts {
                stats.exhausted += 1;
            } else {
                stats.pending += 1;
            }
            let age = (now - event.created_at).num_seconds().max(0);
            stats.oldest_age_seconds = stats.oldest_age_seconds.max(age);
        }

        Ok(stats)
    }
}

/// In-memory read model.
#[derive(Debug, Clone, Default)]
pub struct MemoryProjectionStore {
    rows: Arc<Mutex<HashMap<Uuid, ProjectionRow>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`] until switched off.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.rows).is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "projection store unavailable (injected)".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ProjectionStore for MemoryProjectionStore {
    async fn get(&self, video_id: Uuid) -> Result<Option<ProjectionRow>, StoreError> {
        self.check_available()?;
        Ok(lock(&self.rows).get(&video_id).cloned())
    }

    async fn upsert_created(&self, row: &ProjectionRow) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut rows = lock(&self.rows);
        match rows.get(&row.video_id) {
            Some(existing) if existing.version > row.version => Ok(false),
            _ => {
                rows.insert(row.video_id, row.clone());
                Ok(true)
            }
        }
    }

    async fn update_if_newer(&self, row: &ProjectionRow) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut rows = lock(&self.rows);
        match rows.get_mut(&row.video_id) {
            Some(existing) if existing.version < row.version => {
                *existing = row.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_not_newer(&self, video_id: Uuid, version: i64) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut rows = lock(&self.rows);
        match rows.get(&video_id) {
            Some(existing) if existing.version <= version => {
                rows.remove(&video_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn video(version: i64) -> VideoAggregate {
        let mut v = VideoAggregate::new_upload(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "T".to_string(),
            None,
            "r".to_string(),
            Utc::now(),
        );
        v.version = version;
        v
    }

    fn row(aggregate_id: Uuid, available_at: DateTime<Utc>) -> OutboxEvent {
        let mut event = OutboxEvent::new(
            Uuid::new_v4(),
            "video",
            aggregate_id,
            "video.updated",
            b"{}".to_vec(),
            BTreeMap::new(),
            Utc::now(),
        );
        event.available_at = available_at;
        event
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible_and_dropped() {
        let catalog = MemoryCatalog::new();
        let v = video(1);

        let mut tx = catalog.begin().await.unwrap();
        catalog.insert_video(&mut tx, &v).await.unwrap();
        assert!(catalog.load_video(&mut tx, v.video_id).await.unwrap().is_some());
        assert!(catalog.get_video(v.video_id).await.unwrap().is_none());
        drop(tx);

        assert_eq!(catalog.video_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_detects_concurrent_update() {
        let catalog = MemoryCatalog::new();
        let v = video(1);
        let mut tx = catalog.begin().await.unwrap();
        catalog.insert_video(&mut tx, &v).await.unwrap();
        catalog.commit(tx).await.unwrap();

        let mut first = catalog.begin().await.unwrap();
        let mut second = catalog.begin().await.unwrap();
        let mut a = v.clone();
        a.version = 2;
        let mut b = v.clone();
        b.version = 3;
        assert!(catalog.update_video(&mut first, &a, 1).await.unwrap());
        assert!(catalog.update_video(&mut second, &b, 1).await.unwrap());

        catalog.commit(first).await.unwrap();
        let err = catalog.commit(second).await.unwrap_err();

        assert!(matches!(err, StoreError::WriteConflict(_)));
        assert_eq!(catalog.get_video(v.video_id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_stale_expected_version_is_rejected() {
        let catalog = MemoryCatalog::new();
        let v = video(5);
        let mut tx = catalog.begin().await.unwrap();
        catalog.insert_video(&mut tx, &v).await.unwrap();
        catalog.commit(tx).await.unwrap();

        let mut tx = catalog.begin().await.unwrap();
        assert!(!catalog.update_video(&mut tx, &v, 4).await.unwrap());
        assert!(!catalog.delete_video(&mut tx, v.video_id, 4).await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_due_holds_back_rows_behind_a_backing_off_row() {
        let catalog = MemoryCatalog::new();
        let now = Utc::now();
        let blocked = Uuid::new_v4();
        let free = Uuid::new_v4();
        let later = now + chrono::Duration::seconds(30);

        let mut tx = catalog.begin().await.unwrap();
        for event in [row(blocked, later), row(blocked, now), row(free, now)] {
            catalog.append_event(&mut tx, &event).await.unwrap();
        }
        catalog.commit(tx).await.unwrap();

        let due = catalog.fetch_due(10, 5, now).await.unwrap();

        assert_eq!(due.len(), 1);
        assert_eq!(due[0].aggregate_id, free);
    }

    #[tokio::test]
    async fn test_exhausted_row_holds_back_its_aggregate() {
        let catalog = MemoryCatalog::new();
        let now = Utc::now();
        let aggregate = Uuid::new_v4();
        let created = row(aggregate, now);
        let updated = row(aggregate, now);

        let mut tx = catalog.begin().await.unwrap();
        catalog.append_event(&mut tx, &created).await.unwrap();
        catalog.append_event(&mut tx, &updated).await.unwrap();
        catalog.commit(tx).await.unwrap();
        for _ in 0..3 {
            catalog.mark_failed(created.id, "broker down", now).await.unwrap();
        }

        assert!(catalog.fetch_due(10, 3, now).await.unwrap().is_empty());
        let stats = catalog.pending_stats(3).await.unwrap();
        assert_eq!((stats.pending, stats.exhausted), (1, 1));
    }

    #[tokio::test]
    async fn test_published_prefix_is_skipped_but_kept() {
        let catalog = MemoryCatalog::new();
        let now = Utc::now();
        let rows: Vec<OutboxEvent> = (0..3).map(|_| row(Uuid::new_v4(), now)).collect();

        let mut tx = catalog.begin().await.unwrap();
        for event in &rows {
            catalog.append_event(&mut tx, event).await.unwrap();
        }
        catalog.commit(tx).await.unwrap();
        catalog.mark_published(rows[1].id).await.unwrap();
        catalog.mark_published(rows[0].id).await.unwrap();

        let due = catalog.fetch_due(10, 5, now).await.unwrap();
        assert_eq!(due.iter().map(|e| e.id).collect::<Vec<_>>(), vec![rows[2].id]);
        assert_eq!(lock(&catalog.state).unpublished_from, 2);
        assert_eq!(catalog.outbox_events().len(), 3);
    }

    #[tokio::test]
    async fn test_projection_guards_versions() {
        let store = MemoryProjectionStore::new();
        let v = video(1);
        let snapshot = crate::models::VideoSnapshot::from(&v);
        let mut row = ProjectionRow::from_snapshot(v.video_id, &snapshot, 10, Utc::now());

        assert!(store.upsert_created(&row).await.unwrap());
        row.version = 9;
        assert!(!store.update_if_newer(&row).await.unwrap());
        assert!(!store.upsert_created(&row).await.unwrap());
        assert!(!store.delete_if_not_newer(v.video_id, 9).await.unwrap());
        assert!(store.delete_if_not_newer(v.video_id, 10).await.unwrap());
        assert!(store.is_empty());
    }
}
