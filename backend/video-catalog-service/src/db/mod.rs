/// Storage layer.
///
/// The catalog (aggregate rows plus outbox append) is written through an
/// explicit transaction handle passed into every call of one logical
/// operation; the projection store is written one version-guarded statement
/// at a time by the projection consumer only.
use async_trait::async_trait;
use thiserror::Error;
use transactional_outbox::{OutboxError, OutboxEvent};
use uuid::Uuid;

use crate::models::{ProjectionRow, VideoAggregate};

pub mod memory;
pub mod projection_repo;
pub mod video_repo;

pub use memory::{MemoryCatalog, MemoryProjectionStore, MemoryTx};
pub use projection_repo::PgProjectionStore;
pub use video_repo::PgCatalogStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Duplicate key: {0}")]
    Duplicate(String),

    /// A concurrent writer changed the row between read and commit
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),
}

impl StoreError {
    /// Failures a later retry may not hit again.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            StoreError::Outbox(e) => e.is_transient(),
            StoreError::Unavailable(_) | StoreError::WriteConflict(_) => true,
            StoreError::Duplicate(_) | StoreError::Corrupt(_) => false,
        }
    }
}

/// Map unique violations (SQLSTATE 23505) to [`StoreError::Duplicate`].
pub(crate) fn map_insert_error(err: sqlx::Error, what: &str) -> StoreError {
    let is_unique_violation = err
        .as_database_error()
        .and_then(|db_err| db_err.code())
        .map(|code| code == "23505")
        .unwrap_or(false);

    if is_unique_violation {
        StoreError::Duplicate(what.to_string())
    } else {
        StoreError::Database(err)
    }
}

/// Authoritative video rows and the outbox, written together.
#[async_trait]
pub trait CatalogStore: Send + Sync + 'static {
    /// Transaction handle; dropping it without commit rolls back.
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError>;

    async fn load_video(
        &self,
        tx: &mut Self::Tx,
        video_id: Uuid,
    ) -> Result<Option<VideoAggregate>, StoreError>;

    /// Fails with [`StoreError::Duplicate`] if the id is taken.
    async fn insert_video(&self, tx: &mut Self::Tx, video: &VideoAggregate)
        -> Result<(), StoreError>;

    /// Overwrite the row if its stored version still equals
    /// `expected_version`. Returns false when it does not.
    async fn update_video(
        &self,
        tx: &mut Self::Tx,
        video: &VideoAggregate,
        expected_version: i64,
    ) -> Result<bool, StoreError>;

    /// Same version precondition as [`update_video`](Self::update_video).
    async fn delete_video(
        &self,
        tx: &mut Self::Tx,
        video_id: Uuid,
        expected_version: i64,
    ) -> Result<bool, StoreError>;

    /// Append an outbox row inside `tx`.
    async fn append_event(&self, tx: &mut Self::Tx, event: &OutboxEvent) -> Result<(), StoreError>;

    /// Committed state, outside any transaction.
    async fn get_video(&self, video_id: Uuid) -> Result<Option<VideoAggregate>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Read model written by the projection consumer.
///
/// Every write is a single statement guarded by the row version, so the
/// stored version never decreases whatever order events arrive in.
#[async_trait]
pub trait ProjectionStore: Send + Sync + 'static {
    async fn get(&self, video_id: Uuid) -> Result<Option<ProjectionRow>, StoreError>;

    /// Insert, or overwrite a row whose version is not newer. Returns true if written.
    async fn upsert_created(&self, row: &ProjectionRow) -> Result<bool, StoreError>;

    /// Overwrite the stored row only if `row.version` is greater.
    async fn update_if_newer(&self, row: &ProjectionRow) -> Result<bool, StoreError>;

    /// Delete the row only if its version is `<= version`.
    async fn delete_if_not_newer(&self, video_id: Uuid, version: i64) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
