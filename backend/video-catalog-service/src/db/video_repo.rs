use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use transactional_outbox::{OutboxEvent, SqlxOutboxRepository};
use uuid::Uuid;

use super::{map_insert_error, CatalogStore, StoreError};
use crate::models::VideoAggregate;

const VIDEO_COLUMNS: &str = r#"
    video_id, upload_user_id, title, description, raw_file_reference,
    overall_status, media_status, analysis_status,
    media_job_id, media_emitted_at, analysis_job_id, analysis_emitted_at,
    duration_seconds, resolution, bitrate_kbps, thumbnail_url, playlist_url,
    difficulty, summary, tags, subtitle_url,
    error_message, version, created_at, updated_at
"#;

/// PostgreSQL catalog: `videos` plus the `outbox_events` ledger.
#[derive(Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
    outbox: SqlxOutboxRepository,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            outbox: SqlxOutboxRepository::new(pool.clone()),
            pool,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(crate) fn parse_column<T: std::str::FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e: T::Err| StoreError::Corrupt(format!("{column}: {e}")))
}

fn video_from_row(row: &PgRow) -> Result<VideoAggregate, StoreError> {
    Ok(VideoAggregate {
        video_id: row.try_get("video_id")?,
        upload_user_id: row.try_get("upload_user_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        raw_file_reference: row.try_get("raw_file_reference")?,
        overall_status: parse_column(row, "overall_status")?,
        media_status: parse_column(row, "media_status")?,
        analysis_status: parse_column(row, "analysis_status")?,
        media_job_id: row.try_get("media_job_id")?,
        media_emitted_at: row.try_get("media_emitted_at")?,
        analysis_job_id: row.try_get("analysis_job_id")?,
        analysis_emitted_at: row.try_get("analysis_emitted_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        resolution: row.try_get("resolution")?,
        bitrate_kbps: row.try_get("bitrate_kbps")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        playlist_url: row.try_get("playlist_url")?,
        difficulty: row.try_get("difficulty")?,
        summary: row.try_get("summary")?,
        tags: row.try_get("tags")?,
        subtitle_url: row.try_get("subtitle_url")?,
        error_message: row.try_get("error_message")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.rollback().await?;
        Ok(())
    }

    async fn load_video(
        &self,
        tx: &mut Self::Tx,
        video_id: Uuid,
    ) -> Result<Option<VideoAggregate>, StoreError> {
        let query = format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE video_id = $1");
        let row = sqlx::query(&query)
            .bind(video_id)
            .fetch_optional(&mut **tx)
            .await?;

        row.as_ref().map(video_from_row).transpose()
    }

    async fn insert_video(
        &self,
        tx: &mut Self::Tx,
        video: &VideoAggregate,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO videos (
                video_id, upload_user_id, title, description, raw_file_reference,
                overall_status, media_status, analysis_status,
                media_job_id, media_emitted_at, analysis_job_id, analysis_emitted_at,
                duration_seconds, resolution, bitrate_kbps, thumbnail_url, playlist_url,
                difficulty, summary, tags, subtitle_url,
                error_message, version, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25
            )
            "#,
        )
        .bind(video.video_id)
        .bind(video.upload_user_id)
        .bind(&video.title)
        .bind(&video.description)
        .bind(&video.raw_file_reference)
        .bind(video.overall_status.as_str())
        .bind(video.media_status.as_str())
        .bind(video.analysis_status.as_str())
        .bind(&video.media_job_id)
        .bind(video.media_emitted_at)
        .bind(&video.analysis_job_id)
        .bind(video.analysis_emitted_at)
        .bind(video.duration_seconds)
        .bind(&video.resolution)
        .bind(video.bitrate_kbps)
        .bind(&video.thumbnail_url)
        .bind(&video.playlist_url)
        .bind(&video.difficulty)
        .bind(&video.summary)
        .bind(&video.tags)
        .bind(&video.subtitle_url)
        .bind(&video.error_message)
        .bind(video.version)
        .bind(video.created_at)
        .bind(video.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_insert_error(e, &format!("video {}", video.video_id)))?;

        Ok(())
    }

    async fn update_video(
        &self,
        tx: &mut Self::Tx,
        video: &VideoAggregate,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE videos SET
                title = $2,
                description = $3,
                overall_status = $4,
                media_status = $5,
                analysis_status = $6,
                media_job_id = $7,
                media_emitted_at = $8,
                analysis_job_id = $9,
                analysis_emitted_at = $10,
                duration_seconds = $11,
                resolution = $12,
                bitrate_kbps = $13,
                thumbnail_url = $14,
                playlist_url = $15,
                difficulty = $16,
                summary = $17,
                tags = $18,
                subtitle_url = $19,
                error_message = $20,
                version = $21,
                updated_at = $22
            WHERE video_id = $1 AND version = $23
            "#,
        )
        .bind(video.video_id)
        .bind(&video.title)
        .bind(&video.description)
        .bind(video.overall_status.as_str())
        .bind(video.media_status.as_str())
        .bind(video.analysis_status.as_str())
        .bind(&video.media_job_id)
        .bind(video.media_emitted_at)
        .bind(&video.analysis_job_id)
        .bind(video.analysis_emitted_at)
        .bind(video.duration_seconds)
        .bind(&video.resolution)
        .bind(video.bitrate_kbps)
        .bind(&video.thumbnail_url)
        .bind(&video.playlist_url)
        .bind(&video.difficulty)
        .bind(&video.summary)
        .bind(&video.tags)
        .bind(&video.subtitle_url)
        .bind(&video.error_message)
        .bind(video.version)
        .bind(video.updated_at)
        .bind(expected_version)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_video(
        &self,
        tx: &mut Self::Tx,
        video_id: Uuid,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM videos WHERE video_id = $1 AND version = $2")
            .bind(video_id)
            .bind(expected_version)
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn append_event(&self, tx: &mut Self::Tx, event: &OutboxEvent) -> Result<(), StoreError> {
        self.outbox.insert(tx, event).await?;
        Ok(())
    }

    async fn get_video(&self, video_id: Uuid) -> Result<Option<VideoAggregate>, StoreError> {
        let query = format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE video_id = $1");
        let row = sqlx::query(&query)
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(video_from_row).transpose()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
