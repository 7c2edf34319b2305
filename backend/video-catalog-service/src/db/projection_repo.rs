use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use super::video_repo::parse_column;
use super::{ProjectionStore, StoreError};
use crate::models::ProjectionRow;

/// PostgreSQL read model (`video_projection`).
#[derive(Clone)]
pub struct PgProjectionStore {
    pool: PgPool,
}

impl PgProjectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn projection_from_row(row: &PgRow) -> Result<ProjectionRow, StoreError> {
    Ok(ProjectionRow {
        video_id: row.try_get("video_id")?,
        upload_user_id: row.try_get("upload_user_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        overall_status: parse_column(row, "overall_status")?,
        media_status: parse_column(row, "media_status")?,
        analysis_status: parse_column(row, "analysis_status")?,
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
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        version: row.try_get("version")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

/// Binds `row` as $1..$21 in column order.
fn bind_row<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    row: &'q ProjectionRow,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(row.video_id)
        .bind(row.upload_user_id)
        .bind(&row.title)
        .bind(&row.description)
        .bind(row.overall_status.as_str())
        .bind(row.media_status.as_str())
        .bind(row.analysis_status.as_str())
        .bind(row.duration_seconds)
        .bind(&row.resolution)
        .bind(row.bitrate_kbps)
        .bind(&row.thumbnail_url)
        .bind(&row.playlist_url)
        .bind(&row.difficulty)
        .bind(&row.summary)
        .bind(&row.tags)
        .bind(&row.subtitle_url)
        .bind(&row.error_message)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.version)
        .bind(row.occurred_at)
}

#[async_trait]
impl ProjectionStore for PgProjectionStore {
    async fn get(&self, video_id: Uuid) -> Result<Option<ProjectionRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT video_id, upload_user_id, title, description,
                   overall_status, media_status, analysis_status,
                   duration_seconds, resolution, bitrate_kbps, thumbnail_url, playlist_url,
                   difficulty, summary, tags, subtitle_url, error_message,
                   created_at, updated_at, version, occurred_at
            FROM video_projection
            WHERE video_id = $1
            "#,
        )
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(projection_from_row).transpose()
    }

    async fn upsert_created(&self, row: &ProjectionRow) -> Result<bool, StoreError> {
        let query = sqlx::query(
            r#"
            INSERT INTO video_projection (
                video_id, upload_user_id, title, description,
                overall_status, media_status, analysis_status,
                duration_seconds, resolution, bitrate_kbps, thumbnail_url, playlist_url,
                difficulty, summary, tags, subtitle_url, error_message,
                created_at, updated_at, version, occurred_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, $21
            )
            ON CONFLICT (video_id) DO UPDATE SET
                upload_user_id = EXCLUDED.upload_user_id,
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                overall_status = EXCLUDED.overall_status,
                media_status = EXCLUDED.media_status,
                analysis_status = EXCLUDED.analysis_status,
                duration_seconds = EXCLUDED.duration_seconds,
                resolution = EXCLUDED.resolution,
                bitrate_kbps = EXCLUDED.bitrate_kbps,
                thumbnail_url = EXCLUDED.thumbnail_url,
                playlist_url = EXCLUDED.playlist_url,
                difficulty = EXCLUDED.difficulty,
                summary = EXCLUDED.summary,
                tags = EXCLUDED.tags,
                subtitle_url = EXCLUDED.subtitle_url,
                error_message = EXCLUDED.error_message,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at,
                version = EXCLUDED.version,
                occurred_at = EXCLUDED.occurred_at
            WHERE video_projection.version <= EXCLUDED.version
            "#,
        );

        let result = bind_row(query, row).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_if_newer(&self, row: &ProjectionRow) -> Result<bool, StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE video_projection SET
                upload_user_id = $2,
                title = $3,
                description = $4,
                overall_status = $5,
                media_status = $6,
                analysis_status = $7,
                duration_seconds = $8,
                resolution = $9,
                bitrate_kbps = $10,
                thumbnail_url = $11,
                playlist_url = $12,
                difficulty = $13,
                summary = $14,
                tags = $15,
                subtitle_url = $16,
                error_message = $17,
                created_at = $18,
                updated_at = $19,
                version = $20,
                occurred_at = $21
            WHERE video_id = $1 AND version < $20
            "#,
        );

        let result = bind_row(query, row).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            debug!(
                video_id = %row.video_id,
                version = row.version,
                "Projection row missing or already newer"
            );
        }
        Ok(result.rows_affected() == 1)
    }

    async fn delete_if_not_newer(&self, video_id: Uuid, version: i64) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM video_projection WHERE video_id = $1 AND version <= $2")
                .bind(video_id)
                .bind(version)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
