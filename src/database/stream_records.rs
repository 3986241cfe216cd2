use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite};

use super::{Database, JobStore};
use crate::errors::{AppError, AppResult};
use crate::models::{NewStreamRecord, StreamRecord, StreamRecordUpdate, StreamStatus};

const RECORD_COLUMNS: &str = "id, title, preview_file_video, preview_file_audio, \
    stream_file_video, stream_file_audio, stream_key, stream_url, bitrate, resolution, fps, \
    loop_enabled, audio_enabled, is_streaming, status, auto_stopped, schedule_enabled, \
    schedule_start_enabled, schedule_duration_enabled, schedule_start, schedule_duration_secs, \
    container_order, created_at, started_at, ended_at";

fn parse_datetime(s: &str) -> AppResult<DateTime<Utc>> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // SQLite CURRENT_TIMESTAMP format
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc());
    }
    Err(AppError::internal(format!("Failed to parse datetime: {s}")))
}

fn parse_optional_datetime(s: Option<String>) -> AppResult<Option<DateTime<Utc>>> {
    s.filter(|s| !s.is_empty())
        .map(|s| parse_datetime(&s))
        .transpose()
}

fn record_from_row(row: &SqliteRow) -> AppResult<StreamRecord> {
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");

    Ok(StreamRecord {
        id: row.get("id"),
        title: row.get("title"),
        preview_file_video: row.get("preview_file_video"),
        preview_file_audio: row.get("preview_file_audio"),
        stream_file_video: row.get("stream_file_video"),
        stream_file_audio: row.get("stream_file_audio"),
        stream_key: row.get("stream_key"),
        stream_url: row.get("stream_url"),
        bitrate: row.get("bitrate"),
        resolution: row.get("resolution"),
        fps: row.get("fps"),
        loop_enabled: row.get("loop_enabled"),
        audio_enabled: row.get("audio_enabled"),
        is_streaming: row.get("is_streaming"),
        status: status.parse::<StreamStatus>()?,
        auto_stopped: row.get("auto_stopped"),
        schedule_enabled: row.get("schedule_enabled"),
        schedule_start_enabled: row.get("schedule_start_enabled"),
        schedule_duration_enabled: row.get("schedule_duration_enabled"),
        schedule_start: parse_optional_datetime(row.get("schedule_start"))?,
        schedule_duration_secs: row.get("schedule_duration_secs"),
        container_order: row.get("container_order"),
        created_at: parse_datetime(&created_at)?,
        started_at: parse_optional_datetime(row.get("started_at"))?,
        ended_at: parse_optional_datetime(row.get("ended_at"))?,
    })
}

#[async_trait]
impl JobStore for Database {
    async fn create(&self, record: NewStreamRecord) -> AppResult<StreamRecord> {
        let now = Utc::now();
        let is_streaming = !record.status.is_terminal();

        let next_order: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(container_order), 0) + 1 FROM stream_containers",
        )
        .fetch_one(&self.pool)
        .await?;

        let result = sqlx::query(
            "INSERT INTO stream_containers (
                title, preview_file_video, preview_file_audio, stream_file_video,
                stream_file_audio, stream_key, stream_url, bitrate, resolution, fps,
                loop_enabled, audio_enabled, is_streaming, status, schedule_enabled,
                schedule_start_enabled, schedule_duration_enabled, schedule_start,
                schedule_duration_secs, container_order, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.title)
        .bind(&record.preview_file_video)
        .bind(&record.preview_file_audio)
        .bind(&record.stream_file_video)
        .bind(&record.stream_file_audio)
        .bind(&record.stream_key)
        .bind(&record.stream_url)
        .bind(record.bitrate)
        .bind(&record.resolution)
        .bind(record.fps)
        .bind(record.loop_enabled)
        .bind(record.audio_enabled)
        .bind(is_streaming)
        .bind(record.status.as_str())
        .bind(record.schedule_enabled)
        .bind(record.schedule_start_enabled)
        .bind(record.schedule_duration_enabled)
        .bind(record.schedule_start.map(|dt| dt.to_rfc3339()))
        .bind(record.schedule_duration_secs)
        .bind(next_order)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get(id)
            .await?
            .ok_or_else(|| AppError::internal(format!("Stream record {id} vanished after insert")))
    }

    async fn update(&self, id: i64, update: StreamRecordUpdate) -> AppResult<()> {
        if update.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE stream_containers SET ");
        {
            let mut set = builder.separated(", ");
            if let Some(is_streaming) = update.is_streaming {
                set.push("is_streaming = ").push_bind_unseparated(is_streaming);
            }
            if let Some(status) = update.status {
                set.push("status = ").push_bind_unseparated(status.as_str());
            }
            if let Some(auto_stopped) = update.auto_stopped {
                set.push("auto_stopped = ").push_bind_unseparated(auto_stopped);
            }
            if let Some(started_at) = update.started_at {
                set.push("started_at = ")
                    .push_bind_unseparated(started_at.to_rfc3339());
            }
            if let Some(ended_at) = update.ended_at {
                set.push("ended_at = ").push_bind_unseparated(ended_at.to_rfc3339());
            }
        }
        builder.push(" WHERE id = ").push_bind(id);

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("stream record", id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM stream_containers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: i64) -> AppResult<Option<StreamRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM stream_containers WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn query_active(&self) -> AppResult<Vec<StreamRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM stream_containers
             WHERE is_streaming = 1 ORDER BY container_order"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn query_all(&self) -> AppResult<Vec<StreamRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM stream_containers ORDER BY container_order DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn find_by_key(&self, stream_key: &str) -> AppResult<Option<StreamRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM stream_containers
             WHERE stream_key = ? AND is_streaming = 1
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(stream_key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }
}
