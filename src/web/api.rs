use axum::{
    extract::{multipart::Field, Multipart, Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info};

use super::responses::ApiResponse;
use super::AppState;
use crate::errors::{AppError, AppResult};
use crate::models::{
    ActiveStreamInfo, Resolution, StreamSchedule, ScheduledStreamInfo, StartStreamRequest,
    StartStreamResponse, StreamRecord, UploadedFile,
};

#[derive(Debug, Deserialize)]
pub struct StopStreamRequest {
    pub stream_key: String,
}

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let database = match sqlx::query("SELECT 1")
        .execute(&state.database.pool())
        .await
    {
        Ok(_) => "healthy",
        Err(e) => {
            error!("Database health check failed: {}", e);
            "unhealthy"
        }
    };

    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "database": database,
        "active_streams": state.manager.list_active().len(),
        "scheduled_streams": state.manager.list_scheduled().len(),
    }))
}

// Streams API
pub async fn start_stream(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<StartStreamResponse>, AppError> {
    let request = read_start_form(&state, multipart).await?;
    info!(
        "Start requested for stream {} ({})",
        request.stream_key, request.title
    );
    let response = state.manager.start_job(request).await?;
    Ok(Json(response))
}

pub async fn stop_stream(
    State(state): State<AppState>,
    Json(payload): Json<StopStreamRequest>,
) -> Result<Json<ApiResponse>, AppError> {
    state.manager.stop_job(payload.stream_key.trim()).await?;
    Ok(Json(ApiResponse::message("Stream stopped")))
}

pub async fn cancel_schedule(
    State(state): State<AppState>,
    Path(stream_key): Path<String>,
) -> Result<Json<ApiResponse>, AppError> {
    state.manager.cancel_schedule(&stream_key).await?;
    Ok(Json(ApiResponse::message("Scheduled stream cancelled")))
}

pub async fn stream_status(
    State(state): State<AppState>,
    Path(stream_key): Path<String>,
) -> impl IntoResponse {
    let mut events = state.manager.subscribe_status(&stream_key);

    let stream = async_stream::stream! {
        while let Some(event) = events.next().await {
            match Event::default().json_data(&event) {
                Ok(sse_event) => yield Ok::<Event, axum::Error>(sse_event),
                Err(e) => {
                    error!("Failed to encode status event for {}: {}", stream_key, e);
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

pub async fn list_active_streams(State(state): State<AppState>) -> Json<Vec<ActiveStreamInfo>> {
    Json(state.manager.list_active())
}

pub async fn list_scheduled_streams(
    State(state): State<AppState>,
) -> Json<Vec<ScheduledStreamInfo>> {
    Json(state.manager.list_scheduled())
}

pub async fn list_streams(
    State(state): State<AppState>,
) -> Result<Json<Vec<StreamRecord>>, AppError> {
    Ok(Json(state.manager.list_history().await?))
}

pub async fn delete_stream_record(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse>, AppError> {
    state.manager.delete_history_record(id).await?;
    Ok(Json(ApiResponse::message("Stream record deleted")))
}

/// Drain the multipart body: files go to staging, text fields are
/// collected for [`parse_start_form`].
async fn read_start_form(state: &AppState, mut multipart: Multipart) -> AppResult<StartStreamRequest> {
    let mut fields = HashMap::new();
    let mut video = None;
    let mut audio = None;

    let result: AppResult<()> = async {
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::validation(format!("Invalid multipart body: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "video" => video = stage_file(state, field).await?,
                "audio" => audio = stage_file(state, field).await?,
                _ => {
                    let value = field
                        .text()
                        .await
                        .map_err(|e| AppError::validation(format!("Invalid field {name}: {e}")))?;
                    fields.insert(name, value);
                }
            }
        }
        Ok(())
    }
    .await;

    let parsed = result.and_then(|()| parse_start_form(&fields));
    match parsed {
        Ok(form) => Ok(StartStreamRequest {
            video,
            audio,
            ..form
        }),
        Err(e) => {
            for file in video.iter().chain(audio.iter()) {
                state.storage.discard_staged(file).await;
            }
            Err(e)
        }
    }
}

async fn stage_file(state: &AppState, field: Field<'_>) -> AppResult<Option<UploadedFile>> {
    let original_name = field.file_name().unwrap_or_default().to_string();
    if original_name.is_empty() {
        // Browsers send an empty part for an untouched file input
        let _ = field.bytes().await;
        return Ok(None);
    }
    let staged = state.storage.stage_upload(&original_name, field).await?;
    Ok(Some(staged))
}

fn is_checked(value: Option<&String>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "on" | "yes")
    )
}

fn parse_number<T: std::str::FromStr>(
    fields: &HashMap<String, String>,
    name: &str,
    default: Option<T>,
) -> AppResult<T> {
    match fields.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(value) => value
            .parse()
            .map_err(|_| AppError::validation(format!("Invalid {name}: {value}"))),
        None => default.ok_or_else(|| AppError::validation(format!("{name} is required"))),
    }
}

/// Accepts RFC 3339, or a naive `YYYY-MM-DDTHH:MM[:SS]` in server local time
/// as sent by `datetime-local` inputs.
pub fn parse_schedule_start(value: &str) -> AppResult<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| AppError::validation(format!("Invalid schedule start time: {value}")))
}

/// Turn the text fields of a start submission into a request without files.
pub fn parse_start_form(fields: &HashMap<String, String>) -> AppResult<StartStreamRequest> {
    let text = |name: &str| fields.get(name).cloned().unwrap_or_default();

    let resolution: Resolution = fields
        .get("resolution")
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::validation("resolution is required"))?
        .parse()?;

    let mut schedule = StreamSchedule::default();
    if is_checked(fields.get("schedule_enabled")) {
        if is_checked(fields.get("schedule_start_enabled")) {
            let start = fields
                .get("schedule_start")
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AppError::validation("schedule_start is required"))?;
            schedule.start_at = Some(parse_schedule_start(start)?);
        }
        if is_checked(fields.get("schedule_duration_enabled")) {
            let minutes: u64 = parse_number(fields, "schedule_duration", None)?;
            if minutes == 0 {
                return Err(AppError::validation("schedule_duration must be positive"));
            }
            schedule.duration = Some(Duration::from_secs(minutes * 60));
        }
    }

    Ok(StartStreamRequest {
        title: text("title"),
        stream_key: text("stream_key"),
        target_endpoint: text("rtmp_url"),
        bitrate_kbps: parse_number(fields, "bitrate", None)?,
        fps: parse_number(fields, "fps", Some(30))?,
        resolution,
        loop_enabled: is_checked(fields.get("loop")),
        audio_enabled: is_checked(fields.get("audio_file")),
        schedule,
        video: None,
        audio: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_immediate_form() {
        let request = parse_start_form(&form(&[
            ("title", "Morning"),
            ("stream_key", "k1"),
            ("rtmp_url", "rtmp://a.example/live"),
            ("bitrate", "2500"),
            ("resolution", "1280x720"),
            ("loop", "true"),
        ]))
        .unwrap();

        assert_eq!(request.fps, 30);
        assert_eq!(request.bitrate_kbps, 2500);
        assert!(request.loop_enabled);
        assert!(!request.audio_enabled);
        assert_eq!(request.schedule, StreamSchedule::default());
    }

    #[test]
    fn test_schedule_fields_need_master_switch() {
        let base = [
            ("bitrate", "2500"),
            ("resolution", "1280:720"),
            ("schedule_start_enabled", "1"),
            ("schedule_start", "2099-01-01T10:00:00Z"),
            ("schedule_duration_enabled", "1"),
            ("schedule_duration", "90"),
        ];

        let ignored = parse_start_form(&form(&base)).unwrap();
        assert!(ignored.schedule.start_at.is_none());

        let mut enabled = base.to_vec();
        enabled.push(("schedule_enabled", "1"));
        let request = parse_start_form(&form(&enabled)).unwrap();
        assert_eq!(
            request.schedule.start_at.unwrap().to_rfc3339(),
            "2099-01-01T10:00:00+00:00"
        );
        assert_eq!(request.schedule.duration, Some(Duration::from_secs(90 * 60)));
    }

    #[test]
    fn test_invalid_numbers_are_validation_errors() {
        let result = parse_start_form(&form(&[("bitrate", "fast"), ("resolution", "1280:720")]));
        assert!(matches!(result, Err(AppError::Validation { .. })));

        let result = parse_start_form(&form(&[("resolution", "1280:720")]));
        assert!(matches!(result, Err(AppError::Validation { .. })));
    }

    #[test]
    fn test_parse_schedule_start_formats() {
        assert!(parse_schedule_start("2030-05-01T08:30:00+02:00").is_ok());
        assert!(parse_schedule_start("2030-05-01T08:30").is_ok());
        assert!(parse_schedule_start("2030-05-01 08:30:15").is_ok());
        assert!(parse_schedule_start("tomorrow").is_err());
    }
}
