use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::AppError;

/// Output frame size handed to the encoder's scale filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl FromStr for Resolution {
    type Err = AppError;

    /// Accepts `1280:720` and `1280x720`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (w, h) = s
            .split_once(':')
            .or_else(|| s.split_once(|c: char| c == 'x' || c == 'X'))
            .ok_or_else(|| AppError::validation(format!("Invalid resolution: {s}")))?;

        let width: u32 = w
            .trim()
            .parse()
            .map_err(|_| AppError::validation(format!("Invalid resolution width: {w}")))?;
        let height: u32 = h
            .trim()
            .parse()
            .map_err(|_| AppError::validation(format!("Invalid resolution height: {h}")))?;

        if width == 0 || height == 0 {
            return Err(AppError::validation(format!("Invalid resolution: {s}")));
        }

        Ok(Self { width, height })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingParams {
    pub bitrate_kbps: u32,
    pub fps: u32,
    pub resolution: Resolution,
    pub loop_enabled: bool,
    pub audio_enabled: bool,
}

/// When a job starts and how long it runs once it does
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSchedule {
    pub start_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
}

impl StreamSchedule {
    pub fn is_delayed(&self) -> bool {
        self.start_at.is_some()
    }
}

/// A submitted stream, as the lifecycle manager sees it
#[derive(Debug, Clone)]
pub struct StreamJob {
    pub stream_key: String,
    pub title: String,
    pub source_video: PathBuf,
    pub source_audio: Option<PathBuf>,
    /// Base ingest URL; the stream key is appended to it
    pub target_endpoint: String,
    pub encoding: EncodingParams,
    pub schedule: StreamSchedule,
    pub record_id: i64,
}

impl StreamJob {
    /// `<endpoint>/<stream_key>` joined with exactly one slash
    pub fn output_url(&self) -> String {
        format!(
            "{}/{}",
            self.target_endpoint.trim_end_matches('/'),
            self.stream_key.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Idle,
    Scheduled,
    Live,
    Stopped,
    Failed,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scheduled => "scheduled",
            Self::Live => "live",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "scheduled" => Ok(Self::Scheduled),
            "live" => Ok(Self::Live),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => Err(AppError::internal(format!("Unknown stream status: {other}"))),
        }
    }
}

/// Why the supervisor was asked to stop an encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Manual,
    DurationElapsed,
    Shutdown,
}

/// Durable row in `stream_containers`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: i64,
    pub title: String,
    pub preview_file_video: Option<String>,
    pub preview_file_audio: Option<String>,
    pub stream_file_video: Option<String>,
    pub stream_file_audio: Option<String>,
    pub stream_key: String,
    pub stream_url: String,
    pub bitrate: i64,
    pub resolution: String,
    pub fps: i64,
    pub loop_enabled: bool,
    pub audio_enabled: bool,
    pub is_streaming: bool,
    pub status: StreamStatus,
    pub auto_stopped: bool,
    pub schedule_enabled: bool,
    pub schedule_start_enabled: bool,
    pub schedule_duration_enabled: bool,
    pub schedule_start: Option<DateTime<Utc>>,
    pub schedule_duration_secs: Option<i64>,
    pub container_order: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StreamRecord {
    /// A pending schedule that should be re-armed after a restart
    pub fn has_pending_schedule(&self) -> bool {
        self.is_streaming
            && self.status == StreamStatus::Scheduled
            && self.schedule_enabled
            && self.schedule_start_enabled
            && self.schedule_start.is_some()
    }

    pub fn schedule_duration(&self) -> Option<Duration> {
        if !self.schedule_duration_enabled {
            return None;
        }
        self.schedule_duration_secs
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
    }
}

#[derive(Debug, Clone)]
pub struct NewStreamRecord {
    pub title: String,
    pub preview_file_video: Option<String>,
    pub preview_file_audio: Option<String>,
    pub stream_file_video: String,
    pub stream_file_audio: Option<String>,
    pub stream_key: String,
    pub stream_url: String,
    pub bitrate: i64,
    pub resolution: String,
    pub fps: i64,
    pub loop_enabled: bool,
    pub audio_enabled: bool,
    pub status: StreamStatus,
    pub schedule_enabled: bool,
    pub schedule_start_enabled: bool,
    pub schedule_duration_enabled: bool,
    pub schedule_start: Option<DateTime<Utc>>,
    pub schedule_duration_secs: Option<i64>,
}

/// Partial update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamRecordUpdate {
    pub is_streaming: Option<bool>,
    pub status: Option<StreamStatus>,
    pub auto_stopped: Option<bool>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StreamRecordUpdate {
    pub fn live(at: DateTime<Utc>) -> Self {
        Self {
            is_streaming: Some(true),
            status: Some(StreamStatus::Live),
            started_at: Some(at),
            ..Default::default()
        }
    }

    pub fn stopped(at: DateTime<Utc>, auto_stopped: bool) -> Self {
        Self {
            is_streaming: Some(false),
            status: Some(StreamStatus::Stopped),
            auto_stopped: auto_stopped.then_some(true),
            ended_at: Some(at),
            ..Default::default()
        }
    }

    pub fn failed(at: DateTime<Utc>) -> Self {
        Self {
            is_streaming: Some(false),
            status: Some(StreamStatus::Failed),
            ended_at: Some(at),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEventKind {
    NotStreaming,
    Live,
    Scheduled,
    ScheduleStarted,
    AutoStopped,
    Stopped,
    Failed,
    Cancelled,
}

/// One message on a key's status channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_stopped: Option<bool>,
    pub event: StatusEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusEvent {
    fn new(is_streaming: bool, event: StatusEventKind) -> Self {
        Self {
            is_streaming,
            auto_stopped: None,
            event,
            start_time: None,
            message: None,
        }
    }

    pub fn not_streaming() -> Self {
        Self::new(false, StatusEventKind::NotStreaming)
    }

    pub fn live() -> Self {
        Self::new(true, StatusEventKind::Live)
    }

    pub fn scheduled(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time: Some(start_time),
            ..Self::new(false, StatusEventKind::Scheduled)
        }
    }

    pub fn schedule_started() -> Self {
        Self::new(true, StatusEventKind::ScheduleStarted)
    }

    pub fn auto_stopped() -> Self {
        Self {
            auto_stopped: Some(true),
            ..Self::new(false, StatusEventKind::AutoStopped)
        }
    }

    pub fn stopped() -> Self {
        Self::new(false, StatusEventKind::Stopped)
    }

    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(false, StatusEventKind::Failed)
        }
    }

    pub fn cancelled() -> Self {
        Self::new(false, StatusEventKind::Cancelled)
    }

    /// Terminal events close the channel after delivery
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event,
            StatusEventKind::NotStreaming
                | StatusEventKind::AutoStopped
                | StatusEventKind::Stopped
                | StatusEventKind::Failed
                | StatusEventKind::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledStreamInfo {
    pub stream_key: String,
    pub title: String,
    pub start_time: DateTime<Utc>,
    /// Seconds, when the job is duration bound
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveStreamInfo {
    pub stream_key: String,
    pub title: String,
    pub container_id: i64,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub auto_stop_at: Option<DateTime<Utc>>,
}

/// A multipart file written to the staging area
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub original_name: String,
    pub staged_path: PathBuf,
}

impl UploadedFile {
    /// Extension including the leading dot, lowercased; empty when absent
    pub fn extension(&self) -> String {
        std::path::Path::new(&self.original_name)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .map(|e| format!(".{}", e.to_ascii_lowercase()))
            .unwrap_or_default()
    }
}

/// Parsed `POST /streams/start` submission
#[derive(Debug, Clone)]
pub struct StartStreamRequest {
    pub title: String,
    pub stream_key: String,
    pub target_endpoint: String,
    pub bitrate_kbps: u32,
    pub fps: u32,
    pub resolution: Resolution,
    pub loop_enabled: bool,
    pub audio_enabled: bool,
    pub schedule: StreamSchedule,
    pub video: Option<UploadedFile>,
    pub audio: Option<UploadedFile>,
}

impl StartStreamRequest {
    pub fn staged_files(&self) -> impl Iterator<Item = &UploadedFile> {
        self.video.iter().chain(self.audio.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartStreamResponse {
    Scheduled {
        scheduled: bool,
        start_time: DateTime<Utc>,
        /// Seconds, when the job is duration bound
        duration: Option<u64>,
    },
    Started {
        message: String,
        stream_key: String,
        container_id: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(endpoint: &str, key: &str) -> StreamJob {
        StreamJob {
            stream_key: key.to_string(),
            title: "t".to_string(),
            source_video: PathBuf::from("/tmp/v.mp4"),
            source_audio: None,
            target_endpoint: endpoint.to_string(),
            encoding: EncodingParams {
                bitrate_kbps: 2500,
                fps: 30,
                resolution: Resolution {
                    width: 1280,
                    height: 720,
                },
                loop_enabled: true,
                audio_enabled: false,
            },
            schedule: StreamSchedule::default(),
            record_id: 1,
        }
    }

    #[test]
    fn test_resolution_parsing() {
        let r: Resolution = "1920:1080".parse().unwrap();
        assert_eq!((r.width, r.height), (1920, 1080));
        let r: Resolution = "1280x720".parse().unwrap();
        assert_eq!(r.to_string(), "1280:720");
        assert!("1280".parse::<Resolution>().is_err());
        assert!("0:720".parse::<Resolution>().is_err());
        assert!("abc:def".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_output_url_uses_single_slash() {
        assert_eq!(
            job("rtmp://a.example/live", "k1").output_url(),
            "rtmp://a.example/live/k1"
        );
        assert_eq!(
            job("rtmp://a.example/live/", "k1").output_url(),
            "rtmp://a.example/live/k1"
        );
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            StreamStatus::Idle,
            StreamStatus::Scheduled,
            StreamStatus::Live,
            StreamStatus::Stopped,
            StreamStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<StreamStatus>().unwrap(), status);
        }
        assert!("paused".parse::<StreamStatus>().is_err());
    }

    #[test]
    fn test_status_event_json_shape() {
        let json = serde_json::to_value(StatusEvent::auto_stopped()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"is_streaming": false, "auto_stopped": true, "event": "auto_stopped"})
        );

        let json = serde_json::to_value(StatusEvent::live()).unwrap();
        assert_eq!(json, serde_json::json!({"is_streaming": true, "event": "live"}));

        assert!(StatusEvent::not_streaming().is_terminal());
        assert!(!StatusEvent::schedule_started().is_terminal());
    }

    #[test]
    fn test_upload_extension() {
        let file = |name: &str| UploadedFile {
            original_name: name.to_string(),
            staged_path: PathBuf::from("/tmp/x"),
        };
        assert_eq!(file("clip.MP4").extension(), ".mp4");
        assert_eq!(file("noext").extension(), "");
        assert_eq!(file("trailing.").extension(), "");
    }

    #[test]
    fn test_record_update_constructors() {
        let now = Utc::now();
        let update = StreamRecordUpdate::stopped(now, true);
        assert_eq!(update.is_streaming, Some(false));
        assert_eq!(update.auto_stopped, Some(true));
        assert_eq!(StreamRecordUpdate::stopped(now, false).auto_stopped, None);
        assert!(StreamRecordUpdate::default().is_empty());
    }
}
