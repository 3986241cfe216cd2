use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::monitor::StatusHub;
use super::registry::{EntryState, RegistryEntry, Reservation, StreamRegistry};
use super::scheduler::{delay_until, ScheduleHandle, Scheduler};
use super::supervisor::{LiveHandle, ProcessSupervisor};
use super::{LifecycleEvent, TimerKind};
use crate::config::StreamingConfig;
use crate::database::JobStore;
use crate::errors::{AppError, AppResult};
use crate::models::{
    ActiveStreamInfo, EncodingParams, NewStreamRecord, StreamSchedule, ScheduledStreamInfo,
    StartStreamRequest, StartStreamResponse, StatusEvent, StopReason, StreamJob, StreamRecord,
    StreamRecordUpdate, StreamStatus,
};
use crate::storage::{MediaKind, MediaStorage};

/// Runtime knobs for the lifecycle manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub ffmpeg_command: String,
    pub probe_interval: Duration,
    pub startup_grace: Duration,
    pub stop_timeout: Duration,
    pub run_missed_immediately: bool,
}

impl From<&StreamingConfig> for ManagerSettings {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            ffmpeg_command: config.ffmpeg_command.clone(),
            probe_interval: Duration::from_secs(config.probe_interval_secs),
            startup_grace: Duration::from_secs(config.startup_grace_secs),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
            run_missed_immediately: config.run_missed_immediately,
        }
    }
}

/// What startup recovery did with the records it found
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    /// Future schedules armed again
    pub rearmed: usize,
    /// Schedules whose time passed while down, started right away
    pub started_late: usize,
    /// Schedules whose time passed while down, marked failed
    pub expired: usize,
    /// Records left live by a previous run, marked stopped
    pub reconciled: usize,
}

/// How a job's registry entry came to be released
#[derive(Debug)]
enum Termination {
    Exited,
    Errored(String),
    Cancelled,
}

#[derive(Debug, PartialEq)]
enum Outcome {
    Stopped { auto_stopped: bool },
    Cancelled,
    Failed(String),
}

impl Outcome {
    fn classify(state: &EntryState, termination: Termination) -> Self {
        match state {
            EntryState::Live(handle) => match handle.stop_reason() {
                Some(StopReason::DurationElapsed) => Self::Stopped { auto_stopped: true },
                Some(_) => Self::Stopped {
                    auto_stopped: false,
                },
                None => match termination {
                    Termination::Errored(reason) => Self::Failed(reason),
                    Termination::Exited | Termination::Cancelled => Self::Stopped {
                        auto_stopped: false,
                    },
                },
            },
            // Only a launch that failed outright ends here
            EntryState::Reserved => match termination {
                Termination::Errored(reason) => Self::Failed(reason),
                Termination::Exited => Self::Stopped {
                    auto_stopped: false,
                },
                Termination::Cancelled => Self::Cancelled,
            },
            EntryState::Scheduled(_) => match termination {
                Termination::Errored(reason) => Self::Failed(reason),
                Termination::Exited | Termination::Cancelled => Self::Cancelled,
            },
        }
    }

    fn status_event(&self) -> StatusEvent {
        match self {
            Self::Stopped { auto_stopped: true } => StatusEvent::auto_stopped(),
            Self::Stopped { .. } => StatusEvent::stopped(),
            Self::Cancelled => StatusEvent::cancelled(),
            Self::Failed(reason) => StatusEvent::failed(reason.clone()),
        }
    }
}

struct ManagerInner {
    store: Arc<dyn JobStore>,
    storage: MediaStorage,
    registry: StreamRegistry,
    scheduler: Scheduler,
    supervisor: ProcessSupervisor,
    hub: StatusHub,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    settings: ManagerSettings,
    shutdown: CancellationToken,
}

/// Owns every stream job from submission to its terminal state.
///
/// Cloning is cheap; all clones drive the same lifecycle loop.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

impl StreamManager {
    /// Create the manager and spawn its lifecycle loop on the current runtime.
    pub fn new(store: Arc<dyn JobStore>, storage: MediaStorage, settings: ManagerSettings) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = StreamRegistry::new();

        let inner = Arc::new(ManagerInner {
            scheduler: Scheduler::new(events.clone()),
            supervisor: ProcessSupervisor::new(
                settings.ffmpeg_command.clone(),
                settings.stop_timeout,
                events.clone(),
            ),
            hub: StatusHub::new(registry.clone(), events.clone(), settings.probe_interval),
            registry,
            store,
            storage,
            events,
            settings,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_event_loop(inner.clone(), rx));

        Self { inner }
    }

    /// Validate and admit a submission, then either arm its schedule or
    /// launch it right away.
    ///
    /// Validation and conflict errors are returned before anything durable
    /// is created; staged uploads are discarded on every error path.
    pub async fn start_job(&self, request: StartStreamRequest) -> AppResult<StartStreamResponse> {
        let inner = &self.inner;
        let stream_key = request.stream_key.trim().to_string();

        if stream_key.is_empty() {
            inner.discard_uploads(&request).await;
            return Err(AppError::validation("Stream key is required"));
        }

        let reservation = match inner
            .registry
            .try_reserve(&stream_key, inner.store.as_ref())
            .await
        {
            Ok(Some(reservation)) => reservation,
            Ok(None) => {
                inner.discard_uploads(&request).await;
                return Err(AppError::conflict(stream_key));
            }
            Err(e) => {
                inner.discard_uploads(&request).await;
                return Err(e);
            }
        };

        let job = match inner.admit(&stream_key, &request).await {
            Ok(job) => job,
            Err(e) => {
                inner.registry.release(&stream_key, reservation);
                inner.discard_uploads(&request).await;
                return Err(e);
            }
        };

        // From here on the entry carries the job, so every failure is
        // cleaned up by finalize
        inner
            .registry
            .commit(&stream_key, reservation, job.clone(), EntryState::Reserved);

        match job.schedule.start_at {
            Some(start_at) => {
                let handle = ScheduleHandle::new(start_at, job.schedule.duration);
                inner.registry.commit(
                    &stream_key,
                    reservation,
                    job.clone(),
                    EntryState::Scheduled(handle.clone()),
                );
                inner.scheduler.arm(&stream_key, reservation, &handle);

                info!(
                    "Stream {} ({}) scheduled for {}",
                    stream_key, job.title, start_at
                );

                Ok(StartStreamResponse::Scheduled {
                    scheduled: true,
                    start_time: start_at,
                    duration: job.schedule.duration.map(|d| d.as_secs()),
                })
            }
            None => inner.start_now(job, reservation).await,
        }
    }

    /// Stop a live job. A job that is only scheduled is cancelled instead.
    pub async fn stop_job(&self, stream_key: &str) -> AppResult<()> {
        self.inner.end_job(stream_key).await
    }

    /// Cancel a scheduled job. A job that is already live is stopped instead.
    pub async fn cancel_schedule(&self, stream_key: &str) -> AppResult<()> {
        self.inner.end_job(stream_key).await
    }

    pub fn list_active(&self) -> Vec<ActiveStreamInfo> {
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .filter_map(|(stream_key, entry)| {
                let handle = entry.live_handle()?;
                let job = entry.job.as_ref()?;
                Some(ActiveStreamInfo {
                    stream_key,
                    title: job.title.clone(),
                    container_id: job.record_id,
                    pid: handle.pid,
                    started_at: handle.started_at,
                    auto_stop_at: handle.auto_stop_at,
                })
            })
            .collect()
    }

    pub fn list_scheduled(&self) -> Vec<ScheduledStreamInfo> {
        let mut scheduled: Vec<_> = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .filter_map(|(stream_key, entry)| {
                let handle = entry.schedule_handle()?;
                let job = entry.job.as_ref()?;
                Some(ScheduledStreamInfo {
                    stream_key,
                    title: job.title.clone(),
                    start_time: handle.start_at,
                    duration: handle.duration.map(|d| d.as_secs()),
                })
            })
            .collect();
        scheduled.sort_by_key(|info| info.start_time);
        scheduled
    }

    pub fn subscribe_status(&self, stream_key: &str) -> BoxStream<'static, StatusEvent> {
        self.inner.hub.subscribe(stream_key)
    }

    pub fn is_registered(&self, stream_key: &str) -> bool {
        self.inner.registry.contains(stream_key)
    }

    pub async fn list_history(&self) -> AppResult<Vec<StreamRecord>> {
        self.inner.store.query_all().await
    }

    /// Remove a finished record along with any media it still references.
    pub async fn delete_history_record(&self, id: i64) -> AppResult<()> {
        let inner = &self.inner;
        let record = inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| AppError::not_found("stream record", id.to_string()))?;

        if record.is_streaming {
            return Err(AppError::conflict(record.stream_key));
        }

        inner.delete_record_files(&record).await;
        inner.store.delete(id).await?;
        info!("Deleted stream record {} ({})", id, record.title);
        Ok(())
    }

    /// Bring durable state back in line after a restart.
    ///
    /// Future schedules are armed again. Elapsed ones are started at once
    /// or marked failed, depending on `run_missed_immediately`. Records a
    /// previous run left live are marked stopped, since their encoder died
    /// with that process.
    pub async fn recover(&self) -> AppResult<RecoverySummary> {
        let inner = &self.inner;
        let records = inner.store.query_active().await?;
        let now = Utc::now();
        let mut summary = RecoverySummary::default();

        for record in records {
            let Some(start_at) = record
                .schedule_start
                .filter(|_| record.has_pending_schedule())
            else {
                inner.reconcile_stale(&record, now).await;
                summary.reconciled += 1;
                continue;
            };

            let missed = delay_until(start_at, now).is_none();
            if missed && !inner.settings.run_missed_immediately {
                warn!(
                    "Schedule for stream {} at {} passed while the service was down",
                    record.stream_key, start_at
                );
                inner.expire_schedule(&record, now).await;
                summary.expired += 1;
                continue;
            }

            let fire_at = if missed { now } else { start_at };
            match inner.rearm(&record, fire_at) {
                Ok(()) if missed => summary.started_late += 1,
                Ok(()) => summary.rearmed += 1,
                Err(e) => {
                    warn!(
                        "Could not restore schedule for stream {}: {}",
                        record.stream_key, e
                    );
                    inner.expire_schedule(&record, now).await;
                    summary.expired += 1;
                }
            }
        }

        info!(
            "Recovery complete: {} rearmed, {} started late, {} expired, {} reconciled",
            summary.rearmed, summary.started_late, summary.expired, summary.reconciled
        );
        Ok(summary)
    }

    /// Stop every live encoder and drop pending timers.
    ///
    /// Scheduled records are left untouched in the store so the next start
    /// recovers them.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!("Shutting down stream manager");

        for (stream_key, entry) in inner.registry.snapshot() {
            match &entry.state {
                EntryState::Scheduled(handle) => {
                    let released = inner
                        .registry
                        .release_if(&stream_key, entry.reservation, is_scheduled);
                    if released.is_some() {
                        handle.cancel();
                        inner.hub.close(
                            &stream_key,
                            entry.reservation,
                            StatusEvent::not_streaming(),
                        );
                    } else if let Some(live) = inner
                        .registry
                        .lookup(&stream_key)
                        .filter(|current| current.reservation == entry.reservation)
                        .and_then(|current| current.live_handle().cloned())
                    {
                        live.request_stop(StopReason::Shutdown);
                    }
                }
                EntryState::Live(handle) => handle.request_stop(StopReason::Shutdown),
                EntryState::Reserved => {}
            }
        }

        let deadline =
            tokio::time::Instant::now() + inner.settings.stop_timeout + Duration::from_secs(1);
        while inner.has_live_entries() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if inner.has_live_entries() {
            warn!("Shutting down with encoders still registered");
        }

        inner.shutdown.cancel();
    }
}

fn is_scheduled(state: &EntryState) -> bool {
    matches!(state, EntryState::Scheduled(_))
}

async fn run_event_loop(inner: Arc<ManagerInner>, mut rx: mpsc::UnboundedReceiver<LifecycleEvent>) {
    info!("Stream lifecycle loop started");
    loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        inner.handle_event(event).await;
    }
    info!("Stream lifecycle loop stopped");
}

impl ManagerInner {
    async fn handle_event(&self, event: LifecycleEvent) {
        debug!("Lifecycle event: {:?}", event);
        match event {
            LifecycleEvent::TimerFired {
                stream_key,
                reservation,
                timer: TimerKind::ScheduledStart,
            } => self.start_scheduled(&stream_key, reservation).await,
            LifecycleEvent::TimerFired {
                stream_key,
                reservation,
                timer: TimerKind::AutoStop,
            } => {
                self.request_stop(&stream_key, reservation, StopReason::DurationElapsed)
                    .await
            }
            LifecycleEvent::StopRequested {
                stream_key,
                reservation,
                reason,
            } => self.request_stop(&stream_key, reservation, reason).await,
            LifecycleEvent::Completed {
                stream_key,
                reservation,
            } => {
                self.finalize(&stream_key, reservation, Termination::Exited)
                    .await
            }
            LifecycleEvent::Errored {
                stream_key,
                reservation,
                reason,
            } => {
                self.finalize(&stream_key, reservation, Termination::Errored(reason))
                    .await
            }
            LifecycleEvent::Vanished {
                stream_key,
                reservation,
            } => self.handle_vanished(&stream_key, reservation).await,
        }
    }

    async fn handle_vanished(&self, stream_key: &str, reservation: Reservation) {
        let reaped = self
            .registry
            .lookup(stream_key)
            .filter(|entry| entry.reservation == reservation)
            .and_then(|entry| entry.live_handle().map(LiveHandle::is_reaped));
        if reaped != Some(false) {
            debug!("Encoder exit for stream {} is reported by its waiter", stream_key);
            return;
        }
        self.finalize(
            stream_key,
            reservation,
            Termination::Errored("process no longer running".to_string()),
        )
        .await
    }

    fn send_stop(&self, stream_key: &str, reservation: Reservation) -> AppResult<()> {
        self.events
            .send(LifecycleEvent::StopRequested {
                stream_key: stream_key.to_string(),
                reservation,
                reason: StopReason::Manual,
            })
            .map_err(|_| AppError::internal("Stream lifecycle loop is not running"))
    }

    /// Cancel a job only while it is still waiting for its start time.
    ///
    /// Returns `false` when the entry is gone or has already gone live.
    async fn cancel_scheduled(&self, stream_key: &str, reservation: Reservation) -> bool {
        match self.registry.release_if(stream_key, reservation, is_scheduled) {
            Some(entry) => {
                self.settle(stream_key, entry, Termination::Cancelled).await;
                true
            }
            None => false,
        }
    }

    async fn end_job(&self, stream_key: &str) -> AppResult<()> {
        let entry = self
            .registry
            .lookup(stream_key)
            .ok_or_else(|| AppError::not_found("stream", stream_key))?;

        match entry.state {
            EntryState::Live(_) => self.send_stop(stream_key, entry.reservation),
            EntryState::Scheduled(_) => {
                if self.cancel_scheduled(stream_key, entry.reservation).await {
                    return Ok(());
                }
                // The start timer won the race; stop the job it launched
                match self.registry.lookup(stream_key) {
                    Some(current)
                        if current.reservation == entry.reservation
                            && current.live_handle().is_some() =>
                    {
                        self.send_stop(stream_key, entry.reservation)
                    }
                    _ => Err(AppError::not_found("stream", stream_key)),
                }
            }
            // Still being admitted; nothing to stop yet
            EntryState::Reserved => Err(AppError::not_found("stream", stream_key)),
        }
    }

    async fn request_stop(&self, stream_key: &str, reservation: Reservation, reason: StopReason) {
        let Some(entry) = self
            .registry
            .lookup(stream_key)
            .filter(|entry| entry.reservation == reservation)
        else {
            debug!("Ignoring stop for stream {} that is no longer registered", stream_key);
            return;
        };

        match &entry.state {
            EntryState::Live(handle) => handle.request_stop(reason),
            EntryState::Scheduled(_) => {
                self.cancel_scheduled(stream_key, reservation).await;
            }
            EntryState::Reserved => {
                debug!("Ignoring stop for stream {} that has not started", stream_key)
            }
        }
    }

    async fn start_scheduled(&self, stream_key: &str, reservation: Reservation) {
        let Some(entry) = self
            .registry
            .lookup(stream_key)
            .filter(|entry| entry.reservation == reservation)
        else {
            return;
        };
        let (Some(job), EntryState::Scheduled(_)) = (entry.job.clone(), &entry.state) else {
            return;
        };

        info!("Scheduled start reached for stream {}", stream_key);
        match self.go_live(&job, reservation).await {
            Ok(_) => {
                self.hub
                    .publish(stream_key, reservation, StatusEvent::schedule_started());
            }
            Err(e) => {
                error!("Failed to start scheduled stream {}: {}", stream_key, e);
                self.finalize(stream_key, reservation, Termination::Errored(e.to_string()))
                    .await;
            }
        }
    }

    async fn start_now(
        &self,
        job: Arc<StreamJob>,
        reservation: Reservation,
    ) -> AppResult<StartStreamResponse> {
        let handle = match self.go_live(&job, reservation).await {
            Ok(handle) => handle,
            Err(e) => {
                self.finalize(&job.stream_key, reservation, Termination::Errored(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        // Give the encoder a moment to fail on bad input or an unreachable endpoint
        if !self.settings.startup_grace.is_zero() {
            tokio::select! {
                _ = handle.exited() => {}
                _ = tokio::time::sleep(self.settings.startup_grace) => {}
            }
        }

        if handle.has_exited() && handle.stop_reason().is_none() {
            if let Some(reason) = handle.exit_error() {
                return Err(AppError::runtime(reason));
            }
        }

        info!("Stream {} ({}) is live", job.stream_key, job.title);
        Ok(StartStreamResponse::Started {
            message: "Stream started successfully".to_string(),
            stream_key: job.stream_key.clone(),
            container_id: job.record_id,
        })
    }

    /// Launch the encoder, move the entry to Live and record it as live.
    /// The duration limit, if any, counts from this moment.
    ///
    /// The encoder's exit is not reported until this returns, so finalize
    /// always runs after the live write below.
    async fn go_live(&self, job: &Arc<StreamJob>, reservation: Reservation) -> AppResult<LiveHandle> {
        let mut handle = self.supervisor.launch(job, reservation)?;
        let _published = handle.publish_on_drop();

        if let Some(duration) = job.schedule.duration {
            let token = self
                .scheduler
                .arm_auto_stop(&job.stream_key, reservation, duration);
            handle = handle.with_auto_stop(token, duration);
        }

        let committed = self.registry.commit(
            &job.stream_key,
            reservation,
            job.clone(),
            EntryState::Live(handle.clone()),
        );
        if committed.is_none() {
            // Cancelled while we were launching
            handle.cancel_auto_stop();
            if !handle.has_exited() {
                handle.request_stop(StopReason::Manual);
            }
            return Err(AppError::runtime(
                handle
                    .exit_error()
                    .unwrap_or_else(|| "Stream ended while starting".to_string()),
            ));
        }

        if let Err(e) = self
            .store
            .update(job.record_id, StreamRecordUpdate::live(handle.started_at))
            .await
        {
            error!(
                "Failed to mark stream record {} live: {}",
                job.record_id, e
            );
        }

        let still_ours = self
            .registry
            .lookup(&job.stream_key)
            .is_some_and(|entry| entry.reservation == reservation);
        if !still_ours {
            warn!(
                "Stream {} ended while its live state was being recorded",
                job.stream_key
            );
            if let Err(e) = self
                .store
                .update(job.record_id, StreamRecordUpdate::stopped(Utc::now(), false))
                .await
            {
                debug!("Stream record {} not reset: {}", job.record_id, e);
            }
        }

        Ok(handle)
    }

    /// Run the terminal transition for a job exactly once.
    ///
    /// Whoever wins the registry release does the cleanup; every other
    /// caller returns immediately.
    async fn finalize(&self, stream_key: &str, reservation: Reservation, termination: Termination) {
        let Some(entry) = self.registry.release(stream_key, reservation) else {
            debug!("Stream {} already finalized", stream_key);
            return;
        };
        self.settle(stream_key, entry, termination).await;
    }

    /// Cleanup for an entry the caller has just released.
    async fn settle(&self, stream_key: &str, entry: RegistryEntry, termination: Termination) {
        let reservation = entry.reservation;
        match &entry.state {
            EntryState::Live(handle) => handle.cancel_auto_stop(),
            EntryState::Scheduled(handle) => handle.cancel(),
            EntryState::Reserved => {}
        }

        let outcome = Outcome::classify(&entry.state, termination);
        let now = Utc::now();

        if let Some(job) = &entry.job {
            let result = match &outcome {
                Outcome::Stopped { auto_stopped } => {
                    self.store
                        .update(job.record_id, StreamRecordUpdate::stopped(now, *auto_stopped))
                        .await
                }
                Outcome::Cancelled => {
                    self.store
                        .update(job.record_id, StreamRecordUpdate::stopped(now, false))
                        .await
                }
                Outcome::Failed(_) => self.store.delete(job.record_id).await.map(|_| ()),
            };
            if let Err(e) = result {
                error!(
                    "Failed to persist final state of stream record {}: {}",
                    job.record_id, e
                );
            }

            self.storage.delete(&job.source_video).await;
            if let Some(audio) = &job.source_audio {
                self.storage.delete(audio).await;
            }
        }

        match &outcome {
            Outcome::Failed(reason) => warn!("Stream {} failed: {}", stream_key, reason),
            other => info!("Stream {} ended: {:?}", stream_key, other),
        }

        self.hub
            .close(stream_key, reservation, outcome.status_event());
    }

    /// Validate a submission, move its uploads into place and create its
    /// durable record.
    async fn admit(&self, stream_key: &str, request: &StartStreamRequest) -> AppResult<Arc<StreamJob>> {
        let video = request
            .video
            .as_ref()
            .ok_or_else(|| AppError::validation("Video file not found"))?;

        let title = request.title.trim();
        if title.is_empty() {
            return Err(AppError::validation("Title is required"));
        }
        if video.extension().is_empty() {
            return Err(AppError::validation("Video file has no extension"));
        }
        if let Some(audio) = &request.audio {
            if audio.extension().is_empty() {
                return Err(AppError::validation("Audio file has no extension"));
            }
        }

        let endpoint = request.target_endpoint.trim();
        if endpoint.is_empty() {
            return Err(AppError::validation("RTMP URL is required"));
        }
        url::Url::parse(endpoint)
            .map_err(|e| AppError::validation(format!("Invalid RTMP URL {endpoint}: {e}")))?;

        if request.bitrate_kbps == 0 {
            return Err(AppError::validation("Bitrate must be positive"));
        }
        if request.fps == 0 {
            return Err(AppError::validation("FPS must be positive"));
        }
        if let Some(start_at) = request.schedule.start_at {
            if delay_until(start_at, Utc::now()).is_none() {
                return Err(AppError::validation(
                    "Schedule start time must be in the future",
                ));
            }
        }
        if request.schedule.duration.is_some_and(|d| d.is_zero()) {
            return Err(AppError::validation("Schedule duration must be positive"));
        }

        let video_name = self.storage.persist(video, MediaKind::Video).await?;
        let audio_name = match &request.audio {
            Some(audio) => match self.storage.persist(audio, MediaKind::Audio).await {
                Ok(name) => Some(name),
                Err(e) => {
                    self.storage.delete(&self.storage.path_for(&video_name)).await;
                    return Err(e);
                }
            },
            None => None,
        };

        let schedule = request.schedule.clone();
        let new_record = NewStreamRecord {
            title: title.to_string(),
            preview_file_video: Some(video.original_name.clone()),
            preview_file_audio: request.audio.as_ref().map(|a| a.original_name.clone()),
            stream_file_video: video_name.clone(),
            stream_file_audio: audio_name.clone(),
            stream_key: stream_key.to_string(),
            stream_url: endpoint.to_string(),
            bitrate: i64::from(request.bitrate_kbps),
            resolution: request.resolution.to_string(),
            fps: i64::from(request.fps),
            loop_enabled: request.loop_enabled,
            audio_enabled: request.audio_enabled,
            status: if schedule.is_delayed() {
                StreamStatus::Scheduled
            } else {
                StreamStatus::Idle
            },
            schedule_enabled: schedule.start_at.is_some() || schedule.duration.is_some(),
            schedule_start_enabled: schedule.start_at.is_some(),
            schedule_duration_enabled: schedule.duration.is_some(),
            schedule_start: schedule.start_at,
            schedule_duration_secs: schedule.duration.map(|d| d.as_secs() as i64),
        };

        let record = match self.store.create(new_record).await {
            Ok(record) => record,
            Err(e) => {
                self.storage.delete(&self.storage.path_for(&video_name)).await;
                if let Some(audio_name) = &audio_name {
                    self.storage.delete(&self.storage.path_for(audio_name)).await;
                }
                return Err(e);
            }
        };

        Ok(Arc::new(StreamJob {
            stream_key: stream_key.to_string(),
            title: record.title,
            source_video: self.storage.path_for(&video_name),
            source_audio: audio_name.map(|name| self.storage.path_for(&name)),
            target_endpoint: endpoint.to_string(),
            encoding: EncodingParams {
                bitrate_kbps: request.bitrate_kbps,
                fps: request.fps,
                resolution: request.resolution,
                loop_enabled: request.loop_enabled,
                audio_enabled: request.audio_enabled,
            },
            schedule,
            record_id: record.id,
        }))
    }

    async fn discard_uploads(&self, request: &StartStreamRequest) {
        for file in request.staged_files() {
            self.storage.discard_staged(file).await;
        }
    }

    /// Register a persisted schedule again and arm its timer.
    fn rearm(&self, record: &StreamRecord, fire_at: DateTime<Utc>) -> AppResult<()> {
        let video_name = record
            .stream_file_video
            .as_deref()
            .ok_or_else(|| AppError::validation("Record has no video file"))?;
        let source_video = self.storage.path_for(video_name);
        if !source_video.exists() {
            return Err(AppError::validation(format!(
                "Video file {} is missing",
                source_video.display()
            )));
        }

        let bitrate_kbps = u32::try_from(record.bitrate)
            .map_err(|_| AppError::validation(format!("Invalid bitrate {}", record.bitrate)))?;
        let fps = u32::try_from(record.fps)
            .map_err(|_| AppError::validation(format!("Invalid fps {}", record.fps)))?;

        let duration = record.schedule_duration();
        let job = Arc::new(StreamJob {
            stream_key: record.stream_key.clone(),
            title: record.title.clone(),
            source_video,
            source_audio: record
                .stream_file_audio
                .as_deref()
                .map(|name| self.storage.path_for(name)),
            target_endpoint: record.stream_url.clone(),
            encoding: EncodingParams {
                bitrate_kbps,
                fps,
                resolution: record.resolution.parse()?,
                loop_enabled: record.loop_enabled,
                audio_enabled: record.audio_enabled,
            },
            schedule: StreamSchedule {
                start_at: Some(fire_at),
                duration,
            },
            record_id: record.id,
        });

        let reservation = self
            .registry
            .reserve_local(&record.stream_key)
            .ok_or_else(|| AppError::conflict(record.stream_key.clone()))?;

        let handle = ScheduleHandle::new(fire_at, duration);
        self.registry.commit(
            &record.stream_key,
            reservation,
            job,
            EntryState::Scheduled(handle.clone()),
        );
        self.scheduler.arm(&record.stream_key, reservation, &handle);

        info!(
            "Restored schedule for stream {} at {}",
            record.stream_key, fire_at
        );
        Ok(())
    }

    async fn expire_schedule(&self, record: &StreamRecord, now: DateTime<Utc>) {
        if let Err(e) = self
            .store
            .update(record.id, StreamRecordUpdate::failed(now))
            .await
        {
            error!("Failed to expire stream record {}: {}", record.id, e);
        }
        self.delete_record_files(record).await;
    }

    async fn reconcile_stale(&self, record: &StreamRecord, now: DateTime<Utc>) {
        info!(
            "Stream {} was left {} by a previous run; marking stopped",
            record.stream_key, record.status
        );
        if let Err(e) = self
            .store
            .update(record.id, StreamRecordUpdate::stopped(now, false))
            .await
        {
            error!("Failed to reconcile stream record {}: {}", record.id, e);
        }
        self.delete_record_files(record).await;
    }

    async fn delete_record_files(&self, record: &StreamRecord) {
        for name in [&record.stream_file_video, &record.stream_file_audio]
            .into_iter()
            .flatten()
        {
            self.storage.delete(&self.storage.path_for(name)).await;
        }
    }

    fn has_live_entries(&self) -> bool {
        self.registry
            .snapshot()
            .iter()
            .any(|(_, entry)| matches!(entry.state, EntryState::Live(_)))
    }
}
