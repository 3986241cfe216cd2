//! Encoder process supervision.
//!
//! Each launched encoder gets a waiter task that owns the child and
//! reports how it ended to the lifecycle loop, plus a task that drains
//! stderr into the log. Callers only ever hold a [`LiveHandle`].
//!
//! The waiter holds its exit report until the launcher has published the
//! job, so the lifecycle loop never finalizes a job whose live state is
//! still being recorded.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command as TokioCommand};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use super::command::EncoderCommand;
use super::registry::Reservation;
use super::LifecycleEvent;
use crate::errors::{AppError, AppResult};
use crate::models::{StopReason, StreamJob};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug)]
struct ProcessControl {
    stop_reason: Mutex<Option<StopReason>>,
    stop_notify: Notify,
    /// Cancelled as soon as `wait()` returns
    reaped: CancellationToken,
    /// Cancelled once the exit has been classified
    exited: CancellationToken,
    published: CancellationToken,
    exit_error: Mutex<Option<String>>,
    stderr_tail: Mutex<VecDeque<String>>,
}

impl ProcessControl {
    fn push_stderr(&self, line: String) {
        let mut tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn stop_reason(&self) -> Option<StopReason> {
        *self
            .stop_reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to a running encoder; present in the registry iff the job is live
#[derive(Debug, Clone)]
pub struct LiveHandle {
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub auto_stop: Option<CancellationToken>,
    pub auto_stop_at: Option<DateTime<Utc>>,
    control: Arc<ProcessControl>,
}

impl LiveHandle {
    pub fn with_auto_stop(mut self, token: CancellationToken, duration: Duration) -> Self {
        self.auto_stop_at = chrono::Duration::from_std(duration)
            .ok()
            .map(|d| self.started_at + d);
        self.auto_stop = Some(token);
        self
    }

    /// Tag the stop and deliver SIGTERM. The waiter task finishes the
    /// transition once the encoder exits. The first reason given wins.
    pub fn request_stop(&self, reason: StopReason) {
        {
            let mut current = self
                .control
                .stop_reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if current.is_none() {
                *current = Some(reason);
            }
        }

        if self.has_exited() {
            return;
        }

        if let Some(pid) = self.pid {
            info!("Stopping encoder pid {} ({:?})", pid, reason);
            send_terminate(pid);
        }
        self.control.stop_notify.notify_one();
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.control.stop_reason()
    }

    pub fn cancel_auto_stop(&self) {
        if let Some(token) = &self.auto_stop {
            token.cancel();
        }
    }

    pub fn has_exited(&self) -> bool {
        self.control.exited.is_cancelled()
    }

    /// True once the waiter has collected the exit status, even if it has
    /// not reported it yet
    pub fn is_reaped(&self) -> bool {
        self.control.reaped.is_cancelled()
    }

    /// Let the waiter report the exit to the lifecycle loop.
    pub fn publish(&self) {
        self.control.published.cancel();
    }

    /// Publishes when dropped, on every path out of the caller.
    pub fn publish_on_drop(&self) -> DropGuard {
        self.control.published.clone().drop_guard()
    }

    /// Resolves once the waiter has reaped the encoder
    pub async fn exited(&self) {
        self.control.exited.cancelled().await;
    }

    /// Why the encoder ended abnormally, once it has
    pub fn exit_error(&self) -> Option<String> {
        self.control
            .exit_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Liveness probe used by the status monitor
    pub fn is_alive(&self) -> bool {
        if self.is_reaped() {
            return false;
        }
        match self.pid {
            Some(pid) => process_alive(pid),
            None => false,
        }
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.control.stderr_tail()
    }
}

/// Zero-signal probe: does a process with this pid exist?
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    // Without signals the waiter's exit token is the only source of truth
    true
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        warn!("Failed to send SIGTERM to encoder pid {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) {}

/// Launches encoders and watches them until they exit
#[derive(Clone)]
pub struct ProcessSupervisor {
    ffmpeg_command: String,
    stop_timeout: Duration,
    events: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ProcessSupervisor {
    pub fn new(
        ffmpeg_command: String,
        stop_timeout: Duration,
        events: mpsc::UnboundedSender<LifecycleEvent>,
    ) -> Self {
        Self {
            ffmpeg_command,
            stop_timeout,
            events,
        }
    }

    /// Spawn the encoder for `job`. Never retries.
    pub fn launch(&self, job: &StreamJob, reservation: Reservation) -> AppResult<LiveHandle> {
        if self.ffmpeg_command.trim().is_empty() {
            return Err(AppError::configuration("No encoder command configured"));
        }
        let command = EncoderCommand::for_job(&self.ffmpeg_command, job);

        let mut cmd = TokioCommand::new(&command.program);
        cmd.args(&command.args);
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            AppError::spawn(format!("Failed to spawn {}: {}", command.program, e))
        })?;

        let pid = child.id();
        let control = Arc::new(ProcessControl {
            stop_reason: Mutex::new(None),
            stop_notify: Notify::new(),
            reaped: CancellationToken::new(),
            exited: CancellationToken::new(),
            published: CancellationToken::new(),
            exit_error: Mutex::new(None),
            stderr_tail: Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)),
        });

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_reader(stderr, job.stream_key.clone(), control.clone()));

        info!(
            "Started encoder for stream {} with PID: {:?} command: {}",
            job.stream_key,
            pid,
            command.display()
        );

        self.spawn_waiter(
            child,
            stderr_task,
            job.stream_key.clone(),
            reservation,
            control.clone(),
        );

        Ok(LiveHandle {
            pid,
            started_at: Utc::now(),
            auto_stop: None,
            auto_stop_at: None,
            control,
        })
    }

    fn spawn_waiter(
        &self,
        mut child: Child,
        stderr_task: Option<JoinHandle<()>>,
        stream_key: String,
        reservation: Reservation,
        control: Arc<ProcessControl>,
    ) {
        let events = self.events.clone();
        let stop_timeout = self.stop_timeout;

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = control.stop_notify.notified() => {
                    #[cfg(not(unix))]
                    let _ = child.start_kill();

                    match tokio::time::timeout(stop_timeout, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            warn!(
                                "Encoder for stream {} ignored SIGTERM for {:?}, killing",
                                stream_key, stop_timeout
                            );
                            if let Err(e) = child.start_kill() {
                                warn!("Failed to kill encoder for stream {}: {}", stream_key, e);
                            }
                            child.wait().await
                        }
                    }
                }
            };
            control.reaped.cancel();

            // Let the reader pick up the final lines before we describe the exit
            if let Some(task) = stderr_task {
                let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
            }

            let event = match status {
                Ok(status) if status.success() => {
                    info!("Encoder for stream {} exited cleanly", stream_key);
                    LifecycleEvent::Completed {
                        stream_key,
                        reservation,
                    }
                }
                Ok(status) => {
                    let reason = describe_exit(status, &control.stderr_tail());
                    if control.stop_reason().is_some() {
                        debug!("Encoder for stream {} stopped: {}", stream_key, reason);
                    } else {
                        error!("Encoder for stream {} failed: {}", stream_key, reason);
                    }
                    record_exit_error(&control, &reason);
                    LifecycleEvent::Errored {
                        stream_key,
                        reservation,
                        reason,
                    }
                }
                Err(e) => {
                    let reason = format!("failed to wait for encoder: {e}");
                    error!("Encoder for stream {}: {}", stream_key, reason);
                    record_exit_error(&control, &reason);
                    LifecycleEvent::Errored {
                        stream_key,
                        reservation,
                        reason,
                    }
                }
            };

            control.exited.cancel();
            control.published.cancelled().await;
            if events.send(event).is_err() {
                debug!("Lifecycle loop gone, dropping encoder exit event");
            }
        });
    }
}

fn record_exit_error(control: &ProcessControl, reason: &str) {
    *control
        .exit_error
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason.to_string());
}

fn describe_exit(status: ExitStatus, stderr_tail: &[String]) -> String {
    match stderr_tail.iter().rev().find(|line| !line.trim().is_empty()) {
        Some(last) => format!("{status}: {}", last.trim()),
        None => status.to_string(),
    }
}

fn spawn_stderr_reader(
    stderr: ChildStderr,
    stream_key: String,
    control: Arc<ProcessControl>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line_lower = line.to_lowercase();
            if line_lower.contains("error")
                || line_lower.contains("failed")
                || line_lower.contains("invalid")
                || line_lower.contains("could not")
                || line_lower.contains("unable to")
            {
                error!(stream_key = %stream_key, "encoder: {}", line);
            } else if line_lower.contains("warning") || line_lower.contains("deprecated") {
                warn!(stream_key = %stream_key, "encoder: {}", line);
            } else {
                debug!(stream_key = %stream_key, "encoder: {}", line);
            }
            control.push_stderr(line);
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::{EncodingParams, Resolution, StreamSchedule};
    use crate::streaming::registry::StreamRegistry;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    fn write_script(dir: &Path, body: &str) -> String {
        let path = dir.join("encoder.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn job() -> StreamJob {
        StreamJob {
            stream_key: "k1".to_string(),
            title: "t".to_string(),
            source_video: PathBuf::from("/tmp/v.mp4"),
            source_audio: None,
            target_endpoint: "rtmp://localhost/live".to_string(),
            encoding: EncodingParams {
                bitrate_kbps: 1000,
                fps: 25,
                resolution: Resolution {
                    width: 640,
                    height: 360,
                },
                loop_enabled: true,
                audio_enabled: false,
            },
            schedule: StreamSchedule::default(),
            record_id: 1,
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>) -> LifecycleEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for encoder event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_failing_encoder_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo 'Connection refused' >&2\nexit 1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(script, Duration::from_secs(5), tx);
        let reservation = StreamRegistry::new().reserve_local("k1").unwrap();

        let handle = supervisor.launch(&job(), reservation).unwrap();
        handle.publish();

        match next_event(&mut rx).await {
            LifecycleEvent::Errored { reason, .. } => {
                assert!(reason.contains("Connection refused"), "{reason}");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(handle.has_exited());
        assert!(!handle.is_alive());
        assert!(handle.exit_error().is_some());
    }

    #[tokio::test]
    async fn test_clean_exit_reports_completed() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exit 0");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(script, Duration::from_secs(5), tx);
        let reservation = StreamRegistry::new().reserve_local("k1").unwrap();

        let handle = supervisor.launch(&job(), reservation).unwrap();
        handle.publish();

        assert!(matches!(
            next_event(&mut rx).await,
            LifecycleEvent::Completed { .. }
        ));
        assert!(handle.exit_error().is_none());
    }

    #[tokio::test]
    async fn test_stop_is_tagged_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "trap 'exit 255' TERM\nwhile true; do sleep 0.1; done");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(script, Duration::from_secs(5), tx);
        let reservation = StreamRegistry::new().reserve_local("k1").unwrap();

        let handle = supervisor.launch(&job(), reservation).unwrap();
        handle.publish();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.is_alive());

        handle.request_stop(StopReason::DurationElapsed);
        handle.request_stop(StopReason::Manual);

        let event = next_event(&mut rx).await;
        assert!(matches!(event, LifecycleEvent::Errored { .. }));
        assert_eq!(handle.stop_reason(), Some(StopReason::DurationElapsed));
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_stubborn_encoder_is_killed_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "trap '' TERM\nwhile true; do sleep 0.1; done");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(script, Duration::from_millis(300), tx);
        let reservation = StreamRegistry::new().reserve_local("k1").unwrap();

        let handle = supervisor.launch(&job(), reservation).unwrap();
        handle.publish();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.request_stop(StopReason::Manual);

        assert!(matches!(
            next_event(&mut rx).await,
            LifecycleEvent::Errored { .. }
        ));
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(
            "/nonexistent/encoder-binary".to_string(),
            Duration::from_secs(1),
            tx,
        );
        let reservation = StreamRegistry::new().reserve_local("k1").unwrap();

        let result = supervisor.launch(&job(), reservation);
        assert!(matches!(result, Err(AppError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_exit_report_waits_for_publish() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exit 0");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(script, Duration::from_secs(5), tx);
        let reservation = StreamRegistry::new().reserve_local("k1").unwrap();

        let handle = supervisor.launch(&job(), reservation).unwrap();
        let guard = handle.publish_on_drop();

        tokio::time::timeout(Duration::from_secs(10), handle.exited())
            .await
            .unwrap();
        assert!(handle.is_reaped());
        assert!(!handle.is_alive());
        let held = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(held.is_err(), "exit was reported before publish");

        drop(guard);
        assert!(matches!(
            next_event(&mut rx).await,
            LifecycleEvent::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn test_reaped_while_stderr_held_open() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep 0.2\n(sleep 3) &\nexit 0");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(script, Duration::from_secs(5), tx);
        let reservation = StreamRegistry::new().reserve_local("k1").unwrap();

        let handle = supervisor.launch(&job(), reservation).unwrap();
        handle.publish();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !handle.is_reaped() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(handle.is_reaped());
        assert!(!handle.is_alive());
        assert!(matches!(
            next_event(&mut rx).await,
            LifecycleEvent::Completed { .. }
        ));
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }
}
