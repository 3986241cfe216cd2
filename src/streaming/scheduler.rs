use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::registry::Reservation;
use super::{LifecycleEvent, TimerKind};

/// Pending delayed start for a registered job
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    pub start_at: DateTime<Utc>,
    pub duration: Option<Duration>,
    cancel: CancellationToken,
}

impl ScheduleHandle {
    pub fn new(start_at: DateTime<Utc>, duration: Option<Duration>) -> Self {
        Self {
            start_at,
            duration,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling twice, or after the timer fired, does nothing
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Time left until `start_at`, or `None` if it is not in the future.
pub fn delay_until(start_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    (start_at - now)
        .to_std()
        .ok()
        .filter(|delay| !delay.is_zero())
}

/// Arms one-shot timers that report back to the lifecycle loop
#[derive(Clone)]
pub struct Scheduler {
    events: mpsc::UnboundedSender<LifecycleEvent>,
}

impl Scheduler {
    pub fn new(events: mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        Self { events }
    }

    /// Start the timer behind `handle`. A start time that has already
    /// passed fires on the next tick.
    pub fn arm(&self, stream_key: &str, reservation: Reservation, handle: &ScheduleHandle) {
        let delay = delay_until(handle.start_at, Utc::now()).unwrap_or(Duration::ZERO);

        debug!(
            "Scheduling stream {} to start at {} (in {:?})",
            stream_key, handle.start_at, delay
        );

        self.spawn_timer(
            delay,
            handle.cancel.clone(),
            LifecycleEvent::TimerFired {
                stream_key: stream_key.to_string(),
                reservation,
                timer: TimerKind::ScheduledStart,
            },
        );
    }

    /// Arm the duration limit of a job that just went live.
    pub fn arm_auto_stop(
        &self,
        stream_key: &str,
        reservation: Reservation,
        duration: Duration,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        debug!("Stream {} will auto-stop after {:?}", stream_key, duration);

        self.spawn_timer(
            duration,
            cancel.clone(),
            LifecycleEvent::TimerFired {
                stream_key: stream_key.to_string(),
                reservation,
                timer: TimerKind::AutoStop,
            },
        );
        cancel
    }

    fn spawn_timer(&self, delay: Duration, cancel: CancellationToken, event: LifecycleEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!("Timer cancelled: {:?}", event);
                }
                _ = tokio::time::sleep(delay) => {
                    if !cancel.is_cancelled() && events.send(event).is_err() {
                        trace!("Lifecycle loop gone, dropping timer event");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::registry::StreamRegistry;

    #[test]
    fn test_delay_until() {
        let now = Utc::now();
        assert_eq!(
            delay_until(now + chrono::Duration::seconds(90), now),
            Some(Duration::from_secs(90))
        );
        assert_eq!(delay_until(now, now), None);
        assert_eq!(delay_until(now - chrono::Duration::seconds(1), now), None);
    }

    #[tokio::test]
    async fn test_schedule_fires_once_delay_elapses() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        let reservation = StreamRegistry::new().reserve_local("k1").unwrap();

        let start = Utc::now() + chrono::Duration::milliseconds(50);
        let handle = ScheduleHandle::new(start, None);
        scheduler.arm("k1", reservation, &handle);
        assert!(!handle.is_cancelled());

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            LifecycleEvent::TimerFired {
                stream_key,
                reservation: r,
                timer,
            } => {
                assert_eq!(stream_key, "k1");
                assert_eq!(r, reservation);
                assert_eq!(timer, TimerKind::ScheduledStart);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        let reservation = StreamRegistry::new().reserve_local("k1").unwrap();

        let token = scheduler.arm_auto_stop("k1", reservation, Duration::from_millis(50));
        token.cancel();
        token.cancel();

        let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err(), "cancelled timer should stay silent");
    }
}
