//! Per-key status channels.
//!
//! Subscribers to the same key share one broadcast channel and one probe
//! loop. The loop checks the encoder every probe interval, and goes away
//! when the job terminates or the last subscriber disconnects.

use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::registry::{EntryState, RegistryEntry, Reservation, StreamRegistry};
use super::LifecycleEvent;
use crate::models::StatusEvent;

const CHANNEL_CAPACITY: usize = 16;

struct Channel {
    id: u64,
    reservation: Reservation,
    tx: broadcast::Sender<StatusEvent>,
    stop: CancellationToken,
}

struct HubInner {
    registry: StreamRegistry,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    probe_interval: Duration,
    channels: Mutex<HashMap<String, Channel>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct StatusHub {
    inner: Arc<HubInner>,
}

impl StatusHub {
    pub fn new(
        registry: StreamRegistry,
        events: mpsc::UnboundedSender<LifecycleEvent>,
        probe_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry,
                events,
                probe_interval,
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Status feed for `stream_key`.
    ///
    /// An unregistered key yields a single `not_streaming` event. Otherwise
    /// the feed starts with the current state and ends after the first
    /// terminal event.
    pub fn subscribe(&self, stream_key: &str) -> BoxStream<'static, StatusEvent> {
        let Some(entry) = self.inner.registry.lookup(stream_key) else {
            return stream::once(async { StatusEvent::not_streaming() }).boxed();
        };

        let initial = current_status(&entry);
        let mut rx = self.attach(stream_key, entry.reservation);

        async_stream::stream! {
            if let Some(event) = initial {
                yield event;
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Status subscriber lagged by {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        .boxed()
    }

    /// Join the key's channel, starting its probe loop if there is none.
    fn attach(
        &self,
        stream_key: &str,
        reservation: Reservation,
    ) -> broadcast::Receiver<StatusEvent> {
        let mut channels = self.channels();

        if let Some(channel) = channels.get(stream_key) {
            if channel.reservation == reservation && !channel.stop.is_cancelled() {
                return channel.tx.subscribe();
            }
            // Left over from an earlier job on the same key
            channel.stop.cancel();
        }

        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
        let channel = Channel {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            reservation,
            tx: tx.clone(),
            stop: CancellationToken::new(),
        };
        self.spawn_probe_loop(stream_key.to_string(), &channel);
        channels.insert(stream_key.to_string(), channel);
        rx
    }

    fn spawn_probe_loop(&self, stream_key: String, channel: &Channel) {
        let hub = self.clone();
        let id = channel.id;
        let reservation = channel.reservation;
        let tx = channel.tx.clone();
        let stop = channel.stop.clone();
        let interval = self.inner.probe_interval;

        tokio::spawn(async move {
            debug!("Status monitor started for stream {}", stream_key);
            let mut reported_dead = false;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                if tx.receiver_count() == 0 {
                    debug!("No status subscribers left for stream {}", stream_key);
                    break;
                }

                let entry = hub
                    .inner
                    .registry
                    .lookup(&stream_key)
                    .filter(|entry| entry.reservation == reservation);

                let Some(entry) = entry else {
                    let _ = tx.send(StatusEvent::not_streaming());
                    break;
                };

                match &entry.state {
                    EntryState::Live(handle) => {
                        if handle.is_reaped() {
                            // The waiter reports this exit
                        } else if handle.is_alive() {
                            let _ = tx.send(StatusEvent::live());
                        } else if !reported_dead {
                            warn!(
                                "Encoder for stream {} is no longer running (pid {:?})",
                                stream_key, handle.pid
                            );
                            reported_dead = true;
                            let _ = hub.inner.events.send(LifecycleEvent::Vanished {
                                stream_key: stream_key.clone(),
                                reservation,
                            });
                        }
                    }
                    EntryState::Scheduled(handle) => {
                        let _ = tx.send(StatusEvent::scheduled(handle.start_at));
                    }
                    EntryState::Reserved => {}
                }
            }

            hub.remove_channel(&stream_key, id);
            debug!("Status monitor stopped for stream {}", stream_key);
        });
    }

    fn remove_channel(&self, stream_key: &str, id: u64) {
        let mut channels = self.channels();
        if channels.get(stream_key).is_some_and(|c| c.id == id) {
            channels.remove(stream_key);
        }
    }

    /// Deliver a one-shot event to current subscribers of the job.
    pub fn publish(&self, stream_key: &str, reservation: Reservation, event: StatusEvent) {
        let channels = self.channels();
        if let Some(channel) = channels
            .get(stream_key)
            .filter(|c| c.reservation == reservation)
        {
            let _ = channel.tx.send(event);
        }
    }

    /// Deliver the terminal event and tear the channel down.
    pub fn close(&self, stream_key: &str, reservation: Reservation, event: StatusEvent) {
        let mut channels = self.channels();
        if channels
            .get(stream_key)
            .is_some_and(|c| c.reservation == reservation)
        {
            if let Some(channel) = channels.remove(stream_key) {
                let _ = channel.tx.send(event);
                channel.stop.cancel();
            }
        }
    }

    /// Number of keys with an active probe loop
    pub fn active_channels(&self) -> usize {
        self.channels().len()
    }
}

fn current_status(entry: &RegistryEntry) -> Option<StatusEvent> {
    match &entry.state {
        EntryState::Live(_) => Some(StatusEvent::live()),
        EntryState::Scheduled(handle) => Some(StatusEvent::scheduled(handle.start_at)),
        EntryState::Reserved => None,
    }
}
