//! In-memory index of scheduled and live jobs, keyed by stream key.
//!
//! Every entry carries the [`Reservation`] that created it. Operations that
//! mutate an entry must present the matching reservation, so a late event
//! from a job that has already been released can never touch a newer job
//! that reuses the same key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use super::scheduler::ScheduleHandle;
use super::supervisor::LiveHandle;
use crate::database::JobStore;
use crate::errors::AppResult;
use crate::models::StreamJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reservation(u64);

impl Reservation {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub enum EntryState {
    /// Key claimed, job not yet armed or launched
    Reserved,
    Scheduled(ScheduleHandle),
    Live(LiveHandle),
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub reservation: Reservation,
    pub job: Option<Arc<StreamJob>>,
    pub state: EntryState,
}

impl RegistryEntry {
    pub fn live_handle(&self) -> Option<&LiveHandle> {
        match &self.state {
            EntryState::Live(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn schedule_handle(&self) -> Option<&ScheduleHandle> {
        match &self.state {
            EntryState::Scheduled(handle) => Some(handle),
            _ => None,
        }
    }
}

#[derive(Clone, Default)]
pub struct StreamRegistry {
    entries: Arc<Mutex<HashMap<String, RegistryEntry>>>,
    next_reservation: Arc<AtomicU64>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
        // A panic while holding the lock leaves the map itself consistent
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `stream_key` in memory without yielding, then confirm with
    /// the durable store that no other record holds it.
    ///
    /// Returns `Ok(None)` when the key is taken.
    pub async fn try_reserve(
        &self,
        stream_key: &str,
        store: &dyn JobStore,
    ) -> AppResult<Option<Reservation>> {
        let Some(reservation) = self.reserve_local(stream_key) else {
            debug!("Stream key {} already registered", stream_key);
            return Ok(None);
        };

        match store.find_by_key(stream_key).await {
            Ok(None) => Ok(Some(reservation)),
            Ok(Some(record)) => {
                debug!(
                    "Stream key {} held by durable record {}",
                    stream_key, record.id
                );
                self.release(stream_key, reservation);
                Ok(None)
            }
            Err(e) => {
                self.release(stream_key, reservation);
                Err(e)
            }
        }
    }

    /// The synchronous half of [`try_reserve`](Self::try_reserve).
    pub fn reserve_local(&self, stream_key: &str) -> Option<Reservation> {
        let mut entries = self.entries();
        if entries.contains_key(stream_key) {
            return None;
        }
        let reservation = Reservation(self.next_reservation.fetch_add(1, Ordering::Relaxed) + 1);
        entries.insert(
            stream_key.to_string(),
            RegistryEntry {
                reservation,
                job: None,
                state: EntryState::Reserved,
            },
        );
        Some(reservation)
    }

    /// Attach the job and its state to a reservation.
    ///
    /// Returns the previous state, or `None` when the reservation is no
    /// longer current (the entry was released in the meantime).
    pub fn commit(
        &self,
        stream_key: &str,
        reservation: Reservation,
        job: Arc<StreamJob>,
        state: EntryState,
    ) -> Option<EntryState> {
        let mut entries = self.entries();
        match entries.get_mut(stream_key) {
            Some(entry) if entry.reservation == reservation => {
                entry.job = Some(job);
                Some(std::mem::replace(&mut entry.state, state))
            }
            _ => {
                warn!(
                    "Ignoring commit for stream {} with stale reservation {}",
                    stream_key,
                    reservation.id()
                );
                None
            }
        }
    }

    /// Remove the entry if it still belongs to `reservation`.
    ///
    /// Only the first caller gets the entry back; later calls and calls
    /// with a stale reservation return `None`.
    pub fn release(&self, stream_key: &str, reservation: Reservation) -> Option<RegistryEntry> {
        let mut entries = self.entries();
        match entries.get(stream_key) {
            Some(entry) if entry.reservation == reservation => entries.remove(stream_key),
            _ => None,
        }
    }

    /// Like [`release`](Self::release), but only while the entry's state
    /// still satisfies `allowed`.
    pub fn release_if(
        &self,
        stream_key: &str,
        reservation: Reservation,
        allowed: impl FnOnce(&EntryState) -> bool,
    ) -> Option<RegistryEntry> {
        let mut entries = self.entries();
        match entries.get(stream_key) {
            Some(entry) if entry.reservation == reservation && allowed(&entry.state) => {
                entries.remove(stream_key)
            }
            _ => None,
        }
    }

    pub fn lookup(&self, stream_key: &str) -> Option<RegistryEntry> {
        self.entries().get(stream_key).cloned()
    }

    pub fn contains(&self, stream_key: &str) -> bool {
        self.entries().contains_key(stream_key)
    }

    pub fn snapshot(&self) -> Vec<(String, RegistryEntry)> {
        let mut items: Vec<_> = self
            .entries()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EncodingParams, Resolution, StreamSchedule};
    use std::path::PathBuf;

    fn job(key: &str) -> Arc<StreamJob> {
        Arc::new(StreamJob {
            stream_key: key.to_string(),
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
                loop_enabled: false,
                audio_enabled: false,
            },
            schedule: StreamSchedule::default(),
            record_id: 1,
        })
    }

    #[test]
    fn test_second_reservation_for_same_key_is_refused() {
        let registry = StreamRegistry::new();
        let first = registry.reserve_local("k1");
        assert!(first.is_some());
        assert!(registry.reserve_local("k1").is_none());
        assert!(registry.reserve_local("k2").is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_release_runs_once() {
        let registry = StreamRegistry::new();
        let reservation = registry.reserve_local("k1").unwrap();

        assert!(registry.release("k1", reservation).is_some());
        assert!(registry.release("k1", reservation).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_reservation_cannot_touch_new_entry() {
        let registry = StreamRegistry::new();
        let old = registry.reserve_local("k1").unwrap();
        registry.release("k1", old);
        let new = registry.reserve_local("k1").unwrap();
        assert_ne!(old, new);

        assert!(registry.release("k1", old).is_none());
        assert!(registry
            .commit("k1", old, job("k1"), EntryState::Reserved)
            .is_none());
        assert!(registry.contains("k1"));

        let previous = registry.commit("k1", new, job("k1"), EntryState::Reserved);
        assert!(matches!(previous, Some(EntryState::Reserved)));
        assert!(registry.lookup("k1").unwrap().job.is_some());
    }

    #[test]
    fn test_release_if_checks_state() {
        let registry = StreamRegistry::new();
        let reservation = registry.reserve_local("k1").unwrap();

        let scheduled_only = |state: &EntryState| matches!(state, EntryState::Scheduled(_));
        assert!(registry.release_if("k1", reservation, scheduled_only).is_none());
        assert!(registry.contains("k1"));

        assert!(registry
            .release_if("k1", reservation, |state| matches!(state, EntryState::Reserved))
            .is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_reservations_admit_one() {
        let registry = StreamRegistry::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.reserve_local("shared"))
            })
            .collect();

        let granted = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(granted, 1);
    }
}
