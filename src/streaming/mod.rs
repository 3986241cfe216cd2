//! Stream job lifecycle: registry, timers, encoder supervision and status.
//!
//! All state transitions are driven by [`LifecycleEvent`]s processed on a
//! single task owned by [`StreamManager`].

pub mod command;
pub mod manager;
pub mod monitor;
pub mod registry;
pub mod scheduler;
pub mod supervisor;

pub use manager::{ManagerSettings, RecoverySummary, StreamManager};
pub use registry::{EntryState, RegistryEntry, Reservation, StreamRegistry};

use crate::models::StopReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ScheduledStart,
    AutoStop,
}

/// Named events consumed by the lifecycle loop
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    TimerFired {
        stream_key: String,
        reservation: Reservation,
        timer: TimerKind,
    },
    StopRequested {
        stream_key: String,
        reservation: Reservation,
        reason: StopReason,
    },
    /// The encoder exited with status zero
    Completed {
        stream_key: String,
        reservation: Reservation,
    },
    /// The encoder exited abnormally
    Errored {
        stream_key: String,
        reservation: Reservation,
        reason: String,
    },
    /// The liveness probe found no process behind the pid
    Vanished {
        stream_key: String,
        reservation: Reservation,
    },
}
