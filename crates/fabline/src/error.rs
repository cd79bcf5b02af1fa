//! Simulation error types.

use thiserror::Error;

use crate::event::ActionKind;

/// Errors surfaced while building or running a simulation.
///
/// Runtime variants indicate a kernel or topology bug, never an expected
/// outcome: a correct model keeps every invariant at every tick. When one is
/// returned the kernel has already exported the event trace (if enabled).
#[derive(Debug, Error)]
pub enum SimError {
    /// A topology or parameter problem detected before any event ran.
    #[error("invalid system configuration: {0}")]
    Build(String),

    /// A state invariant failed inside an action.
    #[error("invariant violated at t={time} ({location}): {message}")]
    InvariantViolation {
        time: u64,
        location: String,
        message: String,
    },

    /// An event fired against a node in a state that cannot accept it.
    #[error("unexpected {action:?} at t={time} ({location}): {message}")]
    UnexpectedEvent {
        time: u64,
        location: String,
        action: ActionKind,
        message: String,
    },

    /// The clock would have moved backwards.
    #[error("event queue produced t={event_time} after clock reached t={now}")]
    ClockRegression { now: u64, event_time: u64 },

    /// Replication worker pool could not be created.
    #[error("replication pool error: {0}")]
    Replication(String),
}
