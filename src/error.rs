//! Crate-level error types for command execution, waiting, and dispatch.

use std::time::Duration;

use uuid::Uuid;

use crate::message::{Envelope, Fault};
use crate::persistence::StoreError;

/// A raise or cancel referenced a schedule that no longer exists.
///
/// This is the benign duplicate case: the schedule already fired or was
/// cancelled. Timer collaborators deliver at least once, so callers must
/// treat this as a no-op rather than a failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("scheduled event {future_event_id} not found (already fired or cancelled)")]
pub struct ScheduledEventNotFound {
    /// The schedule that could not be found.
    pub future_event_id: Uuid,
}

/// A persistence confirmation arrived for an event that is not buffered.
///
/// Confirming the same event twice hits this error instead of applying the
/// event a second time.
#[derive(Debug, Clone, thiserror::Error)]
#[error("event {event_id} is not awaiting persistence confirmation")]
pub struct PendingEventMissing {
    /// The event the confirmation referenced.
    pub event_id: Uuid,
}

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `E`, the domain-specific error type that the aggregate's
/// command handler may produce (e.g. "insufficient funds").
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic.
    ///
    /// Wraps the domain-specific error returned from the aggregate's
    /// command handler, forwarding its `Display` and `Error` impls.
    #[error(transparent)]
    Domain(E),

    /// The event store rejected or failed the append.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An event could not be serialized for storage.
    #[error("event codec failure: {0}")]
    Codec(String),

    /// A raise or cancel referenced an unknown schedule.
    #[error(transparent)]
    ScheduledEventNotFound(#[from] ScheduledEventNotFound),

    /// A confirmation referenced an event that was never buffered.
    #[error(transparent)]
    Confirmation(#[from] PendingEventMissing),

    /// No aggregate of this type is registered with the node.
    #[error("no aggregate registered for type '{0}'")]
    HandlerNotFound(String),

    /// The lane task backing this aggregate has exited.
    #[error("aggregate lane is no longer running")]
    LaneClosed,
}

/// Error returned when reading the current state of an aggregate fails.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateError {
    /// The lane task backing this aggregate has exited.
    #[error("aggregate lane is no longer running")]
    LaneClosed,
}

/// Errors surfaced by the type-erased node entry points (saga dispatch,
/// timer raises, envelope routing).
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// No aggregate of this type is registered with the node.
    #[error("no aggregate registered for type '{aggregate_type}'")]
    HandlerNotFound {
        /// The unregistered aggregate type tag.
        aggregate_type: String,
    },

    /// The event store failed while spawning or driving a lane.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The lane task backing the target aggregate has exited.
    #[error("aggregate lane is no longer running")]
    LaneClosed,

    /// A type-erased dispatch could not be completed.
    ///
    /// Covers command payload deserialization failures and non-domain
    /// execution errors. Domain rejections are not dispatch failures --
    /// they become published faults.
    #[error("command dispatch failed: {0}")]
    DispatchFailed(String),
}

/// Error returned by the wait engine.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The condition tree was not satisfied before the deadline.
    ///
    /// Carries every correlated message observed during the wait so the
    /// caller can inspect how far the flow progressed.
    #[error("wait timed out after {elapsed:?} with {} message(s) observed", observed.len())]
    Timeout {
        /// The timeout that elapsed.
        elapsed: Duration,
        /// Messages observed before the deadline.
        observed: Vec<Envelope>,
    },

    /// The awaited command produced one or more faults.
    ///
    /// Returned instead of a normal result when fail-on-fault is active;
    /// the collected faults are the aggregated failure set.
    #[error("command {command_id} failed with {} fault(s)", faults.len())]
    CommandFailed {
        /// The command whose faults were collected.
        command_id: Uuid,
        /// Every fault referencing the command.
        faults: Vec<Fault>,
    },

    /// The command could not be submitted to its lane.
    #[error("command submission failed: {0}")]
    Submit(String),

    /// The message bus shut down while waiting.
    #[error("message bus closed while waiting")]
    BusClosed,
}

/// Error returned by the aggregate scenario harness.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioFailure {
    /// The command under test was rejected by the handler.
    #[error("command was rejected: {0}")]
    Rejected(String),

    /// A rejection was expected but the command succeeded.
    #[error("expected rejection, but command produced {produced} event(s)")]
    UnexpectedSuccess {
        /// Number of events the command produced.
        produced: usize,
    },

    /// The produced events do not match the expectation.
    #[error("produced events do not match:\n  expected: {expected}\n  actual:   {actual}")]
    Mismatch {
        /// Debug rendering of the expected events.
        expected: String,
        /// Debug rendering of the actually produced events.
        actual: String,
    },

    /// No command was configured before running the scenario.
    #[error("scenario has no command to execute")]
    MissingCommand,
}
