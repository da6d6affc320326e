//! Aggregate trait and the event-sourced aggregate root.
//!
//! [`Aggregate`] is the domain-facing contract: a pure decision function
//! (`handle`) and a pure state fold (`apply`). [`AggregateRoot`] wraps an
//! aggregate with the runtime bookkeeping that makes replay deterministic
//! and persistence confirmation exactly-once: the insertion-ordered pending
//! buffer, the future-event map, and the in-flight emit counter.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PendingEventMissing, ScheduledEventNotFound};
use crate::event::{EventEnvelope, ScheduledRecord, StreamEvent};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// State is built by folding stream events through [`apply`](Aggregate::apply).
///
/// # Associated Types
///
/// - `Command`: the set of commands this aggregate can handle.
/// - `Event`: the set of events this aggregate can produce and apply.
/// - `Error`: command rejection / validation error.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O,
///   no side effects. It validates a command against the current state and
///   returns zero or more emissions (immediate events, scheduled events, or
///   cancellations of pending schedules).
/// - [`apply`](Aggregate::apply) must be a pure, total function. It takes
///   ownership of the current state and a reference to an event, returning
///   the next state. The variant match inside `apply` is the aggregate's
///   event-application table.
/// - `Event` must use `#[serde(tag = "type", content = "data")]` adjacently
///   tagged serialization; the tag becomes the stored event type.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. "counter"). Used for stream
    /// derivation, routing, and handler registration.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Clone + Send + Sync + 'static;

    /// The set of events this aggregate can produce and apply.
    type Event: Serialize + DeserializeOwned + Send + Sync + Clone + std::fmt::Debug + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce emissions.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op.
    /// Returns `Err` to reject the command.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Emission<Self::Event>>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::Event) -> Self;
}

/// One output of a command handler.
///
/// Immediate events take effect once their persistence confirms. Scheduled
/// events persist only the [`ScheduledRecord`] wrapper; the inner event
/// takes effect when an external timer fires the schedule. Cancellations
/// select pending schedules by predicate and emit one cancellation marker
/// per match.
pub enum Emission<E> {
    /// Emit an event that takes effect on persistence confirmation.
    Event(E),
    /// Emit an event that takes effect at `raise_at`.
    Scheduled {
        /// The event to apply when the schedule fires.
        event: E,
        /// Earliest time the schedule may fire.
        raise_at: DateTime<Utc>,
    },
    /// Cancel every pending schedule whose inner event matches.
    Cancel(Box<dyn Fn(&E) -> bool + Send + Sync>),
}

impl<E> Emission<E> {
    /// An immediate event.
    pub fn event(event: E) -> Self {
        Self::Event(event)
    }

    /// An event deferred until `raise_at`.
    pub fn at(event: E, raise_at: DateTime<Utc>) -> Self {
        Self::Scheduled { event, raise_at }
    }

    /// A cancellation of pending schedules matching `predicate`.
    pub fn cancel(predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self::Cancel(Box::new(predicate))
    }
}

impl<E> From<E> for Emission<E> {
    fn from(event: E) -> Self {
        Self::Event(event)
    }
}

/// A point-in-time snapshot of an aggregate's state, pending schedules, and
/// stream version.
///
/// Only clean roots (nothing buffered, nothing in flight) may be
/// snapshotted; see [`AggregateRoot::snapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "A: Serialize, A::Event: Serialize",
    deserialize = "A: DeserializeOwned, A::Event: DeserializeOwned"
))]
pub struct AggregateSnapshot<A: Aggregate> {
    /// The aggregate state at snapshot time.
    pub state: A,
    /// Pending future-event records at snapshot time.
    pub future_events: HashMap<Uuid, ScheduledRecord<A::Event>>,
    /// The stream version (number of events applied) at snapshot time.
    pub version: u64,
}

/// Runtime wrapper owning an aggregate's state and persistence bookkeeping.
///
/// A root is owned exclusively by its processing lane; all mutation happens
/// from within that lane, so the root itself needs no locking.
///
/// The core invariant: an event affects state exactly once, at persistence
/// confirmation time ([`mark_persisted`](AggregateRoot::mark_persisted)),
/// never at emission time. Replay uses the same transition function as live
/// confirmation, which is what makes recovery deterministic.
#[derive(Debug)]
pub struct AggregateRoot<A: Aggregate> {
    id: String,
    version: u64,
    state: A,
    /// Events buffered between emission and persistence confirmation.
    /// Insertion order is confirmation order.
    pending: Vec<EventEnvelope<A::Event>>,
    future_events: HashMap<Uuid, ScheduledRecord<A::Event>>,
    in_flight_emits: usize,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A fresh root with default state and an empty history.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            state: A::default(),
            pending: Vec::new(),
            future_events: HashMap::new(),
            in_flight_emits: 0,
        }
    }

    /// Rebuild a root from a snapshot; catch-up replay resumes from
    /// `snapshot.version`.
    pub fn restore(id: impl Into<String>, snapshot: AggregateSnapshot<A>) -> Self {
        Self {
            id: id.into(),
            version: snapshot.version,
            state: snapshot.state,
            pending: Vec::new(),
            future_events: snapshot.future_events,
            in_flight_emits: 0,
        }
    }

    /// The aggregate instance ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of confirmed events in this aggregate's stream.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Current state. Reflects confirmed events only.
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Pending future-event records, keyed by future event ID.
    pub fn future_events(&self) -> &HashMap<Uuid, ScheduledRecord<A::Event>> {
        &self.future_events
    }

    /// `true` while events are buffered awaiting confirmation.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// `true` while an emission is suspended on its persistence call.
    pub fn is_emitting(&self) -> bool {
        self.in_flight_emits > 0
    }

    /// Mark the start of an emission's persistence call.
    pub fn begin_emit(&mut self) {
        self.in_flight_emits += 1;
    }

    /// Mark the end of an emission's persistence call.
    ///
    /// Must be called on the failure path as well as the success path.
    pub fn end_emit(&mut self) {
        self.in_flight_emits = self.in_flight_emits.saturating_sub(1);
    }

    /// Buffer an envelope until its persistence confirms.
    ///
    /// Duplicate event IDs are ignored; returns `false` for a duplicate.
    pub fn stage(&mut self, envelope: EventEnvelope<A::Event>) -> bool {
        if self.pending.iter().any(|p| p.event_id == envelope.event_id) {
            return false;
        }
        self.pending.push(envelope);
        true
    }

    /// Drop a buffered envelope whose persistence will never confirm.
    ///
    /// Returns `false` if no such envelope is buffered.
    pub fn unstage(&mut self, event_id: Uuid) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.event_id != event_id);
        self.pending.len() != before
    }

    /// Confirm persistence of a buffered event: apply it to state exactly
    /// once and remove it from the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`PendingEventMissing`] if the event is not buffered --
    /// including the case where it was already confirmed. State is left
    /// unchanged.
    pub fn mark_persisted(&mut self, event_id: Uuid) -> Result<(), PendingEventMissing> {
        let index = self
            .pending
            .iter()
            .position(|p| p.event_id == event_id)
            .ok_or(PendingEventMissing { event_id })?;
        let envelope = self.pending.remove(index);
        self.transition(&envelope.event);
        self.version += 1;
        Ok(())
    }

    /// Fold one already-persisted event into state during recovery.
    ///
    /// Uses the same transition function as live confirmation.
    pub fn replay(&mut self, event: &StreamEvent<A::Event>) {
        self.transition(event);
        self.version += 1;
    }

    /// Advance the version past an event this build cannot decode.
    ///
    /// Keeps the version aligned with the stream length so later appends
    /// carry the correct expected version.
    pub fn replay_skipped(&mut self) {
        self.version += 1;
    }

    /// Look up a pending schedule.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduledEventNotFound`] if the schedule already fired or
    /// was cancelled. Callers must treat this as a benign duplicate.
    pub fn scheduled(
        &self,
        future_event_id: Uuid,
    ) -> Result<&ScheduledRecord<A::Event>, ScheduledEventNotFound> {
        self.future_events
            .get(&future_event_id)
            .ok_or(ScheduledEventNotFound { future_event_id })
    }

    /// IDs of every pending schedule whose inner event matches `predicate`.
    pub fn cancel_matching(&self, predicate: impl Fn(&A::Event) -> bool) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .future_events
            .values()
            .filter(|record| predicate(&record.inner))
            .map(|record| record.future_event_id)
            .collect();
        ids.sort();
        ids
    }

    /// Expand handler emissions into stream events against current state.
    ///
    /// Scheduled emissions get a fresh future event ID; cancellations are
    /// resolved against the pending schedules at expansion time.
    pub fn expand_emissions(
        &self,
        emissions: Vec<Emission<A::Event>>,
    ) -> Vec<StreamEvent<A::Event>> {
        let mut out = Vec::with_capacity(emissions.len());
        for emission in emissions {
            match emission {
                Emission::Event(event) => out.push(StreamEvent::Domain(event)),
                Emission::Scheduled { event, raise_at } => {
                    out.push(StreamEvent::FutureEventScheduled(ScheduledRecord {
                        future_event_id: Uuid::new_v4(),
                        raise_at,
                        inner: event,
                    }));
                }
                Emission::Cancel(predicate) => {
                    for future_event_id in self.cancel_matching(|e| predicate(e)) {
                        out.push(StreamEvent::FutureEventCanceled { future_event_id });
                    }
                }
            }
        }
        out
    }

    /// Take a snapshot if the root is clean.
    ///
    /// Returns `None` while events are buffered or an emission is in
    /// flight: snapshotting then would capture state that persisted events
    /// have not yet reached.
    pub fn snapshot(&self) -> Option<AggregateSnapshot<A>> {
        if self.has_pending() || self.is_emitting() {
            return None;
        }
        Some(AggregateSnapshot {
            state: self.state.clone(),
            future_events: self.future_events.clone(),
            version: self.version,
        })
    }

    /// The single transition function shared by confirmation and replay.
    ///
    /// Pure state mutation plus future-event bookkeeping; never emits,
    /// schedules, or performs I/O.
    fn transition(&mut self, event: &StreamEvent<A::Event>) {
        match event {
            StreamEvent::Domain(e) => {
                let state = std::mem::take(&mut self.state);
                self.state = state.apply(e);
            }
            StreamEvent::FutureEventScheduled(record) => {
                self.future_events
                    .insert(record.future_event_id, record.clone());
            }
            StreamEvent::FutureEventOccurred { future_event_id }
            | StreamEvent::FutureEventCanceled { future_event_id } => {
                self.future_events.remove(future_event_id);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::{Aggregate, Emission};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    /// A simple counter aggregate used as a test fixture across the crate.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Counter {
        pub name: Option<String>,
        pub value: i64,
    }

    /// Commands that can be issued to the `Counter` aggregate.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) enum CounterCommand {
        Create { name: String },
        Add { amount: i64 },
        ScheduleReset { at: DateTime<Utc> },
        CancelResets,
    }

    /// Domain events produced by the `Counter` aggregate.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum CounterEvent {
        Created { name: String },
        Added { amount: i64 },
        Reset,
    }

    /// Errors that can occur when handling a `CounterCommand`.
    #[derive(Debug, thiserror::Error)]
    pub(crate) enum CounterError {
        #[error("counter already created")]
        AlreadyCreated,
        #[error("counter does not exist yet")]
        NotCreated,
    }

    impl Aggregate for Counter {
        const AGGREGATE_TYPE: &'static str = "counter";

        type Command = CounterCommand;
        type Event = CounterEvent;
        type Error = CounterError;

        fn handle(&self, cmd: Self::Command) -> Result<Vec<Emission<Self::Event>>, Self::Error> {
            match cmd {
                CounterCommand::Create { name } => {
                    if self.name.is_some() {
                        return Err(CounterError::AlreadyCreated);
                    }
                    Ok(vec![Emission::event(CounterEvent::Created { name })])
                }
                CounterCommand::Add { amount } => {
                    if self.name.is_none() {
                        return Err(CounterError::NotCreated);
                    }
                    Ok(vec![Emission::event(CounterEvent::Added { amount })])
                }
                CounterCommand::ScheduleReset { at } => {
                    if self.name.is_none() {
                        return Err(CounterError::NotCreated);
                    }
                    Ok(vec![Emission::at(CounterEvent::Reset, at)])
                }
                CounterCommand::CancelResets => Ok(vec![Emission::cancel(|e| {
                    matches!(e, CounterEvent::Reset)
                })]),
            }
        }

        fn apply(mut self, event: &Self::Event) -> Self {
            match event {
                CounterEvent::Created { name } => self.name = Some(name.clone()),
                CounterEvent::Added { amount } => self.value += amount,
                CounterEvent::Reset => self.value = 0,
            }
            self
        }
    }
}
