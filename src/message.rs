//! Message metadata, type-erased envelopes, and faults.
//!
//! Every message travelling through the engine -- commands, domain events,
//! scheduling markers, saga lifecycle events, and faults -- is wrapped in an
//! [`Envelope`] carrying [`MessageMetadata`]. The metadata links causally
//! related messages: the correlation ID is propagated unchanged across an
//! entire flow, the causation ID points at the message that directly caused
//! this one, and the history records one audit entry per processing hop.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `why` value recorded when an aggregate lane executes a command.
pub const WHY_COMMAND_EXECUTION: &str = "command-execution";
/// `why` value recorded when a lane fires a previously scheduled event.
pub const WHY_SCHEDULED_RAISE: &str = "scheduled-event-raise";
/// `why` value recorded when a saga applies a transition.
pub const WHY_SAGA_TRANSITION: &str = "saga-transition";
/// `what` value recorded when the hop produced a published event.
pub const WHAT_EVENT_PUBLISHED: &str = "event-published";
/// `what` value recorded when the hop produced a published fault.
pub const WHAT_FAULT_PUBLISHED: &str = "fault-published";
/// `what` value recorded when the hop dispatched a follow-up command.
pub const WHAT_COMMAND_DISPATCHED: &str = "command-dispatched";

/// One processing hop in a message's audit trail.
///
/// `who` identifies the processor (e.g. `"counter/c-1"`), `why` the trigger
/// kind, and `what` the outcome kind. The engine only ever appends steps;
/// a message's history length equals the number of causal hops since the
/// originating command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHistoryStep {
    /// Identity of the processor that produced the new message.
    pub who: String,
    /// Why the processor acted (trigger kind).
    pub why: String,
    /// What the processing produced (outcome kind).
    pub what: String,
}

impl ProcessHistoryStep {
    /// Create a history step from its three parts.
    pub fn new(who: impl Into<String>, why: impl Into<String>, what: impl Into<String>) -> Self {
        Self {
            who: who.into(),
            why: why.into(),
            what: what.into(),
        }
    }
}

/// Cross-cutting metadata attached to every message.
///
/// # Examples
///
/// ```
/// use gridlane::{MessageMetadata, ProcessHistoryStep};
/// use uuid::Uuid;
///
/// let command_id = Uuid::new_v4();
/// let meta = MessageMetadata::origin(command_id);
///
/// let event_id = Uuid::new_v4();
/// let child = meta.child(
///     event_id,
///     ProcessHistoryStep::new("counter/c-1", "command-execution", "event-published"),
/// );
///
/// assert_eq!(child.correlation_id, meta.correlation_id);
/// assert_eq!(child.causation_id, command_id);
/// assert_eq!(child.history.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Identity of the message this metadata is attached to.
    pub message_id: Uuid,
    /// Identifier shared by every message in one causally related flow.
    pub correlation_id: Uuid,
    /// Identity of the message that directly caused this one.
    ///
    /// Nil for an originating message that was not caused by another.
    pub causation_id: Uuid,
    /// Ordered, append-only audit trail of processing hops.
    pub history: Vec<ProcessHistoryStep>,
}

impl MessageMetadata {
    /// Metadata for an originating message (usually a command from the
    /// outside world). A fresh correlation ID is assigned and the causation
    /// ID is nil.
    pub fn origin(message_id: Uuid) -> Self {
        Self {
            message_id,
            correlation_id: Uuid::new_v4(),
            causation_id: Uuid::nil(),
            history: Vec::new(),
        }
    }

    /// Set the correlation ID, joining this message to an existing flow.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Derive metadata for a message produced while processing this one.
    ///
    /// The correlation ID is propagated unchanged, the causation ID is set
    /// to this message's ID, and `step` is appended to the history.
    pub fn child(&self, message_id: Uuid, step: ProcessHistoryStep) -> Self {
        let mut history = self.history.clone();
        history.push(step);
        Self {
            message_id,
            correlation_id: self.correlation_id,
            causation_id: self.message_id,
            history,
        }
    }
}

/// A type-erased message plus its metadata, as published on the bus.
///
/// The payload is held behind `Arc<dyn Any>` so envelopes are cheap to
/// clone and fan out to any number of subscribers; consumers recover the
/// concrete type with [`payload_as`](Envelope::payload_as).
#[derive(Clone)]
pub struct Envelope {
    payload: Arc<dyn Any + Send + Sync>,
    /// Metadata of the wrapped message.
    pub metadata: MessageMetadata,
}

impl Envelope {
    /// Wrap a message and its metadata.
    pub fn new<M: Any + Send + Sync>(payload: M, metadata: MessageMetadata) -> Self {
        Self {
            payload: Arc::new(payload),
            metadata,
        }
    }

    /// Wrap an already shared payload.
    pub fn from_arc(payload: Arc<dyn Any + Send + Sync>, metadata: MessageMetadata) -> Self {
        Self { payload, metadata }
    }

    /// Returns `true` if the payload is of type `M`.
    pub fn is<M: Any>(&self) -> bool {
        self.payload.is::<M>()
    }

    /// Downcast the payload to a concrete message type.
    pub fn payload_as<M: Any>(&self) -> Option<&M> {
        self.payload.downcast_ref::<M>()
    }

    /// The shared payload, for re-wrapping without a copy.
    pub fn payload_arc(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.payload)
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("message_id", &self.metadata.message_id)
            .field("correlation_id", &self.metadata.correlation_id)
            .finish()
    }
}

/// A failed handling attempt, published as an ordinary message.
///
/// Faults are never thrown across the pipeline boundary: command rejection
/// and persistence failures are converted into a `Fault` and published on
/// the bus so waiters and sagas can observe them like any other message.
#[derive(Clone)]
pub struct Fault {
    /// ID of the message whose handling failed (for a command fault, the
    /// command ID).
    pub message_id: Uuid,
    /// The original message, kept for post-hoc inspection.
    pub original: Arc<dyn Any + Send + Sync>,
    /// Human-readable failure description.
    pub reason: String,
    /// Tag of the handler that failed (e.g. the aggregate type).
    pub handler_type: String,
    /// Saga the failed message belonged to, if any.
    pub saga_id: Option<Uuid>,
    /// When the failure was observed.
    pub occurred_at: DateTime<Utc>,
}

impl Fault {
    /// Build a fault for a failed message.
    pub fn new<M: Any + Send + Sync>(
        message_id: Uuid,
        original: M,
        handler_type: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            original: Arc::new(original),
            reason: reason.into(),
            handler_type: handler_type.into(),
            saga_id: None,
            occurred_at: Utc::now(),
        }
    }

    /// Build a fault around an already shared original message.
    pub fn from_arc(
        message_id: Uuid,
        original: Arc<dyn Any + Send + Sync>,
        handler_type: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            original,
            reason: reason.into(),
            handler_type: handler_type.into(),
            saga_id: None,
            occurred_at: Utc::now(),
        }
    }

    /// Attach the saga the failed message belonged to.
    pub fn with_saga_id(mut self, saga_id: Uuid) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    /// Downcast the original message to a concrete type.
    pub fn original_as<M: Any>(&self) -> Option<&M> {
        self.original.downcast_ref::<M>()
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("message_id", &self.message_id)
            .field("handler_type", &self.handler_type)
            .field("reason", &self.reason)
            .field("saga_id", &self.saga_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_metadata_has_nil_causation_and_empty_history() {
        let id = Uuid::new_v4();
        let meta = MessageMetadata::origin(id);
        assert_eq!(meta.message_id, id);
        assert_eq!(meta.causation_id, Uuid::nil());
        assert!(meta.history.is_empty());
    }

    #[test]
    fn child_propagates_correlation_and_sets_causation() {
        let command_id = Uuid::new_v4();
        let meta = MessageMetadata::origin(command_id);
        let event_id = Uuid::new_v4();

        let child = meta.child(
            event_id,
            ProcessHistoryStep::new("counter/c-1", WHY_COMMAND_EXECUTION, WHAT_EVENT_PUBLISHED),
        );

        assert_eq!(child.message_id, event_id);
        assert_eq!(child.correlation_id, meta.correlation_id);
        assert_eq!(child.causation_id, command_id);
        assert_eq!(child.history.len(), 1);
        assert_eq!(child.history[0].who, "counter/c-1");
    }

    #[test]
    fn history_length_tracks_causal_hops() {
        let meta = MessageMetadata::origin(Uuid::new_v4());
        let hop1 = meta.child(
            Uuid::new_v4(),
            ProcessHistoryStep::new("a/1", WHY_COMMAND_EXECUTION, WHAT_EVENT_PUBLISHED),
        );
        let hop2 = hop1.child(
            Uuid::new_v4(),
            ProcessHistoryStep::new("saga/x", WHY_SAGA_TRANSITION, WHAT_COMMAND_DISPATCHED),
        );

        assert_eq!(hop2.history.len(), 2);
        assert_eq!(hop2.causation_id, hop1.message_id);
        assert_eq!(hop2.correlation_id, meta.correlation_id);
    }

    #[test]
    fn child_does_not_mutate_parent_history() {
        let meta = MessageMetadata::origin(Uuid::new_v4());
        let _child = meta.child(
            Uuid::new_v4(),
            ProcessHistoryStep::new("a/1", WHY_COMMAND_EXECUTION, WHAT_EVENT_PUBLISHED),
        );
        assert!(meta.history.is_empty());
    }

    #[test]
    fn metadata_serde_roundtrip() {
        let meta = MessageMetadata::origin(Uuid::new_v4()).with_correlation(Uuid::new_v4());
        let json = serde_json::to_string(&meta).expect("serialization should succeed");
        let back: MessageMetadata =
            serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(back, meta);
    }

    #[test]
    fn envelope_downcasts_to_concrete_payload() {
        #[derive(Debug, PartialEq)]
        struct Ping(u32);

        let env = Envelope::new(Ping(7), MessageMetadata::origin(Uuid::new_v4()));
        assert!(env.is::<Ping>());
        assert!(!env.is::<String>());
        assert_eq!(env.payload_as::<Ping>(), Some(&Ping(7)));
        assert_eq!(env.payload_as::<String>(), None);
    }

    #[test]
    fn envelope_clone_shares_payload() {
        let env = Envelope::new(41u64, MessageMetadata::origin(Uuid::new_v4()));
        let cloned = env.clone();
        assert_eq!(cloned.payload_as::<u64>(), Some(&41));
        assert_eq!(cloned.metadata, env.metadata);
    }

    #[test]
    fn fault_keeps_original_message() {
        #[derive(Debug, Clone)]
        struct CreateThing {
            name: String,
        }

        let command_id = Uuid::new_v4();
        let fault = Fault::new(
            command_id,
            CreateThing {
                name: "x".to_owned(),
            },
            "thing",
            "already exists",
        );

        assert_eq!(fault.message_id, command_id);
        assert_eq!(fault.handler_type, "thing");
        let original = fault.original_as::<CreateThing>().expect("original message");
        assert_eq!(original.name, "x");
        assert_eq!(fault.saga_id, None);
    }

    #[test]
    fn fault_with_saga_id() {
        let saga_id = Uuid::new_v4();
        let fault = Fault::new(Uuid::new_v4(), (), "saga", "boom").with_saga_id(saga_id);
        assert_eq!(fault.saga_id, Some(saga_id));
    }
}
