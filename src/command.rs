//! Command envelopes and confirmation modes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::message::MessageMetadata;

/// How much confirmation the caller of an execute waits for.
///
/// The mode only changes what the pipeline waits for before returning;
/// execution and fault semantics are identical in all three.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfirmationMode {
    /// Return as soon as the command is handed to its lane.
    None,
    /// Return once the handler has produced its events, before persistence.
    Produced,
    /// Return once the produced events are durably persisted.
    #[default]
    Persisted,
}

/// A typed command addressed to exactly one aggregate instance.
///
/// # Examples
///
/// ```no_run
/// use gridlane::CommandEnvelope;
///
/// # #[derive(Clone)] enum CounterCommand { Create { name: String } }
/// let envelope = CommandEnvelope::new(
///     "c-7",
///     CounterCommand::Create { name: "X".to_owned() },
/// );
/// assert_eq!(envelope.target, "c-7");
/// assert_eq!(envelope.metadata.message_id, envelope.command_id);
/// ```
#[derive(Debug, Clone)]
pub struct CommandEnvelope<C> {
    /// Unique command identity; faults produced by this command carry it.
    pub command_id: Uuid,
    /// Instance ID of the target aggregate.
    pub target: String,
    /// The command itself.
    pub payload: C,
    /// Causal metadata; `metadata.message_id` equals `command_id`.
    pub metadata: MessageMetadata,
    /// Saga this command belongs to, if dispatched by one.
    pub saga_id: Option<Uuid>,
}

impl<C> CommandEnvelope<C> {
    /// Address `payload` to the aggregate instance `target` with fresh
    /// origin metadata.
    pub fn new(target: impl Into<String>, payload: C) -> Self {
        let command_id = Uuid::new_v4();
        Self {
            command_id,
            target: target.into(),
            payload,
            metadata: MessageMetadata::origin(command_id),
            saga_id: None,
        }
    }

    /// Join an existing correlation instead of starting a fresh one.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.metadata.correlation_id = correlation_id;
        self
    }

    /// Replace the metadata wholesale (e.g. with a causal child derived
    /// from a triggering message). The message ID is forced back to this
    /// envelope's command ID.
    pub fn with_metadata(mut self, mut metadata: MessageMetadata) -> Self {
        metadata.message_id = self.command_id;
        self.metadata = metadata;
        self
    }

    /// Mark this command as dispatched on behalf of a saga.
    pub fn with_saga_id(mut self, saga_id: Uuid) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    /// The correlation this command belongs to.
    pub fn correlation_id(&self) -> Uuid {
        self.metadata.correlation_id
    }
}

/// A type-erased command envelope for cross-aggregate dispatch.
///
/// Produced by sagas when reacting to events: the saga does not know the
/// concrete command type of the target aggregate at compile time, so the
/// payload travels as JSON and the dispatch layer deserializes it into the
/// correct `A::Command` at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynCommandEnvelope {
    /// Target aggregate type tag (must match an `Aggregate::AGGREGATE_TYPE`).
    pub aggregate_type: String,
    /// Unique command identity.
    pub command_id: Uuid,
    /// Instance ID of the target aggregate.
    pub target: String,
    /// JSON-serialized command payload.
    pub payload: Value,
    /// Causal metadata forwarded to the command handler.
    pub metadata: MessageMetadata,
    /// Saga this command belongs to, if dispatched by one.
    pub saga_id: Option<Uuid>,
}

impl DynCommandEnvelope {
    /// Build a type-erased envelope addressed to aggregate type `A`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the command cannot be serialized.
    pub fn encode<A: Aggregate>(
        target: impl Into<String>,
        payload: &A::Command,
    ) -> serde_json::Result<Self>
    where
        A::Command: Serialize,
    {
        let command_id = Uuid::new_v4();
        Ok(Self {
            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            command_id,
            target: target.into(),
            payload: serde_json::to_value(payload)?,
            metadata: MessageMetadata::origin(command_id),
            saga_id: None,
        })
    }

    /// Deserialize back into a typed envelope for aggregate type `A`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload does not deserialize
    /// into `A::Command`.
    pub fn decode<A: Aggregate>(self) -> serde_json::Result<CommandEnvelope<A::Command>>
    where
        A::Command: serde::de::DeserializeOwned,
    {
        Ok(CommandEnvelope {
            command_id: self.command_id,
            target: self.target,
            payload: serde_json::from_value(self.payload)?,
            metadata: self.metadata,
            saga_id: self.saga_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterCommand};
    use crate::message::ProcessHistoryStep;

    #[test]
    fn new_envelope_gets_origin_metadata() {
        let env = CommandEnvelope::new("c-1", CounterCommand::Add { amount: 1 });
        assert_eq!(env.metadata.message_id, env.command_id);
        assert_eq!(env.metadata.causation_id, Uuid::nil());
        assert!(env.metadata.history.is_empty());
        assert_eq!(env.saga_id, None);
    }

    #[test]
    fn with_correlation_keeps_command_identity() {
        let correlation = Uuid::new_v4();
        let env =
            CommandEnvelope::new("c-1", CounterCommand::Add { amount: 1 }).with_correlation(correlation);
        assert_eq!(env.correlation_id(), correlation);
        assert_eq!(env.metadata.message_id, env.command_id);
    }

    #[test]
    fn with_metadata_forces_message_id_to_command_id() {
        let parent = MessageMetadata::origin(Uuid::new_v4());
        let env = CommandEnvelope::new("c-1", CounterCommand::Add { amount: 1 });
        let child = parent.child(
            Uuid::new_v4(),
            ProcessHistoryStep::new("saga/x", "saga-transition", "command-dispatched"),
        );
        let env = env.with_metadata(child);

        assert_eq!(env.metadata.message_id, env.command_id);
        assert_eq!(env.metadata.correlation_id, parent.correlation_id);
        assert_eq!(env.metadata.causation_id, parent.message_id);
        assert_eq!(env.metadata.history.len(), 1);
    }

    #[test]
    fn dyn_envelope_roundtrip() {
        let dyn_env = DynCommandEnvelope::encode::<Counter>(
            "c-9",
            &CounterCommand::Create {
                name: "X".to_owned(),
            },
        )
        .expect("encode should succeed");

        assert_eq!(dyn_env.aggregate_type, "counter");
        assert_eq!(dyn_env.target, "c-9");

        let typed = dyn_env.decode::<Counter>().expect("decode should succeed");
        assert!(matches!(
            typed.payload,
            CounterCommand::Create { ref name } if name == "X"
        ));
        assert_eq!(typed.target, "c-9");
    }

    #[test]
    fn dyn_envelope_decode_rejects_wrong_shape() {
        let bogus = DynCommandEnvelope {
            aggregate_type: "counter".to_owned(),
            command_id: Uuid::new_v4(),
            target: "c-1".to_owned(),
            payload: serde_json::json!({"NoSuchVariant": {}}),
            metadata: MessageMetadata::origin(Uuid::new_v4()),
            saga_id: None,
        };
        assert!(bogus.decode::<Counter>().is_err());
    }
}
