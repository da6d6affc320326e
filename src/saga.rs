//! Sagas: cross-aggregate workflows as explicit named-state machines.
//!
//! A saga reacts to messages from the bus and produces commands that are
//! dispatched to (potentially different) aggregates. Saga state persists
//! through the same lane machinery as any aggregate: each accepted
//! transition appends one lifecycle event carrying the full next state, so
//! recovery is ordinary replay and the latest state wins by construction.

use std::convert::Infallible;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::{Aggregate, Emission};
use crate::bus::BusStream;
use crate::command::{CommandEnvelope, DynCommandEnvelope};
use crate::message::{
    Envelope, Fault, ProcessHistoryStep, WHAT_COMMAND_DISPATCHED, WHAT_EVENT_PUBLISHED,
    WHAT_FAULT_PUBLISHED, WHY_SAGA_TRANSITION,
};
use crate::node::DomainNode;

/// Domain state carried by a saga.
///
/// The initial state of a fresh saga is `Default::default()`; the state
/// name is the machine's current named state.
pub trait SagaState:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + std::fmt::Debug + 'static
{
    /// Name of the current state (e.g. `"Working"`).
    fn state_name(&self) -> &'static str;
}

/// The outcome of one accepted saga transition.
#[derive(Debug, Clone)]
pub struct SagaTransition<S> {
    /// The saga's next state.
    pub state: S,
    /// Commands to dispatch once the transition is persisted.
    pub commands: Vec<DynCommandEnvelope>,
}

impl<S> SagaTransition<S> {
    /// A transition to `state` dispatching no commands.
    pub fn to(state: S) -> Self {
        Self {
            state,
            commands: Vec::new(),
        }
    }

    /// Add a command to dispatch after the transition persists.
    pub fn with_command(mut self, command: DynCommandEnvelope) -> Self {
        self.commands.push(command);
        self
    }
}

/// A cross-aggregate workflow definition.
///
/// # Contract
///
/// - [`transit`](Saga::transit) must be deterministic: a pure function of
///   `(state, message)`. Returning `None` makes the message a tolerant
///   no-op in the current state; it is not an error.
/// - [`accepts`](Saga::accepts) filters the bus down to the message types
///   this saga participates in. A message that is accepted but yields no
///   saga ID from [`resolve_saga_id`](Saga::resolve_saga_id) is surfaced
///   as a published fault, never silently dropped.
pub trait Saga: Send + Sync + 'static {
    /// Saga type tag; doubles as the aggregate type of its instances.
    const SAGA_TYPE: &'static str;

    /// Domain state carried between transitions.
    type State: SagaState;

    /// Whether this saga participates in the given message at all.
    fn accepts(envelope: &Envelope) -> bool;

    /// Resolve which saga instance the message belongs to.
    fn resolve_saga_id(envelope: &Envelope) -> Option<Uuid>;

    /// Decide the transition for a message in the current state.
    fn transit(state: &Self::State, envelope: &Envelope) -> Option<SagaTransition<Self::State>>;
}

/// Transition markers persisted for a saga instance.
///
/// Each carries the full next state, which is what makes recovery a plain
/// replay: the last applied marker determines the current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    bound(serialize = "S: Serialize", deserialize = "S: DeserializeOwned")
)]
pub enum SagaLifecycleEvent<S> {
    /// A saga instance came into existence at its first correlated message.
    Created {
        /// The initial state.
        state: S,
    },
    /// The saga accepted a message and moved to a new state.
    Transitioned {
        /// The full next state.
        state: S,
    },
}

/// The command a saga lane processes: one inbound bus message.
#[derive(Debug, Clone)]
pub struct SagaMessage {
    /// The message being transited.
    pub envelope: Envelope,
}

/// An aggregate wrapping one saga instance's persisted state.
#[derive(Serialize, Deserialize)]
#[serde(bound(
    serialize = "G::State: Serialize",
    deserialize = "G::State: DeserializeOwned"
))]
pub struct SagaInstance<G: Saga> {
    /// Whether a creation marker has been applied.
    pub created: bool,
    /// The saga's current domain state.
    pub state: G::State,
}

impl<G: Saga> Default for SagaInstance<G> {
    fn default() -> Self {
        Self {
            created: false,
            state: G::State::default(),
        }
    }
}

impl<G: Saga> Clone for SagaInstance<G> {
    fn clone(&self) -> Self {
        Self {
            created: self.created,
            state: self.state.clone(),
        }
    }
}

impl<G: Saga> std::fmt::Debug for SagaInstance<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaInstance")
            .field("created", &self.created)
            .field("state", &self.state)
            .finish()
    }
}

impl<G: Saga> Aggregate for SagaInstance<G> {
    const AGGREGATE_TYPE: &'static str = G::SAGA_TYPE;

    type Command = SagaMessage;
    type Event = SagaLifecycleEvent<G::State>;
    type Error = Infallible;

    fn handle(&self, cmd: Self::Command) -> Result<Vec<Emission<Self::Event>>, Self::Error> {
        // Unrecognized messages are a tolerant no-op.
        let Some(transition) = G::transit(&self.state, &cmd.envelope) else {
            return Ok(Vec::new());
        };

        let mut events = Vec::with_capacity(2);
        if !self.created {
            events.push(Emission::event(SagaLifecycleEvent::Created {
                state: G::State::default(),
            }));
        }
        events.push(Emission::event(SagaLifecycleEvent::Transitioned {
            state: transition.state,
        }));
        Ok(events)
    }

    fn apply(mut self, event: &Self::Event) -> Self {
        match event {
            SagaLifecycleEvent::Created { state } => {
                self.created = true;
                self.state = state.clone();
            }
            SagaLifecycleEvent::Transitioned { state } => {
                self.created = true;
                self.state = state.clone();
            }
        }
        self
    }
}

/// Drives one saga type: consumes the bus and applies transitions.
pub(crate) struct SagaRunner<G: Saga> {
    node: DomainNode,
    stream: BusStream,
    _marker: PhantomData<fn() -> G>,
}

impl<G: Saga> SagaRunner<G> {
    /// Build a runner, subscribing to the bus immediately so no message
    /// published after construction is missed.
    pub(crate) fn new(node: DomainNode) -> Self {
        let stream = node.subscribe();
        Self {
            node,
            stream,
            _marker: PhantomData,
        }
    }

    /// Consume the bus until it closes.
    pub(crate) async fn run(mut self) {
        while let Some(envelope) = self.stream.recv().await {
            // A saga never reacts to its own transition markers.
            if envelope.is::<SagaLifecycleEvent<G::State>>() {
                continue;
            }
            if !G::accepts(&envelope) {
                continue;
            }
            self.handle_message(envelope).await;
        }
        tracing::debug!(saga_type = G::SAGA_TYPE, "saga runner stopped, bus closed");
    }

    async fn handle_message(&self, envelope: Envelope) {
        let Some(saga_id) = G::resolve_saga_id(&envelope) else {
            self.publish_unresolved_fault(envelope).await;
            return;
        };

        let instance_id = saga_id.to_string();
        let identity = format!("{}/{instance_id}", G::SAGA_TYPE);

        let lane = match self.node.lane::<SagaInstance<G>>(&instance_id).await {
            Ok(lane) => lane,
            Err(error) => {
                tracing::error!(%error, saga_type = G::SAGA_TYPE, "saga lane unavailable");
                return;
            }
        };
        let (instance, _version) = match lane.state().await {
            Ok(state) => state,
            Err(error) => {
                tracing::error!(%error, saga_type = G::SAGA_TYPE, "saga state unavailable");
                return;
            }
        };

        let Some(transition) = G::transit(&instance.state, &envelope) else {
            tracing::trace!(
                saga_type = G::SAGA_TYPE,
                state = instance.state.state_name(),
                "message ignored in current state"
            );
            return;
        };
        let commands = transition.commands;

        // Persist the transition through the saga's serialized lane. The
        // lane re-derives the same transition from the same state.
        let command = CommandEnvelope::new(instance_id.clone(), SagaMessage {
            envelope: envelope.clone(),
        });
        let step = ProcessHistoryStep::new(&identity, WHY_SAGA_TRANSITION, WHAT_EVENT_PUBLISHED);
        let metadata = envelope.metadata.child(command.command_id, step);
        let command = command.with_metadata(metadata).with_saga_id(saga_id);

        if let Err(error) = lane.execute(command).await {
            tracing::error!(%error, saga_type = G::SAGA_TYPE, "saga transition failed to persist");
            return;
        }

        tracing::info!(
            saga_type = G::SAGA_TYPE,
            saga_id = %saga_id,
            commands = commands.len(),
            "saga transitioned"
        );

        // Only after the transition is durable do the commands go out.
        for mut dyn_command in commands {
            dyn_command.saga_id = Some(saga_id);
            dyn_command.metadata = envelope.metadata.child(
                dyn_command.command_id,
                ProcessHistoryStep::new(&identity, WHY_SAGA_TRANSITION, WHAT_COMMAND_DISPATCHED),
            );
            if let Err(error) = self.node.dispatch(dyn_command).await {
                tracing::error!(%error, saga_type = G::SAGA_TYPE, "saga command dispatch failed");
            }
        }
    }

    /// An accepted message with no resolvable saga ID is surfaced as a
    /// fault, not dropped.
    async fn publish_unresolved_fault(&self, envelope: Envelope) {
        let message_id = envelope.metadata.message_id;
        tracing::error!(
            saga_type = G::SAGA_TYPE,
            message_id = %message_id,
            "cannot resolve saga id"
        );
        let fault = Fault::from_arc(
            message_id,
            envelope.payload_arc(),
            G::SAGA_TYPE,
            format!("cannot resolve saga id for message {message_id}"),
        );
        let step =
            ProcessHistoryStep::new(G::SAGA_TYPE, WHY_SAGA_TRANSITION, WHAT_FAULT_PUBLISHED);
        let metadata = envelope.metadata.child(Uuid::new_v4(), step);
        self.node.publish(fault, metadata).await;
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterCommand};

    /// A pipeline step finished; starts/advances the deploy saga.
    #[derive(Debug, Clone)]
    pub(crate) struct StepDone {
        pub saga_id: Uuid,
    }

    /// A pipeline step failed; the saga compensates.
    #[derive(Debug, Clone)]
    pub(crate) struct StepFailed {
        pub saga_id: Uuid,
        pub reason: String,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub(crate) enum DeployPhase {
        #[default]
        Start,
        Working,
        Compensating,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct DeployState {
        pub phase: DeployPhase,
        pub failure: Option<String>,
    }

    impl SagaState for DeployState {
        fn state_name(&self) -> &'static str {
            match self.phase {
                DeployPhase::Start => "Start",
                DeployPhase::Working => "Working",
                DeployPhase::Compensating => "Compensating",
            }
        }
    }

    /// Workflow fixture: `Start --StepDone--> Working --StepFailed-->
    /// Compensating`, dispatching one counter command on the first hop.
    pub(crate) struct DeploySaga;

    impl Saga for DeploySaga {
        const SAGA_TYPE: &'static str = "deploy-saga";

        type State = DeployState;

        fn accepts(envelope: &Envelope) -> bool {
            envelope.is::<StepDone>() || envelope.is::<StepFailed>()
        }

        fn resolve_saga_id(envelope: &Envelope) -> Option<Uuid> {
            envelope
                .payload_as::<StepDone>()
                .map(|m| m.saga_id)
                .or_else(|| envelope.payload_as::<StepFailed>().map(|m| m.saga_id))
                .filter(|id| !id.is_nil())
        }

        fn transit(state: &DeployState, envelope: &Envelope) -> Option<SagaTransition<DeployState>> {
            if envelope.is::<StepDone>() {
                if state.phase != DeployPhase::Start {
                    return None;
                }
                let command = DynCommandEnvelope::encode::<Counter>(
                    "c-saga",
                    &CounterCommand::Create {
                        name: "saga".to_owned(),
                    },
                )
                .ok()?;
                return Some(
                    SagaTransition::to(DeployState {
                        phase: DeployPhase::Working,
                        failure: None,
                    })
                    .with_command(command),
                );
            }
            if let Some(failed) = envelope.payload_as::<StepFailed>() {
                if state.phase != DeployPhase::Working {
                    return None;
                }
                return Some(SagaTransition::to(DeployState {
                    phase: DeployPhase::Compensating,
                    failure: Some(failed.reason.clone()),
                }));
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use crate::aggregate::test_fixtures::Counter;
    use crate::aggregate::AggregateRoot;
    use crate::message::MessageMetadata;
    use crate::node::DomainNode;
    use std::time::Duration;

    fn envelope_of<M: std::any::Any + Send + Sync>(message: M) -> Envelope {
        Envelope::new(message, MessageMetadata::origin(Uuid::new_v4()))
    }

    #[test]
    fn fresh_instance_creates_then_transitions() {
        let instance = SagaInstance::<DeploySaga>::default();
        let saga_id = Uuid::new_v4();

        let emissions = instance
            .handle(SagaMessage {
                envelope: envelope_of(StepDone { saga_id }),
            })
            .unwrap();

        assert_eq!(emissions.len(), 2);
        assert!(matches!(
            emissions[0],
            Emission::Event(SagaLifecycleEvent::Created { .. })
        ));
        match &emissions[1] {
            Emission::Event(SagaLifecycleEvent::Transitioned { state }) => {
                assert_eq!(state.phase, DeployPhase::Working);
            }
            _ => panic!("expected a transition marker"),
        }
    }

    #[test]
    fn existing_instance_transitions_without_creation_marker() {
        let instance = SagaInstance::<DeploySaga> {
            created: true,
            state: DeployState {
                phase: DeployPhase::Working,
                failure: None,
            },
        };

        let emissions = instance
            .handle(SagaMessage {
                envelope: envelope_of(StepFailed {
                    saga_id: Uuid::new_v4(),
                    reason: "boom".to_owned(),
                }),
            })
            .unwrap();

        assert_eq!(emissions.len(), 1);
        match &emissions[0] {
            Emission::Event(SagaLifecycleEvent::Transitioned { state }) => {
                assert_eq!(state.phase, DeployPhase::Compensating);
                assert_eq!(state.failure.as_deref(), Some("boom"));
            }
            _ => panic!("expected a transition marker"),
        }
    }

    #[test]
    fn unrecognized_message_is_a_no_op() {
        let instance = SagaInstance::<DeploySaga>::default();
        // StepFailed in Start has no transition defined.
        let emissions = instance
            .handle(SagaMessage {
                envelope: envelope_of(StepFailed {
                    saga_id: Uuid::new_v4(),
                    reason: "early".to_owned(),
                }),
            })
            .unwrap();
        assert!(emissions.is_empty());
    }

    #[test]
    fn replay_of_lifecycle_events_restores_state() {
        let mut root = AggregateRoot::<SagaInstance<DeploySaga>>::new("s-1");
        root.replay(&crate::event::StreamEvent::Domain(
            SagaLifecycleEvent::Created {
                state: DeployState::default(),
            },
        ));
        root.replay(&crate::event::StreamEvent::Domain(
            SagaLifecycleEvent::Transitioned {
                state: DeployState {
                    phase: DeployPhase::Working,
                    failure: None,
                },
            },
        ));

        assert!(root.state().created);
        assert_eq!(root.state().state.phase, DeployPhase::Working);
        assert_eq!(root.state().state.state_name(), "Working");
    }

    #[test]
    fn resolve_rejects_nil_ids() {
        let env = envelope_of(StepDone {
            saga_id: Uuid::nil(),
        });
        assert!(DeploySaga::accepts(&env));
        assert_eq!(DeploySaga::resolve_saga_id(&env), None);
    }

    fn saga_node() -> DomainNode {
        DomainNode::builder()
            .aggregate_type::<Counter>()
            .saga::<DeploySaga>()
            .wait_timeout(Duration::from_secs(5))
            .open()
    }

    #[tokio::test]
    async fn step_done_creates_instance_and_dispatches_command() {
        let node = saga_node();
        let saga_id = Uuid::new_v4();
        let metadata = MessageMetadata::origin(Uuid::new_v4());
        let correlation = metadata.correlation_id;

        let wait = node
            .waiter(correlation)
            .expect_where::<SagaLifecycleEvent<DeployState>>(|e| {
                matches!(e, SagaLifecycleEvent::Created { .. })
            })
            .expect_where::<SagaLifecycleEvent<DeployState>>(|e| {
                matches!(
                    e,
                    SagaLifecycleEvent::Transitioned { state } if state.phase == DeployPhase::Working
                )
            })
            .expect::<crate::aggregate::test_fixtures::CounterEvent>()
            .start();

        node.publish(StepDone { saga_id }, metadata).await;
        let result = wait.finish().await.expect("saga flow completes");

        // The follow-up command reached the counter aggregate.
        let (counter, _) = node.state_of::<Counter>("c-saga").await.unwrap();
        assert_eq!(counter.name.as_deref(), Some("saga"));

        // The saga instance persisted in its named state.
        let (instance, version) = node
            .state_of::<SagaInstance<DeploySaga>>(&saga_id.to_string())
            .await
            .unwrap();
        assert_eq!(instance.state.state_name(), "Working");
        assert_eq!(version, 2); // created + transitioned

        // Every observed message shares the originating correlation.
        assert!(
            result
                .all
                .iter()
                .all(|env| env.metadata.correlation_id == correlation)
        );
    }

    #[tokio::test]
    async fn step_failed_compensates_and_copies_reason() {
        let node = saga_node();
        let saga_id = Uuid::new_v4();

        let start_meta = MessageMetadata::origin(Uuid::new_v4());
        let started = node
            .waiter(start_meta.correlation_id)
            .expect_where::<SagaLifecycleEvent<DeployState>>(|e| {
                matches!(e, SagaLifecycleEvent::Transitioned { .. })
            })
            .start();
        node.publish(StepDone { saga_id }, start_meta).await;
        started.finish().await.expect("saga starts");

        let fail_meta = MessageMetadata::origin(Uuid::new_v4());
        let compensating = node
            .waiter(fail_meta.correlation_id)
            .expect_where::<SagaLifecycleEvent<DeployState>>(|e| {
                matches!(
                    e,
                    SagaLifecycleEvent::Transitioned { state }
                        if state.phase == DeployPhase::Compensating
                )
            })
            .start();
        node.publish(
            StepFailed {
                saga_id,
                reason: "disk on fire".to_owned(),
            },
            fail_meta,
        )
        .await;
        compensating.finish().await.expect("saga compensates");

        let (instance, _) = node
            .state_of::<SagaInstance<DeploySaga>>(&saga_id.to_string())
            .await
            .unwrap();
        assert_eq!(instance.state.state_name(), "Compensating");
        assert_eq!(instance.state.failure.as_deref(), Some("disk on fire"));
    }

    #[tokio::test]
    async fn unresolvable_saga_id_is_surfaced_as_fault() {
        let node = saga_node();
        let metadata = MessageMetadata::origin(Uuid::new_v4());

        let wait = node
            .waiter(metadata.correlation_id)
            .expect::<Fault>()
            .start();
        node.publish(
            StepDone {
                saga_id: Uuid::nil(),
            },
            metadata,
        )
        .await;

        let result = wait.finish().await.expect("fault published");
        let fault = result.message_of::<Fault>().expect("fault payload");
        assert_eq!(fault.handler_type, "deploy-saga");
        assert!(fault.original_as::<StepDone>().is_some());
    }

    #[tokio::test]
    async fn out_of_order_message_is_tolerated() {
        let node = saga_node();
        let saga_id = Uuid::new_v4();
        let metadata = MessageMetadata::origin(Uuid::new_v4());

        let wait = node
            .waiter(metadata.correlation_id)
            .timeout(Duration::from_millis(200))
            .expect::<SagaLifecycleEvent<DeployState>>()
            .start();
        // StepFailed in Start is not a defined transition.
        node.publish(
            StepFailed {
                saga_id,
                reason: "too early".to_owned(),
            },
            metadata,
        )
        .await;

        assert!(matches!(
            wait.finish().await,
            Err(crate::error::WaitError::Timeout { .. })
        ));
    }
}
