//! Top-level entry point composing lanes, dispatch, sagas, and timers into
//! a single [`DomainNode`].
//!
//! The node is opened via [`NodeBuilder`], which registers aggregate types
//! (the explicit constructor/handler registry), sagas, and the collaborator
//! implementations (event store, message bus, timer). Lanes are spawned on
//! demand and cached; stale handles are evicted and re-spawned transparently.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::{RwLock, mpsc, oneshot};
use uuid::Uuid;

use crate::actor::{LaneConfig, LaneContext, LaneHandle, RaiseOutcome, spawn_lane};
use crate::aggregate::Aggregate;
use crate::bus::{BusStream, LocalBus, MessageBus};
use crate::command::{CommandEnvelope, ConfirmationMode, DynCommandEnvelope};
use crate::error::{ExecuteError, NodeError, StateError};
use crate::event::EventEnvelope;
use crate::message::{Envelope, MessageMetadata};
use crate::persistence::{EventStore, InMemoryEventStore};
use crate::saga::{Saga, SagaRunner};
use crate::scheduling::{ManualTimer, ScheduledTrigger, TimerService, WallclockTimer};
use crate::shard::shard_id;
use crate::waiter::{CommandWaiter, MessageWaiter};

/// Type-erased lane cache keyed by `(TypeId, instance_id)`.
///
/// `TypeId` identifies the aggregate type at runtime; the `String` is the
/// instance ID. `Box<dyn Any + Send + Sync>` lets a single map hold
/// `LaneHandle<A>` for any concrete `A`. Downcasting recovers the typed
/// handle.
type LaneCache = HashMap<(TypeId, String), Box<dyn Any + Send + Sync>>;

/// Type-erased dispatcher map keyed by aggregate type name.
type DispatcherMap = HashMap<String, Box<dyn AggregateDispatcher>>;

/// Acknowledgment returned by [`DomainNode::execute`].
///
/// Which variant is returned depends on the requested
/// [`ConfirmationMode`]; the execution itself is identical.
#[derive(Debug)]
pub enum CommandAck<A: Aggregate> {
    /// The command was handed to its lane; no outcome is awaited.
    Accepted,
    /// The handler produced this many events; persistence may still be in
    /// flight.
    Produced {
        /// Number of produced events.
        events: usize,
    },
    /// The produced events are durably persisted and published.
    Persisted {
        /// The persisted event envelopes, in confirmation order.
        events: Vec<EventEnvelope<A::Event>>,
    },
}

/// Central registry that manages aggregate instance lifecycles.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct DomainNode {
    store: Arc<dyn EventStore>,
    bus: Arc<dyn MessageBus>,
    timer: Arc<dyn TimerService>,
    manual_timer: Option<Arc<ManualTimer>>,
    lanes: Arc<RwLock<LaneCache>>,
    dispatchers: Arc<DispatcherMap>,
    registered: Arc<HashSet<String>>,
    lane_config: LaneConfig,
    shard_count: u32,
    wait_timeout: Duration,
}

// Manual `Debug` because `dyn Any` is not `Debug` and we don't want to
// expose cache internals.
impl std::fmt::Debug for DomainNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainNode")
            .field("shard_count", &self.shard_count)
            .field("registered", &self.registered)
            .finish()
    }
}

impl DomainNode {
    /// Start building a node.
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    /// The message bus this node publishes on.
    pub fn bus(&self) -> Arc<dyn MessageBus> {
        Arc::clone(&self.bus)
    }

    /// The manual timer, if the node was opened with one.
    pub fn manual_timer(&self) -> Option<Arc<ManualTimer>> {
        self.manual_timer.clone()
    }

    /// Routing bucket for an aggregate instance.
    ///
    /// Every command addressed to the same instance maps to the same shard,
    /// which is what guarantees single-lane serialized processing when the
    /// hosting cluster places lanes by shard.
    pub fn shard_of(&self, instance_id: &str) -> u32 {
        shard_id(instance_id, self.shard_count)
    }

    /// Execute a command with the requested confirmation mode.
    ///
    /// Domain rejections and persistence failures surface both ways at
    /// once: as the returned error value and as a published [`Fault`] on
    /// the bus. Nothing is thrown past this boundary.
    ///
    /// [`Fault`]: crate::Fault
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] -- the aggregate rejected the command.
    /// * [`ExecuteError::Store`] -- persistence failed.
    /// * [`ExecuteError::HandlerNotFound`] -- the aggregate type was never
    ///   registered.
    /// * [`ExecuteError::LaneClosed`] -- the lane exited mid-command.
    pub async fn execute<A: Aggregate>(
        &self,
        envelope: CommandEnvelope<A::Command>,
        mode: ConfirmationMode,
    ) -> Result<CommandAck<A>, ExecuteError<A::Error>> {
        let lane = self
            .lane::<A>(&envelope.target)
            .await
            .map_err(node_to_execute_error)?;

        match mode {
            ConfirmationMode::None => {
                // Detach: the reply receiver is dropped, the lane still
                // runs the full pipeline (including fault publication).
                let _ = lane.submit(envelope, None).await?;
                Ok(CommandAck::Accepted)
            }
            ConfirmationMode::Produced => {
                let (produced_tx, produced_rx) = oneshot::channel();
                let reply = lane.submit(envelope, Some(produced_tx)).await?;
                match produced_rx.await {
                    Ok(events) => Ok(CommandAck::Produced { events }),
                    // The handler failed before producing; recover the
                    // typed error from the final reply.
                    Err(_) => match reply.await {
                        Ok(Ok(events)) => Ok(CommandAck::Produced {
                            events: events.len(),
                        }),
                        Ok(Err(error)) => Err(error),
                        Err(_) => Err(ExecuteError::LaneClosed),
                    },
                }
            }
            ConfirmationMode::Persisted => {
                let reply = lane.submit(envelope, None).await?;
                let events = reply.await.map_err(|_| ExecuteError::LaneClosed)??;
                Ok(CommandAck::Persisted { events })
            }
        }
    }

    /// Read a clone of an aggregate's current state and version.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError`] if the type is unregistered or the lane
    /// cannot be spawned; [`StateError`] is folded into
    /// [`NodeError::LaneClosed`].
    pub async fn state_of<A: Aggregate>(&self, instance_id: &str) -> Result<(A, u64), NodeError> {
        let lane = self.lane::<A>(instance_id).await?;
        lane.state()
            .await
            .map_err(|_: StateError| NodeError::LaneClosed)
    }

    /// Build a waiter for a command: subscribe, send, wait for the
    /// expected messages of the same correlation.
    pub fn prepare<A: Aggregate>(
        &self,
        envelope: CommandEnvelope<A::Command>,
    ) -> CommandWaiter<A> {
        CommandWaiter::new(self.clone(), envelope, self.wait_timeout)
    }

    /// Build a free-standing waiter scoped to a correlation ID.
    pub fn waiter(&self, correlation_id: Uuid) -> MessageWaiter {
        MessageWaiter::new(Arc::clone(&self.bus), correlation_id, self.wait_timeout)
    }

    /// Publish an arbitrary message on the node's bus.
    ///
    /// This is how external events enter saga processing.
    pub async fn publish<M: Any + Send + Sync>(&self, message: M, metadata: MessageMetadata) {
        self.bus.publish(Envelope::new(message, metadata)).await;
    }

    /// Subscribe to the node's bus.
    pub fn subscribe(&self) -> BusStream {
        self.bus.subscribe()
    }

    /// Dispatch a type-erased command envelope to its target aggregate.
    ///
    /// Used by sagas and other components that do not know the target's
    /// concrete types. A domain rejection is not an `Err` here: the fault
    /// is already published and the dispatch is complete.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::HandlerNotFound`] for an unknown aggregate
    /// type, [`NodeError::DispatchFailed`] for payload or persistence
    /// failures.
    pub async fn dispatch(&self, envelope: DynCommandEnvelope) -> Result<(), NodeError> {
        let dispatcher =
            self.dispatchers
                .get(&envelope.aggregate_type)
                .ok_or_else(|| NodeError::HandlerNotFound {
                    aggregate_type: envelope.aggregate_type.clone(),
                })?;
        dispatcher.dispatch(self, envelope).await
    }

    /// Raise a scheduled event identified by a timer trigger.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::HandlerNotFound`] for an unknown aggregate
    /// type, [`NodeError::DispatchFailed`] if the raise fails.
    pub async fn raise_scheduled(
        &self,
        trigger: &ScheduledTrigger,
    ) -> Result<RaiseOutcome, NodeError> {
        let dispatcher = self
            .dispatchers
            .get(&trigger.aggregate_type)
            .ok_or_else(|| NodeError::HandlerNotFound {
                aggregate_type: trigger.aggregate_type.clone(),
            })?;
        dispatcher
            .raise(self, &trigger.instance_id, trigger.future_event_id)
            .await
    }

    /// Get a lane handle for an aggregate instance, spawning it if needed.
    ///
    /// If the lane is already running (cached and alive), returns a clone
    /// of the existing handle.
    pub(crate) async fn lane<A: Aggregate>(
        &self,
        instance_id: &str,
    ) -> Result<LaneHandle<A>, NodeError> {
        if !self.registered.contains(A::AGGREGATE_TYPE) {
            return Err(NodeError::HandlerNotFound {
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            });
        }

        let key = (TypeId::of::<A>(), instance_id.to_owned());

        // Fast path: check cache with read lock.
        {
            let lanes = self.lanes.read().await;
            if let Some(boxed) = lanes.get(&key)
                && let Some(handle) = boxed.downcast_ref::<LaneHandle<A>>()
                && handle.is_alive()
            {
                return Ok(handle.clone());
            }
        }

        // Slow path: evict any stale entry and spawn a fresh lane.
        {
            let mut lanes = self.lanes.write().await;
            lanes.remove(&key);
        }

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            instance_id = %instance_id,
            "spawning lane"
        );

        let ctx = LaneContext {
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            timer: Arc::clone(&self.timer),
        };
        let handle = spawn_lane::<A>(instance_id, ctx, self.lane_config.clone()).await?;

        let mut lanes = self.lanes.write().await;
        lanes.insert(key, Box::new(handle.clone()));
        Ok(handle)
    }
}

fn node_to_execute_error<E: std::error::Error + Send + Sync + 'static>(
    error: NodeError,
) -> ExecuteError<E> {
    match error {
        NodeError::HandlerNotFound { aggregate_type } => {
            ExecuteError::HandlerNotFound(aggregate_type)
        }
        NodeError::Store(store) => ExecuteError::Store(store),
        NodeError::LaneClosed | NodeError::DispatchFailed(_) => ExecuteError::LaneClosed,
    }
}

// --- Type-erased dispatch ---

/// Type-erased interface for routing work to an aggregate type.
///
/// Each concrete `TypedDispatcher<A>` implements this trait, deserializing
/// JSON command payloads into `A::Command` and driving the typed lane.
#[async_trait]
trait AggregateDispatcher: Send + Sync {
    /// Dispatch a command envelope to the target aggregate.
    async fn dispatch(&self, node: &DomainNode, envelope: DynCommandEnvelope)
    -> Result<(), NodeError>;

    /// Raise a scheduled event on the target aggregate.
    async fn raise(
        &self,
        node: &DomainNode,
        instance_id: &str,
        future_event_id: Uuid,
    ) -> Result<RaiseOutcome, NodeError>;
}

/// Concrete dispatcher for a specific aggregate type `A`.
struct TypedDispatcher<A: Aggregate> {
    _marker: std::marker::PhantomData<fn() -> A>,
}

impl<A: Aggregate> TypedDispatcher<A> {
    fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<A> AggregateDispatcher for TypedDispatcher<A>
where
    A: Aggregate,
    A::Command: DeserializeOwned,
{
    async fn dispatch(
        &self,
        node: &DomainNode,
        envelope: DynCommandEnvelope,
    ) -> Result<(), NodeError> {
        let typed = envelope
            .decode::<A>()
            .map_err(|e| NodeError::DispatchFailed(format!("command deserialization: {e}")))?;
        let lane = node.lane::<A>(&typed.target).await?;
        match lane.execute(typed).await {
            Ok(_) => Ok(()),
            // The rejection is already on the bus as a fault; the dispatch
            // itself did its job.
            Err(ExecuteError::Domain(error)) => {
                tracing::info!(%error, "dispatched command rejected by aggregate");
                Ok(())
            }
            Err(ExecuteError::LaneClosed) => Err(NodeError::LaneClosed),
            Err(error) => Err(NodeError::DispatchFailed(error.to_string())),
        }
    }

    async fn raise(
        &self,
        node: &DomainNode,
        instance_id: &str,
        future_event_id: Uuid,
    ) -> Result<RaiseOutcome, NodeError> {
        let lane = node.lane::<A>(instance_id).await?;
        let metadata = MessageMetadata::origin(Uuid::new_v4());
        lane.raise_scheduled(future_event_id, Uuid::new_v4(), metadata)
            .await
            .map_err(|error| match error {
                ExecuteError::LaneClosed => NodeError::LaneClosed,
                other => NodeError::DispatchFailed(other.to_string()),
            })
    }
}

// --- Builder ---

/// Factory for creating a type-erased aggregate dispatcher.
type DispatcherFactory = Box<dyn FnOnce() -> Box<dyn AggregateDispatcher>>;

/// Factory that starts a saga runner against the opened node.
type SagaStarter = Box<dyn FnOnce(&DomainNode)>;

/// Builder for configuring and opening a [`DomainNode`].
///
/// # Examples
///
/// ```no_run
/// use gridlane::DomainNode;
/// # use gridlane::Aggregate;
/// # fn demo<Counter: Aggregate>() where Counter::Command: serde::de::DeserializeOwned {
/// let node = DomainNode::builder()
///     .shard_count(100)
///     .aggregate_type::<Counter>()
///     .open();
/// # }
/// ```
pub struct NodeBuilder {
    store: Option<Arc<dyn EventStore>>,
    bus: Option<Arc<dyn MessageBus>>,
    dispatcher_factories: Vec<(String, DispatcherFactory)>,
    saga_starters: Vec<(String, SagaStarter)>,
    lane_config: LaneConfig,
    shard_count: u32,
    wait_timeout: Duration,
    use_manual_timer: bool,
}

/// Default number of routing shards.
const DEFAULT_SHARD_COUNT: u32 = 100;

/// Default hard deadline for waiters.
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

impl NodeBuilder {
    /// A builder with defaults: in-memory store, local bus, wall-clock
    /// timer, 100 shards.
    pub fn new() -> Self {
        Self {
            store: None,
            bus: None,
            dispatcher_factories: Vec::new(),
            saga_starters: Vec::new(),
            lane_config: LaneConfig::default(),
            shard_count: DEFAULT_SHARD_COUNT,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            use_manual_timer: false,
        }
    }

    /// Use a specific event store implementation.
    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a specific message bus implementation.
    pub fn message_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Register an aggregate type.
    ///
    /// Registration is what makes the type routable: it enters the
    /// constructor registry (lanes start from `A::default()`) and the
    /// dispatcher registry (type-erased envelopes and timer raises find
    /// their way to the typed lane).
    pub fn aggregate_type<A>(mut self) -> Self
    where
        A: Aggregate,
        A::Command: DeserializeOwned,
    {
        self.dispatcher_factories.push((
            A::AGGREGATE_TYPE.to_owned(),
            Box::new(|| Box::new(TypedDispatcher::<A>::new()) as Box<dyn AggregateDispatcher>),
        ));
        self
    }

    /// Register a saga type; its runner starts when the node opens.
    pub fn saga<G: Saga>(mut self) -> Self {
        self.saga_starters.push((
            G::SAGA_TYPE.to_owned(),
            Box::new(|node: &DomainNode| {
                let runner = SagaRunner::<G>::new(node.clone());
                tokio::spawn(runner.run());
            }),
        ));
        self
    }

    /// Set the number of routing shards (see [`shard_id`]).
    pub fn shard_count(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count;
        self
    }

    /// Set the idle timeout after which lanes snapshot and shut down.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.lane_config.idle_timeout = timeout;
        self
    }

    /// Set the lane mailbox capacity.
    pub fn lane_capacity(mut self, capacity: usize) -> Self {
        self.lane_config.channel_capacity = capacity;
        self
    }

    /// Set the default hard deadline for waiters.
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Replace the wall-clock timer with a manually fired one.
    ///
    /// The timer is reachable via [`DomainNode::manual_timer`]; schedules
    /// fire only when the test fires them.
    pub fn manual_timer(mut self) -> Self {
        self.use_manual_timer = true;
        self
    }

    /// Open the node: build registries, start the timer pump and saga
    /// runners.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(self) -> DomainNode {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryEventStore::new()));
        let bus = self.bus.unwrap_or_else(|| Arc::new(LocalBus::default()));

        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<ScheduledTrigger>();
        let mut manual_timer = None;
        let timer: Arc<dyn TimerService> = if self.use_manual_timer {
            let timer = Arc::new(ManualTimer::new(trigger_tx));
            manual_timer = Some(Arc::clone(&timer));
            timer
        } else {
            Arc::new(WallclockTimer::new(trigger_tx))
        };

        let mut dispatchers: DispatcherMap = HashMap::new();
        let mut registered: HashSet<String> = HashSet::new();
        for (aggregate_type, factory) in self.dispatcher_factories {
            registered.insert(aggregate_type.clone());
            dispatchers.insert(aggregate_type, factory());
        }
        for (saga_type, _) in &self.saga_starters {
            // Saga instances persist through ordinary lanes but accept no
            // external dispatch.
            registered.insert(saga_type.clone());
        }

        let node = DomainNode {
            store,
            bus,
            timer,
            manual_timer,
            lanes: Arc::new(RwLock::new(HashMap::new())),
            dispatchers: Arc::new(dispatchers),
            registered: Arc::new(registered),
            lane_config: self.lane_config,
            shard_count: self.shard_count,
            wait_timeout: self.wait_timeout,
        };

        // Timer pump: triggers flow back in as raises.
        let pump_node = node.clone();
        tokio::spawn(async move {
            while let Some(trigger) = trigger_rx.recv().await {
                match pump_node.raise_scheduled(&trigger).await {
                    Ok(RaiseOutcome::Raised) => {
                        tracing::info!(
                            aggregate_type = %trigger.aggregate_type,
                            instance_id = %trigger.instance_id,
                            future_event_id = %trigger.future_event_id,
                            "scheduled event raised"
                        );
                    }
                    Ok(RaiseOutcome::AlreadyGone) => {
                        tracing::debug!(
                            future_event_id = %trigger.future_event_id,
                            "duplicate or late trigger ignored"
                        );
                    }
                    Err(error) => {
                        tracing::warn!(%error, "scheduled raise failed");
                    }
                }
            }
        });

        for (_, starter) in self.saga_starters {
            starter(&node);
        }

        node
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
