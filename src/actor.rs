//! Lane task that owns an aggregate and processes its messages serially.
//!
//! Each aggregate instance is driven by exactly one lane: a tokio task that
//! exclusively owns the [`AggregateRoot`] and sequentially processes
//! messages from an `mpsc` channel. The lane performs the full pipeline for
//! every command -- handle, buffer, persist, confirm, publish -- so at most
//! one message touches an instance's state at any time.
//!
//! Public API: [`RaiseOutcome`]. Lanes themselves are spawned and cached by
//! [`DomainNode`](crate::DomainNode).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;
use uuid::Uuid;

use crate::aggregate::{Aggregate, AggregateRoot, AggregateSnapshot};
use crate::bus::MessageBus;
use crate::command::CommandEnvelope;
use crate::error::{ExecuteError, StateError};
use crate::event::{EventEnvelope, StreamEvent, decode_recorded, encode_envelope, stream_uuid};
use crate::message::{
    Envelope, Fault, MessageMetadata, ProcessHistoryStep, WHAT_EVENT_PUBLISHED,
    WHAT_FAULT_PUBLISHED, WHY_COMMAND_EXECUTION, WHY_SCHEDULED_RAISE,
};
use crate::persistence::{EventStore, ExpectedVersion, SnapshotRecord};
use crate::scheduling::{
    FutureEventCanceled, FutureEventOccurred, FutureEventScheduled, ScheduledTrigger, TimerService,
};

/// Result of asking a lane to raise a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaiseOutcome {
    /// The inner event and its occurred marker were persisted.
    Raised,
    /// The schedule already fired or was cancelled; nothing changed.
    ///
    /// Timers deliver at least once, so this outcome is routine.
    AlreadyGone,
}

/// Configuration for a lane task.
#[derive(Debug, Clone)]
pub(crate) struct LaneConfig {
    /// Mailbox capacity before senders are backpressured.
    pub channel_capacity: usize,
    /// How long the lane waits for a message before snapshotting and
    /// shutting down. The next access transparently re-spawns it.
    pub idle_timeout: Duration,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Collaborators a lane needs to run the pipeline.
#[derive(Clone)]
pub(crate) struct LaneContext {
    pub store: Arc<dyn EventStore>,
    pub bus: Arc<dyn MessageBus>,
    pub timer: Arc<dyn TimerService>,
}

/// Result type sent back through the `Execute` reply channel.
type ExecuteReply<A> = Result<
    Vec<EventEnvelope<<A as Aggregate>::Event>>,
    ExecuteError<<A as Aggregate>::Error>,
>;

/// Messages sent from [`LaneHandle`] to the lane task.
pub(crate) enum LaneMessage<A: Aggregate> {
    /// Execute a command against the aggregate.
    Execute {
        envelope: CommandEnvelope<A::Command>,
        /// Acked with the produced event count before persistence starts.
        produced: Option<oneshot::Sender<usize>>,
        reply: oneshot::Sender<ExecuteReply<A>>,
    },
    /// Retrieve a clone of the current state and version.
    GetState {
        reply: oneshot::Sender<(A, u64)>,
    },
    /// Raise a previously scheduled event.
    RaiseScheduled {
        future_event_id: Uuid,
        occurred_id: Uuid,
        metadata: MessageMetadata,
        reply: oneshot::Sender<Result<RaiseOutcome, ExecuteError<A::Error>>>,
    },
    /// Cancel every pending schedule matching the predicate.
    CancelScheduled {
        predicate: Box<dyn Fn(&A::Event) -> bool + Send>,
        metadata: MessageMetadata,
        reply: oneshot::Sender<Result<usize, ExecuteError<A::Error>>>,
    },
}

/// Async handle to a running lane.
///
/// Lightweight and `Send + Sync`; communicates with the lane task over a
/// bounded channel.
#[derive(Debug)]
pub(crate) struct LaneHandle<A: Aggregate> {
    sender: mpsc::Sender<LaneMessage<A>>,
}

// Manual `Clone` because `A` itself need not be `Clone` for the handle --
// we only clone the `Sender`.
impl<A: Aggregate> Clone for LaneHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<A: Aggregate> LaneHandle<A> {
    /// Submit a command and return the receiver for its final reply.
    ///
    /// Splitting submission from awaiting lets callers choose what to wait
    /// for (see [`ConfirmationMode`](crate::ConfirmationMode)): dropping
    /// the returned receiver detaches from the outcome without cancelling
    /// the execution.
    pub(crate) async fn submit(
        &self,
        envelope: CommandEnvelope<A::Command>,
        produced: Option<oneshot::Sender<usize>>,
    ) -> Result<oneshot::Receiver<ExecuteReply<A>>, ExecuteError<A::Error>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LaneMessage::Execute {
                envelope,
                produced,
                reply: tx,
            })
            .await
            .map_err(|_| ExecuteError::LaneClosed)?;
        Ok(rx)
    }

    /// Execute a command and wait for its persistence confirmation.
    pub(crate) async fn execute(
        &self,
        envelope: CommandEnvelope<A::Command>,
    ) -> ExecuteReply<A> {
        let rx = self.submit(envelope, None).await?;
        rx.await.map_err(|_| ExecuteError::LaneClosed)?
    }

    /// Read a clone of the current state and version.
    pub(crate) async fn state(&self) -> Result<(A, u64), StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LaneMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::LaneClosed)?;
        rx.await.map_err(|_| StateError::LaneClosed)
    }

    /// Raise a previously scheduled event.
    pub(crate) async fn raise_scheduled(
        &self,
        future_event_id: Uuid,
        occurred_id: Uuid,
        metadata: MessageMetadata,
    ) -> Result<RaiseOutcome, ExecuteError<A::Error>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LaneMessage::RaiseScheduled {
                future_event_id,
                occurred_id,
                metadata,
                reply: tx,
            })
            .await
            .map_err(|_| ExecuteError::LaneClosed)?;
        rx.await.map_err(|_| ExecuteError::LaneClosed)?
    }

    /// Cancel pending schedules matching the predicate; returns how many
    /// were cancelled.
    pub(crate) async fn cancel_scheduled(
        &self,
        predicate: impl Fn(&A::Event) -> bool + Send + 'static,
        metadata: MessageMetadata,
    ) -> Result<usize, ExecuteError<A::Error>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LaneMessage::CancelScheduled {
                predicate: Box::new(predicate),
                metadata,
                reply: tx,
            })
            .await
            .map_err(|_| ExecuteError::LaneClosed)?;
        rx.await.map_err(|_| ExecuteError::LaneClosed)?
    }

    /// Check whether the lane backing this handle is still running.
    ///
    /// The node uses this to evict stale handles from its cache and
    /// re-spawn the lane on the next access.
    pub(crate) fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Spawn a lane for the given instance, recovering state from the store.
///
/// Recovery loads the latest snapshot (if any), then replays the remaining
/// events through the same transition function used by live confirmation.
pub(crate) async fn spawn_lane<A: Aggregate>(
    id: &str,
    ctx: LaneContext,
    config: LaneConfig,
) -> Result<LaneHandle<A>, crate::persistence::StoreError> {
    let stream_id = stream_uuid(A::AGGREGATE_TYPE, id);

    let mut root = AggregateRoot::<A>::new(id);
    if let Some(snapshot) = ctx.store.load_snapshot(stream_id).await? {
        match serde_json::from_value::<AggregateSnapshot<A>>(snapshot.state) {
            Ok(state) => root = AggregateRoot::restore(id, state),
            Err(error) => tracing::warn!(
                aggregate_type = A::AGGREGATE_TYPE,
                instance_id = %id,
                %error,
                "undecodable snapshot, replaying from scratch"
            ),
        }
    }

    let records = ctx.store.load(stream_id).await?;
    for record in records.iter().skip(root.version() as usize) {
        match decode_recorded::<A::Event>(record) {
            Ok(event) => root.replay(&event),
            Err(error) => {
                tracing::warn!(
                    event_type = %record.event_type,
                    %error,
                    "skipping undecodable event during replay"
                );
                root.replay_skipped();
            }
        }
    }

    let (tx, rx) = mpsc::channel(config.channel_capacity);
    tokio::spawn(run_lane::<A>(root, ctx, rx, config));
    Ok(LaneHandle { sender: tx })
}

/// Runs the lane loop: receive, process, reply, until shutdown or idle.
async fn run_lane<A: Aggregate>(
    mut root: AggregateRoot<A>,
    ctx: LaneContext,
    mut rx: mpsc::Receiver<LaneMessage<A>>,
    config: LaneConfig,
) {
    loop {
        let msg = tokio::time::timeout(config.idle_timeout, rx.recv()).await;
        match msg {
            Ok(Some(LaneMessage::Execute {
                envelope,
                produced,
                reply,
            })) => {
                let span = tracing::info_span!(
                    "execute",
                    aggregate_type = A::AGGREGATE_TYPE,
                    instance_id = %root.id()
                );
                let result = execute_command(&mut root, &ctx, envelope, produced)
                    .instrument(span)
                    .await;
                // If the receiver was dropped, the caller no longer cares
                // about the result. Silently discard it.
                let _ = reply.send(result);
            }

            Ok(Some(LaneMessage::GetState { reply })) => {
                let _ = reply.send((root.state().clone(), root.version()));
            }

            Ok(Some(LaneMessage::RaiseScheduled {
                future_event_id,
                occurred_id,
                metadata,
                reply,
            })) => {
                let result =
                    raise_scheduled(&mut root, &ctx, future_event_id, occurred_id, metadata).await;
                let _ = reply.send(result);
            }

            Ok(Some(LaneMessage::CancelScheduled {
                predicate,
                metadata,
                reply,
            })) => {
                let result = cancel_scheduled(&mut root, &ctx, predicate, metadata).await;
                let _ = reply.send(result);
            }

            // Channel closed: all senders dropped.
            Ok(None) => break,

            // Idle timeout elapsed with no messages.
            Err(_elapsed) => {
                tracing::info!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    instance_id = %root.id(),
                    "lane idle, shutting down"
                );
                break;
            }
        }
    }

    save_snapshot_if_clean(&root, &ctx).await;
}

/// Persist a snapshot on lane shutdown if the root is clean.
async fn save_snapshot_if_clean<A: Aggregate>(root: &AggregateRoot<A>, ctx: &LaneContext) {
    let Some(snapshot) = root.snapshot() else {
        return;
    };
    if snapshot.version == 0 {
        return;
    }
    let stream_id = stream_uuid(A::AGGREGATE_TYPE, root.id());
    let state = match serde_json::to_value(&snapshot) {
        Ok(state) => state,
        Err(error) => {
            tracing::warn!(%error, "snapshot serialization failed, skipping");
            return;
        }
    };
    let record = SnapshotRecord {
        stream_id,
        version: snapshot.version,
        state,
    };
    if let Err(error) = ctx.store.save_snapshot(record).await {
        tracing::warn!(%error, "snapshot save failed");
    }
}

/// The lane's identity as recorded in message history (`who`).
fn lane_identity<A: Aggregate>(instance_id: &str) -> String {
    format!("{}/{instance_id}", A::AGGREGATE_TYPE)
}

/// Execute a single command: handle, expand, persist, confirm, publish.
async fn execute_command<A: Aggregate>(
    root: &mut AggregateRoot<A>,
    ctx: &LaneContext,
    envelope: CommandEnvelope<A::Command>,
    produced: Option<oneshot::Sender<usize>>,
) -> ExecuteReply<A> {
    let CommandEnvelope {
        command_id,
        target: _,
        payload,
        metadata,
        saga_id,
    } = envelope;
    let identity = lane_identity::<A>(root.id());

    // 1. Decide: run the command handler against current state.
    let emissions = match root.state().handle(payload.clone()) {
        Ok(emissions) => emissions,
        Err(error) => {
            let reason = error.to_string();
            tracing::info!(%command_id, %reason, "command rejected");
            publish_fault(ctx, command_id, payload, saga_id, &metadata, &identity, reason).await;
            return Err(ExecuteError::Domain(error));
        }
    };

    // 2. Expand emissions against the current schedule table.
    let stream_events = root.expand_emissions(emissions);

    // The produced acknowledgment fires before persistence starts.
    if let Some(tx) = produced {
        let _ = tx.send(stream_events.len());
    }

    // 3. No-op commands produce no events.
    if stream_events.is_empty() {
        return Ok(Vec::new());
    }

    // 4. Envelope each event with one causal hop and run the batch through
    //    persistence confirmation.
    let envelopes: Vec<EventEnvelope<A::Event>> = stream_events
        .into_iter()
        .map(|event| {
            let event_id = Uuid::new_v4();
            let step =
                ProcessHistoryStep::new(&identity, WHY_COMMAND_EXECUTION, WHAT_EVENT_PUBLISHED);
            EventEnvelope::new(root.id(), event, metadata.child(event_id, step))
                .with_saga_id(saga_id)
        })
        .collect();

    match persist_and_publish(root, ctx, envelopes).await {
        Ok(batch) => Ok(batch),
        Err(error) => {
            let reason = error.to_string();
            tracing::error!(%command_id, %reason, "command persistence failed");
            publish_fault(ctx, command_id, payload, saga_id, &metadata, &identity, reason).await;
            Err(error)
        }
    }
}

/// Buffer, persist, confirm, and publish one batch of envelopes.
///
/// State becomes observable only after the store confirms the append:
/// each envelope is applied via `mark_persisted` in buffered order, then
/// published. On append failure the buffered envelopes are dropped and
/// state is left untouched.
async fn persist_and_publish<A: Aggregate>(
    root: &mut AggregateRoot<A>,
    ctx: &LaneContext,
    batch: Vec<EventEnvelope<A::Event>>,
) -> ExecuteReply<A> {
    if batch.is_empty() {
        return Ok(batch);
    }

    let stream_id = stream_uuid(A::AGGREGATE_TYPE, root.id());
    let expected = ExpectedVersion::Exact(root.version());

    let mut records = Vec::with_capacity(batch.len());
    for envelope in &batch {
        records.push(
            encode_envelope(stream_id, envelope)
                .map_err(|e| ExecuteError::Codec(e.to_string()))?,
        );
    }

    for envelope in &batch {
        root.stage(envelope.clone());
    }

    // The append is the only suspension point of a command's completion.
    root.begin_emit();
    let appended = ctx.store.append(stream_id, expected, records).await;
    root.end_emit();

    if let Err(error) = appended {
        // These events will never confirm; drop them so state stays
        // consistent and the lane remains usable.
        for envelope in &batch {
            root.unstage(envelope.event_id);
        }
        return Err(error.into());
    }

    for envelope in &batch {
        root.mark_persisted(envelope.event_id)?;
    }

    tracing::info!(count = batch.len(), "events persisted");

    // Register timers for newly persisted schedules.
    for envelope in &batch {
        if let StreamEvent::FutureEventScheduled(record) = &envelope.event {
            ctx.timer.register(ScheduledTrigger {
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                instance_id: root.id().to_owned(),
                future_event_id: record.future_event_id,
                raise_at: record.raise_at,
            });
        }
    }

    // Publish only after persistence has confirmed.
    for envelope in &batch {
        ctx.bus.publish(publishable::<A>(envelope)).await;
    }

    Ok(batch)
}

/// Raise a previously scheduled event.
///
/// The inner event is persisted and confirmed first; only then is the
/// occurred marker emitted, so a recovering aggregate can never observe
/// the marker without having applied the inner event.
async fn raise_scheduled<A: Aggregate>(
    root: &mut AggregateRoot<A>,
    ctx: &LaneContext,
    future_event_id: Uuid,
    occurred_id: Uuid,
    metadata: MessageMetadata,
) -> Result<RaiseOutcome, ExecuteError<A::Error>> {
    let record = match root.scheduled(future_event_id) {
        Ok(record) => record.clone(),
        Err(_) => {
            tracing::debug!(
                %future_event_id,
                "schedule not found, treating raise as duplicate"
            );
            return Ok(RaiseOutcome::AlreadyGone);
        }
    };

    let identity = lane_identity::<A>(root.id());

    let inner_id = Uuid::new_v4();
    let inner_step = ProcessHistoryStep::new(&identity, WHY_SCHEDULED_RAISE, WHAT_EVENT_PUBLISHED);
    let inner = EventEnvelope::new(
        root.id(),
        StreamEvent::Domain(record.inner),
        metadata.child(inner_id, inner_step),
    );
    persist_and_publish(root, ctx, vec![inner]).await?;

    let occurred_step =
        ProcessHistoryStep::new(&identity, WHY_SCHEDULED_RAISE, WHAT_EVENT_PUBLISHED);
    let occurred = EventEnvelope::new(
        root.id(),
        StreamEvent::FutureEventOccurred { future_event_id },
        metadata.child(occurred_id, occurred_step),
    );
    persist_and_publish(root, ctx, vec![occurred]).await?;

    Ok(RaiseOutcome::Raised)
}

/// Cancel every pending schedule matching the predicate.
async fn cancel_scheduled<A: Aggregate>(
    root: &mut AggregateRoot<A>,
    ctx: &LaneContext,
    predicate: Box<dyn Fn(&A::Event) -> bool + Send>,
    metadata: MessageMetadata,
) -> Result<usize, ExecuteError<A::Error>> {
    let matched = root.cancel_matching(|event| predicate(event));
    if matched.is_empty() {
        return Ok(0);
    }

    let identity = lane_identity::<A>(root.id());
    let batch: Vec<EventEnvelope<A::Event>> = matched
        .iter()
        .map(|&future_event_id| {
            let step =
                ProcessHistoryStep::new(&identity, WHY_COMMAND_EXECUTION, WHAT_EVENT_PUBLISHED);
            EventEnvelope::new(
                root.id(),
                StreamEvent::FutureEventCanceled { future_event_id },
                metadata.child(Uuid::new_v4(), step),
            )
        })
        .collect();

    persist_and_publish(root, ctx, batch).await?;
    Ok(matched.len())
}

/// Convert a persisted envelope into its published bus form.
///
/// Domain events are published as their typed value; the scheduling
/// bookkeeping is published as non-generic marker messages.
fn publishable<A: Aggregate>(envelope: &EventEnvelope<A::Event>) -> Envelope {
    match &envelope.event {
        StreamEvent::Domain(event) => Envelope::new(event.clone(), envelope.metadata.clone()),
        StreamEvent::FutureEventScheduled(record) => Envelope::new(
            FutureEventScheduled {
                future_event_id: record.future_event_id,
                source_id: envelope.source_id.clone(),
                raise_at: record.raise_at,
            },
            envelope.metadata.clone(),
        ),
        StreamEvent::FutureEventOccurred { future_event_id } => Envelope::new(
            FutureEventOccurred {
                future_event_id: *future_event_id,
                source_id: envelope.source_id.clone(),
            },
            envelope.metadata.clone(),
        ),
        StreamEvent::FutureEventCanceled { future_event_id } => Envelope::new(
            FutureEventCanceled {
                future_event_id: *future_event_id,
                source_id: envelope.source_id.clone(),
            },
            envelope.metadata.clone(),
        ),
    }
}

/// Publish a fault for a failed command.
async fn publish_fault<C: std::any::Any + Send + Sync>(
    ctx: &LaneContext,
    command_id: Uuid,
    original: C,
    saga_id: Option<Uuid>,
    metadata: &MessageMetadata,
    identity: &str,
    reason: String,
) {
    let mut fault = Fault::new(command_id, original, identity, reason);
    if let Some(saga_id) = saga_id {
        fault = fault.with_saga_id(saga_id);
    }
    let fault_id = Uuid::new_v4();
    let step = ProcessHistoryStep::new(identity, WHY_COMMAND_EXECUTION, WHAT_FAULT_PUBLISHED);
    ctx.bus
        .publish(Envelope::new(fault, metadata.child(fault_id, step)))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterCommand, CounterEvent};
    use crate::bus::LocalBus;
    use crate::persistence::{FailingStore, InMemoryEventStore};
    use crate::scheduling::ManualTimer;
    use chrono::Utc;

    struct Harness {
        ctx: LaneContext,
        store: Arc<InMemoryEventStore>,
        bus: LocalBus,
        timer: Arc<ManualTimer>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = LocalBus::default();
        let (trigger_tx, _trigger_rx) = mpsc::unbounded_channel();
        let timer = Arc::new(ManualTimer::new(trigger_tx));
        let ctx = LaneContext {
            store: store.clone(),
            bus: Arc::new(bus.clone()),
            timer: timer.clone(),
        };
        Harness {
            ctx,
            store,
            bus,
            timer,
        }
    }

    async fn spawn(h: &Harness, id: &str) -> LaneHandle<Counter> {
        spawn_lane::<Counter>(id, h.ctx.clone(), LaneConfig::default())
            .await
            .expect("spawn should succeed")
    }

    fn create(name: &str) -> CommandEnvelope<CounterCommand> {
        CommandEnvelope::new(
            "c-1",
            CounterCommand::Create {
                name: name.to_owned(),
            },
        )
    }

    #[tokio::test]
    async fn execute_persists_applies_and_publishes() {
        let h = harness();
        let mut stream = h.bus.subscribe();
        let lane = spawn(&h, "c-1").await;

        let envelope = create("X");
        let command_id = envelope.command_id;
        let correlation = envelope.correlation_id();

        let batch = lane.execute(envelope).await.expect("execute should succeed");
        assert_eq!(batch.len(), 1);

        let (state, version) = lane.state().await.unwrap();
        assert_eq!(state.name.as_deref(), Some("X"));
        assert_eq!(version, 1);

        let stream_id = stream_uuid("counter", "c-1");
        assert_eq!(h.store.event_types(stream_id).await, ["Created"]);

        // Published after persistence, with one causal hop recorded.
        let published = stream.recv().await.expect("published event");
        let event = published.payload_as::<CounterEvent>().expect("typed event");
        assert!(matches!(event, CounterEvent::Created { name } if name == "X"));
        assert_eq!(published.metadata.causation_id, command_id);
        assert_eq!(published.metadata.correlation_id, correlation);
        assert_eq!(published.metadata.history.len(), 1);
        assert_eq!(published.metadata.history[0].who, "counter/c-1");
        assert_eq!(published.metadata.history[0].why, WHY_COMMAND_EXECUTION);
    }

    #[tokio::test]
    async fn rejected_command_publishes_fault_and_leaves_state() {
        let h = harness();
        let lane = spawn(&h, "c-1").await;
        lane.execute(create("X")).await.unwrap();

        let mut stream = h.bus.subscribe();
        let second = create("Y");
        let second_id = second.command_id;

        let err = lane.execute(second).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Domain(_)));

        let published = stream.recv().await.expect("fault envelope");
        let fault = published.payload_as::<Fault>().expect("fault payload");
        assert_eq!(fault.message_id, second_id);
        assert_eq!(fault.handler_type, "counter/c-1");
        assert!(fault.original_as::<CounterCommand>().is_some());

        let (state, version) = lane.state().await.unwrap();
        assert_eq!(state.name.as_deref(), Some("X"));
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn store_failure_faults_and_keeps_state_consistent() {
        let store = Arc::new(FailingStore::new());
        let bus = LocalBus::default();
        let (trigger_tx, _trigger_rx) = mpsc::unbounded_channel();
        let ctx = LaneContext {
            store: store.clone(),
            bus: Arc::new(bus.clone()),
            timer: Arc::new(ManualTimer::new(trigger_tx)),
        };
        let lane = spawn_lane::<Counter>("c-1", ctx, LaneConfig::default())
            .await
            .unwrap();

        store.fail_appends(true);
        let mut stream = bus.subscribe();
        let envelope = create("X");
        let command_id = envelope.command_id;

        let err = lane.execute(envelope).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Store(_)));

        let fault_env = stream.recv().await.expect("fault envelope");
        let fault = fault_env.payload_as::<Fault>().expect("fault payload");
        assert_eq!(fault.message_id, command_id);

        // Unconfirmed events never reach state; the lane stays usable.
        let (state, version) = lane.state().await.unwrap();
        assert_eq!(state.name, None);
        assert_eq!(version, 0);

        store.fail_appends(false);
        lane.execute(create("X")).await.expect("retry succeeds");
        let (state, _) = lane.state().await.unwrap();
        assert_eq!(state.name.as_deref(), Some("X"));
    }

    #[tokio::test]
    async fn produced_ack_fires_with_event_count() {
        let h = harness();
        let lane = spawn(&h, "c-1").await;

        let (tx, rx) = oneshot::channel();
        let reply = lane.submit(create("X"), Some(tx)).await.unwrap();
        assert_eq!(rx.await.unwrap(), 1);
        reply.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn schedule_registers_timer_and_publishes_marker() {
        let h = harness();
        let lane = spawn(&h, "c-1").await;
        lane.execute(create("X")).await.unwrap();

        let mut stream = h.bus.subscribe();
        let raise_at = Utc::now() + chrono::Duration::hours(1);
        lane.execute(CommandEnvelope::new(
            "c-1",
            CounterCommand::ScheduleReset { at: raise_at },
        ))
        .await
        .unwrap();

        let registrations = h.timer.registrations();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].aggregate_type, "counter");
        assert_eq!(registrations[0].instance_id, "c-1");

        let published = stream.recv().await.expect("marker envelope");
        let marker = published
            .payload_as::<FutureEventScheduled>()
            .expect("scheduled marker");
        assert_eq!(marker.future_event_id, registrations[0].future_event_id);
        assert_eq!(marker.source_id, "c-1");
    }

    #[tokio::test]
    async fn raise_applies_inner_before_occurred_marker() {
        let h = harness();
        let lane = spawn(&h, "c-1").await;
        lane.execute(create("X")).await.unwrap();
        lane.execute(CommandEnvelope::new(
            "c-1",
            CounterCommand::Add { amount: 5 },
        ))
        .await
        .unwrap();
        lane.execute(CommandEnvelope::new(
            "c-1",
            CounterCommand::ScheduleReset {
                at: Utc::now() + chrono::Duration::hours(1),
            },
        ))
        .await
        .unwrap();

        let future_event_id = h.timer.registrations()[0].future_event_id;
        let outcome = lane
            .raise_scheduled(
                future_event_id,
                Uuid::new_v4(),
                MessageMetadata::origin(Uuid::new_v4()),
            )
            .await
            .unwrap();
        assert_eq!(outcome, RaiseOutcome::Raised);

        // The stream shows the causal order: inner event strictly before
        // the occurred marker.
        let stream_id = stream_uuid("counter", "c-1");
        assert_eq!(
            h.store.event_types(stream_id).await,
            [
                "Created",
                "Added",
                "$future.scheduled",
                "Reset",
                "$future.occurred"
            ]
        );

        let (state, _) = lane.state().await.unwrap();
        assert_eq!(state.value, 0);
    }

    #[tokio::test]
    async fn raise_unknown_schedule_is_benign() {
        let h = harness();
        let lane = spawn(&h, "c-1").await;
        lane.execute(create("X")).await.unwrap();

        let outcome = lane
            .raise_scheduled(
                Uuid::new_v4(),
                Uuid::new_v4(),
                MessageMetadata::origin(Uuid::new_v4()),
            )
            .await
            .unwrap();
        assert_eq!(outcome, RaiseOutcome::AlreadyGone);

        let (state, version) = lane.state().await.unwrap();
        assert_eq!(state.value, 0);
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn raise_twice_fires_once() {
        let h = harness();
        let lane = spawn(&h, "c-1").await;
        lane.execute(create("X")).await.unwrap();
        lane.execute(CommandEnvelope::new(
            "c-1",
            CounterCommand::Add { amount: 3 },
        ))
        .await
        .unwrap();
        lane.execute(CommandEnvelope::new(
            "c-1",
            CounterCommand::ScheduleReset {
                at: Utc::now() + chrono::Duration::hours(1),
            },
        ))
        .await
        .unwrap();
        let future_event_id = h.timer.registrations()[0].future_event_id;

        let first = lane
            .raise_scheduled(
                future_event_id,
                Uuid::new_v4(),
                MessageMetadata::origin(Uuid::new_v4()),
            )
            .await
            .unwrap();
        let second = lane
            .raise_scheduled(
                future_event_id,
                Uuid::new_v4(),
                MessageMetadata::origin(Uuid::new_v4()),
            )
            .await
            .unwrap();

        assert_eq!(first, RaiseOutcome::Raised);
        assert_eq!(second, RaiseOutcome::AlreadyGone);

        // Reset applied exactly once.
        let stream_id = stream_uuid("counter", "c-1");
        let resets = h
            .store
            .event_types(stream_id)
            .await
            .iter()
            .filter(|t| t.as_str() == "Reset")
            .count();
        assert_eq!(resets, 1);
    }

    #[tokio::test]
    async fn cancel_then_raise_always_fails_the_raise() {
        let h = harness();
        let lane = spawn(&h, "c-1").await;
        lane.execute(create("X")).await.unwrap();
        lane.execute(CommandEnvelope::new(
            "c-1",
            CounterCommand::ScheduleReset {
                at: Utc::now() + chrono::Duration::hours(1),
            },
        ))
        .await
        .unwrap();
        let future_event_id = h.timer.registrations()[0].future_event_id;

        let cancelled = lane
            .cancel_scheduled(
                |e| matches!(e, CounterEvent::Reset),
                MessageMetadata::origin(Uuid::new_v4()),
            )
            .await
            .unwrap();
        assert_eq!(cancelled, 1);

        let outcome = lane
            .raise_scheduled(
                future_event_id,
                Uuid::new_v4(),
                MessageMetadata::origin(Uuid::new_v4()),
            )
            .await
            .unwrap();
        assert_eq!(outcome, RaiseOutcome::AlreadyGone);

        let stream_id = stream_uuid("counter", "c-1");
        let types = h.store.event_types(stream_id).await;
        assert!(types.contains(&"$future.canceled".to_owned()));
        assert!(!types.contains(&"Reset".to_owned()));
    }

    #[tokio::test]
    async fn lane_recovers_state_from_store() {
        let h = harness();
        {
            let lane = spawn(&h, "c-1").await;
            lane.execute(create("X")).await.unwrap();
            lane.execute(CommandEnvelope::new(
                "c-1",
                CounterCommand::Add { amount: 4 },
            ))
            .await
            .unwrap();
            lane.execute(CommandEnvelope::new(
                "c-1",
                CounterCommand::ScheduleReset {
                    at: Utc::now() + chrono::Duration::hours(1),
                },
            ))
            .await
            .unwrap();
        }

        // A fresh lane replays the stream, including the pending schedule.
        let recovered = spawn(&h, "c-1").await;
        let (state, version) = recovered.state().await.unwrap();
        assert_eq!(state.name.as_deref(), Some("X"));
        assert_eq!(state.value, 4);
        assert_eq!(version, 3);

        // The recovered schedule can still be raised.
        let future_event_id = h.timer.registrations()[0].future_event_id;
        let outcome = recovered
            .raise_scheduled(
                future_event_id,
                Uuid::new_v4(),
                MessageMetadata::origin(Uuid::new_v4()),
            )
            .await
            .unwrap();
        assert_eq!(outcome, RaiseOutcome::Raised);
    }

    #[tokio::test]
    async fn idle_lane_shuts_down_and_snapshots() {
        let h = harness();
        let config = LaneConfig {
            channel_capacity: 4,
            idle_timeout: Duration::from_millis(50),
        };
        let lane = spawn_lane::<Counter>("c-1", h.ctx.clone(), config)
            .await
            .unwrap();
        lane.execute(create("X")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!lane.is_alive());

        let stream_id = stream_uuid("counter", "c-1");
        let snapshot = h
            .store
            .load_snapshot(stream_id)
            .await
            .unwrap()
            .expect("idle shutdown saves a snapshot");
        assert_eq!(snapshot.version, 1);
    }
}
