//! Event-sourcing domain engine with sharded, serialized aggregate lanes.

mod actor;
pub use actor::RaiseOutcome;
mod aggregate;
pub use aggregate::{Aggregate, AggregateRoot, AggregateSnapshot, Emission};
mod bus;
pub use bus::{BusStream, LocalBus, MessageBus};
mod command;
pub use command::{CommandEnvelope, ConfirmationMode, DynCommandEnvelope};
mod error;
pub use error::{
    ExecuteError, NodeError, PendingEventMissing, ScenarioFailure, ScheduledEventNotFound,
    StateError, WaitError,
};
mod event;
pub use event::{EventEnvelope, RecordedEvent, ScheduledRecord, StreamEvent, stream_uuid};
mod message;
pub use message::{Envelope, Fault, MessageMetadata, ProcessHistoryStep};
mod node;
pub use node::{CommandAck, DomainNode, NodeBuilder};
mod persistence;
pub use persistence::{EventStore, ExpectedVersion, InMemoryEventStore, SnapshotRecord, StoreError};
mod saga;
pub use saga::{Saga, SagaInstance, SagaLifecycleEvent, SagaMessage, SagaState, SagaTransition};
mod scenario;
pub use scenario::{AggregateScenario, ScenarioRun};
mod scheduling;
pub use scheduling::{
    FutureEventCanceled, FutureEventOccurred, FutureEventScheduled, ManualTimer, ScheduledTrigger,
    TimerService, WallclockTimer,
};
mod shard;
pub use shard::shard_id;
mod waiter;
pub use waiter::{ActiveWait, CommandWaiter, Condition, MessageWaiter, WaitResult};
