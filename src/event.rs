//! Stream events, envelopes, and the serialized record bridge.
//!
//! This module provides the data types and pure encode/decode functions that
//! the lane, saga, and node modules all depend on. No I/O occurs here.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::MessageMetadata;

/// Fixed namespace UUID for deterministic stream ID derivation.
///
/// All stream IDs are UUID v5 values derived from this namespace and the
/// `"{aggregate_type}/{instance_id}"` string, so the same aggregate identity
/// always maps to the same stream UUID regardless of which process performs
/// the mapping.
const STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5e, 0x2b, 0x9f, 0x41, 0x8c, 0x6d, 0x4e, 0x1a, 0x9d, 0x30, 0x7b, 0x44, 0xa1, 0x0e, 0x5c, 0xd8,
]);

/// Derive a deterministic stream UUID from aggregate type and instance ID.
///
/// # Examples
///
/// ```
/// use gridlane::stream_uuid;
/// let id = stream_uuid("counter", "c-1");
/// assert_eq!(id, stream_uuid("counter", "c-1")); // deterministic
/// assert_ne!(id, stream_uuid("counter", "c-2"));
/// ```
pub fn stream_uuid(aggregate_type: &str, instance_id: &str) -> Uuid {
    let name = format!("{aggregate_type}/{instance_id}");
    Uuid::new_v5(&STREAM_NAMESPACE, name.as_bytes())
}

/// A domain event scheduled to take effect at a later wall-clock time.
///
/// The record itself is the persisted fact; the wrapped `inner` event is
/// applied only once the schedule fires. Replaying a stream therefore
/// reconstructs the set of still-pending records exactly as it was.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledRecord<E> {
    /// Identity of the pending schedule, used to raise or cancel it.
    pub future_event_id: Uuid,
    /// Earliest wall-clock time at which the inner event may be raised.
    pub raise_at: DateTime<Utc>,
    /// The event that will be emitted when the schedule fires.
    pub inner: E,
}

/// One element of an aggregate's event stream.
///
/// Most elements are `Domain` facts produced by command handling. The
/// remaining variants are the future-event bookkeeping markers: scheduling
/// a delayed event persists a [`ScheduledRecord`] wrapper, and raising or
/// cancelling it persists a marker that removes the record on (re)apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "E: Serialize", deserialize = "E: DeserializeOwned"))]
pub enum StreamEvent<E> {
    /// An ordinary domain fact.
    Domain(E),
    /// A delayed event was scheduled; the wrapper is the persisted fact.
    FutureEventScheduled(ScheduledRecord<E>),
    /// A previously scheduled event has fired and its inner event was
    /// persisted. Always appears strictly after the inner event.
    FutureEventOccurred {
        /// The schedule that fired.
        future_event_id: Uuid,
    },
    /// A previously scheduled event was cancelled before firing.
    FutureEventCanceled {
        /// The schedule that was cancelled.
        future_event_id: Uuid,
    },
}

/// An event plus the identity and metadata it was emitted with.
///
/// Envelopes are immutable once built: they are buffered while awaiting
/// persistence confirmation, then applied and published as-is.
#[derive(Debug, Clone)]
pub struct EventEnvelope<E> {
    /// Unique event identity; equals `metadata.message_id`.
    pub event_id: Uuid,
    /// Instance ID of the aggregate that produced the event.
    pub source_id: String,
    /// Saga the producing command belonged to, if any.
    pub saga_id: Option<Uuid>,
    /// When the event was produced.
    pub occurred_at: DateTime<Utc>,
    /// The stream event itself.
    pub event: StreamEvent<E>,
    /// Causal metadata (correlation, causation, history).
    pub metadata: MessageMetadata,
}

impl<E> EventEnvelope<E> {
    /// Build an envelope; the event ID is taken from `metadata.message_id`.
    pub fn new(
        source_id: impl Into<String>,
        event: StreamEvent<E>,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            event_id: metadata.message_id,
            source_id: source_id.into(),
            saga_id: None,
            occurred_at: Utc::now(),
            event,
            metadata,
        }
    }

    /// Attach the saga the producing command belonged to.
    pub fn with_saga_id(mut self, saga_id: Option<Uuid>) -> Self {
        self.saga_id = saga_id;
        self
    }
}

/// Reserved event type tags for the future-event markers.
const FUTURE_SCHEDULED_TYPE: &str = "$future.scheduled";
const FUTURE_OCCURRED_TYPE: &str = "$future.occurred";
const FUTURE_CANCELED_TYPE: &str = "$future.canceled";

/// Serialized payload shared by the occurred/cancelled markers.
#[derive(Serialize, Deserialize)]
struct FutureEventRef {
    future_event_id: Uuid,
}

/// A serialized event as handed to (and returned by) the event store.
///
/// Domain events are stored under their adjacently-tagged variant name with
/// the `"data"` portion as payload; the future-event markers use the
/// reserved `$future.*` tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Unique event identity.
    pub event_id: Uuid,
    /// Stream this event belongs to (see [`stream_uuid`]).
    pub stream_id: Uuid,
    /// Event type tag.
    pub event_type: String,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// Causal metadata carried alongside the event.
    pub metadata: MessageMetadata,
    /// Instance ID of the producing aggregate.
    pub source_id: String,
    /// Saga the producing command belonged to, if any.
    pub saga_id: Option<Uuid>,
    /// When the event was produced.
    pub occurred_at: DateTime<Utc>,
}

/// Encode an event envelope into a [`RecordedEvent`] for storage.
///
/// The domain event type `E` must use `#[serde(tag = "type", content =
/// "data")]` adjacently tagged serialization; the `"type"` field becomes
/// [`RecordedEvent::event_type`] and the remaining payload becomes
/// [`RecordedEvent::payload`].
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized or does
/// not follow the adjacently-tagged convention.
pub fn encode_envelope<E: Serialize>(
    stream_id: Uuid,
    envelope: &EventEnvelope<E>,
) -> serde_json::Result<RecordedEvent> {
    use serde::ser::Error;

    let (event_type, payload) = match &envelope.event {
        StreamEvent::Domain(event) => {
            let value = serde_json::to_value(event)?;
            let obj = value.as_object().ok_or_else(|| {
                serde_json::Error::custom("domain event must serialize to a tagged JSON object")
            })?;
            let tag = obj.get("type").and_then(|v| v.as_str()).ok_or_else(|| {
                serde_json::Error::custom("domain event is missing a string 'type' tag")
            })?;
            // Data may be absent for fieldless variants.
            let data = obj.get("data").cloned().unwrap_or(serde_json::Value::Null);
            (tag.to_owned(), data)
        }
        StreamEvent::FutureEventScheduled(record) => (
            FUTURE_SCHEDULED_TYPE.to_owned(),
            serde_json::to_value(record)?,
        ),
        StreamEvent::FutureEventOccurred { future_event_id } => (
            FUTURE_OCCURRED_TYPE.to_owned(),
            serde_json::to_value(FutureEventRef {
                future_event_id: *future_event_id,
            })?,
        ),
        StreamEvent::FutureEventCanceled { future_event_id } => (
            FUTURE_CANCELED_TYPE.to_owned(),
            serde_json::to_value(FutureEventRef {
                future_event_id: *future_event_id,
            })?,
        ),
    };

    Ok(RecordedEvent {
        event_id: envelope.event_id,
        stream_id,
        event_type,
        payload,
        metadata: envelope.metadata.clone(),
        source_id: envelope.source_id.clone(),
        saga_id: envelope.saga_id,
        occurred_at: envelope.occurred_at,
    })
}

/// Decode a [`RecordedEvent`] back into a [`StreamEvent`].
///
/// Reserved `$future.*` tags decode into the corresponding marker; any
/// other tag is reconstructed as an adjacently-tagged domain event.
///
/// # Errors
///
/// Returns `serde_json::Error` if the payload does not deserialize into
/// the expected shape (e.g. an event type unknown to this build).
pub fn decode_recorded<E: DeserializeOwned>(
    record: &RecordedEvent,
) -> serde_json::Result<StreamEvent<E>> {
    match record.event_type.as_str() {
        FUTURE_SCHEDULED_TYPE => Ok(StreamEvent::FutureEventScheduled(serde_json::from_value(
            record.payload.clone(),
        )?)),
        FUTURE_OCCURRED_TYPE => {
            let marker: FutureEventRef = serde_json::from_value(record.payload.clone())?;
            Ok(StreamEvent::FutureEventOccurred {
                future_event_id: marker.future_event_id,
            })
        }
        FUTURE_CANCELED_TYPE => {
            let marker: FutureEventRef = serde_json::from_value(record.payload.clone())?;
            Ok(StreamEvent::FutureEventCanceled {
                future_event_id: marker.future_event_id,
            })
        }
        _ => {
            // Reconstruct the adjacently tagged JSON object.
            let tagged = if record.payload.is_null() {
                serde_json::json!({ "type": record.event_type })
            } else {
                serde_json::json!({ "type": record.event_type, "data": record.payload })
            };
            Ok(StreamEvent::Domain(serde_json::from_value(tagged)?))
        }
    }
}
