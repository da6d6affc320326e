//! Future-event timer seam and the published scheduling markers.
//!
//! The engine never polls wall-clock time itself. When a scheduled wrapper
//! is persisted, the lane registers a [`ScheduledTrigger`] with the
//! [`TimerService`]; the timer's only job is to hand the trigger back to the
//! node at or after `raise_at`. Delivery is at least once -- redundant or
//! late fires land on the benign not-found path.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

/// A registered request to raise a scheduled event later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTrigger {
    /// Aggregate type that owns the schedule.
    pub aggregate_type: String,
    /// Aggregate instance that owns the schedule.
    pub instance_id: String,
    /// The schedule to raise.
    pub future_event_id: Uuid,
    /// Earliest time the raise may happen.
    pub raise_at: DateTime<Utc>,
}

/// Wall-clock timer collaborator.
///
/// Implementations must eventually deliver every registered trigger at or
/// after its `raise_at`, and may deliver it more than once.
pub trait TimerService: Send + Sync {
    /// Register a trigger for later delivery.
    fn register(&self, trigger: ScheduledTrigger);
}

/// Timer that sleeps on the tokio clock and then delivers the trigger.
///
/// Must be used from within a tokio runtime.
pub struct WallclockTimer {
    sink: mpsc::UnboundedSender<ScheduledTrigger>,
}

impl WallclockTimer {
    /// A timer delivering into the node's trigger channel.
    pub(crate) fn new(sink: mpsc::UnboundedSender<ScheduledTrigger>) -> Self {
        Self { sink }
    }
}

impl TimerService for WallclockTimer {
    fn register(&self, trigger: ScheduledTrigger) {
        let sink = self.sink.clone();
        let delay = (trigger.raise_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sink.send(trigger).is_err() {
                tracing::debug!("trigger sink closed before a schedule fired");
            }
        });
    }
}

/// Timer that holds registrations until a test fires them explicitly.
pub struct ManualTimer {
    sink: mpsc::UnboundedSender<ScheduledTrigger>,
    registrations: std::sync::Mutex<Vec<ScheduledTrigger>>,
}

impl ManualTimer {
    /// A manual timer delivering into the node's trigger channel.
    pub(crate) fn new(sink: mpsc::UnboundedSender<ScheduledTrigger>) -> Self {
        Self {
            sink,
            registrations: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Currently held registrations.
    pub fn registrations(&self) -> Vec<ScheduledTrigger> {
        self.registrations
            .lock()
            .map(|held| held.clone())
            .unwrap_or_default()
    }

    /// Fire one held registration by its future event ID.
    ///
    /// Returns `false` if no such registration is held.
    pub fn fire(&self, future_event_id: Uuid) -> bool {
        let trigger = {
            let Ok(mut held) = self.registrations.lock() else {
                return false;
            };
            let Some(index) = held
                .iter()
                .position(|t| t.future_event_id == future_event_id)
            else {
                return false;
            };
            held.remove(index)
        };
        self.sink.send(trigger).is_ok()
    }

    /// Re-deliver a trigger without a matching registration.
    ///
    /// Models the at-least-once timer redelivering after it already fired.
    pub fn fire_duplicate(&self, trigger: ScheduledTrigger) -> bool {
        self.sink.send(trigger).is_ok()
    }

    /// Fire every registration due at `now`, returning how many fired.
    pub fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<ScheduledTrigger> = {
            let Ok(mut held) = self.registrations.lock() else {
                return 0;
            };
            let (ready, later): (Vec<_>, Vec<_>) =
                held.drain(..).partition(|t| t.raise_at <= now);
            *held = later;
            ready
        };
        let count = due.len();
        for trigger in due {
            let _ = self.sink.send(trigger);
        }
        count
    }
}

impl TimerService for ManualTimer {
    fn register(&self, trigger: ScheduledTrigger) {
        if let Ok(mut held) = self.registrations.lock() {
            held.push(trigger);
        }
    }
}

/// Published when a delayed event was scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FutureEventScheduled {
    /// Identity of the new schedule.
    pub future_event_id: Uuid,
    /// Aggregate instance that owns the schedule.
    pub source_id: String,
    /// When the schedule is due.
    pub raise_at: DateTime<Utc>,
}

/// Published after a schedule fired and its inner event persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FutureEventOccurred {
    /// The schedule that fired.
    pub future_event_id: Uuid,
    /// Aggregate instance that owned the schedule.
    pub source_id: String,
}

/// Published when a schedule was cancelled before firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FutureEventCanceled {
    /// The schedule that was cancelled.
    pub future_event_id: Uuid,
    /// Aggregate instance that owned the schedule.
    pub source_id: String,
}
