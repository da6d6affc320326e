//! Message bus abstraction and the in-process broadcast implementation.
//!
//! Events are published to the bus only after their persistence has been
//! confirmed; sagas and waiters consume the published stream. Faults travel
//! the same way, so failure observation needs no side channel.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::message::Envelope;

/// Publish/subscribe seam between the engine and its consumers.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an envelope to all current subscribers.
    async fn publish(&self, envelope: Envelope);

    /// Open a subscription receiving every envelope published from now on.
    fn subscribe(&self) -> BusStream;
}

/// A bus subscription.
///
/// Skips over gaps caused by subscriber lag (the broadcast buffer wrapped
/// around) and logs how many messages were missed.
pub struct BusStream {
    inner: BroadcastStream<Envelope>,
}

impl BusStream {
    /// Receive the next envelope, or `None` once the bus shuts down.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.inner.next().await {
                Some(Ok(envelope)) => return Some(envelope),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "bus subscriber lagged, messages dropped");
                }
                None => return None,
            }
        }
    }
}

/// In-process bus backed by a tokio broadcast channel.
///
/// `Clone` is cheap; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<Envelope>,
}

/// Default broadcast capacity before slow subscribers start lagging.
const DEFAULT_CAPACITY: usize = 256;

impl LocalBus {
    /// A bus with the given broadcast capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, envelope: Envelope) {
        // No subscribers is not an error: events are durable in the store,
        // the bus is a live feed only.
        let _ = self.sender.send(envelope);
    }

    fn subscribe(&self) -> BusStream {
        BusStream {
            inner: BroadcastStream::new(self.sender.subscribe()),
        }
    }
}
