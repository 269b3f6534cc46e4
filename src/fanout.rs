use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::{trace, warn};

use crate::types::Event;

pub const DEFAULT_CAPACITY: usize = 1024;

/// Per-session outbound event channel.
///
/// Publishing never waits on subscribers. A subscriber that falls more than
/// `capacity` events behind loses the oldest ones; order is kept and the
/// newest event (the terminal `complete`) is always retained.
#[derive(Debug, Clone)]
pub struct EventFanout {
    session_id: String,
    tx: broadcast::Sender<Event>,
}

impl EventFanout {
    pub fn new(session_id: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            session_id: session_id.into(),
            tx,
        }
    }

    pub fn publish(&self, event: Event) {
        trace!(session_id = %self.session_id, event = event.name(), "publish");
        // No subscribers means the client is gone; the event has nowhere to go.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Subscription as a stream, logging and skipping over lag gaps.
    pub fn stream(&self) -> impl Stream<Item = Event> + Send + 'static {
        let session_id = self.session_id.clone();
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |result| match result {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(session_id = %session_id, skipped, "slow subscriber dropped events");
                None
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
