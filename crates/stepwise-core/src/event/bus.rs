//! Broadcast channel for `RunEvent`s.
//!
//! Concurrent runs started by one executor share the bus; use
//! [`drain_run`] to pick out the events of a single run.

use stepwise_types::event::RunEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use uuid::Uuid;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receives every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers and return how many there were.
    /// Nobody listening is not an error.
    pub fn publish(&self, event: RunEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// Take every event already queued on `receiver` that belongs to `run_id`.
///
/// Events of other runs are consumed and dropped. A lagged receiver logs the
/// number of skipped events and keeps reading.
pub fn drain_run(receiver: &mut broadcast::Receiver<RunEvent>, run_id: Uuid) -> Vec<RunEvent> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) if event.run_id() == run_id => events.push(event),
            Ok(_) => {}
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(%run_id, skipped, "event receiver lagged");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => return events,
        }
    }
}
