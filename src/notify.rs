use tokio::sync::broadcast;

use crate::model::Event;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Fan-out hub for lock-state and booking events.
///
/// Every subscriber sees every event in the order it was sent. A subscriber
/// that falls more than `capacity` events behind gets `Lagged` on its next
/// receive and is expected to resynchronise from a snapshot.
pub struct NotifyHub {
    sender: broadcast::Sender<Event>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Send an event. No-op if nobody is listening.
    pub fn send(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}
