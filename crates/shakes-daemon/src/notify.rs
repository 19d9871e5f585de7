//! Notification bus (§4.10): a single typed broadcast channel every
//! subsystem publishes to and the control-channel server subscribes
//! from, replacing the original's string-keyed notification center
//! with one closed enum per Design Notes §9.

use shakes_core::{Nick, Tth};
use tokio::sync::broadcast;

pub const CHANNEL_CAPACITY: usize = 1024;

/// Every event a frontend can observe over the control channel (§6).
#[derive(Clone, Debug)]
pub enum Event {
    HubConnecting { hub_id: u64, address: String },
    HubConnected { hub_id: u64 },
    HubDisconnected { hub_id: u64, reason: String },
    HubRedirect { hub_id: u64, target: String },
    ChatMessage { hub_id: u64, nick: Nick, text: String },
    PrivateMessage { hub_id: u64, from: Nick, text: String },
    UserJoin { hub_id: u64, nick: Nick },
    UserQuit { hub_id: u64, nick: Nick },
    SearchResult { hub_id: u64, from: Nick, tth: Option<Tth>, filename: String, size: u64, free_slots: u32 },
    QueueAdded { target_id: u64, filename: String },
    QueueRemoved { target_id: u64 },
    TransferStarted { target_id: u64, peer: Nick, direction: Direction },
    TransferProgress { target_id: u64, bytes_done: u64, bytes_total: u64 },
    TransferFinished { target_id: u64, direction: Direction },
    TransferFailed { target_id: u64, reason: String },
    HashingProgress { filename: String, bytes_done: u64, bytes_total: u64 },
    /// `tth` is `None` when the hasher reported a failure for this file.
    HashingFinished { filename: String, tth: Option<Tth> },
    ShareScanFinished { files_added: u64, files_removed: u64 },
    StatusMessage { code: shakes_core::StatusCode, text: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Owns the broadcast sender; clone the handle to publish from any
/// subsystem, `subscribe()` to follow the stream (control-channel
/// sessions each get their own receiver).
#[derive(Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<Event>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        // No receivers is the common case between control-channel
        // connections; broadcast::send's error just means that.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_events_reach_subscribers() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::HubConnecting { hub_id: 1, address: "hub.example".into() });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::HubConnecting { hub_id: 1, .. }));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = NotificationBus::new();
        bus.publish(Event::HubDisconnected { hub_id: 1, reason: "eof".into() });
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_the_event() {
        let bus = NotificationBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(Event::UserJoin { hub_id: 1, nick: Nick::new("alice") });
        assert!(matches!(a.recv().await.unwrap(), Event::UserJoin { .. }));
        assert!(matches!(b.recv().await.unwrap(), Event::UserJoin { .. }));
    }
}
