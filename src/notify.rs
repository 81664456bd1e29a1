use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

/// Per-channel buffer. A listener that falls further behind than this
/// skips ahead and misses the oldest events.
const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for LISTEN/NOTIFY, one channel per session.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a session's events. Creates the channel if needed.
    pub fn subscribe(&self, session_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, session_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&session_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a session's channel once the session is gone. Listeners see the
    /// channel close after draining what was already sent.
    pub fn remove(&self, session_id: &Ulid) {
        self.channels.remove(session_id);
    }
}
