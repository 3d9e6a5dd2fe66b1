//! Host lifecycle events, broadcast to any number of observers.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of the event channel. Slow observers lose the oldest events.
const EVENT_CAPACITY: usize = 256;

/// Something that happened to a host or one of its links.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    /// The host started accepting links.
    Listening { url: String },
    /// A link to `url` completed its greeting.
    Connected { url: String },
    /// The link to `url` went away.
    Disconnected { url: String },
    /// A reconnect attempt to `url` will run after `delay`.
    ReconnectScheduled {
        url: String,
        attempt: u32,
        #[serde(rename = "delay_ms", serialize_with = "as_millis")]
        delay: Duration,
    },
    /// A reconnect attempt to `url` succeeded.
    Reconnected { url: String },
    /// Reconnecting to `url` ran out of time; its cached peers were evicted.
    GaveUp { url: String },
    /// An explicit or gossiped join of `url` finished.
    Joined { url: String },
    /// `url` said goodbye.
    Goodbye { url: String },
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl HostEvent {
    /// URL of the host the event concerns.
    pub fn url(&self) -> &str {
        match self {
            HostEvent::Listening { url }
            | HostEvent::Connected { url }
            | HostEvent::Disconnected { url }
            | HostEvent::ReconnectScheduled { url, .. }
            | HostEvent::Reconnected { url }
            | HostEvent::GaveUp { url }
            | HostEvent::Joined { url }
            | HostEvent::Goodbye { url } => url,
        }
    }
}

/// Fan-out of host events.
pub(crate) struct EventBus {
    sender: broadcast::Sender<HostEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub(crate) fn publish(&self, event: HostEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.sender.subscribe()
    }
}
