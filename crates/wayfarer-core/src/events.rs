//! Typed event stream consumed by UI and logging.
//!
//! The dispatch pipeline emits three event kinds over a broadcast channel.
//! Emission is fire-and-forget: a lagging or absent subscriber never blocks
//! or fails the request path.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default channel capacity. Slow subscribers past this lag drop events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// An event emitted by the dispatch pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProxyEvent {
    /// An intercepted request left the proxy (or was answered from cache).
    RequestSent {
        id: Uuid,
        url: String,
        method: String,
        headers: Vec<(String, String)>,
        body: String,
        proxied: bool,
        smart_cached: bool,
    },
    /// A response for an intercepted request passed back through the proxy.
    ResponseReceived {
        id: Uuid,
        url: String,
        method: String,
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
        proxied: bool,
        smart_cached: bool,
    },
    /// An operator-facing status message.
    Status { message: String },
}

impl ProxyEvent {
    /// Convenience constructor for status messages.
    pub fn status(message: impl Into<String>) -> Self {
        ProxyEvent::Status {
            message: message.into(),
        }
    }

    /// JSON encoding used by log consumers.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"kind\":\"status\",\"message\":\"encode error: {}\"}}", e)
        })
    }
}

/// Broadcast bus for [`ProxyEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    /// Creates a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    /// Creates a bus with a custom capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes a new consumer.
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }

    /// Emits an event. Returns the number of subscribers that received it.
    pub fn emit(&self, event: ProxyEvent) -> usize {
        // send() errors only when there are no subscribers, which is fine.
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request_event() -> ProxyEvent {
        ProxyEvent::RequestSent {
            id: Uuid::nil(),
            url: "settings.svc.frontier-games.net/settings/foo".into(),
            method: "GET".into(),
            headers: vec![("accept".into(), "application/json".into())],
            body: String::new(),
            proxied: true,
            smart_cached: false,
        }
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(ProxyEvent::status("hello")), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(sample_request_event());

        match rx.recv().await.unwrap() {
            ProxyEvent::RequestSent { method, proxied, .. } => {
                assert_eq!(method, "GET");
                assert!(proxied);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn json_encoding_carries_kind_tag() {
        let json = sample_request_event().to_json();
        assert!(json.contains("\"kind\":\"request_sent\""));
        assert!(json.contains("\"proxied\":true"));

        let json = ProxyEvent::status("schema outdated").to_json();
        assert!(json.contains("\"kind\":\"status\""));
        assert!(json.contains("schema outdated"));
    }
}
