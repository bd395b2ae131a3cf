//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others, and so that a publisher on the control path never waits.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Traffic`] | Frames sent or injected through the gateway |
//! | [`Topic::SafetyTransitions`] | Component state changes and operator overrides |
//! | [`Topic::SystemAlerts`] | Emergency stops, interlock resets, safe shutdown |
//!
//! Every event is also mirrored onto an aggregate channel for consumers that
//! want the whole stream (the audit journal, dashboard WebSocket clients).

use coachnet_types::Event;
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Frames written to or injected onto a logical bus.
    Traffic,
    /// Safety state changes, including operator overrides.
    SafetyTransitions,
    /// Emergency stops, resets and system-wide mode changes.
    SystemAlerts,
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    all: broadcast::Sender<Event>,
    traffic: broadcast::Sender<Event>,
    safety_transitions: broadcast::Sender<Event>,
    system_alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every channel independently.
    pub fn new(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity);
        let (traffic, _) = broadcast::channel(capacity);
        let (safety_transitions, _) = broadcast::channel(capacity);
        let (system_alerts, _) = broadcast::channel(capacity);
        Self {
            all,
            traffic,
            safety_transitions,
            system_alerts,
        }
    }

    /// Publish `event` to `topic` and to the aggregate channel.
    ///
    /// Returns the number of receivers that were handed the event on the
    /// topic lane. Publishing with nobody listening is normal and returns 0;
    /// safety code never fails because a dashboard is not connected.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        let _ = self.all.send(event.clone());
        match self.topic_sender(topic).send(event) {
            Ok(n) => n,
            Err(_) => {
                trace!(?topic, "event published with no subscribers");
                0
            }
        }
    }

    /// Subscribe to a single [`Topic`].
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic: Some(topic),
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to every event regardless of topic.
    pub fn subscribe_all(&self) -> TopicReceiver {
        TopicReceiver {
            topic: None,
            receiver: self.all.subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Traffic => &self.traffic,
            Topic::SafetyTransitions => &self.safety_transitions,
            Topic::SystemAlerts => &self.system_alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to one [`Topic`] (or to the aggregate stream).
pub struct TopicReceiver {
    topic: Option<Topic>,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// The [`Topic`] this receiver is bound to; `None` for the aggregate stream.
    pub fn topic(&self) -> Option<Topic> {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coachnet_types::{EventPayload, SafetyState};
    use std::time::Duration;

    fn transition(component: &str) -> Event {
        Event::new(
            "coachnet-middleware::test",
            EventPayload::SafetyTransition {
                component: component.to_string(),
                from: SafetyState::Healthy,
                to: SafetyState::Degraded,
                detail: serde_json::Value::Null,
            },
        )
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish_to(Topic::SystemAlerts, transition("brakes")), 0);
    }

    #[tokio::test]
    async fn topic_multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut first = bus.subscribe_to(Topic::SafetyTransitions);
        let mut second = bus.subscribe_to(Topic::SafetyTransitions);

        let event = transition("slides");
        assert_eq!(bus.publish_to(Topic::SafetyTransitions, event.clone()), 2);

        assert_eq!(first.recv().await?.id, event.id);
        assert_eq!(second.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn topic_subscriber_does_not_receive_other_topic_events() {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::SystemAlerts);

        bus.publish_to(Topic::Traffic, transition("house"));

        let result = tokio::time::timeout(Duration::from_millis(50), alerts.recv()).await;
        assert!(result.is_err(), "SystemAlerts must not see Traffic events");
    }

    #[tokio::test]
    async fn aggregate_stream_sees_every_topic() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut all = bus.subscribe_all();
        assert_eq!(all.topic(), None);

        let a = transition("a");
        let b = transition("b");
        bus.publish_to(Topic::Traffic, a.clone());
        bus.publish_to(Topic::SystemAlerts, b.clone());

        assert_eq!(all.recv().await?.id, a.id);
        assert_eq!(all.recv().await?.id, b.id);
        Ok(())
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(16);
        let mut slow = bus.subscribe_to(Topic::Traffic);

        for _ in 0..1_000 {
            bus.publish_to(Topic::Traffic, transition("flood"));
        }

        let result = slow.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }
}
