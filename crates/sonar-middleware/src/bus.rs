//! Typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels so that every subscriber receives
//! every message without any single subscriber blocking the others.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Sensors`] | Inbound `sensor_msgs/Range` messages, one `source` per sonar channel |
//! | [`Topic::Whiteboard`] | Full sonar tables posted by the relay |
//! | [`Topic::SystemAlerts`] | Shutdown requests and transport faults |
//!
//! Sensor channels (`sonar_0`, `sonar_1`, …) share the [`Topic::Sensors`]
//! lane and are told apart by the event `source`.  Use
//! [`EventBus::subscribe_channel`] to receive a single channel.

use sonar_types::{Event, EventPayload, RangeMessage, RelayError};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Raw range measurements from the sonar ring.
    Sensors,
    /// Sonar tables posted for whiteboard consumers.
    Whiteboard,
    /// Shutdown requests and transport faults.
    SystemAlerts,
}

/// Build the name of the channel carrying sonar `index`, e.g. `sonar_3`.
pub fn channel_name(prefix: &str, index: usize) -> String {
    format!("{prefix}{index}")
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    sensors: broadcast::Sender<Event>,
    whiteboard: broadcast::Sender<Event>,
    system_alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (sensors, _) = broadcast::channel(capacity);
        let (whiteboard, _) = broadcast::channel(capacity);
        let (system_alerts, _) = broadcast::channel(capacity);
        Self {
            sensors,
            whiteboard,
            system_alerts,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event, or
    /// [`RelayError::Channel`] when no subscriber is listening on the topic.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, RelayError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| RelayError::Channel(format!("No subscribers for topic {topic:?}")))
    }

    /// Publish a range measurement on the sensor channel `channel`.
    pub fn publish_range(&self, channel: &str, message: RangeMessage) -> Result<usize, RelayError> {
        self.publish_to(
            Topic::Sensors,
            Event::new(channel, EventPayload::Range(message)),
        )
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to exactly one sensor channel.
    ///
    /// Matching is on the full channel name, so `sonar_1` never receives
    /// traffic for `sonar_10`.
    pub fn subscribe_channel(&self, channel: impl Into<String>) -> ChannelSubscriber {
        ChannelSubscriber {
            channel: channel.into(),
            receiver: self.sensors.subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn receiver_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Sensors => &self.sensors,
            Topic::Whiteboard => &self.whiteboard,
            Topic::SystemAlerts => &self.system_alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

// ---------------------------------------------------------------------------
// Per-channel sensor subscriber
// ---------------------------------------------------------------------------

/// Delivers the range messages of a single named sensor channel.
pub struct ChannelSubscriber {
    channel: String,
    receiver: broadcast::Receiver<Event>,
}

impl ChannelSubscriber {
    /// Wait for the next range message on this channel.
    ///
    /// Returns `None` when the bus is closed and no further events will arrive.
    pub async fn recv(&mut self) -> Option<RangeMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(Event {
                    source,
                    payload: EventPayload::Range(message),
                    ..
                }) if source == self.channel => return Some(message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(channel = %self.channel, lagged_by = n, "ChannelSubscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Name of the channel this subscriber is bound to.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}
