//! rosbridge sensor ingest.
//!
//! [`RosbridgeIngest`] connects to a `rosbridge_server` WebSocket, subscribes
//! to every sonar topic and republishes each inbound `sensor_msgs/Range`
//! frame onto [`Topic::Sensors`][crate::bus::Topic::Sensors] with the channel
//! name as the event source.
//!
//! Frames look like:
//!
//! ```json
//! {"op":"publish","topic":"/sonar_3","msg":{"header":{"frame_id":"sonar_3_link"},
//!  "radiation_type":0,"field_of_view":0.5,"min_range":0.02,"max_range":2.55,"range":1.2}}
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use sonar_types::{Event, EventPayload, RangeMessage, RelayError};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Topic};

/// ROS message type of every sonar channel.
pub const RANGE_MSG_TYPE: &str = "sensor_msgs/Range";

/// Fault code raised on [`Topic::SystemAlerts`] when rosbridge is lost.
pub const TRANSPORT_FAULT_CODE: u32 = 503;

const SOURCE: &str = "sonar-middleware::rosbridge";

/// Bridges a rosbridge WebSocket into the event bus.
pub struct RosbridgeIngest {
    bus: Arc<EventBus>,
    url: String,
    channels: Vec<String>,
    queue_length: usize,
}

impl RosbridgeIngest {
    /// `channels` are the bare channel names (`sonar_0`, …); the matching
    /// ROS topics are the same names rooted at `/`.
    pub fn new(
        bus: Arc<EventBus>,
        url: impl Into<String>,
        channels: Vec<String>,
        queue_length: usize,
    ) -> Self {
        Self {
            bus,
            url: url.into(),
            channels,
            queue_length,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect, subscribe and pump frames until the server closes the socket.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the connection or a subscribe
    /// request fails.
    pub async fn run(self) -> Result<(), RelayError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RelayError::Transport(format!("rosbridge connect to {}: {e}", self.url)))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        for channel in &self.channels {
            let op = subscribe_op(channel, self.queue_length);
            ws_tx
                .send(Message::Text(op.into()))
                .await
                .map_err(|e| RelayError::Transport(format!("rosbridge subscribe {channel}: {e}")))?;
            info!(channel = %channel, "rosbridge subscription requested");
        }

        let known: HashSet<&str> = self.channels.iter().map(String::as_str).collect();

        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Text(text)) => match parse_range_frame(text.as_str()) {
                    Some((channel, message)) if known.contains(channel.as_str()) => {
                        if let Err(e) = self.bus.publish_range(&channel, message) {
                            debug!(channel = %channel, error = %e, "range dropped");
                        }
                    }
                    Some((channel, _)) => debug!(channel = %channel, "frame for unsubscribed topic"),
                    None => debug!("ignoring non-range rosbridge frame"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "rosbridge stream error");
                    break;
                }
            }
        }

        info!(url = %self.url, "rosbridge connection closed");
        Ok(())
    }

    /// [`run`](Self::run), raising a fault on [`Topic::SystemAlerts`] when
    /// the transport fails.
    pub async fn run_or_alert(self) -> Result<(), RelayError> {
        let bus = Arc::clone(&self.bus);
        let result = self.run().await;
        if let Err(e) = &result {
            error!(error = %e, "sonar transport unavailable");
            let fault = Event::new(
                SOURCE,
                EventPayload::Fault {
                    component: "rosbridge".to_string(),
                    code: TRANSPORT_FAULT_CODE,
                    message: e.to_string(),
                },
            );
            let _ = bus.publish_to(Topic::SystemAlerts, fault);
        }
        result
    }
}

/// rosbridge `subscribe` request for a sonar channel.
pub fn subscribe_op(channel: &str, queue_length: usize) -> String {
    json!({
        "op": "subscribe",
        "topic": format!("/{channel}"),
        "type": RANGE_MSG_TYPE,
        "queue_length": queue_length,
    })
    .to_string()
}

/// Parse a rosbridge `publish` frame carrying a `sensor_msgs/Range`.
///
/// Returns the channel name (topic without the leading `/`) and the decoded
/// message, or `None` for anything else.
pub fn parse_range_frame(text: &str) -> Option<(String, RangeMessage)> {
    let frame: Value = serde_json::from_str(text).ok()?;
    if frame.get("op")?.as_str()? != "publish" {
        return None;
    }
    let topic = frame.get("topic")?.as_str()?;
    let channel = topic.trim_start_matches('/').to_string();
    let msg = frame.get("msg")?;

    let float = |key: &str| msg.get(key).and_then(Value::as_f64).map(|v| v as f32);

    let message = RangeMessage {
        frame_id: msg
            .get("header")
            .and_then(|h| h.get("frame_id"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        radiation_type: msg
            .get("radiation_type")
            .and_then(Value::as_u64)
            .and_then(|v| u8::try_from(v).ok())
            .unwrap_or_default(),
        field_of_view: float("field_of_view").unwrap_or_default(),
        min_range: float("min_range").unwrap_or_default(),
        max_range: float("max_range").unwrap_or_default(),
        range: float("range")?,
    };
    Some((channel, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_op_roots_topic_and_sets_type() {
        let op: Value = serde_json::from_str(&subscribe_op("sonar_4", 10)).unwrap();
        assert_eq!(op["op"], "subscribe");
        assert_eq!(op["topic"], "/sonar_4");
        assert_eq!(op["type"], RANGE_MSG_TYPE);
        assert_eq!(op["queue_length"], 10);
    }

    #[test]
    fn parse_full_range_frame() {
        let text = r#"{"op":"publish","topic":"/sonar_3","msg":{"header":{"frame_id":"sonar_3_link"},"radiation_type":0,"field_of_view":0.5,"min_range":0.02,"max_range":2.55,"range":1.2}}"#;
        let (channel, msg) = parse_range_frame(text).expect("frame must parse");
        assert_eq!(channel, "sonar_3");
        assert_eq!(msg.frame_id, "sonar_3_link");
        assert_eq!(msg.radiation_type, 0);
        assert!((msg.range - 1.2).abs() < 1e-6);
        assert!((msg.max_range - 2.55).abs() < 1e-6);
    }

    #[test]
    fn parse_frame_without_metadata() {
        let text = r#"{"op":"publish","topic":"sonar_0","msg":{"range":0.5}}"#;
        let (channel, msg) = parse_range_frame(text).expect("frame must parse");
        assert_eq!(channel, "sonar_0");
        assert!((msg.range - 0.5).abs() < f32::EPSILON);
        assert!(msg.frame_id.is_empty());
    }

    #[test]
    fn parse_rejects_non_publish_and_missing_range() {
        assert!(parse_range_frame(r#"{"op":"status","level":"error"}"#).is_none());
        assert!(parse_range_frame(r#"{"op":"publish","topic":"/sonar_0","msg":{}}"#).is_none());
        assert!(parse_range_frame("not json").is_none());
    }

    #[tokio::test]
    async fn run_fails_when_rosbridge_unreachable() {
        let bus = Arc::new(EventBus::default());
        // Port 1 on loopback is never a rosbridge server.
        let ingest = RosbridgeIngest::new(bus, "ws://127.0.0.1:1", vec!["sonar_0".into()], 10);
        assert_eq!(ingest.url(), "ws://127.0.0.1:1");
        let result = ingest.run().await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }

    #[tokio::test]
    async fn unreachable_rosbridge_raises_system_alert() {
        let bus = Arc::new(EventBus::default());
        let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
        let ingest =
            RosbridgeIngest::new(Arc::clone(&bus), "ws://127.0.0.1:1", vec!["sonar_0".into()], 10);

        let result = ingest.run_or_alert().await;
        assert!(matches!(result, Err(RelayError::Transport(_))));

        let event = alerts.try_recv().expect("fault published");
        assert_eq!(event.source, SOURCE);
        match event.payload {
            EventPayload::Fault { component, code, message } => {
                assert_eq!(component, "rosbridge");
                assert_eq!(code, TRANSPORT_FAULT_CODE);
                assert!(message.contains("ws://127.0.0.1:1"), "message was: {message}");
            }
            other => panic!("expected a fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_forwards_subscribed_frames_to_bus() -> Result<(), Box<dyn std::error::Error>> {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        // Minimal rosbridge stand-in: read the subscribe request, then publish
        // one frame on an unsubscribed topic and one on the subscribed one.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let mut ws = tokio_tungstenite::accept_async(stream).await?;
            let _subscribe = ws.next().await;
            ws.send(Message::Text(
                r#"{"op":"publish","topic":"/sonar_9","msg":{"range":0.1}}"#.into(),
            ))
            .await?;
            ws.send(Message::Text(
                r#"{"op":"publish","topic":"/sonar_2","msg":{"range":0.9}}"#.into(),
            ))
            .await?;
            let _ = ws.close(None).await;
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
        });

        let bus = Arc::new(EventBus::default());
        let mut sub = bus.subscribe_channel("sonar_2");
        let ingest = RosbridgeIngest::new(
            Arc::clone(&bus),
            format!("ws://{addr}"),
            vec!["sonar_2".into()],
            10,
        );
        ingest.run().await?;
        server.await?.map_err(|e| e.to_string())?;

        let received = sub.recv().await.ok_or("No message received")?;
        assert!((received.range - 0.9).abs() < 1e-6);
        Ok(())
    }
}
