//! `sonar-middleware` – host transport for the sonar relay.
//!
//! Routes range messages from the robot into the relay, and posted sonar
//! tables out to whiteboard consumers, without caring what the numbers mean.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels, with exact-name sensor channel subscriptions.
//! - [`rosbridge`] – client that subscribes to the sonar topics on a
//!   `rosbridge_server` and feeds their `sensor_msgs/Range` frames into the bus.
//! - [`whiteboard`] – the [`Whiteboard`] output trait, its bus-backed
//!   implementation and a WebSocket server for whiteboard readers.

pub mod bus;
pub mod rosbridge;
pub mod whiteboard;

pub use bus::{ChannelSubscriber, EventBus, Topic, TopicReceiver, channel_name};
pub use rosbridge::RosbridgeIngest;
pub use whiteboard::{BusWhiteboard, Whiteboard, WhiteboardServer};
