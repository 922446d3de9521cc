//! [`SonarRelay`] – sonar ring to whiteboard relay.
//!
//! Each of the [`SONAR_COUNT`] sonar channels feeds one slot of a
//! [`SonarTable`].  Every inbound range is clamped to [`SONAR_CAP`]
//! centimetres, written into its slot, and the *whole* table is posted to the
//! [`Whiteboard`] again.
//!
//! # Single writer
//!
//! [`SonarRelay::start`] spawns one forwarding task per channel.  Forwarders
//! never touch the table: they tag each message with its position index and
//! push it into one bounded `mpsc` queue.  A single consumer task owns the
//! relay and applies the readings in arrival order, so table updates and
//! posts never interleave regardless of how the runtime schedules the
//! forwarders.

use std::sync::Arc;

use sonar_middleware::{EventBus, Whiteboard, channel_name};
use sonar_types::{
    RangeMessage, RelayError, SONAR_CAP, SONAR_COUNT, SonarPosition, SonarReading, SonarTable,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Subscription settings for [`SonarRelay::start`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Channel names are `<channel_prefix><index>`.
    pub channel_prefix: String,
    /// Messages buffered per channel before forwarders wait on the relay.
    pub queue_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "sonar_".to_string(),
            queue_size: 10,
        }
    }
}

/// Owns the sonar table and posts it on every update.
pub struct SonarRelay {
    sensors: SonarTable,
    whiteboard: Arc<dyn Whiteboard>,
}

impl SonarRelay {
    /// Build a relay with every sonar at [`SonarReading::MAX`] and post that
    /// initial table once.
    pub fn new(whiteboard: Arc<dyn Whiteboard>) -> Self {
        let relay = Self {
            sensors: SonarTable::new(),
            whiteboard,
        };
        relay.post();
        relay
    }

    /// Apply one range measurement (metres) from the channel at `index`.
    ///
    /// On success the clamped reading is stored and the full table posted.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UnknownPosition`] when `index` is not a sonar on
    /// the ring.  The table is left untouched and nothing is posted.
    pub fn on_reading(&mut self, index: usize, range_m: f32) -> Result<SonarReading, RelayError> {
        let reading = SonarReading::from_metres(range_m);
        let Some(position) = SonarPosition::from_index(index) else {
            error!(
                index,
                range_cm = reading.centimetres(),
                "trying to post value ({}) to non-existent sonar {index}",
                reading.centimetres()
            );
            return Err(RelayError::UnknownPosition(index));
        };

        info!(
            %position,
            range_cm = reading.centimetres(),
            "{:<3} range: [{}]cm",
            position.to_string(),
            reading.centimetres()
        );

        self.sensors.set(position, reading);
        self.post();
        Ok(reading)
    }

    /// Current table.
    pub fn table(&self) -> &SonarTable {
        &self.sensors
    }

    /// Subscribe to every sonar channel on `bus`, post the initial table and
    /// spawn the consumer task.
    ///
    /// The relay stops when `shutdown` flips to `true` or when every channel
    /// has closed.  Dropping the shutdown sender without sending only removes
    /// the first stop condition.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        bus: &EventBus,
        whiteboard: Arc<dyn Whiteboard>,
        config: &RelayConfig,
        shutdown: watch::Receiver<bool>,
    ) -> RelayHandle {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1) * SONAR_COUNT);

        let forwarders = (0..SONAR_COUNT)
            .map(|index| {
                let channel = channel_name(&config.channel_prefix, index);
                info!("Subscribing to [{channel}]");
                let mut subscriber = bus.subscribe_channel(channel);
                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Some(message) = subscriber.recv().await {
                        if tx.send((index, message)).await.is_err() {
                            break;
                        }
                    }
                    debug!(channel = subscriber.channel(), "sonar channel closed");
                })
            })
            .collect();
        drop(tx);

        let relay = SonarRelay::new(whiteboard);
        let consumer = tokio::spawn(relay.run(rx, shutdown));

        RelayHandle {
            consumer,
            forwarders,
        }
    }

    async fn run(
        mut self,
        mut readings: mpsc::Receiver<(usize, RangeMessage)>,
        mut shutdown: watch::Receiver<bool>,
    ) -> SonarTable {
        let mut shutdown_open = true;
        loop {
            tokio::select! {
                changed = shutdown.changed(), if shutdown_open => match changed {
                    Ok(()) if *shutdown.borrow() => {
                        info!("sonar relay shutting down");
                        break;
                    }
                    Ok(()) => {}
                    Err(_) => shutdown_open = false,
                },
                next = readings.recv() => match next {
                    Some((index, message)) => {
                        // Unknown positions are already reported by on_reading.
                        let _ = self.on_reading(index, message.range);
                    }
                    None => {
                        info!("all sonar channels closed");
                        break;
                    }
                },
            }
        }
        self.sensors
    }

    /// Post the whole table. Failures are logged and otherwise ignored.
    fn post(&self) {
        if let Err(e) = self.whiteboard.post(&self.sensors) {
            warn!(error = %e, cap = SONAR_CAP, "whiteboard post failed");
        }
    }
}

/// Handle to a relay started with [`SonarRelay::start`].
pub struct RelayHandle {
    consumer: JoinHandle<SonarTable>,
    forwarders: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    /// Wait for the relay to stop and return its final table.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Channel`] if the consumer task panicked or was
    /// cancelled.
    pub async fn join(self) -> Result<SonarTable, RelayError> {
        let result = self
            .consumer
            .await
            .map_err(|e| RelayError::Channel(format!("sonar relay task failed: {e}")));
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingWhiteboard {
        posts: Mutex<Vec<SonarTable>>,
    }

    impl RecordingWhiteboard {
        fn posts(&self) -> Vec<SonarTable> {
            self.posts.lock().unwrap().clone()
        }
    }

    impl Whiteboard for RecordingWhiteboard {
        fn post(&self, sensors: &SonarTable) -> Result<(), RelayError> {
            self.posts.lock().unwrap().push(*sensors);
            Ok(())
        }
    }

    struct FailingWhiteboard;

    impl Whiteboard for FailingWhiteboard {
        fn post(&self, _sensors: &SonarTable) -> Result<(), RelayError> {
            Err(RelayError::Whiteboard("store offline".to_string()))
        }
    }

    fn make_relay() -> (Arc<RecordingWhiteboard>, SonarRelay) {
        let whiteboard = Arc::new(RecordingWhiteboard::default());
        let relay = SonarRelay::new(whiteboard.clone());
        (whiteboard, relay)
    }

    fn cm(table: &SonarTable, index: usize) -> u8 {
        table.get(SonarPosition::ALL[index]).centimetres()
    }

    /// In-memory sink standing in for stdout or stderr.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedBuf {
        type Writer = SharedBuf;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn range_lines_go_to_stdout_and_unknown_position_to_stderr() {
        use tracing_subscriber::layer::SubscriberExt;

        let out = SharedBuf::default();
        let err = SharedBuf::default();
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(crate::telemetry::diagnostic_writer(out.clone(), err.clone())),
        );

        tracing::subscriber::with_default(subscriber, || {
            let (_, mut relay) = make_relay();
            relay.on_reading(0, 0.5).unwrap();
            assert!(relay.on_reading(12, 0.5).is_err());
        });

        let out = out.contents();
        let err = err.contents();
        assert!(out.contains("s0  range: [50]cm"), "stdout was: {out}");
        assert!(!out.contains("non-existent"), "stdout was: {out}");
        assert!(err.contains("non-existent sonar 12"), "stderr was: {err}");
        assert!(!err.contains("range: ["), "stderr was: {err}");
    }

    #[test]
    fn startup_posts_table_at_cap() {
        let (whiteboard, relay) = make_relay();
        let posts = whiteboard.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0], SonarTable::new());
        assert!(relay.table().iter().all(|(_, r)| r == SonarReading::MAX));
    }

    #[test]
    fn sequence_on_one_position_clamps_and_posts_each_time() {
        let (whiteboard, mut relay) = make_relay();

        let stored: Vec<u8> = [0.50, 3.10, 5.00]
            .into_iter()
            .map(|m| relay.on_reading(0, m).unwrap().centimetres())
            .collect();
        assert_eq!(stored, vec![50, 255, 255]);

        let posts = whiteboard.posts();
        assert_eq!(posts.len(), 4, "initial post plus one per reading");
        assert_eq!(cm(&posts[1], 0), 50);
        assert_eq!(cm(&posts[2], 0), 255);
        assert_eq!(cm(&posts[3], 0), 255);
    }

    #[test]
    fn single_position_update_leaves_others_at_cap() {
        let (whiteboard, mut relay) = make_relay();
        relay.on_reading(5, 1.20).unwrap();

        let table = *relay.table();
        for index in 0..SONAR_COUNT {
            let expected = if index == 5 { 120 } else { 255 };
            assert_eq!(cm(&table, index), expected, "sonar {index}");
        }
        assert_eq!(whiteboard.posts().last(), Some(&table));
    }

    #[test]
    fn reading_never_changes_other_positions() {
        let (_, mut relay) = make_relay();
        relay.on_reading(2, 0.3).unwrap();
        relay.on_reading(9, 1.0).unwrap();
        relay.on_reading(2, 0.6).unwrap();

        assert_eq!(cm(relay.table(), 2), 60);
        assert_eq!(cm(relay.table(), 9), 100);
        assert_eq!(cm(relay.table(), 0), 255);
    }

    #[test]
    fn unchanged_value_still_posts_full_table() {
        let (whiteboard, mut relay) = make_relay();
        relay.on_reading(1, 9.0).unwrap();
        assert_eq!(whiteboard.posts().len(), 2);
        assert_eq!(whiteboard.posts()[1], SonarTable::new());
    }

    #[test]
    fn unknown_position_is_dropped_without_post() {
        let (whiteboard, mut relay) = make_relay();
        relay.on_reading(3, 0.4).unwrap();
        let before = *relay.table();

        let result = relay.on_reading(SONAR_COUNT, 0.1);
        assert_eq!(result, Err(RelayError::UnknownPosition(SONAR_COUNT)));
        assert_eq!(*relay.table(), before);
        assert_eq!(whiteboard.posts().len(), 2);
    }

    #[test]
    fn negative_range_is_stored_as_zero() {
        let (_, mut relay) = make_relay();
        assert_eq!(relay.on_reading(7, -0.25).unwrap().centimetres(), 0);
        assert_eq!(cm(relay.table(), 7), 0);
    }

    #[test]
    fn failed_post_does_not_lose_reading() {
        let mut relay = SonarRelay::new(Arc::new(FailingWhiteboard));
        let reading = relay.on_reading(4, 0.75).unwrap();
        assert_eq!(reading.centimetres(), 75);
        assert_eq!(cm(relay.table(), 4), 75);
    }

    #[tokio::test]
    async fn started_relay_consumes_every_channel() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let whiteboard = Arc::new(RecordingWhiteboard::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = SonarRelay::start(
            &bus,
            whiteboard.clone(),
            &RelayConfig::default(),
            shutdown_rx,
        );

        let range = |m: f32| RangeMessage {
            range: m,
            ..RangeMessage::default()
        };
        bus.publish_range("sonar_0", range(0.5))?;
        bus.publish_range("sonar_11", range(1.1))?;
        bus.publish_range("sonar_5", range(4.0))?;
        // Not a sonar channel; nobody forwards it.
        bus.publish_range("sonar_12", range(0.2))?;

        // Closing the bus ends every channel once its backlog is drained.
        drop(bus);
        let table = handle.join().await?;

        assert_eq!(cm(&table, 0), 50);
        assert_eq!(cm(&table, 11), 110);
        assert_eq!(cm(&table, 5), 255);
        assert_eq!(cm(&table, 3), 255);
        assert_eq!(whiteboard.posts().len(), 4);
        assert_eq!(whiteboard.posts().last(), Some(&table));
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_signal_stops_relay() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let whiteboard = Arc::new(RecordingWhiteboard::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = SonarRelay::start(&bus, whiteboard.clone(), &RelayConfig::default(), shutdown_rx);
        shutdown_tx.send(true)?;

        let table = tokio::time::timeout(std::time::Duration::from_secs(2), handle.join()).await??;
        assert_eq!(table, SonarTable::new());
        assert_eq!(whiteboard.posts().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn custom_prefix_selects_channels() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let whiteboard = Arc::new(RecordingWhiteboard::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = RelayConfig {
            channel_prefix: "toto/sonar".to_string(),
            queue_size: 1,
        };

        let handle = SonarRelay::start(&bus, whiteboard.clone(), &config, shutdown_rx);
        bus.publish_range(
            "toto/sonar8",
            RangeMessage {
                range: 0.33,
                ..RangeMessage::default()
            },
        )?;
        drop(bus);

        let table = handle.join().await?;
        assert_eq!(cm(&table, 8), 33);
        Ok(())
    }
}
