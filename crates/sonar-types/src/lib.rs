use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Number of sonar transducers on the Toto sonar ring.
pub const SONAR_COUNT: usize = 12;

/// Largest range (centimetres) the whiteboard can store for one sonar.
///
/// This is a storage limit, not a physical one: each slot is a single byte.
pub const SONAR_CAP: u8 = 255;

/// One of the fixed physical sonar slots around the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SonarPosition {
    S0,
    S1,
    S2,
    S3,
    S4,
    S5,
    S6,
    S7,
    S8,
    S9,
    S10,
    S11,
}

impl SonarPosition {
    /// Every position, in index order.
    pub const ALL: [SonarPosition; SONAR_COUNT] = [
        SonarPosition::S0,
        SonarPosition::S1,
        SonarPosition::S2,
        SonarPosition::S3,
        SonarPosition::S4,
        SonarPosition::S5,
        SonarPosition::S6,
        SonarPosition::S7,
        SonarPosition::S8,
        SonarPosition::S9,
        SonarPosition::S10,
        SonarPosition::S11,
    ];

    /// Map a channel index onto its position. Returns `None` past the ring.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Slot index of this position inside a [`SonarTable`].
    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for SonarPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.index())
    }
}

/// A clamped sonar range in whole centimetres, always within `0..=SONAR_CAP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SonarReading(u8);

impl SonarReading {
    /// "No obstacle": the value every slot starts with.
    pub const MAX: SonarReading = SonarReading(SONAR_CAP);

    /// Convert a range in metres into a clamped centimetre reading.
    ///
    /// Values above [`SONAR_CAP`] saturate to the cap and the fractional part
    /// is truncated. Negative ranges and NaN become 0.
    pub fn from_metres(range_m: f32) -> Self {
        let cm = f64::from(range_m) * 100.0;
        if cm > f64::from(SONAR_CAP) {
            Self::MAX
        } else if cm > 0.0 {
            Self(cm as u8)
        } else {
            Self(0)
        }
    }

    pub fn centimetres(self) -> u8 {
        self.0
    }
}

impl Default for SonarReading {
    fn default() -> Self {
        Self::MAX
    }
}

/// The latest reading of every sonar, as posted to the whiteboard.
///
/// Always fully populated: construction sets every slot to
/// [`SonarReading::MAX`] and updates only ever overwrite a single slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SonarTable {
    sonar: [SonarReading; SONAR_COUNT],
}

impl SonarTable {
    pub fn new() -> Self {
        Self {
            sonar: [SonarReading::MAX; SONAR_COUNT],
        }
    }

    pub fn get(&self, position: SonarPosition) -> SonarReading {
        self.sonar[position.index()]
    }

    pub fn set(&mut self, position: SonarPosition, reading: SonarReading) {
        self.sonar[position.index()] = reading;
    }

    /// Iterate `(position, reading)` pairs in index order.
    pub fn iter(&self) -> impl Iterator<Item = (SonarPosition, SonarReading)> + '_ {
        SonarPosition::ALL.iter().map(|&p| (p, self.get(p)))
    }
}

impl Default for SonarTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A `sensor_msgs/Range` message as delivered on a sonar channel.
///
/// Only `range` is consumed by the relay; the rest is carried for
/// diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeMessage {
    #[serde(default)]
    pub frame_id: String,
    /// 0 = ultrasound, 1 = infrared.
    #[serde(default)]
    pub radiation_type: u8,
    #[serde(default)]
    pub field_of_view: f32,
    #[serde(default)]
    pub min_range: f32,
    #[serde(default)]
    pub max_range: f32,
    /// Measured distance in metres.
    pub range: f32,
}

/// Unified event wrapper for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Channel name for sensor traffic (e.g. `"sonar_3"`), otherwise the
    /// emitting component (e.g. `"sonar-middleware::whiteboard"`).
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// An inbound sonar measurement.
    Range(RangeMessage),
    /// A full sonar table posted to the whiteboard.
    SonarSensors(SonarTable),
    Fault {
        component: String,
        code: u32,
        message: String,
    },
}

/// Error type shared by every sonar relay crate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayError {
    #[error("No sonar at position {0}")]
    UnknownPosition(usize),

    #[error("Event Bus Channel Error: {0}")]
    Channel(String),

    #[error("Sensor Transport Error: {0}")]
    Transport(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Whiteboard Post Error: {0}")]
    Whiteboard(String),
}
