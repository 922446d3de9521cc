//! `sonar-relay` – Toto sonar ring to whiteboard relay.
//!
//! # Modules
//!
//! - [`relay`] – [`SonarRelay`][relay::SonarRelay]: subscribes to the
//!   twelve `sonar_<i>` channels, clamps each range to the whiteboard's
//!   255 cm limit and posts the full [`SonarTable`][sonar_types::SonarTable]
//!   on every reading.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber (stdout/stderr split, optional JSON output,
//!   optional OTLP span export).

pub mod relay;
pub mod telemetry;

pub use relay::{RelayConfig, RelayHandle, SonarRelay};
pub use telemetry::{TracerProviderGuard, diagnostic_writer, init_tracing};
