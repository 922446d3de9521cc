//! `sonar_wb_poster` – relays the Toto sonar ring onto the whiteboard.
//!
//! 1. Loads `~/.sonar_relay/config.toml` (defaults when absent), applies the
//!    `SONAR_RELAY_*` environment overrides and honours a `__name:=<node>`
//!    remapping argument.
//! 2. Subscribes the relay to the twelve `sonar_<i>` channels and posts the
//!    initial all-clear table.
//! 3. Connects to `rosbridge_server` for the range messages and serves posted
//!    tables to whiteboard readers over WebSocket.
//! 4. Runs until **Ctrl-C**, then exits with status 0.

mod config;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use sonar_middleware::{
    BusWhiteboard, EventBus, RosbridgeIngest, Topic, WhiteboardServer, channel_name,
};
use sonar_relay::{RelayConfig, SonarRelay};
use sonar_types::{Event, EventPayload, RelayError, SONAR_COUNT, SonarTable};
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let loaded = config::load();
    let mut cfg = config::resolve(&loaded, |key| std::env::var(key).ok());
    if let Some(name) = config::node_name_from_args(std::env::args().skip(1)) {
        cfg.node_name = name;
    }

    let _guard = sonar_relay::init_tracing(&cfg.node_name);

    match loaded {
        Ok(Some(_)) => info!(path = %config::config_path().display(), "config loaded"),
        Ok(None) => info!("no config file; using defaults"),
        Err(e) => warn!(error = %e, "config error; using defaults"),
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let bus = Arc::new(EventBus::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bus_ctrlc = Arc::clone(&bus);
    if let Err(e) = ctrlc::set_handler(move || {
        let stop_event = Event::new(
            "sonar-cli",
            EventPayload::Fault {
                component: "cli".to_string(),
                code: 130,
                message: "shutdown requested: operator Ctrl-C".to_string(),
            },
        );
        let _ = bus_ctrlc.publish_to(Topic::SystemAlerts, stop_event);
        let _ = shutdown_tx.send(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the node can only be killed");
    }

    match runtime.block_on(run(cfg, bus, shutdown_rx)) {
        Ok(table) => {
            info!(?table, "final sonar table");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "sonar relay failed");
            ExitCode::FAILURE
        }
    }
}

/// Wire the relay, the rosbridge ingest and the whiteboard server together
/// and wait for the relay to stop.
async fn run(
    cfg: config::Config,
    bus: Arc<EventBus>,
    shutdown: watch::Receiver<bool>,
) -> Result<SonarTable, RelayError> {
    info!(node = %cfg.node_name, "starting sonar relay");

    tokio::spawn(log_alerts(bus.subscribe_to(Topic::SystemAlerts)));

    if cfg.whiteboard_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], cfg.whiteboard_port));
        let server = WhiteboardServer::new(Arc::clone(&bus));
        tokio::spawn(async move {
            if let Err(e) = server.run(addr).await {
                error!(error = %e, "whiteboard server stopped");
            }
        });
    }

    let relay_config = RelayConfig {
        channel_prefix: cfg.channel_prefix.clone(),
        queue_size: cfg.queue_size,
    };
    let whiteboard = Arc::new(BusWhiteboard::new(Arc::clone(&bus)));
    let handle = SonarRelay::start(&bus, whiteboard, &relay_config, shutdown);

    let channels = (0..SONAR_COUNT)
        .map(|index| channel_name(&cfg.channel_prefix, index))
        .collect();
    let ingest = RosbridgeIngest::new(Arc::clone(&bus), cfg.rosbridge_url, channels, cfg.queue_size);
    tokio::spawn(ingest.run_or_alert());

    handle.join().await
}

async fn log_alerts(mut alerts: sonar_middleware::TopicReceiver) {
    loop {
        match alerts.recv().await {
            Ok(Event {
                source,
                payload: EventPayload::Fault { component, code, message },
                ..
            }) => warn!(%source, %component, code, "{message}"),
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!(lagged_by = n, "alert log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
