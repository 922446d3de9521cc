//! Whiteboard output.
//!
//! The whiteboard is the shared-state store that sonar consumers read.  The
//! relay only ever hands it a complete [`SonarTable`]; how the table is stored
//! and delivered belongs to the [`Whiteboard`] implementation.
//!
//! * [`BusWhiteboard`] posts each table to [`Topic::Whiteboard`] on the
//!   [`EventBus`].
//! * [`WhiteboardServer`] serves that lane to WebSocket clients as one JSON
//!   text frame per posted table.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use sonar_types::{Event, EventPayload, RelayError, SonarTable};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Topic};

/// Event source stamped on every posted table.
pub const WHITEBOARD_SOURCE: &str = "sonar-middleware::whiteboard";

/// A store that accepts the full sonar table.
pub trait Whiteboard: Send + Sync {
    /// Post `sensors` as the current value of the sonar aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Whiteboard`] if the store rejected the post.
    fn post(&self, sensors: &SonarTable) -> Result<(), RelayError>;
}

/// [`Whiteboard`] that posts onto the [`Topic::Whiteboard`] lane.
#[derive(Clone)]
pub struct BusWhiteboard {
    bus: Arc<EventBus>,
}

impl BusWhiteboard {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl Whiteboard for BusWhiteboard {
    /// Having nobody subscribed to the whiteboard lane is not an error: the
    /// post simply has no readers yet.
    fn post(&self, sensors: &SonarTable) -> Result<(), RelayError> {
        let event = Event::new(WHITEBOARD_SOURCE, EventPayload::SonarSensors(*sensors));
        match self.bus.publish_to(Topic::Whiteboard, event) {
            Ok(_) => Ok(()),
            Err(RelayError::Channel(_)) => {
                debug!("whiteboard post has no subscribers");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Serves posted sonar tables to WebSocket clients.
#[derive(Clone)]
pub struct WhiteboardServer {
    bus: Arc<EventBus>,
}

impl WhiteboardServer {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Bind `addr` and serve clients until the process exits.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the TCP listener cannot be bound.
    pub async fn run(self, addr: SocketAddr) -> Result<(), RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Transport(format!("whiteboard bind error on {addr}: {e}")))?;
        info!(%addr, "whiteboard server listening");
        self.serve(listener).await
    }

    /// Accept clients on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(stream, peer).await {
                            error!(peer = %peer, error = %e, "whiteboard client error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "whiteboard accept error");
                }
            }
        }
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), RelayError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| RelayError::Transport(format!("ws handshake from {peer}: {e}")))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut rx = self.bus.subscribe_to(Topic::Whiteboard);
        debug!(peer = %peer, "whiteboard client connected");

        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(Event { payload: EventPayload::SonarSensors(table), .. }) => {
                            let json = table_json(&table)?;
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => {
                            warn!(peer = %peer, lagged_by = n, "whiteboard client lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        _ => {}
                    }
                }
            }
        }

        debug!(peer = %peer, "whiteboard client disconnected");
        Ok(())
    }
}

/// JSON text frame for one posted table.
pub fn table_json(table: &SonarTable) -> Result<String, RelayError> {
    serde_json::to_string(table).map_err(|e| RelayError::Serialization(e.to_string()))
}
