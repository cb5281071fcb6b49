//! Backend connection and the loop that drives the bus.
//!
//! [`TransportBridge::run`] owns the single bus consumer: inbound envelopes,
//! messages posted by background tasks, and outbound envelopes are all
//! serviced from one `select!`, so handlers never run concurrently.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::bus::MessageBus;
use crate::config::GatewayConfig;
use crate::envelope;
use crate::error::{GatewayError, Result};
use crate::messages::Message;

pub type TextSink = Pin<Box<dyn Sink<String, Error = GatewayError> + Send>>;

/// Inbound text frames.  An `Err` item or the end of the stream means the
/// connection is gone.
pub type TextStream = BoxStream<'static, Result<String>>;

/// One open backend connection.
pub struct Connection {
    pub sink: TextSink,
    pub stream: TextStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, uri: &str) -> anyhow::Result<Connection>;
}

// ── WebSocket ─────────────────────────────────────────────────────────────────

/// [`Transport`] over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, uri: &str) -> anyhow::Result<Connection> {
        let (ws, _) = connect_async(uri).await?;
        let (ws_tx, ws_rx) = ws.split();

        let sink = ws_tx
            .sink_map_err(|e| GatewayError::TransportClosed(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, GatewayError>(WsMessage::Text(text.into()))));

        let stream = ws_rx.filter_map(|frame| {
            future::ready(match frame {
                Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(WsMessage::Close(reason)) => {
                    let reason = reason.map(|r| r.reason.as_str().to_owned()).unwrap_or_default();
                    Some(Err(GatewayError::TransportClosed(reason)))
                }
                // Ping / pong are answered by tungstenite; binary is not part
                // of the protocol.
                Ok(_) => None,
                Err(e) => Some(Err(GatewayError::TransportClosed(e.to_string()))),
            })
        });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        })
    }
}

// ── Bridge ────────────────────────────────────────────────────────────────────

pub struct TransportBridge<T: Transport> {
    transport: T,
    uri: String,
    client_id: String,
    reconnect_delay: Duration,
}

impl<T: Transport> TransportBridge<T> {
    pub fn new(transport: T, config: &GatewayConfig) -> Self {
        Self {
            transport,
            uri: config.backend_uri.clone(),
            client_id: config.client_id.clone(),
            reconnect_delay: config.reconnect_delay,
        }
    }

    /// Connect, serve until the connection drops, wait, reconnect.  Never
    /// returns; cancel it from the outside to shut down.
    ///
    /// `inbox` carries messages posted by background tasks, `outbound` the
    /// envelopes event handlers want delivered.  Both keep being drained while
    /// the backend is unreachable; outbound envelopes queue until the next
    /// connection.
    pub async fn run<D: Send>(
        &self,
        bus: &mut MessageBus<D>,
        inbox: &mut UnboundedReceiver<Message>,
        outbound: &mut UnboundedReceiver<Value>,
    ) {
        loop {
            match self.transport.connect(&self.uri).await {
                Ok(connection) => {
                    info!("backend: connected to {}", self.uri);
                    self.serve(connection, bus, inbox, outbound).await;
                }
                Err(e) => warn!("backend: cannot connect to {}: {e}", self.uri),
            }
            info!("backend: reconnecting in {:?}", self.reconnect_delay);
            self.wait(bus, inbox).await;
        }
    }

    async fn serve<D: Send>(
        &self,
        connection: Connection,
        bus: &mut MessageBus<D>,
        inbox: &mut UnboundedReceiver<Message>,
        outbound: &mut UnboundedReceiver<Value>,
    ) {
        let Connection { mut sink, mut stream } = connection;
        // Registration goes out ahead of anything queued while disconnected.
        let registration = envelope::registration(&self.client_id).to_string();
        if let Err(e) = sink.send(registration).await {
            warn!("backend: registration failed: {e}");
            return;
        }

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.receive(bus, &text).await,
                    Some(Err(e)) => {
                        warn!("backend: {e}");
                        return;
                    }
                    None => {
                        warn!("backend: connection closed");
                        return;
                    }
                },
                Some(message) = inbox.recv() => dispatch(bus, message).await,
                Some(envelope) = outbound.recv() => {
                    let text = envelope.to_string();
                    if let Err(e) = sink.send(text).await {
                        warn!("backend: send failed, dropped {envelope}: {e}");
                        return;
                    }
                }
            }
        }
    }

    /// Sleep out the reconnect delay while still servicing the inbox.
    async fn wait<D: Send>(&self, bus: &mut MessageBus<D>, inbox: &mut UnboundedReceiver<Message>) {
        let delay = tokio::time::sleep(self.reconnect_delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => return,
                Some(message) = inbox.recv() => dispatch(bus, message).await,
            }
        }
    }

    /// Decode one inbound envelope and dispatch it.  Echoes of the gateway's
    /// own connection outcomes are skipped; undecodable envelopes are logged
    /// and dropped.
    async fn receive<D: Send>(&self, bus: &mut MessageBus<D>, text: &str) {
        match envelope::decode(text) {
            Ok(Message::Event(event)) if event.is_connection_outcome() => {
                debug!("backend: ignoring echoed {:?}", event.kind());
            }
            Ok(message) => dispatch(bus, message).await,
            Err(e) => warn!("backend: {e}"),
        }
    }
}

async fn dispatch<D: Send>(bus: &mut MessageBus<D>, message: Message) {
    if let Err(e) = bus.handle(message).await {
        error!("bus: {e}");
    }
}
