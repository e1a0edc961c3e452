//! WebSocket Gateway
//!
//! A single TCP listener serving two endpoints (§4.J), the way
//! `call_server.rs`'s `start_call_server` owns one `TcpListener` and spawns a
//! task per accepted connection:
//!
//! - `/ws/events` — subscribe: forwards every envelope dequeued from the
//!   Event Bus as one text frame per envelope.
//! - `/ws/command` — publish: parses each inbound text frame as a `Command`,
//!   dispatches it through the `CommandHandler`, and replies with an ack.
//!
//! Any other path is accepted at the WebSocket layer (so the handshake
//! itself always succeeds) and then closed immediately with a
//! policy-violation close frame and an explanatory reason.

use crate::bus::EventBus;
use crate::commands::CommandHandler;
use crate::event::Command;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

const EVENTS_PATH: &str = "/ws/events";
const COMMAND_PATH: &str = "/ws/command";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Shared gateway state: the bus subscribers connect to, and the command
/// handler inbound frames dispatch through.
pub struct Gateway {
    bus: Arc<EventBus>,
    commands: Arc<CommandHandler>,
    /// If set, the first `/ws/events` subscriber triggers one synthetic
    /// `start_sim`, via the same command path a real client would use.
    autostart: bool,
    autostart_fired: AtomicBool,
}

impl Gateway {
    pub fn new(bus: Arc<EventBus>, commands: Arc<CommandHandler>, autostart: bool) -> Self {
        Self { bus, commands, autostart, autostart_fired: AtomicBool::new(false) }
    }

    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;
        info!(%addr, "websocket gateway listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed, continuing");
                    continue;
                }
            };
            let gateway = self.clone();
            tokio::spawn(async move {
                gateway.handle_connection(stream, peer).await;
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let path = Arc::new(Mutex::new(String::new()));
        let path_cb = path.clone();
        let callback = move |req: &Request, resp: Response| {
            *path_cb.lock() = req.uri().path().to_string();
            Ok(resp)
        };

        let ws_stream = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(peer = %peer, error = %e, "websocket handshake failed");
                return;
            }
        };

        let path = path.lock().clone();
        debug!(peer = %peer, path = %path, "websocket connection accepted");

        match path.as_str() {
            EVENTS_PATH => self.serve_events(ws_stream).await,
            COMMAND_PATH => self.serve_commands(ws_stream).await,
            other => {
                let mut ws_stream = ws_stream;
                let _ = ws_stream
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Policy,
                        reason: format!("unknown path: {other}").into(),
                    })))
                    .await;
            }
        }

        debug!(peer = %peer, "websocket connection closed");
    }

    async fn serve_events(&self, ws_stream: WebSocketStream<TcpStream>) {
        let mut sub = self.bus.subscribe();
        let (mut sender, mut receiver) = ws_stream.split();

        if self.autostart && !self.autostart_fired.swap(true, Ordering::SeqCst) {
            let ack = self.commands.handle(Command::new("start_sim")).await;
            debug!(?ack, "autostart start_sim dispatched");
        }

        loop {
            tokio::select! {
                envelope = sub.recv() => {
                    let Some(envelope) = envelope else { break };
                    let text = match envelope.to_json_string() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "failed to serialize envelope, skipping");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                incoming = receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        _ => {} // ignore pings/unexpected frames from an events-only client
                    }
                }
            }
        }

        self.bus.unsubscribe(sub.id());
    }

    async fn serve_commands(&self, ws_stream: WebSocketStream<TcpStream>) {
        let (mut sender, mut receiver) = ws_stream.split();

        while let Some(message) = receiver.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "command socket read error, closing");
                    break;
                }
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            let command: Command = match serde_json::from_str(&text) {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!(error = %e, frame = %text, "malformed command frame, ignoring");
                    continue;
                }
            };

            let ack = self.commands.handle(command).await;
            let ack_text = serde_json::to_string(&ack).expect("CommandAck always serializes");
            if sender.send(Message::Text(ack_text.into())).await.is_err() {
                break;
            }
        }
    }
}
