//! Relay (split mode)
//!
//! A reduced gateway with the same two endpoints as `gateway.rs` but no
//! `Orchestrator` behind it: commands are translated into broadcast events
//! through a static table instead of driving a session. Used for UI bring-up
//! and wiring tests (§4.K) — an implementer should run either this or the
//! full gateway on a given port, never both, since the two disagree on what
//! commands like `sleep` actually do (the orchestrator is authoritative when
//! both are present).

use crate::bus::EventBus;
use crate::event::{component, Command, CommandAck, EventEnvelope};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::net::SocketAddr;
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
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// For each command type, the fixed list of event types it broadcasts (with
/// the command's payload merged in), mirroring the original UI-dev stub's
/// `relay.py::COMMAND_EVENTS` table.
fn mapped_events(command_type: &str) -> &'static [&'static str] {
    match command_type {
        "start_sim" => &["session_start"],
        "stop" | "cancel" => &["cancel_request"],
        "mute" => &["muted"],
        "sleep" => &["sleep_ack", "session_end"],
        "ptt_start" => &["vad_start"],
        "ptt_stop" => &["vad_end", "stt_final"],
        "mark_golden" => &["golden_marked"],
        "test_barge_in" => &["cancel_request", "cancel_done"],
        "raise_error" => &["error_raised"],
        _ => &[],
    }
}

/// Commands whose verbatim event (same `type`, same `payload`) is also
/// broadcast — the "pass-through" table entries (§4.K, §9's open question on
/// `orb_frame_stats`).
fn is_pass_through(command_type: &str) -> bool {
    matches!(
        command_type,
        "set_llm_backend"
            | "set_llm_profile"
            | "set_stt_profile"
            | "set_tts_voice"
            | "set_ollama_model"
            | "set_vad_profile"
            | "set_dsp_mode"
            | "set_wake_words"
            | "set_skill_allowlist"
            | "set_routing_mode"
            | "set_console_mode"
            | "set_dev_context"
            | "watchdog_restart"
            | "orb_frame_stats"
    )
}

fn component_for(event_type: &str) -> &'static str {
    match event_type {
        "vad_start" | "vad_end" => component::VAD,
        "stt_final" => component::STT,
        _ => component::SYSTEM,
    }
}

/// Stand-alone pub/sub hub: no orchestrator, no sessions, just the bus and a
/// static command-to-events table.
pub struct Relay {
    bus: Arc<EventBus>,
}

impl Relay {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<(), RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        info!(%addr, "relay listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed, continuing");
                    continue;
                }
            };
            let relay = self.clone();
            tokio::spawn(async move { relay.handle_connection(stream, peer).await });
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
        debug!(peer = %peer, path = %path, "relay connection accepted");

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
    }

    async fn serve_events(&self, ws_stream: WebSocketStream<TcpStream>) {
        let mut sub = self.bus.subscribe();
        let (mut sender, mut receiver) = ws_stream.split();

        loop {
            tokio::select! {
                envelope = sub.recv() => {
                    let Some(envelope) = envelope else { break };
                    let Ok(text) = envelope.to_json_string() else { continue };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                incoming = receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        _ => {}
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
                Err(_) => break,
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

            self.dispatch(&command);

            let ack = CommandAck::ok_for(command.command_type.clone());
            let ack_text = serde_json::to_string(&ack).expect("CommandAck always serializes");
            if sender.send(Message::Text(ack_text.into())).await.is_err() {
                break;
            }
        }
    }

    /// Applies the static command-to-events table: broadcasts each mapped
    /// event with the command's payload merged in, and a verbatim
    /// pass-through event when the command type is in that allow-list.
    fn dispatch(&self, command: &Command) {
        let session_id = command.session_id.unwrap_or_else(crate::clock::new_id);

        for event_type in mapped_events(&command.command_type) {
            let mut fields: Map<String, Value> = command.payload.clone();
            fields.entry("source_command".to_string()).or_insert_with(|| Value::from(command.command_type.clone()));
            let envelope = EventEnvelope::new(session_id, component_for(event_type), *event_type, fields);
            self.bus.publish(envelope);
        }

        if is_pass_through(&command.command_type) {
            let envelope = EventEnvelope::new(
                session_id,
                component::SYSTEM,
                command.command_type.clone(),
                command.payload.clone(),
            );
            self.bus.publish(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_routing_mode_passes_through_verbatim() {
        let bus = Arc::new(EventBus::new());
        let relay = Relay::new(bus);
        let mut sub = relay.event_bus().subscribe();

        let mut cmd = Command::new("set_routing_mode");
        cmd.payload.insert("mode".to_string(), Value::from("X"));
        relay.dispatch(&cmd);

        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.event_type, "set_routing_mode");
        assert_eq!(ev.payload.get("mode").unwrap(), "X");
    }

    #[tokio::test]
    async fn ptt_stop_broadcasts_both_mapped_events_in_order() {
        let bus = Arc::new(EventBus::new());
        let relay = Relay::new(bus);
        let mut sub = relay.event_bus().subscribe();

        relay.dispatch(&Command::new("ptt_stop"));

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.event_type, "vad_end");
        assert_eq!(second.event_type, "stt_final");
    }

    #[tokio::test]
    async fn unmapped_non_pass_through_command_broadcasts_nothing() {
        let bus = Arc::new(EventBus::new());
        let relay = Relay::new(bus);
        let mut sub = relay.event_bus().subscribe();

        relay.dispatch(&Command::new("totally_unknown"));
        relay.dispatch(&Command::new("mark_golden"));

        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.event_type, "golden_marked");
    }
}
