//! Event Envelope
//!
//! The wire record for every observable state change. Immutable once emitted;
//! see `bus.rs` for fan-out and `gateway.rs` for the WebSocket framing.

use crate::clock::{new_id, now_ms, SortableId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fixed for this wire format. Bump alongside a documented migration, never silently.
pub const SCHEMA_VERSION: &str = "1.0";

/// Short component tags used across §4.H's timeline.
pub mod component {
    pub const SYSTEM: &str = "system";
    pub const AUDIO: &str = "audio";
    pub const DSP: &str = "dsp";
    pub const WAKE: &str = "wake";
    pub const VAD: &str = "vad";
    pub const STT: &str = "stt";
    pub const ROUTER: &str = "router";
    pub const LLM: &str = "llm";
    pub const TTS: &str = "tts";
    pub const DEVCTX: &str = "devctx";
    pub const ORB: &str = "orb";
}

pub type Payload = Map<String, Value>;

/// An immutable, versioned event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub schema_version: String,
    pub event_id: SortableId,
    pub session_id: SortableId,
    pub ts_unix_ms: i64,
    pub component: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Payload,
}

impl EventEnvelope {
    /// Builds an envelope stamped with the current wall clock.
    pub fn new(
        session_id: SortableId,
        component: impl Into<String>,
        event_type: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            event_id: new_id(),
            session_id,
            ts_unix_ms: now_ms(),
            component: component.into(),
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// An inbound, transient control message (never persisted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub session_id: Option<SortableId>,
    #[serde(default)]
    pub payload: Payload,
}

impl Command {
    pub fn new(command_type: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            session_id: None,
            payload: Payload::new(),
        }
    }
}

/// Acknowledgement sent back to the command-socket sender.
#[derive(Debug, Clone, Serialize)]
pub struct CommandAck {
    pub ok: bool,
    #[serde(rename = "type")]
    pub command_type: String,
}

impl CommandAck {
    pub fn ok_for(command_type: impl Into<String>) -> Self {
        Self {
            ok: true,
            command_type: command_type.into(),
        }
    }
}

/// Builds a JSON payload from literal entries — the common case for event construction.
pub fn payload(entries: impl IntoIterator<Item = (&'static str, Value)>) -> Payload {
    let mut map = Payload::new();
    for (k, v) in entries {
        map.insert(k.to_string(), v);
    }
    map
}
