//! Session
//!
//! Process-resident state for one wake-to-speak interaction. At most one
//! session is `not ended` at any time (§3 invariant); enforced by the
//! orchestrator, not by this type itself.

use crate::adapters::CancelToken;
use crate::clock::{now_ms, SortableId};

/// The session state machine (§4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Transcribing,
    Reasoning,
    Speaking,
    Cancelling,
    Ended,
}

impl SessionState {
    pub fn is_ended(self) -> bool {
        matches!(self, SessionState::Ended)
    }
}

/// Dev-context attach mode: `once` clears the blob at session end,
/// `persistent` keeps it for the next session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevContextMode {
    Once,
    Persistent,
}

impl DevContextMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DevContextMode::Once => "once",
            DevContextMode::Persistent => "persistent",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "persistent" => DevContextMode::Persistent,
            _ => DevContextMode::Once,
        }
    }
}

/// The untrusted dev-context blob. Content never leaves memory; only its
/// byte length and mode are ever observable (events, manifests, traces).
#[derive(Debug, Clone, Default)]
pub struct DevContext {
    pub text: String,
    pub auto_attach: bool,
    pub mode: DevContextMode,
}

impl Default for DevContextMode {
    fn default() -> Self {
        DevContextMode::Once
    }
}

impl DevContext {
    pub fn byte_len(&self) -> usize {
        self.text.len()
    }

    pub fn is_attachable(&self) -> bool {
        !self.text.trim().is_empty() && self.auto_attach
    }
}

/// Runtime profile selections, mutated by commands between sessions.
#[derive(Debug, Clone)]
pub struct ProfileSelections {
    pub llm_backend: String,
    pub llm_profile: String,
    pub stt_profile: String,
    pub tts_voice: String,
    pub vad_profile: String,
    pub ollama_model: String,
    pub routing_mode: String,
    pub console_mode: String,
}

/// One wake-to-speak interaction.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SortableId,
    pub state: SessionState,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub cancel: CancelToken,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: crate::clock::new_id(),
            state: SessionState::Idle,
            started_at_ms: now_ms(),
            ended_at_ms: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn transition(&mut self, state: SessionState) {
        self.state = state;
        if state == SessionState::Ended {
            self.ended_at_ms = Some(now_ms());
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_context_is_attachable_only_with_nonblank_text_and_auto_attach() {
        let mut ctx = DevContext { text: "  ".to_string(), auto_attach: true, mode: DevContextMode::Once };
        assert!(!ctx.is_attachable());
        ctx.text = "hello".to_string();
        assert!(ctx.is_attachable());
        ctx.auto_attach = false;
        assert!(!ctx.is_attachable());
    }

    #[test]
    fn session_transition_to_ended_stamps_ended_at() {
        let mut session = Session::new();
        assert!(session.ended_at_ms.is_none());
        session.transition(SessionState::Ended);
        assert!(session.ended_at_ms.is_some());
        assert!(session.state.is_ended());
    }
}
