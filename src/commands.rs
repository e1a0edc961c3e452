//! Command Handler
//!
//! Maps inbound `Command`s to `Orchestrator` actions and/or event broadcasts
//! (§4.I). Every command, known or not, is acknowledged to its sender;
//! unknown types are ignored but still acknowledged, matching the original
//! system's `command_handler.py::dispatch`'s fallthrough.

use crate::event::{Command, CommandAck};
use crate::orchestrator::Orchestrator;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Dispatches commands against a single shared `Orchestrator`.
pub struct CommandHandler {
    orchestrator: Arc<Orchestrator>,
}

fn str_field<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

fn string_list_field(payload: &Map<String, Value>, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

impl CommandHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Handles one inbound command, returning its acknowledgement. Side
    /// effects (state mutation, event publication) happen before this
    /// returns, except for `start_sim`'s full timeline, which is spawned so
    /// the ack isn't held hostage to an entire session.
    pub async fn handle(&self, command: Command) -> CommandAck {
        debug!(command_type = %command.command_type, "dispatching command");

        match command.command_type.as_str() {
            "start_sim" => {
                let orchestrator = self.orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator.start_sim().await;
                });
            }
            "stop" | "cancel" => {
                self.orchestrator.request_cancel("user_stop").await;
            }
            "mute" => {
                self.orchestrator.publish_muted();
            }
            "sleep" => {
                self.orchestrator.publish_sleep().await;
            }
            "ptt_start" => {
                self.orchestrator.publish_ptt_start();
            }
            "ptt_stop" => {
                self.orchestrator.publish_ptt_stop();
            }
            "set_llm_backend" => {
                if let Some(backend) = str_field(&command.payload, "backend") {
                    self.orchestrator.set_llm_backend(backend);
                }
            }
            "set_llm_profile" => {
                if let Some(profile) = str_field(&command.payload, "profile") {
                    self.orchestrator.set_llm_profile(profile);
                }
            }
            "set_stt_profile" => {
                if let Some(profile) = str_field(&command.payload, "profile") {
                    self.orchestrator.set_stt_profile(profile);
                }
            }
            "set_tts_voice" => {
                if let Some(voice) = str_field(&command.payload, "voice") {
                    self.orchestrator.set_tts_voice(voice);
                }
            }
            "set_ollama_model" => {
                if let Some(model) = str_field(&command.payload, "model") {
                    self.orchestrator.set_ollama_model(model);
                }
            }
            "set_vad_profile" => {
                if let Some(profile) = str_field(&command.payload, "profile") {
                    self.orchestrator.set_vad_profile(profile);
                }
            }
            "set_dsp_mode" => {
                if let Some(mode) = str_field(&command.payload, "mode") {
                    self.orchestrator.set_dsp_mode(mode);
                }
            }
            "set_wake_words" => {
                let words = string_list_field(&command.payload, "words");
                self.orchestrator.set_wake_words(words);
            }
            "set_skill_allowlist" => {
                let allowlist = string_list_field(&command.payload, "allowlist");
                let permissions = command
                    .payload
                    .get("permissions")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                self.orchestrator.set_skill_allowlist(allowlist, permissions);
            }
            "set_routing_mode" => {
                if let Some(mode) = str_field(&command.payload, "mode") {
                    self.orchestrator.set_routing_mode(mode);
                }
            }
            "set_console_mode" => {
                if let Some(mode) = str_field(&command.payload, "mode") {
                    self.orchestrator.set_console_mode(mode);
                }
            }
            "set_dev_context" => {
                let text = str_field(&command.payload, "text").unwrap_or_default().to_string();
                let auto_attach = command.payload.get("auto_attach").and_then(Value::as_bool).unwrap_or(true);
                let mode = str_field(&command.payload, "mode").unwrap_or("once");
                self.orchestrator.set_dev_context(text, auto_attach, mode);
            }
            "watchdog_restart" => {
                let component = str_field(&command.payload, "component").unwrap_or("unknown");
                let reason = str_field(&command.payload, "reason").unwrap_or("exited");
                self.orchestrator.watchdog_restart(component, reason);
            }
            "mark_golden" => {
                self.orchestrator.mark_golden();
            }
            "test_barge_in" => {
                self.orchestrator.test_barge_in().await;
            }
            "raise_error" => {
                self.orchestrator.raise_error();
            }
            "orb_frame_stats" => {
                self.orchestrator.orb_frame_stats(command.payload.clone());
            }
            unknown => {
                debug!(command_type = %unknown, "ignoring unknown command type");
            }
        }

        CommandAck::ok_for(command.command_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sim::{SimLlmAdapter, SimSttAdapter, SimTtsAdapter};
    use crate::bus::EventBus;
    use crate::cas::CasStore;
    use crate::config::RootConfig;
    use crate::manifest::ManifestWriter;
    use crate::orchestrator::Adapters;
    use serde_json::json;

    fn test_handler(dir: &std::path::Path) -> CommandHandler {
        let bus = Arc::new(EventBus::new());
        let cas = CasStore::new(dir.join("cas"));
        let manifest_writer = ManifestWriter::new(dir.join("runs"));
        let adapters = Adapters {
            sim_llm: Arc::new(SimLlmAdapter::new()),
            ollama_llm: Arc::new(SimLlmAdapter::new()),
            cli_llm: Arc::new(SimLlmAdapter::new()),
            stt: Arc::new(SimSttAdapter),
            tts: Arc::new(SimTtsAdapter::new()),
        };
        let orchestrator = Arc::new(Orchestrator::new("sim", RootConfig::default(), bus, cas, manifest_writer, adapters));
        CommandHandler::new(orchestrator)
    }

    #[tokio::test]
    async fn unknown_command_is_still_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let handler = test_handler(dir.path());
        let ack = handler.handle(Command::new("not_a_real_command")).await;
        assert!(ack.ok);
        assert_eq!(ack.command_type, "not_a_real_command");
    }

    #[tokio::test]
    async fn ptt_round_trip_emits_vad_start_then_vad_end_and_empty_stt_final() {
        let dir = tempfile::tempdir().unwrap();
        let handler = test_handler(dir.path());
        let mut sub = handler.orchestrator.event_bus().subscribe();

        handler.handle(Command::new("ptt_start")).await;
        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.event_type, "vad_start");
        assert_eq!(ev.payload.get("source").unwrap(), "ptt");

        handler.handle(Command::new("ptt_stop")).await;
        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.event_type, "vad_end");
        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.event_type, "stt_final");
        assert_eq!(ev.payload.get("text").unwrap(), "");
        assert_eq!(ev.payload.get("confidence").unwrap(), &json!(1.0));
    }

    #[tokio::test]
    async fn set_wake_words_broadcasts_update() {
        let dir = tempfile::tempdir().unwrap();
        let handler = test_handler(dir.path());
        let mut sub = handler.orchestrator.event_bus().subscribe();

        let mut cmd = Command::new("set_wake_words");
        cmd.payload.insert("words".to_string(), json!(["alpha", "beta"]));
        let ack = handler.handle(cmd).await;
        assert!(ack.ok);

        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.event_type, "wake_words_updated");
        assert_eq!(ev.payload.get("words").unwrap(), &json!(["alpha", "beta"]));
    }
}
