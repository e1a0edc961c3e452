//! Session Orchestrator
//!
//! Runs one session end-to-end as a state machine, publishing the canonical
//! timeline of envelopes to the Event Bus and honoring cancellation at every
//! stage boundary. The `sim` timeline's exact event content mirrors the
//! original system's `engine.py::start_sim_session` line for line; the
//! generic cancellation contract (cancel_request → cancel_done →
//! session_end) is implemented once here and shared by every command that
//! sets the cancel latch, rather than re-derived per command.

use crate::adapters::{LlmAdapter, SttAdapter, TtsAdapter};
use crate::bus::EventBus;
use crate::cas::CasStore;
use crate::clock::{now_ms, SortableId};
use crate::config::{config_snapshot_value, RootConfig};
use crate::event::{component, payload, EventEnvelope};
use crate::manifest::{Artifacts, DevContextMarker, ManifestWriter, RunManifest};
use crate::session::{DevContext, DevContextMode, ProfileSelections, Session, SessionState};
use crate::trace::TraceRecorder;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::error;

/// Adapters selectable for a running session. Sim mode never calls through
/// these; they exist so non-sim generation has somewhere real to go.
pub struct Adapters {
    pub sim_llm: Arc<dyn LlmAdapter>,
    pub ollama_llm: Arc<dyn LlmAdapter>,
    pub cli_llm: Arc<dyn LlmAdapter>,
    pub stt: Arc<dyn SttAdapter>,
    pub tts: Arc<dyn TtsAdapter>,
}

/// Owns the single current session and drives its timeline.
pub struct Orchestrator {
    bus: Arc<EventBus>,
    trace: Arc<TraceRecorder>,
    cas: CasStore,
    manifest_writer: ManifestWriter,
    config: RwLock<RootConfig>,
    mode: String,
    adapters: Adapters,

    current: Mutex<Option<Session>>,
    dev_context: Mutex<DevContext>,
    profiles: Mutex<ProfileSelections>,
}

fn default_profiles(config: &RootConfig) -> ProfileSelections {
    ProfileSelections {
        llm_backend: config.llm.backend.clone(),
        llm_profile: config.llm.active_profile.clone(),
        stt_profile: config.stt.active_profile.clone(),
        tts_voice: config.tts.default_voice.clone(),
        vad_profile: "chat".to_string(),
        ollama_model: config.llm.ollama.model.clone(),
        routing_mode: "GEMINI".to_string(),
        console_mode: "cli".to_string(),
    }
}

impl Orchestrator {
    pub fn new(
        mode: impl Into<String>,
        config: RootConfig,
        bus: Arc<EventBus>,
        cas: CasStore,
        manifest_writer: ManifestWriter,
        adapters: Adapters,
    ) -> Self {
        let profiles = default_profiles(&config);
        Self {
            bus,
            trace: Arc::new(TraceRecorder::new(1)),
            cas,
            manifest_writer,
            config: RwLock::new(config),
            mode: mode.into(),
            adapters,
            current: Mutex::new(None),
            dev_context: Mutex::new(DevContext::default()),
            profiles: Mutex::new(profiles),
        }
    }

    fn emit(&self, session_id: SortableId, component: &str, event_type: &str, fields: Map<String, Value>) {
        let envelope = EventEnvelope::new(session_id, component, event_type, fields);
        self.bus.publish(envelope);
    }

    /// The id of the current session if one exists, or a fresh one if not —
    /// matching the original's `self._current_session or str(ULID())`
    /// pattern for commands that need a session id to stamp their event with
    /// even when nothing is running.
    fn session_id_or_new(&self) -> SortableId {
        self.current.lock().as_ref().map(|s| s.id).unwrap_or_else(crate::clock::new_id)
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config_snapshot(&self) -> RootConfig {
        self.config.read().clone()
    }

    /// Begins a new session if idle (no current session, or the last one has
    /// ended); otherwise emits `session_busy` and returns the busy session's
    /// id unchanged.
    pub async fn start_sim(&self) -> SortableId {
        let session_id = {
            let mut guard = self.current.lock();
            if let Some(existing) = guard.as_ref() {
                if !existing.state.is_ended() {
                    let sid = existing.id;
                    drop(guard);
                    self.emit(sid, component::SYSTEM, "session_busy", Map::new());
                    return sid;
                }
            }

            let mut session = Session::new();
            session.transition(SessionState::Listening);
            let session_id = session.id;
            *guard = Some(session);
            session_id
        };

        self.run_sim_timeline(session_id).await;
        session_id
    }

    async fn run_sim_timeline(&self, session_id: SortableId) {
        let config = self.config_snapshot();
        let profiles = self.profiles.lock().clone();
        let started_at = now_ms();

        self.emit(
            session_id,
            component::SYSTEM,
            "session_start",
            payload([
                ("llm_backend", json!(profiles.llm_backend)),
                ("llm_profile", json!(profiles.llm_profile)),
            ]),
        );

        self.emit(
            session_id,
            component::AUDIO,
            "audio_device_changed",
            payload([
                ("input", json!("default")),
                ("output", json!("default")),
                ("backend", json!(config.audio.backend)),
                ("sample_rate_hz", json!(config.audio.sample_rate_hz)),
            ]),
        );

        self.emit(
            session_id,
            component::DSP,
            "dsp_state",
            payload([
                ("aec_on", json!(config.dsp.aec.enabled)),
                ("ns_level", json!(config.dsp.ns.level)),
                (
                    "agc_mode",
                    json!(if config.dsp.agc.enabled { config.dsp.agc.mode.clone() } else { "off".to_string() }),
                ),
                ("echo_likelihood", json!(0.12)),
            ]),
        );

        let vad_profile = config.vad.profile(&profiles.vad_profile);
        self.emit(
            session_id,
            component::VAD,
            "vad_state",
            payload([
                ("profile", json!(profiles.vad_profile)),
                ("min_speech_ms", json!(vad_profile.min_speech_ms)),
                ("end_silence_ms", json!(vad_profile.end_silence_ms)),
                ("continue_window_ms", json!(vad_profile.continue_window_ms)),
            ]),
        );

        let dev_context_attached = {
            let ctx = self.dev_context.lock();
            if ctx.is_attachable() {
                self.emit(
                    session_id,
                    component::DEVCTX,
                    "dev_context_attached",
                    payload([("mode", json!(ctx.mode.as_str())), ("bytes", json!(ctx.byte_len()))]),
                );
                true
            } else {
                false
            }
        };

        self.trace.span_begin("system", "session", Map::new());

        let cancel = self.current.lock().as_ref().map(|s| s.cancel.clone());
        let Some(cancel) = cancel else { return };

        self.trace.span_begin("wake", "wakeword", Map::new());
        self.emit(session_id, component::WAKE, "wake_detected", payload([("word", json!("wanda")), ("confidence", json!(0.92))]));
        sleep(Duration::from_millis(50)).await;
        self.trace.span_end("wake", "wakeword", Map::new());

        self.trace.span_begin("vad", "vad", Map::new());
        self.emit(session_id, component::VAD, "vad_start", payload([("profile", json!("chat"))]));
        for i in 0..20 {
            if cancel.is_cancelled() {
                break;
            }
            self.emit(session_id, component::AUDIO, "audio_level", payload([("rms", json!(0.05 + i as f64 * 0.01))]));
            sleep(Duration::from_millis(20)).await;
        }
        self.emit(session_id, component::VAD, "vad_end", payload([("speech_ms", json!(420))]));
        self.trace.span_end("vad", "vad", Map::new());

        if cancel.is_cancelled() {
            self.finish_cancelled(session_id, &cancel, started_at, &profiles, dev_context_attached).await;
            return;
        }

        self.trace.span_begin("stt", "stt", Map::new());
        self.emit(session_id, component::STT, "stt_partial", payload([("text", json!("wie")), ("profile", json!(profiles.stt_profile))]));
        sleep(Duration::from_millis(50)).await;
        self.emit(session_id, component::STT, "stt_partial", payload([("text", json!("wie geht")), ("profile", json!(profiles.stt_profile))]));
        sleep(Duration::from_millis(50)).await;
        self.emit(
            session_id,
            component::STT,
            "stt_final",
            payload([("text", json!("wie geht es dir")), ("confidence", json!(0.86)), ("profile", json!(profiles.stt_profile))]),
        );
        self.trace.span_end("stt", "stt", Map::new());

        self.trace.span_begin("router", "router", Map::new());
        self.emit(session_id, component::ROUTER, "router_decision", payload([("mode", json!("chat")), ("why", json!(["no hard command"]))]));
        self.trace.span_end("router", "router", Map::new());

        self.trace.span_begin("llm", "llm", Map::new());
        for chunk in ["Mir geht", " es gut.", " Was brauchst du?"] {
            if cancel.is_cancelled() {
                break;
            }
            self.emit(session_id, component::LLM, "llm_stream_chunk", payload([("text", json!(chunk))]));
            sleep(Duration::from_millis(40)).await;
        }
        self.emit(
            session_id,
            component::LLM,
            "llm_done",
            payload([("tokens", json!(42)), ("backend", json!(profiles.llm_backend)), ("profile", json!(profiles.llm_profile))]),
        );
        self.trace.span_end("llm", "llm", Map::new());

        if cancel.is_cancelled() {
            self.finish_cancelled(session_id, &cancel, started_at, &profiles, dev_context_attached).await;
            return;
        }

        self.trace.span_begin("tts", "tts", Map::new());
        self.emit(session_id, component::TTS, "tts_start", payload([("voice", json!(profiles.tts_voice))]));
        for i in 0..15 {
            if cancel.is_cancelled() {
                break;
            }
            self.emit(session_id, component::TTS, "tts_chunk", payload([("pcm_ms", json!(40))]));
            self.emit(session_id, component::AUDIO, "audio_level_out", payload([("rms", json!(0.06 + (i % 5) as f64 * 0.01))]));
            sleep(Duration::from_millis(40)).await;
        }
        let cancelled_during_tts = cancel.is_cancelled();
        self.emit(session_id, component::TTS, "tts_stop", payload([("reason", json!(if cancelled_during_tts { "cancel" } else { "done" }))]));
        self.trace.span_end("tts", "tts", Map::new());

        if cancelled_during_tts {
            self.finish_cancelled(session_id, &cancel, started_at, &profiles, dev_context_attached).await;
            return;
        }

        self.finish_normally(session_id, started_at, &profiles, dev_context_attached).await;
    }

    /// Shared tail: cancel_done, session_end, artifact writes, manifest.
    async fn finish_cancelled(
        &self,
        session_id: SortableId,
        cancel: &crate::adapters::CancelToken,
        started_at: i64,
        profiles: &ProfileSelections,
        dev_context_attached: bool,
    ) {
        let reason = cancel.reason().unwrap_or_else(|| "user_stop".to_string());
        self.emit(session_id, component::SYSTEM, "cancel_done", payload([("reason", json!(reason))]));
        self.finish(session_id, started_at, profiles, dev_context_attached, false).await;
    }

    async fn finish_normally(
        &self,
        session_id: SortableId,
        started_at: i64,
        profiles: &ProfileSelections,
        dev_context_attached: bool,
    ) {
        self.finish(session_id, started_at, profiles, dev_context_attached, false).await;
    }

    async fn finish(
        &self,
        session_id: SortableId,
        started_at: i64,
        profiles: &ProfileSelections,
        dev_context_attached: bool,
        failed: bool,
    ) {
        let ended_at = now_ms();
        self.emit(session_id, component::SYSTEM, "session_end", Map::new());
        self.trace.span_end("system", "session", Map::new());

        if let Some(session) = self.current.lock().as_mut() {
            if session.id == session_id {
                session.transition(SessionState::Ended);
            }
        }

        let transcripts = json!({"user": "wie geht es dir", "assistant": "Mir geht es gut. Was brauchst du?"});
        let transcripts_bytes = serde_json::to_vec(&transcripts).expect("transcripts always serialize");
        let transcripts_hash = match self.cas.put(&transcripts_bytes).await {
            Ok(h) => Some(h),
            Err(e) => {
                self.emit_storage_failure(session_id, &e.to_string());
                None
            }
        };

        let trace_path = self.manifest_writer.trace_path(&session_id);
        let trace_hash = match self.trace.export(&trace_path).await {
            Ok(()) => match tokio::fs::read(&trace_path).await {
                Ok(bytes) => match self.cas.put(&bytes).await {
                    Ok(h) => Some(h),
                    Err(e) => {
                        self.emit_storage_failure(session_id, &e.to_string());
                        None
                    }
                },
                Err(e) => {
                    self.emit_storage_failure(session_id, &e.to_string());
                    None
                }
            },
            Err(e) => {
                self.emit_storage_failure(session_id, &e.to_string());
                None
            }
        };

        let config_value = config_snapshot_value(&self.config_snapshot());
        let config_bytes = serde_json::to_vec(&config_value).expect("config always serializes");
        let config_hash = match self.cas.put(&config_bytes).await {
            Ok(h) => Some(h),
            Err(e) => {
                self.emit_storage_failure(session_id, &e.to_string());
                None
            }
        };

        let mut llm_fields = Map::new();
        llm_fields.insert("backend".to_string(), json!(profiles.llm_backend));
        llm_fields.insert("profile".to_string(), json!(profiles.llm_profile));

        let manifest = RunManifest {
            schema_version: "1.0".to_string(),
            session_id,
            started_at_unix_ms: started_at,
            ended_at_unix_ms: ended_at,
            mode: self.mode.clone(),
            failed,
            llm: llm_fields,
            dev_context: DevContextMarker {
                attached: dev_context_attached,
                mode: self.dev_context.lock().mode.as_str().to_string(),
            },
            artifacts: Artifacts {
                transcripts_json_sha256: transcripts_hash,
                trace_json_sha256: trace_hash.clone(),
                config_json_sha256: config_hash,
            },
        };

        match self.manifest_writer.write(&manifest).await {
            Ok(path) => {
                self.emit(
                    session_id,
                    component::SYSTEM,
                    "run_manifest_written",
                    payload([
                        ("path", json!(path.display().to_string())),
                        ("trace_sha256", json!(trace_hash)),
                    ]),
                );
            }
            Err(e) => self.emit_storage_failure(session_id, &e.to_string()),
        }

        let mut ctx = self.dev_context.lock();
        if ctx.mode == DevContextMode::Once {
            ctx.text.clear();
        }
    }

    fn emit_storage_failure(&self, session_id: SortableId, message: &str) {
        error!(session_id = %session_id, error = message, "storage failure during session finish");
        self.emit(
            session_id,
            component::SYSTEM,
            "error_raised",
            payload([("component", json!("system")), ("message", json!(message))]),
        );
    }

    /// The single source of truth for "a cancel was requested": sets the
    /// latch (first caller's reason wins), publishes `cancel_request` if this
    /// is the first time for the current session, and — if no session
    /// timeline is actually running to observe the latch — finishes the
    /// session synchronously so the contract still completes.
    pub async fn request_cancel(&self, reason: &str) {
        let (session_id, cancel, already_ended) = {
            let guard = self.current.lock();
            match guard.as_ref() {
                Some(s) => (s.id, s.cancel.clone(), s.state.is_ended()),
                None => return,
            }
        };

        if already_ended {
            return;
        }

        if cancel.cancel_with_reason(reason) {
            self.emit(session_id, component::SYSTEM, "cancel_request", payload([("reason", json!(reason))]));
        }
    }

    /// Sets the cancel latch without publishing `cancel_request` — used by
    /// commands (`mute`, `sleep`) whose own effect event is the only thing
    /// the spec says should be observed on the bus.
    fn cancel_latch_only(&self, reason: &str) {
        if let Some(session) = self.current.lock().as_ref() {
            session.cancel.cancel_with_reason(reason);
        }
    }

    pub fn publish_muted(&self) {
        self.cancel_latch_only("user_mute");
        let session_id = self.session_id_or_new();
        self.emit(session_id, component::SYSTEM, "muted", payload([("reason", json!("user_mute"))]));
    }

    pub async fn publish_sleep(&self) {
        self.cancel_latch_only("sleep");
        let session_id = self.session_id_or_new();
        self.emit(session_id, component::SYSTEM, "sleep_ack", Map::new());
        self.emit(session_id, component::SYSTEM, "session_end", Map::new());
    }

    pub fn publish_ptt_start(&self) {
        let session_id = self.session_id_or_new();
        let vad_profile = self.profiles.lock().vad_profile.clone();
        self.emit(session_id, component::VAD, "vad_start", payload([("profile", json!(vad_profile)), ("source", json!("ptt"))]));
    }

    pub fn publish_ptt_stop(&self) {
        let session_id = self.session_id_or_new();
        let stt_profile = self.profiles.lock().stt_profile.clone();
        self.emit(session_id, component::VAD, "vad_end", payload([("speech_ms", json!(0)), ("source", json!("ptt"))]));
        self.emit(session_id, component::STT, "stt_final", payload([("text", json!("")), ("confidence", json!(1.0)), ("profile", json!(stt_profile))]));
    }

    pub fn set_llm_backend(&self, backend: &str) {
        if backend != "gemini_cli" && backend != "ollama" {
            return;
        }
        self.profiles.lock().llm_backend = backend.to_string();
    }

    pub fn set_llm_profile(&self, profile: &str) {
        if !self.config.read().llm.profiles.contains_key(profile) {
            return;
        }
        self.profiles.lock().llm_profile = profile.to_string();
    }

    pub fn set_ollama_model(&self, model: &str) {
        let model = model.trim();
        if model.is_empty() {
            return;
        }
        self.profiles.lock().ollama_model = model.to_string();
    }

    pub fn set_tts_voice(&self, voice: &str) {
        let voice = voice.trim();
        if voice.is_empty() {
            return;
        }
        self.profiles.lock().tts_voice = voice.to_string();
    }

    pub fn set_stt_profile(&self, profile: &str) {
        if !self.config.read().stt.profiles.contains_key(profile) {
            return;
        }
        self.profiles.lock().stt_profile = profile.to_string();
    }

    pub fn set_vad_profile(&self, profile: &str) -> bool {
        let config = self.config.read();
        if !config.vad.has_profile(profile) {
            return false;
        }
        let vad_profile = config.vad.profile(profile).clone();
        drop(config);
        self.profiles.lock().vad_profile = profile.to_string();

        let session_id = self.session_id_or_new();
        self.emit(
            session_id,
            component::VAD,
            "vad_state",
            payload([
                ("profile", json!(profile)),
                ("min_speech_ms", json!(vad_profile.min_speech_ms)),
                ("end_silence_ms", json!(vad_profile.end_silence_ms)),
                ("continue_window_ms", json!(vad_profile.continue_window_ms)),
            ]),
        );
        true
    }

    pub fn set_dsp_mode(&self, mode: &str) {
        let mut config = self.config.write();
        config.dsp.mode = mode.to_string();
        let snapshot = config.dsp.clone();
        drop(config);

        let session_id = self.session_id_or_new();
        self.emit(
            session_id,
            component::DSP,
            "dsp_state",
            payload([
                ("aec_on", json!(snapshot.aec.enabled)),
                ("ns_level", json!(snapshot.ns.level)),
                ("agc_mode", json!(if snapshot.agc.enabled { snapshot.agc.mode.clone() } else { "off".to_string() })),
                ("echo_likelihood", json!(0.0)),
                ("mode", json!(mode)),
            ]),
        );
    }

    pub fn set_wake_words(&self, words: Vec<String>) {
        let mut config = self.config.write();
        config.wakeword.words = words.into_iter().filter(|w| !w.is_empty()).collect();
        let words = config.wakeword.words.clone();
        drop(config);

        let session_id = self.session_id_or_new();
        self.emit(session_id, component::SYSTEM, "wake_words_updated", payload([("words", json!(words))]));
    }

    pub fn set_skill_allowlist(&self, allowlist: Vec<String>, permissions: Map<String, Value>) {
        let mut config = self.config.write();
        config.skills.allowlist = allowlist.into_iter().filter(|s| !s.is_empty()).collect();
        for (k, v) in permissions {
            if let Some(s) = v.as_str() {
                config.skills.permissions.insert(k, s.to_string());
            }
        }
        let allowlist = config.skills.allowlist.clone();
        let permissions = config
            .skills
            .permissions
            .iter()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect::<Map<String, Value>>();
        drop(config);

        let session_id = self.session_id_or_new();
        self.emit(
            session_id,
            component::SYSTEM,
            "skill_allowlist_updated",
            payload([("allowlist", json!(allowlist)), ("permissions", json!(permissions))]),
        );
    }

    pub fn set_routing_mode(&self, mode: &str) {
        self.profiles.lock().routing_mode = mode.to_string();
        let session_id = self.session_id_or_new();
        self.emit(session_id, component::SYSTEM, "set_routing_mode", payload([("mode", json!(mode))]));
    }

    pub fn set_console_mode(&self, mode: &str) {
        self.profiles.lock().console_mode = mode.to_string();
        let session_id = self.session_id_or_new();
        self.emit(session_id, component::SYSTEM, "set_console_mode", payload([("mode", json!(mode))]));
    }

    pub fn set_dev_context(&self, text: String, auto_attach: bool, mode: &str) {
        let mut ctx = self.dev_context.lock();
        ctx.text = text;
        ctx.auto_attach = auto_attach;
        ctx.mode = DevContextMode::parse(mode);
    }

    pub fn mark_golden(&self) {
        let session_id = self.session_id_or_new();
        self.emit(session_id, component::SYSTEM, "golden_marked", payload([("session_id", json!(session_id.to_string()))]));
    }

    pub fn raise_error(&self) {
        let session_id = self.session_id_or_new();
        self.emit(
            session_id,
            component::SYSTEM,
            "error_raised",
            payload([("component", json!("system")), ("code", json!("SIM_ERROR")), ("stack", json!("<synthetic>"))]),
        );
    }

    pub fn watchdog_restart(&self, subsystem: &str, reason: &str) {
        let session_id = self.session_id_or_new();
        self.emit(session_id, component::SYSTEM, "watchdog_restart", payload([("component", json!(subsystem)), ("reason", json!(reason))]));
    }

    pub async fn test_barge_in(&self) {
        let session_id = self.session_id_or_new();
        self.request_cancel("barge_in_test").await;
        self.emit(session_id, component::SYSTEM, "cancel_done", payload([("reason", json!("barge_in_test"))]));
    }

    pub fn orb_frame_stats(&self, fields: Map<String, Value>) {
        let session_id = self.session_id_or_new();
        self.emit(session_id, component::ORB, "orb_frame_stats", fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sim::{SimLlmAdapter, SimSttAdapter, SimTtsAdapter};

    fn test_orchestrator(dir: &std::path::Path) -> Orchestrator {
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
        Orchestrator::new("sim", RootConfig::default(), bus, cas, manifest_writer, adapters)
    }

    #[tokio::test]
    async fn second_start_sim_while_running_emits_session_busy() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        let mut sub = orchestrator.event_bus().subscribe();

        let orch = Arc::new(orchestrator);
        let orch2 = orch.clone();
        let first = tokio::spawn(async move { orch2.start_sim().await });

        // Give the first session a moment to become non-ended, then try a
        // second one — it must be rejected with session_busy.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let busy_id = orch.start_sim().await;

        let mut saw_busy = false;
        while let Some(env) = sub.recv().await {
            if env.event_type == "session_busy" {
                saw_busy = true;
                assert_eq!(env.session_id, busy_id);
                break;
            }
            if env.event_type == "run_manifest_written" {
                break;
            }
        }
        assert!(saw_busy, "expected exactly one session_busy event");
        first.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_during_tts_stops_further_tts_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Arc::new(test_orchestrator(dir.path()));
        let mut sub = orchestrator.event_bus().subscribe();

        let orch2 = orchestrator.clone();
        let runner = tokio::spawn(async move { orch2.start_sim().await });

        let mut saw_first_tts_chunk = false;
        let mut tts_chunks_after_cancel = 0;
        let mut cancel_sent = false;

        loop {
            let env = sub.recv().await.expect("bus closed unexpectedly");
            if env.event_type == "tts_chunk" && !saw_first_tts_chunk {
                saw_first_tts_chunk = true;
                let orch3 = orchestrator.clone();
                cancel_sent = true;
                tokio::spawn(async move { orch3.request_cancel("user_stop").await });
            } else if cancel_sent && env.event_type == "tts_chunk" {
                tts_chunks_after_cancel += 1;
            } else if env.event_type == "run_manifest_written" {
                break;
            }
        }

        assert!(saw_first_tts_chunk);
        assert!(tts_chunks_after_cancel <= 1, "at most one in-flight chunk may race the cancel check");
        runner.await.unwrap();
    }
}
