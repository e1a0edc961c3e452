//! Configuration Snapshot
//!
//! `RootConfig` is the whole-tree configuration loaded once at startup,
//! mirroring the original system's `config.py::RootConfig`. Runtime command
//! overrides mutate a working copy; the snapshot captured at session start
//! (§4.L) is an immutable JSON value taken at that instant and is never
//! rewritten once a session is running.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub backend: String,
    pub sample_rate_hz: u32,
    pub channels_in: u8,
    pub channels_out: u8,
    pub pre_roll_seconds: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: "pipewire".to_string(),
            sample_rate_hz: 48_000,
            channels_in: 1,
            channels_out: 1,
            pre_roll_seconds: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DspAec {
    pub enabled: bool,
    pub method: String,
    pub aggressiveness: String,
}

impl Default for DspAec {
    fn default() -> Self {
        Self {
            enabled: true,
            method: "pipewire-module-echo-cancel".to_string(),
            aggressiveness: "medium".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DspNs {
    pub enabled: bool,
    pub level: u8,
    pub profile: String,
}

impl Default for DspNs {
    fn default() -> Self {
        Self { enabled: true, level: 2, profile: "balanced".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DspAgc {
    pub enabled: bool,
    pub mode: String,
    pub target_level_dbfs: i32,
}

impl Default for DspAgc {
    fn default() -> Self {
        Self { enabled: false, mode: "adaptive".to_string(), target_level_dbfs: -18 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DspConfig {
    pub mode: String,
    pub aec: DspAec,
    pub ns: DspNs,
    pub agc: DspAgc,
}

impl Default for DspConfig {
    fn default() -> Self {
        Self {
            mode: "speakers".to_string(),
            aec: DspAec::default(),
            ns: DspNs::default(),
            agc: DspAgc::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeWordConfig {
    pub engine: String,
    pub threshold: f32,
    pub words: Vec<String>,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        Self {
            engine: "openWakeWord".to_string(),
            threshold: 0.5,
            words: vec!["wanda".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadProfile {
    pub min_speech_ms: u32,
    pub end_silence_ms: u32,
    pub continue_window_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub command: VadProfile,
    pub chat: VadProfile,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            command: VadProfile { min_speech_ms: 120, end_silence_ms: 350, continue_window_ms: 800 },
            chat: VadProfile { min_speech_ms: 160, end_silence_ms: 650, continue_window_ms: 1100 },
        }
    }
}

impl VadConfig {
    /// Looks up a profile by name, falling back to `chat` as the original does.
    pub fn profile(&self, name: &str) -> &VadProfile {
        match name {
            "command" => &self.command,
            _ => &self.chat,
        }
    }

    pub fn has_profile(&self, name: &str) -> bool {
        matches!(name, "command" | "chat")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiCliConfig {
    pub cmd: String,
    pub cwd: String,
    pub isolated_home: String,
    pub rules_file: String,
    pub restart_on_exit: bool,
}

impl Default for GeminiCliConfig {
    fn default() -> Self {
        Self {
            cmd: "gemini".to_string(),
            cwd: ".".to_string(),
            isolated_home: ".runtime/gemini_home".to_string(),
            rules_file: "config/gemini_voice_rules.md".to_string(),
            restart_on_exit: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub stream: bool,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "llama3".to_string(),
            stream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProfile {
    pub model: String,
    #[serde(default)]
    pub auto_reasoning: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: String,
    pub profiles: HashMap<String, LlmProfile>,
    pub active_profile: String,
    pub gemini_cli: GeminiCliConfig,
    pub ollama: OllamaConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert("fast".to_string(), LlmProfile { model: "gemini-3-flash-preview".to_string(), auto_reasoning: false });
        profiles.insert("reasoning".to_string(), LlmProfile { model: "gemini-3-pro-preview".to_string(), auto_reasoning: false });
        profiles.insert("auto".to_string(), LlmProfile { model: "auto".to_string(), auto_reasoning: true });
        Self {
            backend: "gemini_cli".to_string(),
            profiles,
            active_profile: "fast".to_string(),
            gemini_cli: GeminiCliConfig::default(),
            ollama: OllamaConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttProfile {
    pub adapter: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    pub adapter: String,
    pub profiles: HashMap<String, SttProfile>,
    pub active_profile: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert("fast".to_string(), SttProfile { adapter: "faster_whisper".to_string(), model: "small".to_string() });
        profiles.insert("final".to_string(), SttProfile { adapter: "faster_whisper".to_string(), model: "medium".to_string() });
        Self { adapter: "faster_whisper".to_string(), profiles, active_profile: "fast".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub default_voice: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self { default_voice: "edge:de-DE-SeraphinaNeural".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SkillsConfig {
    pub allowlist: Vec<String>,
    pub permissions: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub redaction: bool,
    pub retention_days: u32,
    pub max_runs: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { redaction: true, retention_days: 14, max_runs: 500 }
    }
}

/// The whole-tree configuration. Loaded once from `--config`; runtime
/// command overrides mutate an in-process working copy of this value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    pub schema_version: String,
    pub audio: AudioConfig,
    pub dsp: DspConfig,
    pub wakeword: WakeWordConfig,
    pub vad: VadConfig,
    pub llm: LlmConfig,
    pub stt: SttConfig,
    pub tts: TtsConfig,
    pub skills: SkillsConfig,
    pub logging: LoggingConfig,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            schema_version: "1.0".to_string(),
            audio: AudioConfig::default(),
            dsp: DspConfig::default(),
            wakeword: WakeWordConfig::default(),
            vad: VadConfig::default(),
            llm: LlmConfig::default(),
            stt: SttConfig::default(),
            tts: TtsConfig::default(),
            skills: SkillsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Loads and parses a `RootConfig` from a JSON file on disk.
pub fn load_config(path: impl AsRef<Path>) -> Result<RootConfig, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
}

/// A stable, explicit snapshot for run manifests and the configuration
/// snapshot artifact (§4.L).
pub fn config_snapshot_value(config: &RootConfig) -> serde_json::Value {
    serde_json::to_value(config).expect("RootConfig always serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let config = RootConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: RootConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.llm.active_profile, "fast");
        assert_eq!(back.wakeword.words, vec!["wanda".to_string()]);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let partial = r#"{"llm": {"active_profile": "reasoning"}}"#;
        let config: RootConfig = serde_json::from_str(partial).unwrap();
        assert_eq!(config.llm.active_profile, "reasoning");
        assert_eq!(config.audio.sample_rate_hz, 48_000);
    }

    #[test]
    fn vad_profile_falls_back_to_chat() {
        let vad = VadConfig::default();
        assert_eq!(vad.profile("unknown").end_silence_ms, vad.chat.end_silence_ms);
        assert!(vad.has_profile("command"));
        assert!(!vad.has_profile("unknown"));
    }
}
