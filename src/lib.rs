//! Vox Core
//!
//! Voice-assistant orchestration core: a long-running process that drives a
//! wake → capture → speech-to-text → reasoning → text-to-speech session
//! pipeline and fans every state change out to observers (an orb indicator,
//! a mission-control dashboard) over WebSockets, while accepting commands
//! from those observers to steer the session in real time.
//!
//! # Architecture
//!
//! ```text
//! /ws/command ──▶ CommandHandler ──▶ Orchestrator ──▶ EventBus ──▶ /ws/events
//!                                        │
//!                                        ├── TraceRecorder (spans, exported per session)
//!                                        └── CasStore + ManifestWriter (run artifacts)
//! ```
//!
//! Everything downstream of the Orchestrator is pluggable: STT, TTS, and LLM
//! backends implement the small adapter contracts in `adapters`, so a sim
//! backend, a local HTTP model, and a supervised CLI subprocess are all the
//! same shape to the session timeline in `orchestrator`.

pub mod adapters;
pub mod bus;
pub mod cas;
pub mod clock;
pub mod commands;
pub mod config;
pub mod event;
pub mod gateway;
pub mod manifest;
pub mod orchestrator;
pub mod relay;
pub mod runtime;
pub mod session;
pub mod supervisor;
pub mod trace;

pub use adapters::{AdapterError, CancelToken, LlmAdapter, SttAdapter, TtsAdapter};
pub use bus::{EventBus, SubscriberId, Subscription};
pub use cas::{CasError, CasStore};
pub use clock::{new_id, now_ms, now_us, SortableId};
pub use commands::CommandHandler;
pub use config::{load_config, ConfigError, RootConfig};
pub use event::{Command, CommandAck, EventEnvelope};
pub use gateway::{Gateway, GatewayError};
pub use manifest::{ManifestError, ManifestWriter, RunManifest};
pub use orchestrator::{Adapters, Orchestrator};
pub use relay::{Relay, RelayError};
pub use runtime::{LockError, SingleInstanceLock};
pub use session::{Session, SessionState};
pub use supervisor::{ProcessSupervisor, SupervisorError};
pub use trace::{TraceError, TraceRecorder};
