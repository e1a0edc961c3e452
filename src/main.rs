//! Vox Core host process
//!
//! Loads configuration, acquires the single-instance lock, wires the
//! Orchestrator to its adapters and the WebSocket Gateway, and runs until
//! signaled to stop. Exits 0 on clean shutdown, non-zero only on fatal init
//! failure (config load, port bind, lock contention).

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vox_core::adapters::cli_llm::CliLlmAdapter;
use vox_core::adapters::ollama::OllamaAdapter;
use vox_core::adapters::sim::{SimLlmAdapter, SimSttAdapter, SimTtsAdapter};
use vox_core::{Adapters, CasStore, CommandHandler, Gateway, ManifestWriter, Orchestrator, ProcessSupervisor, RootConfig, SingleInstanceLock};

#[derive(Parser, Debug)]
#[command(name = "vox-core", about = "Voice-assistant orchestration core")]
struct Cli {
    /// Pipeline mode to run. Only `sim` is implemented by the core itself;
    /// real STT/TTS/LLM backends are consumed through the adapter contracts.
    #[arg(long, default_value = "sim")]
    mode: String,

    /// Path to a JSON RootConfig. Defaults are used for anything absent.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "127.0.0.1")]
    ws_host: String,

    #[arg(long, default_value_t = 7777)]
    ws_port: u16,

    #[arg(long, default_value = "runs")]
    runs_dir: PathBuf,

    #[arg(long, default_value = "cas")]
    cas_dir: PathBuf,

    /// Issue one synthetic `start_sim` the first time an /ws/events
    /// subscriber connects.
    #[arg(long, default_value_t = false)]
    autostart: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_adapters(config: &RootConfig) -> Adapters {
    let gemini = &config.llm.gemini_cli;
    let supervisor = ProcessSupervisor::new(gemini.cmd.clone(), gemini.cwd.clone(), gemini.isolated_home.clone(), gemini.restart_on_exit);
    let rules_text = std::fs::read_to_string(&gemini.rules_file).ok();

    Adapters {
        sim_llm: Arc::new(SimLlmAdapter::new()),
        ollama_llm: Arc::new(OllamaAdapter::new(config.llm.ollama.base_url.clone(), config.llm.ollama.model.clone())),
        cli_llm: Arc::new(CliLlmAdapter::new(supervisor, rules_text)),
        stt: Arc::new(SimSttAdapter),
        tts: Arc::new(SimTtsAdapter::new()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(mode = %cli.mode, ws_host = %cli.ws_host, ws_port = cli.ws_port, "starting vox-core");

    let lock_path = cli.runs_dir.join(".vox-core.pid");
    let _instance_lock = SingleInstanceLock::acquire(&lock_path).context("another vox-core instance appears to be running")?;

    let config = match &cli.config {
        Some(path) => vox_core::load_config(path).with_context(|| format!("loading config from {}", path.display()))?,
        None => RootConfig::default(),
    };

    let bus = Arc::new(vox_core::EventBus::new());
    let cas = CasStore::new(&cli.cas_dir);
    let manifest_writer = ManifestWriter::new(&cli.runs_dir);
    let adapters = init_adapters(&config);

    let orchestrator = Arc::new(Orchestrator::new(cli.mode.clone(), config, bus.clone(), cas, manifest_writer, adapters));
    let command_handler = Arc::new(CommandHandler::new(orchestrator));
    let gateway = Arc::new(Gateway::new(bus, command_handler, cli.autostart));

    let addr: SocketAddr = format!("{}:{}", cli.ws_host, cli.ws_port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cli.ws_host, cli.ws_port))?;

    gateway.serve(addr).await.context("gateway failed")?;
    Ok(())
}
