//! Process-backed LLM adapter
//!
//! Wraps a persistent CLI subprocess (e.g. a `gemini` binary) behind the
//! `LlmAdapter` contract, using a `ProcessSupervisor` to own the child and
//! restart it on model/profile change. Grounded in the original system's
//! `llm/gemini_cli.py::GeminiCLIAdapter` — an untrusted boundary: only this
//! adapter decides when to relaunch, the orchestrator never touches the
//! child directly.

use super::{LlmAdapter, LlmChunk, LlmRequest};
use crate::clock::SortableId;
use crate::supervisor::ProcessSupervisor;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::warn;

pub struct CliLlmAdapter {
    supervisor: ProcessSupervisor,
    rules_text: Option<String>,
    cancelled_sessions: Arc<Mutex<HashSet<SortableId>>>,
}

impl CliLlmAdapter {
    pub fn new(supervisor: ProcessSupervisor, rules_text: Option<String>) -> Self {
        Self {
            supervisor,
            rules_text,
            cancelled_sessions: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

#[async_trait]
impl LlmAdapter for CliLlmAdapter {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn healthcheck(&self) -> bool {
        match self.supervisor.ensure_running("auto").await {
            Ok(mut guard) => guard
                .as_mut()
                .map(|r| r.child.try_wait().ok().flatten().is_none())
                .unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "cli llm healthcheck failed to spawn");
                false
            }
        }
    }

    async fn generate(&self, request: LlmRequest) -> BoxStream<'static, LlmChunk> {
        self.cancelled_sessions.lock().remove(&request.session_id);

        let mut guard = match self.supervisor.ensure_running(&request.model).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(error = %e, "cli llm failed to ensure process running");
                return stream::empty().boxed();
            }
        };

        let running = match guard.as_mut() {
            Some(r) => r,
            None => return stream::empty().boxed(),
        };

        let mut prompt = String::new();
        if let Some(rules) = &self.rules_text {
            prompt.push_str(rules.trim());
            prompt.push_str("\n\n");
        }
        prompt.push_str(request.prompt.trim());
        prompt.push('\n');

        let Some(stdin) = running.child.stdin.as_mut() else {
            return stream::empty().boxed();
        };
        if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
            warn!(error = %e, "failed writing prompt to supervised process");
            return stream::empty().boxed();
        }

        let Some(lines) = running.stdout_lines.clone() else {
            return stream::empty().boxed();
        };

        let session_id = request.session_id;
        let cancelled_sessions = self.cancelled_sessions.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            loop {
                if cancelled_sessions.lock().contains(&session_id) {
                    break;
                }
                let mut lines = lines.lock().await;
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        drop(lines);
                        if tx.send(LlmChunk { text: line }).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        });

        tokio_stream::wrappers::ReceiverStream::new(rx).boxed()
    }

    async fn cancel(&self, session_id: SortableId) {
        self.cancelled_sessions.lock().insert(session_id);
    }
}
