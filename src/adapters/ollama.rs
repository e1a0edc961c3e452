//! Ollama LLM adapter
//!
//! HTTP-backed `LlmAdapter` talking to a local Ollama server, grounded in the
//! original system's `llm/ollama.py`. Demonstrates that the LLM contract is
//! genuinely pluggable alongside the process-backed `CliLlmAdapter`.

use super::{LlmAdapter, LlmChunk, LlmRequest};
use crate::clock::SortableId;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Deserialize)]
struct GenerateChunk {
    response: Option<String>,
    #[serde(default)]
    done: bool,
}

/// Talks to `POST {base_url}/api/generate` with `stream: true`, one JSON
/// object per line.
pub struct OllamaAdapter {
    client: reqwest::Client,
    base_url: String,
    model: String,
    cancelled_sessions: Arc<Mutex<HashSet<SortableId>>>,
}

impl OllamaAdapter {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            cancelled_sessions: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }
}

#[async_trait]
impl LlmAdapter for OllamaAdapter {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn healthcheck(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "ollama healthcheck failed");
                false
            }
        }
    }

    async fn generate(&self, request: LlmRequest) -> BoxStream<'static, LlmChunk> {
        self.cancelled_sessions.lock().remove(&request.session_id);

        let model = if request.model.is_empty() || request.model == "auto" {
            self.model.clone()
        } else {
            request.model.clone()
        };

        let body = serde_json::json!({
            "model": model,
            "prompt": request.prompt,
            "stream": true,
        });

        let url = format!("{}/api/generate", self.base_url);
        let response = match self.client.post(&url).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "ollama generate request failed");
                return stream::empty().boxed();
            }
        };

        let session_id = request.session_id;
        let cancelled_sessions = self.cancelled_sessions.clone();
        let byte_stream = response.bytes_stream();

        byte_stream
            .filter_map(|chunk| async move {
                let bytes = chunk.ok()?;
                let text = String::from_utf8_lossy(&bytes).to_string();
                Some(text)
            })
            .flat_map(|text| stream::iter(text.lines().map(str::to_string).collect::<Vec<_>>()))
            .take_while(move |_| {
                let cancelled = cancelled_sessions.lock().contains(&session_id);
                std::future::ready(!cancelled)
            })
            .filter_map(|line| async move {
                if line.trim().is_empty() {
                    return None;
                }
                match serde_json::from_str::<GenerateChunk>(&line) {
                    Ok(parsed) if parsed.done => None,
                    Ok(parsed) => parsed.response.filter(|r| !r.is_empty()).map(|text| LlmChunk { text }),
                    Err(e) => {
                        warn!(error = %e, line = %line, "failed to parse ollama generate line");
                        None
                    }
                }
            })
            .boxed()
    }

    async fn cancel(&self, session_id: SortableId) {
        self.cancelled_sessions.lock().insert(session_id);
    }
}
