//! Simulated adapters
//!
//! Lightweight stand-ins that satisfy the STT/TTS/LLM contracts without any
//! external process or model. Used by tests and as the default backend
//! selection; the orchestrator's `start_sim` timeline (§4.H) does not call
//! through these at all — it reproduces the canonical scripted session
//! directly, the way the original engine's `start_sim_session` does.

use super::{LlmAdapter, LlmChunk, LlmRequest, SttAdapter, SttResult, TtsAdapter};
use crate::clock::SortableId;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Echoes a fixed final transcript regardless of input, after one partial.
pub struct SimSttAdapter;

#[async_trait]
impl SttAdapter for SimSttAdapter {
    fn name(&self) -> &'static str {
        "sim"
    }

    async fn transcribe_stream(
        &self,
        _chunks: BoxStream<'static, Vec<u8>>,
    ) -> BoxStream<'static, SttResult> {
        let partial = SttResult {
            text: "wie".to_string(),
            confidence: 0.4,
            is_final: false,
            language: None,
            start_ms: None,
            end_ms: None,
        };
        let final_result = SttResult::final_text("wie geht es dir", 0.86);
        stream::iter(vec![partial, final_result]).boxed()
    }

    async fn transcribe_blob(&self, _bytes: Vec<u8>) -> SttResult {
        SttResult::final_text("", 1.0)
    }
}

/// Produces a handful of fixed-size silent PCM chunks, honoring `stop()`.
pub struct SimTtsAdapter {
    stopped: Arc<std::sync::atomic::AtomicBool>,
}

impl SimTtsAdapter {
    pub fn new() -> Self {
        Self { stopped: Arc::new(std::sync::atomic::AtomicBool::new(false)) }
    }
}

impl Default for SimTtsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TtsAdapter for SimTtsAdapter {
    fn name(&self) -> &'static str {
        "sim"
    }

    async fn synthesize_stream(
        &self,
        _text_chunks: BoxStream<'static, String>,
    ) -> BoxStream<'static, Vec<u8>> {
        self.stopped.store(false, std::sync::atomic::Ordering::SeqCst);
        let stopped = self.stopped.clone();
        stream::iter(0..15)
            .take_while(move |_| {
                let still_running = !stopped.load(std::sync::atomic::Ordering::SeqCst);
                std::future::ready(still_running)
            })
            .map(|_| vec![0u8; 320]) // 40ms of 8kHz 16-bit silence
            .boxed()
    }

    fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Streams the canonical demo reply in three chunks, matching the session
/// timeline's `"Mir geht es gut. Was brauchst du?"` response.
pub struct SimLlmAdapter {
    cancelled_sessions: Mutex<HashSet<SortableId>>,
}

impl SimLlmAdapter {
    pub fn new() -> Self {
        Self { cancelled_sessions: Mutex::new(HashSet::new()) }
    }
}

impl Default for SimLlmAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmAdapter for SimLlmAdapter {
    fn name(&self) -> &'static str {
        "sim"
    }

    async fn healthcheck(&self) -> bool {
        true
    }

    async fn generate(&self, request: LlmRequest) -> BoxStream<'static, LlmChunk> {
        self.cancelled_sessions.lock().remove(&request.session_id);
        let chunks = ["Mir geht", " es gut.", " Was brauchst du?"]
            .into_iter()
            .map(|text| LlmChunk { text: text.to_string() })
            .collect::<Vec<_>>();
        stream::iter(chunks).boxed()
    }

    async fn cancel(&self, session_id: SortableId) {
        self.cancelled_sessions.lock().insert(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn stt_adapter_ends_with_exactly_one_final_result() {
        let adapter = SimSttAdapter;
        let input: BoxStream<'static, Vec<u8>> = stream::empty().boxed();
        let mut results = adapter.transcribe_stream(input).await;
        let mut finals = 0;
        while let Some(r) = results.next().await {
            if r.is_final {
                finals += 1;
            }
        }
        assert_eq!(finals, 1);
    }

    #[tokio::test]
    async fn tts_stop_truncates_the_stream() {
        let adapter = SimTtsAdapter::new();
        let input: BoxStream<'static, String> = stream::empty().boxed();
        let mut out = adapter.synthesize_stream(input).await;
        let _first = out.next().await.unwrap();
        adapter.stop();
        // Subsequent polls may yield at most a couple already-buffered items
        // before the take_while predicate observes the stop flag.
        let mut remaining = 0;
        while out.next().await.is_some() {
            remaining += 1;
            if remaining > 15 {
                panic!("stop() did not terminate the stream promptly");
            }
        }
    }

    #[tokio::test]
    async fn llm_generate_reproduces_canonical_reply() {
        let adapter = SimLlmAdapter::new();
        let request = LlmRequest {
            session_id: crate::clock::new_id(),
            prompt: "wie geht es dir".to_string(),
            model: "auto".to_string(),
            auto_reasoning: false,
        };
        let chunks: Vec<_> = adapter.generate(request).await.collect().await;
        let joined: String = chunks.into_iter().map(|c| c.text).collect();
        assert_eq!(joined, "Mir geht es gut. Was brauchst du?");
    }
}
