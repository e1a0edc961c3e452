//! Adapter Contracts
//!
//! Abstract STT, TTS, and LLM interfaces the orchestrator consumes, plus the
//! `CancelToken` one-shot latch shared across all three. Concrete model
//! backends (faster-whisper, F5-TTS, a real wake engine, ...) are out of
//! scope here — only the contract and a handful of adapters that actually
//! exercise it (`sim`, `ollama`, `cli_llm`) are provided.

pub mod cli_llm;
pub mod ollama;
pub mod sim;

use crate::clock::SortableId;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("{component} adapter failed: {message}")]
    Failed { component: &'static str, message: String },

    #[error("process spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("healthcheck timed out")]
    HealthcheckTimeout,
}

/// A one-shot cancellation latch. Once set, stays set; cheap to clone and
/// share between the orchestrator and the adapter it's currently driving.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Sets the latch with a reason, returning `true` only the first time —
    /// the reason recorded by that first call sticks for the session.
    pub fn cancel_with_reason(&self, reason: &str) -> bool {
        let first = !self.cancelled.swap(true, Ordering::SeqCst);
        if first {
            *self.reason.lock() = Some(reason.to_string());
            self.notify.notify_waiters();
        }
        first
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Suspends until `cancel()` is called; returns immediately if already set.
    pub async fn wait(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// One recognition result from an STT adapter.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SttResult {
    pub text: String,
    pub confidence: f32,
    pub is_final: bool,
    pub language: Option<String>,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

impl SttResult {
    pub fn final_text(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            is_final: true,
            language: None,
            start_ms: None,
            end_ms: None,
        }
    }
}

/// Speech-to-text: streaming and one-shot transcription.
///
/// Implementations must eventually emit exactly one `is_final = true` result
/// per closed utterance, and may emit any number of non-final results first.
#[async_trait]
pub trait SttAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn transcribe_stream(
        &self,
        chunks: BoxStream<'static, Vec<u8>>,
    ) -> BoxStream<'static, SttResult>;

    async fn transcribe_blob(&self, bytes: Vec<u8>) -> SttResult;
}

/// Text-to-speech: streaming synthesis with a prompt barge-in stop.
#[async_trait]
pub trait TtsAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn synthesize_stream(
        &self,
        text_chunks: BoxStream<'static, String>,
    ) -> BoxStream<'static, Vec<u8>>;

    /// Causes the current stream (if any) to terminate promptly.
    fn stop(&self);
}

/// A single generation request into an LLM adapter.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub session_id: SortableId,
    pub prompt: String,
    pub model: String,
    pub auto_reasoning: bool,
}

/// One streamed chunk of generated text.
#[derive(Debug, Clone)]
pub struct LlmChunk {
    pub text: String,
}

/// Large-language-model backend: healthcheck, streaming generation, cancel.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bounded to a short timeout (≤ 2s) by callers; the adapter itself need
    /// not enforce one.
    async fn healthcheck(&self) -> bool;

    async fn generate(&self, request: LlmRequest) -> BoxStream<'static, LlmChunk>;

    /// Must cause `generate` for this session to terminate promptly, emitting
    /// no further chunks.
    async fn cancel(&self, session_id: SortableId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_token_is_idempotent_and_wakes_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });

        token.cancel();
        token.cancel(); // second call is a no-op
        handle.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn wait_returns_immediately_if_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(50), token.wait())
            .await
            .expect("wait() must not block once already cancelled");
    }
}
