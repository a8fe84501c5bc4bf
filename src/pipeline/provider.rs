//! # Provider Traits
//!
//! The three pipeline stages behind trait objects so transports can be
//! swapped (HTTP services in production, in-memory fakes in tests) without
//! touching the orchestrator.

use crate::error::VoiceResult;
use crate::session::voice::{ChatTurn, VoiceConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The three sequential stages of a voice turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Stt,
    Llm,
    Tts,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Stt => "stt",
            Stage::Llm => "llm",
            Stage::Tts => "tts",
        }
    }
}

/// Speech-to-text output.
#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    pub text: String,

    /// Provider confidence in [0.0, 1.0], when reported
    pub confidence: Option<f32>,

    /// Detected or echoed language code
    pub language: Option<String>,

    /// Duration of the transcribed audio in seconds
    pub duration_secs: f64,
}

/// Source citation attached to a completion, when the provider grounds its
/// answer in retrieved documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub title: String,
    pub url: Option<String>,
}

/// Completion-stage output.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub conversation_id: Option<String>,
    pub sources: Vec<SourceRef>,
}

/// Per-stage wall-clock durations for one turn, in milliseconds. A stage
/// that did not run (STT on a text turn) stays at zero.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StageTimings {
    pub stt_ms: u64,
    pub llm_ms: u64,
    pub tts_ms: u64,
}

impl StageTimings {
    pub fn total_ms(&self) -> u64 {
        self.stt_ms + self.llm_ms + self.tts_ms
    }
}

/// Everything a completed turn produced.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub transcript: Option<Transcript>,
    pub response_text: String,
    pub conversation_id: Option<String>,
    pub sources: Vec<SourceRef>,
    pub audio: Vec<u8>,
    pub timings: StageTimings,
}

#[async_trait]
pub trait SttProvider: Send + Sync {
    /// Transcribe one complete PCM utterance.
    async fn transcribe(&self, audio: &[u8], language: Option<&str>) -> VoiceResult<Transcript>;
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Generate the assistant reply for a user message, given the
    /// session's prior exchanges.
    async fn complete(
        &self,
        chatbot_id: &str,
        conversation_id: Option<&str>,
        message: &str,
        history: &[ChatTurn],
    ) -> VoiceResult<Completion>;
}

#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Synthesize the reply text with the session's voice parameters.
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> VoiceResult<Vec<u8>>;
}
