//! # Usage Emitter
//!
//! One usage record per completed turn, for billing and analytics. Records
//! go through the `UsageSink` trait so the delivery mechanism can change
//! without touching the connection layer; the default sink writes them to
//! the structured log under the `usage` target, where the log shipper picks
//! them up.
//!
//! Cancelled turns never produce a record — a barge-in means the user did
//! not receive the response, so it is not billed.

use crate::pipeline::provider::StageTimings;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// Rough synthesized-speech rate.
const TTS_CHARS_PER_SEC: f64 = 15.0;

/// Estimate of synthesized audio duration from the reply length.
// TODO: use provider-reported duration once the TTS service returns it
pub fn estimate_speech_secs(response_chars: usize) -> f64 {
    response_chars as f64 / TTS_CHARS_PER_SEC
}

/// How a turn entered the pipeline.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Audio,
    Text,
}

/// The per-turn usage record.
#[derive(Debug, Clone, Serialize)]
pub struct TurnUsage {
    pub session_id: String,
    pub principal_id: String,
    pub chatbot_id: String,
    pub conversation_id: Option<String>,
    pub kind: TurnKind,

    /// Seconds of client audio transcribed (zero for text turns)
    pub audio_in_secs: f64,

    /// Seconds of synthesized audio delivered
    pub audio_out_secs: f64,

    pub response_chars: usize,
    pub timings: StageTimings,
    pub completed_at: DateTime<Utc>,
}

pub trait UsageSink: Send + Sync {
    fn emit(&self, usage: &TurnUsage);
}

/// Writes usage records as structured log lines under the `usage` target.
pub struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn emit(&self, usage: &TurnUsage) {
        info!(
            target: "usage",
            session_id = %usage.session_id,
            principal_id = %usage.principal_id,
            chatbot_id = %usage.chatbot_id,
            conversation_id = usage.conversation_id.as_deref().unwrap_or("-"),
            kind = ?usage.kind,
            audio_in_secs = usage.audio_in_secs,
            audio_out_secs = usage.audio_out_secs,
            response_chars = usage.response_chars,
            stt_ms = usage.timings.stt_ms,
            llm_ms = usage.timings.llm_ms,
            tts_ms = usage.timings.tts_ms,
            "Turn usage"
        );
    }
}
