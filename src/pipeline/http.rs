//! # HTTP Providers
//!
//! Production implementations of the stage traits against HTTP services:
//! multipart upload for STT, JSON for the completion stage, JSON-in /
//! audio-bytes-out for TTS. Transport failures and non-success statuses map
//! to the stage's error variant so the orchestrator never sees raw reqwest
//! errors.

use crate::error::{VoiceError, VoiceResult};
use crate::pipeline::provider::{
    Completion, CompletionProvider, SourceRef, SttProvider, Transcript, TtsProvider,
};
use crate::session::voice::{ChatTurn, VoiceConfig};
use async_trait::async_trait;
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub struct HttpSttProvider {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct SttResponse {
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration_secs: Option<f64>,
}

impl HttpSttProvider {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl SttProvider for HttpSttProvider {
    async fn transcribe(&self, audio: &[u8], language: Option<&str>) -> VoiceResult<Transcript> {
        let file_part = multipart::Part::bytes(audio.to_vec())
            .file_name("utterance.pcm")
            .mime_str("audio/l16")
            .map_err(|e| VoiceError::Stt(format!("invalid audio part: {}", e)))?;

        let mut form = multipart::Form::new().part("audio", file_part);
        if let Some(lang) = language {
            form = form.text("language", lang.to_string());
        }

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Stt(format!("transcription request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(VoiceError::Stt(format!(
                "transcription service returned {}",
                response.status()
            )));
        }

        let body: SttResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Stt(format!("malformed transcription response: {}", e)))?;

        debug!(text_len = body.text.len(), "Transcription received");

        Ok(Transcript {
            text: body.text,
            confidence: body.confidence,
            language: body.language,
            duration_secs: body.duration_secs.unwrap_or(0.0),
        })
    }
}

pub struct HttpCompletionProvider {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    chatbot_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    message: &'a str,
    history: &'a [ChatTurn],
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    text: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    sources: Vec<CompletionSource>,
}

#[derive(Debug, Deserialize)]
struct CompletionSource {
    title: String,
    #[serde(default)]
    url: Option<String>,
}

impl HttpCompletionProvider {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    async fn complete(
        &self,
        chatbot_id: &str,
        conversation_id: Option<&str>,
        message: &str,
        history: &[ChatTurn],
    ) -> VoiceResult<Completion> {
        let request = CompletionRequest {
            chatbot_id,
            conversation_id,
            message,
            history,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| VoiceError::Llm(format!("completion request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(VoiceError::Llm(format!(
                "completion service returned {}",
                response.status()
            )));
        }

        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Llm(format!("malformed completion response: {}", e)))?;

        Ok(Completion {
            text: body.text,
            conversation_id: body.conversation_id,
            sources: body
                .sources
                .into_iter()
                .map(|s| SourceRef {
                    title: s.title,
                    url: s.url,
                })
                .collect(),
        })
    }
}

pub struct HttpTtsProvider {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    voice_id: &'a str,
    speed: f32,
    pitch: f32,
    format: &'a str,
}

impl HttpTtsProvider {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl TtsProvider for HttpTtsProvider {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> VoiceResult<Vec<u8>> {
        let request = TtsRequest {
            text,
            voice_id: &voice.voice_id,
            speed: voice.speed,
            pitch: voice.pitch,
            format: voice.format.as_str(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| VoiceError::Tts(format!("synthesis request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(VoiceError::Tts(format!(
                "synthesis service returned {}",
                response.status()
            )));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| VoiceError::Tts(format!("failed to read synthesized audio: {}", e)))?;

        if audio.is_empty() {
            return Err(VoiceError::Tts("synthesis returned no audio".into()));
        }

        Ok(audio.to_vec())
    }
}
