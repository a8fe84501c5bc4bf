//! # REST Voice Endpoints
//!
//! Fallback surface for clients that cannot hold a WebSocket open. A
//! multipart upload carries a full utterance at once; the same pipeline runs
//! underneath, just without streaming progress events or barge-in.

use crate::auth::Authenticator;
use crate::error::{VoiceError, VoiceResult};
use crate::pipeline::orchestrator::{cancel_pair, PipelineOrchestrator, TurnInput};
use crate::pipeline::provider::{PipelineResult, SttProvider, TtsProvider};
use crate::session::voice::{AudioFormat, VoiceConfig};
use crate::state::AppState;
use crate::usage::{estimate_speech_secs, TurnKind, TurnUsage, UsageSink};
use actix_multipart::form::{bytes::Bytes as FormBytes, text::Text, MultipartForm};
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;

/// Pull the bearer token out of the Authorization header.
fn bearer_token(req: &HttpRequest) -> VoiceResult<String> {
    req.headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| VoiceError::Auth("missing bearer token".into()))
}

#[derive(Debug, MultipartForm)]
pub struct ChatForm {
    pub audio: FormBytes,
    pub chatbot_id: Text<String>,
    pub conversation_id: Option<Text<String>>,
    pub voice_id: Option<Text<String>>,
    pub speed: Option<Text<f32>>,
    pub pitch: Option<Text<f32>>,
    pub format: Option<Text<String>>,
    pub language: Option<Text<String>>,
}

impl ChatForm {
    fn voice_config(&self) -> VoiceResult<VoiceConfig> {
        let mut voice = VoiceConfig::default();
        if let Some(voice_id) = &self.voice_id {
            voice.voice_id = voice_id.0.clone();
        }
        if let Some(speed) = &self.speed {
            voice.speed = speed.0;
        }
        if let Some(pitch) = &self.pitch {
            voice.pitch = pitch.0;
        }
        if let Some(format) = &self.format {
            voice.format = format.0.parse::<AudioFormat>()?;
        }
        voice.language = self.language.as_ref().map(|l| l.0.clone());
        voice.validate()?;
        Ok(voice)
    }
}

/// `POST /api/v1/voice/chat` — one full voice turn over HTTP.
pub async fn voice_chat(
    req: HttpRequest,
    form: MultipartForm<ChatForm>,
    auth: web::Data<dyn Authenticator>,
    orchestrator: web::Data<PipelineOrchestrator>,
    state: web::Data<AppState>,
    usage: web::Data<dyn UsageSink>,
) -> Result<HttpResponse, VoiceError> {
    let principal = auth.authenticate(&bearer_token(&req)?)?;
    let form = form.into_inner();

    if form.audio.data.is_empty() {
        return Err(VoiceError::AudioFormat("empty audio upload".into()));
    }

    let voice = form.voice_config()?;
    let input = TurnInput {
        chatbot_id: form.chatbot_id.0.clone(),
        conversation_id: form.conversation_id.as_ref().map(|c| c.0.clone()),
        transcript_override: None,
        audio: Some(form.audio.data.to_vec()),
        history: Vec::new(),
        voice,
        language_hint: form.language.as_ref().map(|l| l.0.clone()),
    };

    info!(
        principal_id = %principal.id,
        chatbot_id = %form.chatbot_id.0,
        audio_bytes = form.audio.data.len(),
        "REST voice chat"
    );

    let limits = state.get_config().voice;
    let bytes_per_second =
        limits.sample_rate as f64 * limits.channels as f64 * (limits.bit_depth as f64 / 8.0);
    let audio_in_secs = form.audio.data.len() as f64 / bytes_per_second;

    let result = run_chat_turn(
        &orchestrator,
        usage.get_ref(),
        &principal.id,
        input,
        audio_in_secs,
    )
    .await?;

    Ok(HttpResponse::Ok().json(json!({
        "transcription": result.transcript,
        "response_text": result.response_text,
        "conversation_id": result.conversation_id,
        "sources": result.sources,
        "audio_duration": estimate_speech_secs(result.response_text.len()),
        "processing_times": result.timings
    })))
}

/// Run the pipeline for one REST turn and record its usage, exactly like a
/// completed WebSocket turn would be.
async fn run_chat_turn(
    orchestrator: &PipelineOrchestrator,
    usage: &dyn UsageSink,
    principal_id: &str,
    input: TurnInput,
    audio_in_secs: f64,
) -> VoiceResult<PipelineResult> {
    let chatbot_id = input.chatbot_id.clone();

    // Progress events are not surfaced over REST; the receiver is dropped
    // and the orchestrator tolerates that.
    let (tx, _rx) = mpsc::channel(8);
    let (_handle, token) = cancel_pair();

    let result = orchestrator
        .run_turn(input, tx, token)
        .await?
        .ok_or_else(|| VoiceError::Internal("turn cancelled without a cancel handle".into()))?;

    usage.emit(&TurnUsage {
        session_id: format!("rest-{}", uuid::Uuid::new_v4()),
        principal_id: principal_id.to_string(),
        chatbot_id,
        conversation_id: result.conversation_id.clone(),
        kind: TurnKind::Audio,
        audio_in_secs,
        audio_out_secs: estimate_speech_secs(result.response_text.len()),
        response_chars: result.response_text.len(),
        timings: result.timings.clone(),
        completed_at: Utc::now(),
    });

    Ok(result)
}

#[derive(Debug, MultipartForm)]
pub struct TranscribeForm {
    pub audio: FormBytes,
    pub language: Option<Text<String>>,
}

/// `POST /api/v1/voice/transcribe` — STT only.
pub async fn voice_transcribe(
    req: HttpRequest,
    form: MultipartForm<TranscribeForm>,
    auth: web::Data<dyn Authenticator>,
    state: web::Data<AppState>,
    stt: web::Data<dyn SttProvider>,
) -> Result<HttpResponse, VoiceError> {
    auth.authenticate(&bearer_token(&req)?)?;
    let form = form.into_inner();

    if form.audio.data.is_empty() {
        return Err(VoiceError::AudioFormat("empty audio upload".into()));
    }

    let stage_timeout = state.get_config().pipeline.stt_timeout();
    let language = form.language.as_ref().map(|l| l.0.clone());

    let transcript = timeout(
        stage_timeout,
        stt.transcribe(&form.audio.data, language.as_deref()),
    )
    .await
    .map_err(|_| {
        VoiceError::Stt(format!(
            "stt stage timed out after {}s",
            stage_timeout.as_secs()
        ))
    })??;

    Ok(HttpResponse::Ok().json(json!({
        "transcription": transcript,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[derive(Debug, Deserialize)]
pub struct SynthesizeRequest {
    pub text: String,
    pub voice_id: Option<String>,
    pub speed: Option<f32>,
    pub pitch: Option<f32>,
    pub format: Option<String>,
}

/// `POST /api/v1/voice/synthesize` — TTS only; responds with raw audio under
/// the content type of the requested encoding.
pub async fn voice_synthesize(
    req: HttpRequest,
    body: web::Json<SynthesizeRequest>,
    auth: web::Data<dyn Authenticator>,
    state: web::Data<AppState>,
    tts: web::Data<dyn TtsProvider>,
) -> Result<HttpResponse, VoiceError> {
    auth.authenticate(&bearer_token(&req)?)?;
    let body = body.into_inner();

    if body.text.trim().is_empty() {
        return Err(VoiceError::Validation("text must not be empty".into()));
    }

    let mut voice = VoiceConfig::default();
    if let Some(voice_id) = body.voice_id {
        voice.voice_id = voice_id;
    }
    if let Some(speed) = body.speed {
        voice.speed = speed;
    }
    if let Some(pitch) = body.pitch {
        voice.pitch = pitch;
    }
    if let Some(format) = body.format {
        voice.format = format.parse::<AudioFormat>()?;
    }
    voice.validate()?;

    let stage_timeout = state.get_config().pipeline.tts_timeout();
    let audio = timeout(stage_timeout, tts.synthesize(&body.text, &voice))
        .await
        .map_err(|_| {
            VoiceError::Tts(format!(
                "tts stage timed out after {}s",
                stage_timeout.as_secs()
            ))
        })??;

    Ok(HttpResponse::Ok()
        .content_type(voice.format.content_type())
        .body(audio))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::pipeline::provider::{
        Completion, CompletionProvider, SttProvider, Transcript, TtsProvider,
    };
    use crate::session::voice::ChatTurn;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    struct FixedStt;

    #[async_trait]
    impl SttProvider for FixedStt {
        async fn transcribe(&self, _audio: &[u8], _language: Option<&str>) -> VoiceResult<Transcript> {
            Ok(Transcript {
                text: "how are you".to_string(),
                confidence: Some(0.9),
                language: Some("en".to_string()),
                duration_secs: 1.0,
            })
        }
    }

    struct FixedLlm;

    #[async_trait]
    impl CompletionProvider for FixedLlm {
        async fn complete(
            &self,
            _chatbot_id: &str,
            _conversation_id: Option<&str>,
            message: &str,
            _history: &[ChatTurn],
        ) -> VoiceResult<Completion> {
            Ok(Completion {
                text: format!("re: {}", message),
                conversation_id: Some("c-rest".to_string()),
                sources: vec![],
            })
        }
    }

    struct FixedTts;

    #[async_trait]
    impl TtsProvider for FixedTts {
        async fn synthesize(&self, text: &str, _voice: &VoiceConfig) -> VoiceResult<Vec<u8>> {
            Ok(text.as_bytes().to_vec())
        }
    }

    struct CollectingSink {
        records: Mutex<Vec<TurnUsage>>,
    }

    impl UsageSink for CollectingSink {
        fn emit(&self, usage: &TurnUsage) {
            self.records.lock().unwrap().push(usage.clone());
        }
    }

    fn orchestrator() -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            Arc::new(FixedStt),
            Arc::new(FixedLlm),
            Arc::new(FixedTts),
            PipelineConfig {
                stt_timeout_secs: 15,
                llm_timeout_secs: 30,
                tts_timeout_secs: 20,
                retry_transient_once: false,
                max_concurrent_provider_calls: 4,
                stt_url: String::new(),
                llm_url: String::new(),
                tts_url: String::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_rest_turn_records_usage() {
        let orch = orchestrator();
        let sink = CollectingSink {
            records: Mutex::new(Vec::new()),
        };
        let input = TurnInput {
            chatbot_id: "bot".into(),
            conversation_id: None,
            transcript_override: None,
            audio: Some(vec![0u8; 32000]),
            history: vec![],
            voice: VoiceConfig::default(),
            language_hint: None,
        };

        let result = run_chat_turn(&orch, &sink, "p-rest", input, 1.0)
            .await
            .unwrap();
        assert_eq!(result.response_text, "re: how are you");

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.session_id.starts_with("rest-"));
        assert_eq!(record.principal_id, "p-rest");
        assert_eq!(record.chatbot_id, "bot");
        assert_eq!(record.conversation_id.as_deref(), Some("c-rest"));
        assert!((record.audio_in_secs - 1.0).abs() < f64::EPSILON);
        assert_eq!(record.response_chars, result.response_text.len());
    }

    #[tokio::test]
    async fn test_rest_turn_failure_emits_no_usage() {
        struct BrokenLlm;

        #[async_trait]
        impl CompletionProvider for BrokenLlm {
            async fn complete(
                &self,
                _chatbot_id: &str,
                _conversation_id: Option<&str>,
                _message: &str,
                _history: &[ChatTurn],
            ) -> VoiceResult<Completion> {
                Err(VoiceError::Llm("upstream down".into()))
            }
        }

        let orch = PipelineOrchestrator::new(
            Arc::new(FixedStt),
            Arc::new(BrokenLlm),
            Arc::new(FixedTts),
            PipelineConfig {
                stt_timeout_secs: 15,
                llm_timeout_secs: 30,
                tts_timeout_secs: 20,
                retry_transient_once: false,
                max_concurrent_provider_calls: 4,
                stt_url: String::new(),
                llm_url: String::new(),
                tts_url: String::new(),
            },
        );
        let sink = CollectingSink {
            records: Mutex::new(Vec::new()),
        };
        let input = TurnInput {
            chatbot_id: "bot".into(),
            conversation_id: None,
            transcript_override: None,
            audio: Some(vec![0u8; 32000]),
            history: vec![],
            voice: VoiceConfig::default(),
            language_hint: None,
        };

        let err = run_chat_turn(&orch, &sink, "p-rest", input, 1.0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LlmError");
        assert!(sink.records.lock().unwrap().is_empty());
    }
}
