//! # Voice WebSocket Handler
//!
//! Real-time voice chat over WebSocket. Clients connect to `/ws/voice`,
//! stream an utterance as binary PCM frames bracketed by `audio_start` /
//! `audio_stop` control frames, and receive pipeline progress events plus
//! the synthesized reply audio.
//!
//! ## WebSocket Protocol:
//! - **Client → Server**: JSON control frames (`audio_start`, `audio_stop`,
//!   `text_input`, `pong`) and binary PCM chunks (16-bit LE, 16kHz, mono)
//! - **Server → Client**: JSON events (`processing_update`,
//!   `transcription_complete`, `response_generated`, `audio_ready`, `error`,
//!   `ping`) followed by one binary frame carrying the synthesized audio
//!
//! ## Actor Model:
//! Each connection is an independent actix actor. The actor exclusively owns
//! the session's audio assembler and the cancellation handle for the
//! in-flight turn; the actor mailbox is the single-writer queue for all
//! outbound frames, so pipeline tasks never touch the socket directly.
//!
//! An `audio_start` or `text_input` arriving while a turn is in flight is
//! barge-in: the turn is cancelled, its queued events are discarded by turn
//! id, and its usage is never recorded.

use crate::audio::assembler::{AppendOutcome, AudioAssembler, AudioChunk};
use crate::auth::Authenticator;
use crate::config::{SessionsConfig, VoiceLimitsConfig};
use crate::error::VoiceError;
use crate::pipeline::orchestrator::{
    cancel_pair, CancelHandle, PipelineEvent, PipelineOrchestrator, TurnInput,
};
use crate::pipeline::provider::{PipelineResult, SourceRef, StageTimings};
use crate::session::manager::SessionManager;
use crate::session::state::StartKind;
use crate::session::voice::{AudioFormat, VoiceConfig, VoiceSession};
use crate::state::AppState;
use crate::usage::{estimate_speech_secs, TurnKind, TurnUsage, UsageSink};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use actix_web_actors::ws::{CloseCode, CloseReason};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Application close code sent when a session is dropped for inactivity.
pub const CLOSE_CODE_IDLE_TIMEOUT: u16 = 4002;

/// Control frames exchanged as WebSocket text messages.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsFrame {
    /// Server heartbeat probe
    Ping { timestamp: u64 },

    /// Client heartbeat reply (echoes the ping timestamp)
    Pong { timestamp: u64 },

    /// Begin a new utterance; binary frames that follow belong to it
    AudioStart,

    /// Utterance finished, run the pipeline
    AudioStop,

    /// Text turn that skips the transcription stage
    TextInput { text: String },

    /// A pipeline stage has started
    ProcessingUpdate { stage: String },

    /// Transcription stage output
    TranscriptionComplete {
        text: String,
        confidence: Option<f32>,
        language: Option<String>,
    },

    /// Completion stage output
    ResponseGenerated {
        text: String,
        conversation_id: Option<String>,
        sources: Vec<SourceRef>,
    },

    /// Synthesized audio follows as the next binary frame
    AudioReady {
        size: usize,
        format: String,
        timings: StageTimings,
    },

    /// Turn or protocol error; `fatal` means the connection is closing
    Error {
        code: String,
        message: String,
        fatal: bool,
    },
}

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub token: String,
    pub chatbot_id: String,
    pub voice_id: Option<String>,
    pub speed: Option<f32>,
    pub pitch: Option<f32>,
    pub format: Option<String>,
    pub language: Option<String>,
}

/// What the actor remembers about the in-flight turn, for history and usage
/// once it completes.
struct PendingTurn {
    kind: TurnKind,
    user_text: Option<String>,
    audio_in_secs: f64,
}

/// One WebSocket connection; exclusively owns its session's assembler and
/// cancellation handle.
pub struct VoiceWebSocket {
    session: Arc<VoiceSession>,
    manager: Arc<SessionManager>,
    orchestrator: Arc<PipelineOrchestrator>,
    usage: Arc<dyn UsageSink>,
    app_state: web::Data<AppState>,

    limits: VoiceLimitsConfig,
    sessions_config: SessionsConfig,

    assembler: AudioAssembler,
    next_sequence: u64,

    /// Cancels the in-flight turn; `None` while idle
    cancel: Option<CancelHandle>,

    /// Monotonic turn counter; events tagged with an older id are stale
    /// (their turn was cancelled) and get dropped in the mailbox handler
    turn_id: u64,

    pending: Option<PendingTurn>,
    last_heartbeat: Instant,
}

/// Pipeline progress relayed into the actor mailbox.
#[derive(Message)]
#[rtype(result = "()")]
struct TurnEvent {
    turn_id: u64,
    event: PipelineEvent,
}

/// Terminal outcome of a pipeline task.
#[derive(Message)]
#[rtype(result = "()")]
struct TurnFinished {
    turn_id: u64,
    outcome: Result<Option<PipelineResult>, VoiceError>,
}

impl VoiceWebSocket {
    #[allow(clippy::too_many_arguments)]
    fn new(
        session: Arc<VoiceSession>,
        manager: Arc<SessionManager>,
        orchestrator: Arc<PipelineOrchestrator>,
        usage: Arc<dyn UsageSink>,
        app_state: web::Data<AppState>,
        limits: VoiceLimitsConfig,
        sessions_config: SessionsConfig,
    ) -> Self {
        let assembler = AudioAssembler::new(limits.clone());
        Self {
            session,
            manager,
            orchestrator,
            usage,
            app_state,
            limits,
            sessions_config,
            assembler,
            next_sequence: 0,
            cancel: None,
            turn_id: 0,
            pending: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_frame(&self, ctx: &mut ws::WebsocketContext<Self>, frame: &WsFrame) {
        match serde_json::to_string(frame) {
            Ok(json) => ctx.text(json),
            Err(err) => warn!(error = %err, "Failed to serialize outbound frame"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, err: &VoiceError, fatal: bool) {
        warn!(
            session_id = %self.session.session_id,
            code = err.code(),
            fatal,
            "WebSocket error: {}",
            err.message()
        );
        self.send_frame(
            ctx,
            &WsFrame::Error {
                code: err.code().to_string(),
                message: err.message().to_string(),
                fatal,
            },
        );
    }

    /// Cancel the in-flight turn, if any. Bumping the turn id makes any of
    /// its events still queued in the mailbox stale.
    fn cancel_inflight(&mut self) {
        if let Some(handle) = self.cancel.take() {
            info!(session_id = %self.session.session_id, "Cancelling in-flight turn");
            handle.cancel();
            self.begin_turn();
            self.pending = None;
        }
    }

    /// Allocate the next turn id. Anything tagged with an older id is stale.
    fn begin_turn(&mut self) -> u64 {
        self.turn_id += 1;
        self.turn_id
    }

    /// Mailbox messages are only applied when they carry the current turn's
    /// id; a cancelled turn's events may still be queued behind the cancel.
    fn accepts_turn(&self, turn_id: u64) -> bool {
        turn_id == self.turn_id
    }

    /// Spawn the pipeline for one turn. Events and the final outcome come
    /// back through the actor mailbox tagged with this turn's id.
    fn start_turn(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        input: TurnInput,
        kind: TurnKind,
        user_text: Option<String>,
        audio_in_secs: f64,
    ) {
        let turn_id = self.begin_turn();

        let (handle, token) = cancel_pair();
        self.cancel = Some(handle);
        self.pending = Some(PendingTurn {
            kind,
            user_text,
            audio_in_secs,
        });

        let (tx, mut rx) = mpsc::channel::<PipelineEvent>(32);
        let event_addr = ctx.address();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                event_addr.do_send(TurnEvent { turn_id, event });
            }
        });

        let orchestrator = Arc::clone(&self.orchestrator);
        let addr = ctx.address();
        tokio::spawn(async move {
            let outcome = orchestrator.run_turn(input, tx, token).await;
            addr.do_send(TurnFinished { turn_id, outcome });
        });
    }

    fn turn_input(&self, transcript_override: Option<String>, audio: Option<Vec<u8>>) -> TurnInput {
        TurnInput {
            chatbot_id: self.session.chatbot_id.clone(),
            conversation_id: self.session.conversation_id(),
            transcript_override,
            audio,
            history: self.session.history(),
            voice: self.session.config.clone(),
            language_hint: self.session.config.language.clone(),
        }
    }

    fn handle_audio_start(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        match self.session.audio_start() {
            Ok(StartKind::Fresh) => {
                debug!(session_id = %self.session.session_id, "Recording started");
            }
            Ok(StartKind::BargeIn) => {
                info!(session_id = %self.session.session_id, "Barge-in, restarting recording");
                self.cancel_inflight();
            }
            Err(err) => {
                self.send_error(ctx, &err, false);
                return;
            }
        }
        self.assembler.clear();
        self.next_sequence = 0;
    }

    fn handle_audio_stop(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Err(err) = self.session.audio_stop() {
            self.send_error(ctx, &err, false);
            return;
        }

        let audio_in_secs = self.assembler.duration_secs();
        match self.assembler.finalize() {
            Ok(audio) => {
                info!(
                    session_id = %self.session.session_id,
                    bytes = audio.len(),
                    secs = audio_in_secs,
                    "Utterance finalized"
                );
                let input = self.turn_input(None, Some(audio));
                self.start_turn(ctx, input, TurnKind::Audio, None, audio_in_secs);
            }
            Err(err) => self.fail_turn(ctx, err),
        }
    }

    fn handle_text_input(&mut self, ctx: &mut ws::WebsocketContext<Self>, text: String) {
        if text.trim().is_empty() {
            self.send_error(
                ctx,
                &VoiceError::Validation("text_input must not be empty".into()),
                false,
            );
            return;
        }

        // A text turn during recording discards the partial utterance; one
        // during processing is barge-in like audio_start.
        if self.session.state().is_processing() {
            self.cancel_inflight();
            if let Err(err) = self.session.audio_start() {
                self.send_error(ctx, &err, false);
                return;
            }
        }
        if let Err(err) = self.session.text_input() {
            self.send_error(ctx, &err, false);
            return;
        }
        self.assembler.clear();

        let input = self.turn_input(Some(text.clone()), None);
        self.start_turn(ctx, input, TurnKind::Text, Some(text), 0.0);
    }

    fn handle_audio_chunk(&mut self, ctx: &mut ws::WebsocketContext<Self>, data: &[u8]) {
        if let Err(err) = self.session.audio_chunk() {
            self.send_error(ctx, &err, false);
            return;
        }

        let chunk = AudioChunk::new(data.to_vec(), self.next_sequence);
        self.next_sequence += 1;

        match self.assembler.append(chunk) {
            Ok(AppendOutcome::Accepted) => {}
            Ok(AppendOutcome::AcceptedOverLimit) => {
                self.send_error(
                    ctx,
                    &VoiceError::AudioFormat(format!(
                        "utterance exceeds {}s, finish soon",
                        self.limits.max_utterance_secs
                    )),
                    false,
                );
            }
            Err(err) => self.send_error(ctx, &err, false),
        }
    }

    /// One error event, then recovery to Idle — or connection close for
    /// auth/session errors.
    fn fail_turn(&mut self, ctx: &mut ws::WebsocketContext<Self>, err: VoiceError) {
        let failed_from = self.session.fail();
        warn!(
            session_id = %self.session.session_id,
            failed_from = failed_from.as_str(),
            code = err.code(),
            "Turn failed"
        );

        let fatal = err.closes_connection();
        self.send_error(ctx, &err, fatal);
        self.assembler.clear();
        self.pending = None;
        self.cancel = None;

        if fatal {
            ctx.close(Some(CloseReason {
                code: CloseCode::Policy,
                description: Some(err.code().to_string()),
            }));
            ctx.stop();
        } else {
            self.session.recover();
        }
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            session_id = %self.session.session_id,
            chatbot_id = %self.session.chatbot_id,
            "Voice connection started"
        );
        self.app_state.increment_active_sessions();

        let heartbeat_timeout = Duration::from_secs(self.sessions_config.heartbeat_timeout_secs);
        let idle_timeout_secs = self.sessions_config.idle_timeout_secs;

        ctx.run_interval(
            Duration::from_secs(self.sessions_config.heartbeat_interval_secs),
            move |act, ctx| {
                if Instant::now().duration_since(act.last_heartbeat) > heartbeat_timeout {
                    warn!(
                        session_id = %act.session.session_id,
                        "Heartbeat timeout, closing connection"
                    );
                    ctx.stop();
                    return;
                }

                if act.session.idle_seconds() > idle_timeout_secs as i64
                    && !act.session.state().is_processing()
                {
                    info!(
                        session_id = %act.session.session_id,
                        "Idle timeout, closing connection"
                    );
                    ctx.close(Some(CloseReason {
                        code: CloseCode::Other(CLOSE_CODE_IDLE_TIMEOUT),
                        description: Some("idle timeout".to_string()),
                    }));
                    ctx.stop();
                    return;
                }

                let ping = WsFrame::Ping {
                    timestamp: Utc::now().timestamp_millis() as u64,
                };
                if let Ok(json) = serde_json::to_string(&ping) {
                    ctx.text(json);
                }
            },
        );
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session.session_id, "Voice connection stopped");
        self.cancel_inflight();
        self.session.close();
        self.manager.remove_session(&self.session.session_id);
        self.app_state.decrement_active_sessions();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<WsFrame>(&text) {
                Ok(WsFrame::AudioStart) => self.handle_audio_start(ctx),
                Ok(WsFrame::AudioStop) => self.handle_audio_stop(ctx),
                Ok(WsFrame::TextInput { text }) => self.handle_text_input(ctx, text),
                Ok(WsFrame::Pong { .. }) => {
                    self.last_heartbeat = Instant::now();
                    self.session.touch();
                }
                Ok(WsFrame::Ping { timestamp }) => {
                    self.last_heartbeat = Instant::now();
                    self.session.touch();
                    self.send_frame(ctx, &WsFrame::Pong { timestamp });
                }
                Ok(_) => {
                    debug!(
                        session_id = %self.session.session_id,
                        "Ignoring server-only frame type from client"
                    );
                }
                Err(err) => {
                    self.send_error(
                        ctx,
                        &VoiceError::Validation(format!("invalid frame: {}", err)),
                        false,
                    );
                }
            },
            Ok(ws::Message::Binary(data)) => {
                self.handle_audio_chunk(ctx, &data);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(
                    session_id = %self.session.session_id,
                    "Client closed connection: {:?}",
                    reason
                );
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(
                    session_id = %self.session.session_id,
                    "WebSocket protocol error: {}",
                    err
                );
                ctx.stop();
            }
        }
    }
}

impl Handler<TurnEvent> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: TurnEvent, ctx: &mut Self::Context) {
        if !self.accepts_turn(msg.turn_id) {
            debug!(
                session_id = %self.session.session_id,
                "Dropping stale event from cancelled turn"
            );
            return;
        }

        match msg.event {
            PipelineEvent::StageStarted { stage } => {
                // On text turns the machine already sits in the completion
                // state when the first stage event arrives; that mismatch is
                // expected and skipped.
                if let Err(err) = self.session.stage_started(stage) {
                    debug!(
                        session_id = %self.session.session_id,
                        stage = stage.as_str(),
                        "Stage transition skipped: {}",
                        err.message()
                    );
                }
                self.send_frame(
                    ctx,
                    &WsFrame::ProcessingUpdate {
                        stage: stage.as_str().to_string(),
                    },
                );
            }
            PipelineEvent::TranscriptionComplete { transcript } => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.user_text = Some(transcript.text.clone());
                }
                self.send_frame(
                    ctx,
                    &WsFrame::TranscriptionComplete {
                        text: transcript.text,
                        confidence: transcript.confidence,
                        language: transcript.language,
                    },
                );
            }
            PipelineEvent::ResponseGenerated {
                text,
                conversation_id,
                sources,
            } => {
                if let Some(cid) = &conversation_id {
                    self.session.set_conversation_id(cid.clone());
                }
                self.send_frame(
                    ctx,
                    &WsFrame::ResponseGenerated {
                        text,
                        conversation_id,
                        sources,
                    },
                );
            }
            PipelineEvent::AudioReady { audio, timings } => {
                if let Err(err) = self.session.responding() {
                    debug!(
                        session_id = %self.session.session_id,
                        "Responding transition skipped: {}",
                        err.message()
                    );
                }
                self.send_frame(
                    ctx,
                    &WsFrame::AudioReady {
                        size: audio.len(),
                        format: self.session.config.format.as_str().to_string(),
                        timings,
                    },
                );
                ctx.binary(audio);
            }
        }
    }
}

impl Handler<TurnFinished> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: TurnFinished, ctx: &mut Self::Context) {
        if !self.accepts_turn(msg.turn_id) {
            debug!(
                session_id = %self.session.session_id,
                "Dropping outcome of cancelled turn"
            );
            return;
        }

        match msg.outcome {
            Ok(Some(result)) => {
                if let Err(err) = self.session.turn_complete() {
                    debug!(
                        session_id = %self.session.session_id,
                        "Turn-complete transition skipped: {}",
                        err.message()
                    );
                }
                self.cancel = None;

                let pending = self.pending.take();
                let user_text = pending
                    .as_ref()
                    .and_then(|p| p.user_text.clone())
                    .unwrap_or_default();
                let audio_in_secs = pending.as_ref().map(|p| p.audio_in_secs).unwrap_or(0.0);
                let kind = pending.map(|p| p.kind).unwrap_or(TurnKind::Audio);

                self.session
                    .push_turn(user_text, result.response_text.clone());

                let audio_out_secs = estimate_speech_secs(result.response_text.len());
                self.session
                    .record_turn(&result.timings, audio_in_secs, audio_out_secs);
                self.app_state.record_turn_completed();

                self.usage.emit(&TurnUsage {
                    session_id: self.session.session_id.clone(),
                    principal_id: self.session.principal_id.clone(),
                    chatbot_id: self.session.chatbot_id.clone(),
                    conversation_id: self.session.conversation_id(),
                    kind,
                    audio_in_secs,
                    audio_out_secs,
                    response_chars: result.response_text.len(),
                    timings: result.timings,
                    completed_at: Utc::now(),
                });
            }
            Ok(None) => {
                // Cancelled: nothing is emitted and no usage is recorded
                debug!(session_id = %self.session.session_id, "Turn cancelled");
                self.app_state.record_turn_cancelled();
            }
            Err(err) => {
                self.app_state.record_turn_failed();
                self.fail_turn(ctx, err);
            }
        }
    }
}

/// HTTP → WebSocket upgrade for `/ws/voice`.
///
/// Authentication happens before the upgrade: a missing or invalid token is
/// a plain 401 response and no session is created.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<ConnectQuery>,
    app_state: web::Data<AppState>,
    manager: web::Data<SessionManager>,
    orchestrator: web::Data<PipelineOrchestrator>,
    usage: web::Data<dyn UsageSink>,
    auth: web::Data<dyn Authenticator>,
) -> ActixResult<HttpResponse> {
    info!(
        "Voice connection request from: {:?}",
        req.connection_info().peer_addr()
    );

    let principal = auth.authenticate(&query.token)?;

    let mut voice = VoiceConfig::default();
    if let Some(voice_id) = &query.voice_id {
        voice.voice_id = voice_id.clone();
    }
    if let Some(speed) = query.speed {
        voice.speed = speed;
    }
    if let Some(pitch) = query.pitch {
        voice.pitch = pitch;
    }
    if let Some(format) = &query.format {
        voice.format = format.parse::<AudioFormat>()?;
    }
    voice.language = query.language.clone();

    let session = manager.create_session(principal.id, query.chatbot_id.clone(), voice)?;

    let config = app_state.get_config();
    let actor = VoiceWebSocket::new(
        session,
        manager.into_inner(),
        orchestrator.into_inner(),
        usage.into_inner(),
        app_state,
        config.voice,
        config.session,
    );

    ws::start(actor, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::error::VoiceResult;
    use crate::pipeline::provider::{
        Completion, CompletionProvider, SttProvider, Transcript, TtsProvider,
    };
    use crate::session::voice::ChatTurn;
    use async_trait::async_trait;

    struct NoStt;

    #[async_trait]
    impl SttProvider for NoStt {
        async fn transcribe(&self, _audio: &[u8], _language: Option<&str>) -> VoiceResult<Transcript> {
            Err(VoiceError::Stt("not called in these tests".into()))
        }
    }

    struct NoLlm;

    #[async_trait]
    impl CompletionProvider for NoLlm {
        async fn complete(
            &self,
            _chatbot_id: &str,
            _conversation_id: Option<&str>,
            _message: &str,
            _history: &[ChatTurn],
        ) -> VoiceResult<Completion> {
            Err(VoiceError::Llm("not called in these tests".into()))
        }
    }

    struct NoTts;

    #[async_trait]
    impl TtsProvider for NoTts {
        async fn synthesize(&self, _text: &str, _voice: &VoiceConfig) -> VoiceResult<Vec<u8>> {
            Err(VoiceError::Tts("not called in these tests".into()))
        }
    }

    struct NullSink;

    impl UsageSink for NullSink {
        fn emit(&self, _usage: &TurnUsage) {}
    }

    fn test_actor() -> VoiceWebSocket {
        let config = AppConfig::default();
        let session = Arc::new(
            VoiceSession::new(
                "s-test".into(),
                "p-test".into(),
                "bot".into(),
                VoiceConfig::default(),
                8,
            )
            .unwrap(),
        );
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            Arc::new(NoStt),
            Arc::new(NoLlm),
            Arc::new(NoTts),
            config.pipeline.clone(),
        ));
        VoiceWebSocket::new(
            session,
            Arc::new(SessionManager::new(4, 8)),
            orchestrator,
            Arc::new(NullSink),
            web::Data::new(AppState::new(config.clone())),
            config.voice,
            config.session,
        )
    }

    #[test]
    fn test_barge_in_makes_inflight_turn_events_stale() {
        let mut actor = test_actor();

        let first = actor.begin_turn();
        let (handle, token) = cancel_pair();
        actor.cancel = Some(handle);
        actor.pending = Some(PendingTurn {
            kind: TurnKind::Audio,
            user_text: None,
            audio_in_secs: 1.5,
        });
        assert!(actor.accepts_turn(first));

        actor.cancel_inflight();

        // The cancelled turn's queued events and outcome are now stale,
        // the token observed the cancel, and nothing pending survives.
        assert!(!actor.accepts_turn(first));
        assert!(token.is_cancelled());
        assert!(actor.pending.is_none());
        assert!(actor.cancel.is_none());

        // The next turn gets a fresh id that is accepted while the old one
        // stays stale.
        let second = actor.begin_turn();
        assert!(actor.accepts_turn(second));
        assert!(!actor.accepts_turn(first));
    }

    #[test]
    fn test_cancel_without_inflight_turn_changes_nothing() {
        let mut actor = test_actor();
        let turn = actor.begin_turn();

        // No cancel handle held, so there is nothing to invalidate.
        actor.cancel_inflight();
        assert!(actor.accepts_turn(turn));
    }

    #[test]
    fn test_client_frames_deserialize() {
        let frame: WsFrame = serde_json::from_str(r#"{"type":"audio_start"}"#).unwrap();
        assert!(matches!(frame, WsFrame::AudioStart));

        let frame: WsFrame =
            serde_json::from_str(r#"{"type":"text_input","text":"hello"}"#).unwrap();
        match frame {
            WsFrame::TextInput { text } => assert_eq!(text, "hello"),
            other => panic!("wrong frame: {:?}", other),
        }

        let frame: WsFrame = serde_json::from_str(r#"{"type":"pong","timestamp":42}"#).unwrap();
        assert!(matches!(frame, WsFrame::Pong { timestamp: 42 }));
    }

    #[test]
    fn test_server_frames_serialize() {
        let json = serde_json::to_string(&WsFrame::ProcessingUpdate {
            stage: "stt".into(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"processing_update""#));
        assert!(json.contains(r#""stage":"stt""#));

        let json = serde_json::to_string(&WsFrame::Error {
            code: "SttError".into(),
            message: "upstream failure".into(),
            fatal: false,
        })
        .unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""fatal":false"#));
    }

    #[test]
    fn test_audio_ready_frame_carries_timings() {
        let json = serde_json::to_string(&WsFrame::AudioReady {
            size: 1024,
            format: "mp3".into(),
            timings: StageTimings {
                stt_ms: 800,
                llm_ms: 1500,
                tts_ms: 600,
            },
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "audio_ready");
        assert_eq!(value["timings"]["llm_ms"], 1500);
    }

    #[test]
    fn test_garbage_frame_is_rejected() {
        assert!(serde_json::from_str::<WsFrame>(r#"{"type":"resume"}"#).is_err());
        assert!(serde_json::from_str::<WsFrame>("not json").is_err());
    }
}
