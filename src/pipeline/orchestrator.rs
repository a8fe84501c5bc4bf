//! # Pipeline Orchestrator
//!
//! Drives one voice turn through STT → completion → TTS. Each stage runs
//! under its own timeout, behind a counting semaphore that bounds outbound
//! provider calls across all sessions, and races the turn's cancellation
//! token so barge-in and disconnects interrupt the pipeline at the next
//! stage boundary.
//!
//! Progress is reported through an event channel as each stage starts and
//! produces output; the final result is also returned directly so the REST
//! handlers can use the orchestrator without consuming events.
//!
//! Cancellation guarantee: once a turn is cancelled no further events for
//! that turn are emitted, and `run_turn` resolves to `Ok(None)`.

use crate::config::PipelineConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::pipeline::provider::{
    CompletionProvider, PipelineResult, SourceRef, Stage, StageTimings, SttProvider, Transcript,
    TtsProvider,
};
use crate::session::voice::{ChatTurn, VoiceConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Cancels the in-flight turn. Held by the connection actor; dropping the
/// handle does NOT cancel, so a turn outlives actor message handling.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observed by the pipeline task; checked before each stage and raced
/// against the stage call itself.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the turn is cancelled. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling: stay pending
                std::future::pending::<()>().await;
            }
        }
    }
}

/// A fresh token pair for one turn.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Progress events emitted while a turn is in flight, in stage order.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageStarted { stage: Stage },
    TranscriptionComplete { transcript: Transcript },
    ResponseGenerated {
        text: String,
        conversation_id: Option<String>,
        sources: Vec<SourceRef>,
    },
    AudioReady { audio: Vec<u8>, timings: StageTimings },
}

/// Everything the orchestrator needs to run one turn.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub chatbot_id: String,
    pub conversation_id: Option<String>,

    /// For text turns: the user message, verbatim. STT is skipped.
    pub transcript_override: Option<String>,

    /// For audio turns: the assembled PCM utterance.
    pub audio: Option<Vec<u8>>,

    pub history: Vec<ChatTurn>,
    pub voice: VoiceConfig,
    pub language_hint: Option<String>,
}

pub struct PipelineOrchestrator {
    stt: Arc<dyn SttProvider>,
    llm: Arc<dyn CompletionProvider>,
    tts: Arc<dyn TtsProvider>,
    config: PipelineConfig,

    /// Bounds concurrent outbound provider calls across all sessions
    limiter: Arc<Semaphore>,
}

impl PipelineOrchestrator {
    pub fn new(
        stt: Arc<dyn SttProvider>,
        llm: Arc<dyn CompletionProvider>,
        tts: Arc<dyn TtsProvider>,
        config: PipelineConfig,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_provider_calls));
        Self {
            stt,
            llm,
            tts,
            config,
            limiter,
        }
    }

    /// Run one complete turn.
    ///
    /// Returns `Ok(Some(result))` on success, `Ok(None)` when the turn was
    /// cancelled (nothing further is emitted), or the failing stage's error.
    /// The caller is responsible for turning an error into the turn's single
    /// error event.
    pub async fn run_turn(
        &self,
        input: TurnInput,
        events: mpsc::Sender<PipelineEvent>,
        cancel: CancelToken,
    ) -> Result<Option<PipelineResult>, VoiceError> {
        let mut timings = StageTimings::default();
        let turn_started = Instant::now();

        // Stage 1: STT, unless this is a text turn.
        let (transcript, user_text) = match input.transcript_override {
            Some(text) => (None, text),
            None => {
                let audio = input
                    .audio
                    .as_deref()
                    .ok_or_else(|| VoiceError::Validation("turn has neither audio nor text".into()))?;

                self.emit(&events, &cancel, PipelineEvent::StageStarted { stage: Stage::Stt })
                    .await;

                let started = Instant::now();
                let language = input.language_hint.as_deref();
                let transcript = match self
                    .run_stage(Stage::Stt, self.config.stt_timeout(), &cancel, || {
                        self.stt.transcribe(audio, language)
                    })
                    .await?
                {
                    Some(t) => t,
                    None => return Ok(None),
                };
                timings.stt_ms = started.elapsed().as_millis() as u64;

                let text = transcript.text.clone();
                self.emit(
                    &events,
                    &cancel,
                    PipelineEvent::TranscriptionComplete {
                        transcript: transcript.clone(),
                    },
                )
                .await;

                (Some(transcript), text)
            }
        };

        // An empty transcript from a successful STT call is still a valid
        // turn; the completion provider decides how to answer silence.
        if user_text.trim().is_empty() {
            debug!("Transcript is empty, continuing with an empty user message");
        }

        // Stage 2: completion.
        self.emit(&events, &cancel, PipelineEvent::StageStarted { stage: Stage::Llm })
            .await;

        let started = Instant::now();
        let completion = match self
            .run_stage(Stage::Llm, self.config.llm_timeout(), &cancel, || {
                self.llm.complete(
                    &input.chatbot_id,
                    input.conversation_id.as_deref(),
                    &user_text,
                    &input.history,
                )
            })
            .await?
        {
            Some(c) => c,
            None => return Ok(None),
        };
        timings.llm_ms = started.elapsed().as_millis() as u64;

        self.emit(
            &events,
            &cancel,
            PipelineEvent::ResponseGenerated {
                text: completion.text.clone(),
                conversation_id: completion.conversation_id.clone(),
                sources: completion.sources.clone(),
            },
        )
        .await;

        // Stage 3: TTS.
        self.emit(&events, &cancel, PipelineEvent::StageStarted { stage: Stage::Tts })
            .await;

        let started = Instant::now();
        let audio = match self
            .run_stage(Stage::Tts, self.config.tts_timeout(), &cancel, || {
                self.tts.synthesize(&completion.text, &input.voice)
            })
            .await?
        {
            Some(a) => a,
            None => return Ok(None),
        };
        timings.tts_ms = started.elapsed().as_millis() as u64;

        self.emit(
            &events,
            &cancel,
            PipelineEvent::AudioReady {
                audio: audio.clone(),
                timings: timings.clone(),
            },
        )
        .await;

        if cancel.is_cancelled() {
            return Ok(None);
        }

        info!(
            total_ms = turn_started.elapsed().as_millis() as u64,
            stt_ms = timings.stt_ms,
            llm_ms = timings.llm_ms,
            tts_ms = timings.tts_ms,
            "Turn completed"
        );

        Ok(Some(PipelineResult {
            transcript,
            response_text: completion.text,
            conversation_id: completion.conversation_id,
            sources: completion.sources,
            audio,
            timings,
        }))
    }

    /// Run one provider call under the concurrency cap, the stage timeout
    /// and the cancellation token. `Ok(None)` means the turn was cancelled.
    /// A timed-out or failed call is retried exactly once when the retry
    /// policy is enabled.
    async fn run_stage<T, F, Fut>(
        &self,
        stage: Stage,
        stage_timeout: Duration,
        cancel: &CancelToken,
        call: F,
    ) -> Result<Option<T>, VoiceError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = VoiceResult<T>>,
    {
        let attempts = if self.config.retry_transient_once { 2 } else { 1 };
        let mut last_err = None;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                debug!(stage = stage.as_str(), "Turn cancelled before stage start");
                return Ok(None);
            }

            let _permit = self
                .limiter
                .acquire()
                .await
                .map_err(|_| VoiceError::Internal("provider limiter closed".into()))?;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(stage = stage.as_str(), "Turn cancelled mid-stage");
                    return Ok(None);
                }
                result = timeout(stage_timeout, call()) => result,
            };

            match outcome {
                Ok(Ok(value)) => return Ok(Some(value)),
                Ok(Err(err)) => {
                    warn!(stage = stage.as_str(), attempt, error = %err, "Stage failed");
                    last_err = Some(err);
                }
                Err(_elapsed) => {
                    warn!(
                        stage = stage.as_str(),
                        attempt,
                        timeout_secs = stage_timeout.as_secs(),
                        "Stage timed out"
                    );
                    last_err = Some(stage_error(
                        stage,
                        format!(
                            "{} stage timed out after {}s",
                            stage.as_str(),
                            stage_timeout.as_secs()
                        ),
                    ));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| VoiceError::Internal("stage produced no outcome".into())))
    }

    /// Emit a progress event unless the turn has been cancelled. A closed
    /// receiver means the connection is gone; the turn keeps running and its
    /// result is simply dropped by the caller.
    async fn emit(&self, events: &mpsc::Sender<PipelineEvent>, cancel: &CancelToken, event: PipelineEvent) {
        if cancel.is_cancelled() {
            return;
        }
        if events.send(event).await.is_err() {
            debug!("Event receiver dropped, connection likely closed");
        }
    }
}

fn stage_error(stage: Stage, message: String) -> VoiceError {
    match stage {
        Stage::Stt => VoiceError::Stt(message),
        Stage::Llm => VoiceError::Llm(message),
        Stage::Tts => VoiceError::Tts(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::provider::Completion;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeStt {
        delay: Duration,
    }

    #[async_trait]
    impl SttProvider for FakeStt {
        async fn transcribe(&self, audio: &[u8], _language: Option<&str>) -> VoiceResult<Transcript> {
            tokio::time::sleep(self.delay).await;
            Ok(Transcript {
                text: "hello there".to_string(),
                confidence: Some(0.95),
                language: Some("en".to_string()),
                duration_secs: audio.len() as f64 / 32000.0,
            })
        }
    }

    struct FakeLlm {
        delay: Duration,
        fail_first: AtomicU32,
    }

    impl FakeLlm {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                fail_first: AtomicU32::new(0),
            }
        }

        fn failing_first(delay: Duration, failures: u32) -> Self {
            Self {
                delay,
                fail_first: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl CompletionProvider for FakeLlm {
        async fn complete(
            &self,
            _chatbot_id: &str,
            conversation_id: Option<&str>,
            message: &str,
            history: &[ChatTurn],
        ) -> VoiceResult<Completion> {
            tokio::time::sleep(self.delay).await;
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(VoiceError::Llm("upstream hiccup".into()));
            }
            Ok(Completion {
                text: format!("re: {} (history {})", message, history.len()),
                conversation_id: conversation_id.map(str::to_string).or(Some("c-new".into())),
                sources: vec![],
            })
        }
    }

    struct FakeTts;

    #[async_trait]
    impl TtsProvider for FakeTts {
        async fn synthesize(&self, text: &str, _voice: &VoiceConfig) -> VoiceResult<Vec<u8>> {
            Ok(text.as_bytes().to_vec())
        }
    }

    fn pipeline_config() -> PipelineConfig {
        PipelineConfig {
            stt_timeout_secs: 15,
            llm_timeout_secs: 30,
            tts_timeout_secs: 20,
            retry_transient_once: false,
            max_concurrent_provider_calls: 4,
            stt_url: String::new(),
            llm_url: String::new(),
            tts_url: String::new(),
        }
    }

    fn orchestrator(llm: FakeLlm, config: PipelineConfig) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            Arc::new(FakeStt {
                delay: Duration::from_millis(50),
            }),
            Arc::new(llm),
            Arc::new(FakeTts),
            config,
        )
    }

    fn audio_input() -> TurnInput {
        TurnInput {
            chatbot_id: "bot".into(),
            conversation_id: None,
            transcript_override: None,
            audio: Some(vec![0u8; 32000]),
            history: vec![],
            voice: VoiceConfig::default(),
            language_hint: None,
        }
    }

    fn text_input(message: &str) -> TurnInput {
        TurnInput {
            transcript_override: Some(message.to_string()),
            audio: None,
            ..audio_input()
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_turn_emits_events_in_order() {
        let orch = orchestrator(FakeLlm::new(Duration::from_millis(100)), pipeline_config());
        let (tx, mut rx) = mpsc::channel(32);
        let (_handle, token) = cancel_pair();

        let result = orch.run_turn(audio_input(), tx, token).await.unwrap().unwrap();

        assert_eq!(result.response_text, "re: hello there (history 0)");
        assert_eq!(result.audio, result.response_text.as_bytes());
        assert_eq!(result.conversation_id.as_deref(), Some("c-new"));
        assert!(result.transcript.is_some());

        let events = drain(&mut rx).await;
        let labels: Vec<&str> = events
            .iter()
            .map(|e| match e {
                PipelineEvent::StageStarted { stage } => stage.as_str(),
                PipelineEvent::TranscriptionComplete { .. } => "transcript",
                PipelineEvent::ResponseGenerated { .. } => "response",
                PipelineEvent::AudioReady { .. } => "audio",
            })
            .collect();
        assert_eq!(
            labels,
            vec!["stt", "transcript", "llm", "response", "tts", "audio"]
        );

        match events.last().unwrap() {
            PipelineEvent::AudioReady { timings, .. } => {
                assert!(timings.stt_ms >= 50);
                assert!(timings.llm_ms >= 100);
            }
            other => panic!("expected AudioReady last, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_text_turn_skips_stt() {
        let orch = orchestrator(FakeLlm::new(Duration::from_millis(10)), pipeline_config());
        let (tx, mut rx) = mpsc::channel(32);
        let (_handle, token) = cancel_pair();

        let result = orch
            .run_turn(text_input("what's up"), tx, token)
            .await
            .unwrap()
            .unwrap();

        assert!(result.transcript.is_none());
        assert_eq!(result.timings.stt_ms, 0);

        let events = drain(&mut rx).await;
        assert!(events.iter().all(|e| !matches!(
            e,
            PipelineEvent::StageStarted { stage: Stage::Stt }
                | PipelineEvent::TranscriptionComplete { .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_the_turn() {
        let orch = Arc::new(orchestrator(
            FakeLlm::new(Duration::from_secs(3600)),
            pipeline_config(),
        ));
        let (tx, mut rx) = mpsc::channel(32);
        let (handle, token) = cancel_pair();

        let task = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.run_turn(audio_input(), tx, token).await }
        });

        // Let STT finish, then interrupt mid-completion
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();

        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.is_none());

        // Events stop at the completion stage; nothing after the cancel
        let events = drain(&mut rx).await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, PipelineEvent::ResponseGenerated { .. } | PipelineEvent::AudioReady { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout_surfaces_stage_error() {
        let mut config = pipeline_config();
        config.llm_timeout_secs = 2;
        let orch = orchestrator(FakeLlm::new(Duration::from_secs(10)), config);
        let (tx, _rx) = mpsc::channel(32);
        let (_handle, token) = cancel_pair();

        let err = orch
            .run_turn(text_input("hi"), tx, token)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LlmError");
        assert!(err.message().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_once_recovers_transient_failure() {
        let mut config = pipeline_config();
        config.retry_transient_once = true;
        let orch = orchestrator(
            FakeLlm::failing_first(Duration::from_millis(10), 1),
            config,
        );
        let (tx, _rx) = mpsc::channel(32);
        let (_handle, token) = cancel_pair();

        let result = orch.run_turn(text_input("hi"), tx, token).await.unwrap();
        assert!(result.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_by_default() {
        let orch = orchestrator(
            FakeLlm::failing_first(Duration::from_millis(10), 1),
            pipeline_config(),
        );
        let (tx, _rx) = mpsc::channel(32);
        let (_handle, token) = cancel_pair();

        let err = orch
            .run_turn(text_input("hi"), tx, token)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LlmError");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_transcript_is_a_valid_turn() {
        struct SilentStt;

        #[async_trait]
        impl SttProvider for SilentStt {
            async fn transcribe(&self, _audio: &[u8], _language: Option<&str>) -> VoiceResult<Transcript> {
                Ok(Transcript {
                    text: String::new(),
                    confidence: None,
                    language: None,
                    duration_secs: 1.0,
                })
            }
        }

        let orch = PipelineOrchestrator::new(
            Arc::new(SilentStt),
            Arc::new(FakeLlm::new(Duration::ZERO)),
            Arc::new(FakeTts),
            pipeline_config(),
        );
        let (tx, mut rx) = mpsc::channel(32);
        let (_handle, token) = cancel_pair();

        // Silence transcribes to an empty string; the turn still runs all
        // three stages instead of surfacing a stage error.
        let result = orch.run_turn(audio_input(), tx, token).await.unwrap().unwrap();
        assert_eq!(result.response_text, "re:  (history 0)");

        let events = drain(&mut rx).await;
        let empty_transcript = events.iter().any(|e| {
            matches!(e, PipelineEvent::TranscriptionComplete { transcript } if transcript.text.is_empty())
        });
        assert!(empty_transcript);
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::AudioReady { .. })));
    }
}
