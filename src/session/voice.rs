//! # Voice Session
//!
//! Per-connection session context: identity, voice configuration, chat
//! history and usage totals. The session's audio buffer and cancellation
//! handle are owned exclusively by the connection actor; only the metadata
//! that the registry and health endpoints need to read across tasks lives
//! here behind locks.

use crate::error::{VoiceError, VoiceResult};
use crate::pipeline::provider::StageTimings;
use crate::session::state::{SessionState, StartKind, StateMachine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::RwLock;

/// Output audio encodings the TTS stage may be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Webm,
    Ogg,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Webm => "webm",
            AudioFormat::Ogg => "ogg",
        }
    }

    /// Content type used by the REST synthesize endpoint.
    pub fn content_type(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Webm => "audio/webm",
            AudioFormat::Ogg => "audio/ogg",
        }
    }
}

impl FromStr for AudioFormat {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wav" => Ok(AudioFormat::Wav),
            "mp3" => Ok(AudioFormat::Mp3),
            "webm" => Ok(AudioFormat::Webm),
            "ogg" => Ok(AudioFormat::Ogg),
            other => Err(VoiceError::Validation(format!(
                "unknown audio format '{}'",
                other
            ))),
        }
    }
}

/// Immutable voice parameters, validated once at session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Provider-specific voice identifier
    pub voice_id: String,

    /// Playback speed multiplier, 0.5 – 2.0
    pub speed: f32,

    /// Pitch shift, -2.0 – 2.0
    pub pitch: f32,

    /// Output audio encoding
    pub format: AudioFormat,

    /// Optional language hint forwarded to the STT provider
    pub language: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice_id: "default".to_string(),
            speed: 1.0,
            pitch: 0.0,
            format: AudioFormat::Mp3,
            language: None,
        }
    }
}

impl VoiceConfig {
    pub fn validate(&self) -> VoiceResult<()> {
        if !(0.5..=2.0).contains(&self.speed) {
            return Err(VoiceError::Validation(format!(
                "speed must be within [0.5, 2.0], got {}",
                self.speed
            )));
        }
        if !(-2.0..=2.0).contains(&self.pitch) {
            return Err(VoiceError::Validation(format!(
                "pitch must be within [-2.0, 2.0], got {}",
                self.pitch
            )));
        }
        if self.voice_id.is_empty() {
            return Err(VoiceError::Validation("voice_id must not be empty".into()));
        }
        Ok(())
    }
}

/// One completed user/assistant exchange, kept for prompt construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub user: String,
    pub assistant: String,
}

/// Running totals across all turns of a session.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionTotals {
    /// Seconds of audio received from the client
    pub audio_in_secs: f64,

    /// Seconds of synthesized audio sent to the client
    pub audio_out_secs: f64,

    /// Completed turns
    pub turn_count: u32,
}

/// The stateful context for one connected client conversation.
pub struct VoiceSession {
    /// Unique for the process lifetime, generated at creation
    pub session_id: String,

    /// Opaque authenticated principal attached at connect time
    pub principal_id: String,

    /// Chatbot this conversation belongs to
    pub chatbot_id: String,

    /// Set once the first turn persists
    conversation_id: RwLock<Option<String>>,

    machine: RwLock<StateMachine>,

    /// Immutable voice parameters for every TTS call of this session
    pub config: VoiceConfig,

    history: RwLock<Vec<ChatTurn>>,
    history_limit: usize,

    totals: RwLock<SessionTotals>,

    pub created_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
}

impl VoiceSession {
    pub fn new(
        session_id: String,
        principal_id: String,
        chatbot_id: String,
        config: VoiceConfig,
        history_limit: usize,
    ) -> VoiceResult<Self> {
        config.validate()?;
        let now = Utc::now();
        Ok(Self {
            session_id,
            principal_id,
            chatbot_id,
            conversation_id: RwLock::new(None),
            machine: RwLock::new(StateMachine::new()),
            config,
            history: RwLock::new(Vec::new()),
            history_limit,
            totals: RwLock::new(SessionTotals::default()),
            created_at: now,
            last_activity: RwLock::new(now),
        })
    }

    pub fn state(&self) -> SessionState {
        self.machine.read().unwrap().state()
    }

    /// Record client activity; idle-timeout cleanup keys off this.
    pub fn touch(&self) {
        *self.last_activity.write().unwrap() = Utc::now();
    }

    /// Seconds since the last inbound frame.
    pub fn idle_seconds(&self) -> i64 {
        Utc::now()
            .signed_duration_since(*self.last_activity.read().unwrap())
            .num_seconds()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.conversation_id.read().unwrap().clone()
    }

    pub fn set_conversation_id(&self, id: String) {
        let mut guard = self.conversation_id.write().unwrap();
        if guard.is_none() {
            *guard = Some(id);
        }
    }

    // State machine delegates. Mutation only ever happens from the owning
    // connection actor; the lock exists for cross-task reads by the
    // registry sweep and the health endpoint.

    pub fn audio_start(&self) -> VoiceResult<StartKind> {
        self.touch();
        self.machine.write().unwrap().audio_start()
    }

    pub fn audio_chunk(&self) -> VoiceResult<()> {
        self.touch();
        self.machine.write().unwrap().audio_chunk()
    }

    pub fn audio_stop(&self) -> VoiceResult<()> {
        self.touch();
        self.machine.write().unwrap().audio_stop()
    }

    pub fn text_input(&self) -> VoiceResult<()> {
        self.touch();
        self.machine.write().unwrap().text_input()
    }

    pub fn stage_started(&self, stage: crate::pipeline::provider::Stage) -> VoiceResult<()> {
        self.machine.write().unwrap().stage_started(stage)
    }

    pub fn responding(&self) -> VoiceResult<()> {
        self.machine.write().unwrap().responding()
    }

    pub fn turn_complete(&self) -> VoiceResult<()> {
        self.machine.write().unwrap().turn_complete()
    }

    pub fn fail(&self) -> SessionState {
        self.machine.write().unwrap().fail()
    }

    pub fn recover(&self) {
        self.machine.write().unwrap().recover()
    }

    pub fn close(&self) {
        self.machine.write().unwrap().close()
    }

    /// Append a completed exchange, trimming the oldest beyond the limit.
    pub fn push_turn(&self, user: String, assistant: String) {
        let mut history = self.history.write().unwrap();
        history.push(ChatTurn { user, assistant });
        let len = history.len();
        if len > self.history_limit {
            history.drain(0..len - self.history_limit);
        }
    }

    pub fn history(&self) -> Vec<ChatTurn> {
        self.history.read().unwrap().clone()
    }

    /// Fold a completed turn into the running totals.
    pub fn record_turn(&self, _timings: &StageTimings, audio_in_secs: f64, audio_out_secs: f64) {
        let mut totals = self.totals.write().unwrap();
        totals.audio_in_secs += audio_in_secs;
        totals.audio_out_secs += audio_out_secs;
        totals.turn_count += 1;
    }

    pub fn totals(&self) -> SessionTotals {
        self.totals.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> VoiceSession {
        VoiceSession::new(
            "s1".into(),
            "p1".into(),
            "bot1".into(),
            VoiceConfig::default(),
            4,
        )
        .unwrap()
    }

    #[test]
    fn test_voice_config_bounds() {
        let mut cfg = VoiceConfig::default();
        assert!(cfg.validate().is_ok());

        cfg.speed = 0.4;
        assert!(cfg.validate().is_err());
        cfg.speed = 2.0;
        assert!(cfg.validate().is_ok());

        cfg.pitch = -2.5;
        assert!(cfg.validate().is_err());
        cfg.pitch = 2.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_audio_format_parsing() {
        assert_eq!("WAV".parse::<AudioFormat>().unwrap(), AudioFormat::Wav);
        assert_eq!("mp3".parse::<AudioFormat>().unwrap(), AudioFormat::Mp3);
        assert!("flac".parse::<AudioFormat>().is_err());
        assert_eq!(AudioFormat::Ogg.content_type(), "audio/ogg");
    }

    #[test]
    fn test_invalid_config_rejected_at_creation() {
        let config = VoiceConfig {
            speed: 3.0,
            ..VoiceConfig::default()
        };
        assert!(VoiceSession::new("s".into(), "p".into(), "b".into(), config, 4).is_err());
    }

    #[test]
    fn test_history_is_capped() {
        let s = session();
        for i in 0..6 {
            s.push_turn(format!("q{}", i), format!("a{}", i));
        }
        let history = s.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].user, "q2");
        assert_eq!(history[3].assistant, "a5");
    }

    #[test]
    fn test_totals_accumulate() {
        let s = session();
        let timings = StageTimings::default();
        s.record_turn(&timings, 3.0, 1.5);
        s.record_turn(&timings, 2.0, 0.5);
        let totals = s.totals();
        assert_eq!(totals.turn_count, 2);
        assert!((totals.audio_in_secs - 5.0).abs() < f64::EPSILON);
        assert!((totals.audio_out_secs - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_conversation_id_set_once() {
        let s = session();
        assert!(s.conversation_id().is_none());
        s.set_conversation_id("c1".into());
        s.set_conversation_id("c2".into());
        assert_eq!(s.conversation_id().as_deref(), Some("c1"));
    }
}
