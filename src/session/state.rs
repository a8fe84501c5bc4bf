//! # Session State Machine
//!
//! Explicit lifecycle for one voice session. All transitions are synchronous
//! and non-blocking; the owning connection actor is the single mutation
//! point, so no transition ever races another for the same session.
//!
//! ## Lifecycle:
//! ```text
//! Idle → Recording → Finalizing → ProcessingStt → ProcessingLlm
//!      → ProcessingTts → Responding → Idle
//! ```
//! Any state may move to `Error` (which recovers to `Idle` after one error
//! event) or to the terminal `Closed`. `audio_start` during a Processing
//! state is barge-in: the in-flight turn is cancelled and the machine goes
//! straight back to `Recording`. `text_input` from `Idle` or `Recording`
//! skips STT and enters `ProcessingLlm` directly.

use crate::error::{VoiceError, VoiceResult};
use crate::pipeline::provider::Stage;

/// Current lifecycle state of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for input
    Idle,
    /// Receiving audio chunks for the current utterance
    Recording,
    /// Utterance assembly handed to the pipeline, STT not yet started
    Finalizing,
    /// Speech-to-text stage in flight
    ProcessingStt,
    /// Completion stage in flight
    ProcessingLlm,
    /// Text-to-speech stage in flight
    ProcessingTts,
    /// Synthesized audio being written to the socket
    Responding,
    /// A stage failed; one error event is emitted before recovery to Idle
    Error,
    /// Terminal: explicit close, socket loss or idle timeout
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Recording => "recording",
            SessionState::Finalizing => "finalizing",
            SessionState::ProcessingStt => "processing_stt",
            SessionState::ProcessingLlm => "processing_llm",
            SessionState::ProcessingTts => "processing_tts",
            SessionState::Responding => "responding",
            SessionState::Error => "error",
            SessionState::Closed => "closed",
        }
    }

    /// True while a pipeline turn is in flight for this session.
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            SessionState::Finalizing
                | SessionState::ProcessingStt
                | SessionState::ProcessingLlm
                | SessionState::ProcessingTts
                | SessionState::Responding
        )
    }
}

/// What an accepted `audio_start` means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    /// Normal start from Idle: allocate a fresh utterance buffer
    Fresh,
    /// Start arrived mid-pipeline: cancel the in-flight turn, drop its
    /// metrics, then allocate a fresh buffer
    BargeIn,
}

/// Guarded transition table for one session.
///
/// Methods return the follow-up action (where one exists) or a
/// `ValidationError` describing the rejected transition; the machine state
/// is only changed when the transition is legal.
#[derive(Debug)]
pub struct StateMachine {
    state: SessionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// `audio_start` frame. From Idle this begins a fresh recording; during
    /// any Processing state it is barge-in. Restarting while already
    /// Recording simply resets the utterance.
    pub fn audio_start(&mut self) -> VoiceResult<StartKind> {
        match self.state {
            SessionState::Idle | SessionState::Recording => {
                self.state = SessionState::Recording;
                Ok(StartKind::Fresh)
            }
            s if s.is_processing() => {
                self.state = SessionState::Recording;
                Ok(StartKind::BargeIn)
            }
            other => Err(self.rejected("audio_start", other)),
        }
    }

    /// Binary audio frame. Only legal while Recording.
    pub fn audio_chunk(&mut self) -> VoiceResult<()> {
        match self.state {
            SessionState::Recording => Ok(()),
            other => Err(self.rejected("audio_chunk", other)),
        }
    }

    /// `audio_stop` frame: hand the assembled utterance to the pipeline.
    pub fn audio_stop(&mut self) -> VoiceResult<()> {
        match self.state {
            SessionState::Recording => {
                self.state = SessionState::Finalizing;
                Ok(())
            }
            other => Err(self.rejected("audio_stop", other)),
        }
    }

    /// `text_input` frame: skip STT, enter the completion stage directly.
    /// Accepted from Idle or Recording (a partial recording is discarded).
    pub fn text_input(&mut self) -> VoiceResult<()> {
        match self.state {
            SessionState::Idle | SessionState::Recording => {
                self.state = SessionState::ProcessingLlm;
                Ok(())
            }
            other => Err(self.rejected("text_input", other)),
        }
    }

    /// A pipeline stage has started; called as progress events arrive.
    pub fn stage_started(&mut self, stage: Stage) -> VoiceResult<()> {
        let next = match (self.state, stage) {
            (SessionState::Finalizing, Stage::Stt) => SessionState::ProcessingStt,
            (SessionState::ProcessingStt, Stage::Llm) => SessionState::ProcessingLlm,
            // text_input turns begin directly at the completion stage
            (SessionState::Finalizing, Stage::Llm) => SessionState::ProcessingLlm,
            (SessionState::ProcessingLlm, Stage::Tts) => SessionState::ProcessingTts,
            (state, _) => return Err(self.rejected(stage.as_str(), state)),
        };
        self.state = next;
        Ok(())
    }

    /// TTS finished; synthesized audio is being written to the socket.
    pub fn responding(&mut self) -> VoiceResult<()> {
        match self.state {
            SessionState::ProcessingTts => {
                self.state = SessionState::Responding;
                Ok(())
            }
            other => Err(self.rejected("audio_ready", other)),
        }
    }

    /// Audio fully written; the turn is over.
    pub fn turn_complete(&mut self) -> VoiceResult<()> {
        match self.state {
            SessionState::Responding => {
                self.state = SessionState::Idle;
                Ok(())
            }
            other => Err(self.rejected("turn_complete", other)),
        }
    }

    /// Any-state transition into Error. Returns the state that failed so
    /// the caller can log it.
    pub fn fail(&mut self) -> SessionState {
        let failed_from = self.state;
        if self.state != SessionState::Closed {
            self.state = SessionState::Error;
        }
        failed_from
    }

    /// Error → Idle, after the single error event has been emitted.
    pub fn recover(&mut self) {
        if self.state == SessionState::Error {
            self.state = SessionState::Idle;
        }
    }

    /// Terminal transition; legal from every state.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    fn rejected(&self, input: &str, state: SessionState) -> VoiceError {
        VoiceError::Validation(format!(
            "'{}' is not valid in state '{}'",
            input,
            state.as_str()
        ))
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_in(state: SessionState) -> StateMachine {
        let mut m = StateMachine::new();
        // Drive the machine into the requested state through legal transitions
        match state {
            SessionState::Idle => {}
            SessionState::Recording => {
                m.audio_start().unwrap();
            }
            SessionState::Finalizing => {
                m.audio_start().unwrap();
                m.audio_stop().unwrap();
            }
            SessionState::ProcessingStt => {
                m.audio_start().unwrap();
                m.audio_stop().unwrap();
                m.stage_started(Stage::Stt).unwrap();
            }
            SessionState::ProcessingLlm => {
                m.text_input().unwrap();
            }
            SessionState::ProcessingTts => {
                m.text_input().unwrap();
                m.stage_started(Stage::Tts).unwrap();
            }
            SessionState::Responding => {
                m.text_input().unwrap();
                m.stage_started(Stage::Tts).unwrap();
                m.responding().unwrap();
            }
            SessionState::Error => {
                m.fail();
            }
            SessionState::Closed => {
                m.close();
            }
        }
        assert_eq!(m.state(), state);
        m
    }

    #[test]
    fn test_happy_path_audio_turn() {
        let mut m = StateMachine::new();
        assert_eq!(m.audio_start().unwrap(), StartKind::Fresh);
        m.audio_chunk().unwrap();
        m.audio_chunk().unwrap();
        m.audio_stop().unwrap();
        m.stage_started(Stage::Stt).unwrap();
        m.stage_started(Stage::Llm).unwrap();
        m.stage_started(Stage::Tts).unwrap();
        m.responding().unwrap();
        m.turn_complete().unwrap();
        assert_eq!(m.state(), SessionState::Idle);
    }

    #[test]
    fn test_text_input_skips_stt() {
        let mut m = StateMachine::new();
        m.text_input().unwrap();
        assert_eq!(m.state(), SessionState::ProcessingLlm);
        // STT must never start on a text turn
        assert!(m.stage_started(Stage::Stt).is_err());
        m.stage_started(Stage::Tts).unwrap();
        assert_eq!(m.state(), SessionState::ProcessingTts);
    }

    #[test]
    fn test_barge_in_from_every_processing_state() {
        for state in [
            SessionState::Finalizing,
            SessionState::ProcessingStt,
            SessionState::ProcessingLlm,
            SessionState::ProcessingTts,
            SessionState::Responding,
        ] {
            let mut m = machine_in(state);
            assert_eq!(m.audio_start().unwrap(), StartKind::BargeIn, "from {:?}", state);
            assert_eq!(m.state(), SessionState::Recording);
        }
    }

    #[test]
    fn test_restart_while_recording_is_fresh() {
        let mut m = machine_in(SessionState::Recording);
        assert_eq!(m.audio_start().unwrap(), StartKind::Fresh);
        assert_eq!(m.state(), SessionState::Recording);
    }

    #[test]
    fn test_chunk_outside_recording_rejected() {
        for state in [
            SessionState::Idle,
            SessionState::ProcessingStt,
            SessionState::Responding,
        ] {
            let mut m = machine_in(state);
            assert!(m.audio_chunk().is_err(), "chunk accepted in {:?}", state);
        }
    }

    #[test]
    fn test_error_recovers_to_idle() {
        let mut m = machine_in(SessionState::ProcessingLlm);
        let failed_from = m.fail();
        assert_eq!(failed_from, SessionState::ProcessingLlm);
        assert_eq!(m.state(), SessionState::Error);
        m.recover();
        assert_eq!(m.state(), SessionState::Idle);
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut m = machine_in(SessionState::Closed);
        assert!(m.audio_start().is_err());
        assert!(m.text_input().is_err());
        m.fail();
        assert_eq!(m.state(), SessionState::Closed);
    }

    #[test]
    fn test_stage_order_is_enforced() {
        let mut m = machine_in(SessionState::Finalizing);
        // TTS cannot come before the completion stage
        assert!(m.stage_started(Stage::Tts).is_err());
        m.stage_started(Stage::Stt).unwrap();
        assert!(m.stage_started(Stage::Stt).is_err());
        m.stage_started(Stage::Llm).unwrap();
        m.stage_started(Stage::Tts).unwrap();
    }
}
