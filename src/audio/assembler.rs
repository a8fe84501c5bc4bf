//! # Audio Assembler
//!
//! Merges ordered audio chunks into one contiguous utterance buffer and
//! validates them before the buffer is handed to the STT stage.
//!
//! ## Validation:
//! - Zero-length chunks are rejected
//! - Chunk bytes must parse as 16-bit little-endian PCM (even length)
//! - Sequence numbers may drift from the expected position only within a
//!   tolerance window; anything further out of order is rejected
//! - A soft duration limit warns once per utterance while recording keeps
//!   going; a hard byte cap fails finalization
//!
//! The assembler is exclusively owned by its session's connection actor —
//! chunks are never shared between sessions.

use crate::config::VoiceLimitsConfig;
use crate::error::{VoiceError, VoiceResult};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// One inbound audio chunk. Immutable once constructed; owned by the
/// session's assembler until merged.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub sequence: u64,
    pub is_final: bool,
}

impl AudioChunk {
    pub fn new(data: Vec<u8>, sequence: u64) -> Self {
        Self {
            data,
            sequence,
            is_final: false,
        }
    }

    pub fn final_chunk(data: Vec<u8>, sequence: u64) -> Self {
        Self {
            data,
            sequence,
            is_final: true,
        }
    }
}

/// Outcome of appending a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Chunk merged, utterance within limits
    Accepted,
    /// Chunk merged, but the utterance just crossed the soft duration
    /// limit. Reported exactly once per utterance; the caller emits a
    /// non-fatal warning and recording continues.
    AcceptedOverLimit,
}

/// Buffers the chunks of the current utterance for one session.
pub struct AudioAssembler {
    config: VoiceLimitsConfig,
    buffer: Vec<u8>,
    next_sequence: u64,
    over_limit_warned: bool,
    saw_final: bool,
}

impl AudioAssembler {
    pub fn new(config: VoiceLimitsConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            next_sequence: 0,
            over_limit_warned: false,
            saw_final: false,
        }
    }

    /// Validate and merge one chunk into the utterance buffer.
    pub fn append(&mut self, chunk: AudioChunk) -> VoiceResult<AppendOutcome> {
        if self.saw_final {
            return Err(VoiceError::AudioFormat(
                "chunk received after the final chunk of this utterance".into(),
            ));
        }

        if chunk.data.is_empty() {
            return Err(VoiceError::AudioFormat("empty audio chunk".into()));
        }

        if chunk.data.len() % 2 != 0 {
            return Err(VoiceError::AudioFormat(
                "audio chunk length must be even for 16-bit samples".into(),
            ));
        }

        let distance = chunk.sequence.abs_diff(self.next_sequence);
        if distance > self.config.sequence_tolerance {
            return Err(VoiceError::AudioFormat(format!(
                "chunk sequence {} too far from expected {} (tolerance {})",
                chunk.sequence, self.next_sequence, self.config.sequence_tolerance
            )));
        }

        // First chunk of an utterance gets a structural sanity check so a
        // client sending something other than PCM fails fast.
        if self.buffer.is_empty() {
            self.validate_pcm_structure(&chunk.data)?;
        }

        self.next_sequence = self.next_sequence.max(chunk.sequence) + 1;
        self.buffer.extend_from_slice(&chunk.data);
        self.saw_final = chunk.is_final;

        if self.duration_secs() > self.config.max_utterance_secs as f64 && !self.over_limit_warned
        {
            self.over_limit_warned = true;
            return Ok(AppendOutcome::AcceptedOverLimit);
        }

        Ok(AppendOutcome::Accepted)
    }

    /// Duration of the buffered utterance, assuming the configured PCM
    /// format (bytes / (rate * channels * bytes-per-sample)).
    pub fn duration_secs(&self) -> f64 {
        let bytes_per_second = self.config.sample_rate as f64
            * self.config.channels as f64
            * (self.config.bit_depth as f64 / 8.0);
        if bytes_per_second <= 0.0 {
            return 0.0;
        }
        self.buffer.len() as f64 / bytes_per_second
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discard the current utterance (barge-in, text_input, error recovery).
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.next_sequence = 0;
        self.over_limit_warned = false;
        self.saw_final = false;
    }

    /// Hand the assembled utterance to the pipeline and reset.
    ///
    /// Fails when nothing was buffered or the utterance exceeds the hard
    /// byte cap — at this point the error is fatal for the turn, unlike the
    /// soft warning during recording.
    pub fn finalize(&mut self) -> VoiceResult<Vec<u8>> {
        if self.buffer.is_empty() {
            return Err(VoiceError::AudioFormat(
                "no audio buffered for this utterance".into(),
            ));
        }

        if self.buffer.len() > self.config.max_utterance_bytes {
            let len = self.buffer.len();
            self.clear();
            return Err(VoiceError::AudioFormat(format!(
                "utterance of {} bytes exceeds the {} byte limit",
                len, self.config.max_utterance_bytes
            )));
        }

        self.next_sequence = 0;
        self.over_limit_warned = false;
        self.saw_final = false;
        Ok(std::mem::take(&mut self.buffer))
    }

    /// Parse a bounded prefix of the data as little-endian i16 samples to
    /// catch obviously non-PCM payloads.
    fn validate_pcm_structure(&self, data: &[u8]) -> VoiceResult<()> {
        let mut cursor = Cursor::new(data);
        let mut sample_count = 0;

        while let Ok(_sample) = cursor.read_i16::<LittleEndian>() {
            sample_count += 1;
            if sample_count >= 1000 {
                break;
            }
        }

        if sample_count == 0 {
            return Err(VoiceError::AudioFormat("no valid PCM samples found".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> VoiceLimitsConfig {
        VoiceLimitsConfig {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
            max_utterance_secs: 2,
            max_utterance_bytes: 256 * 1024,
            sequence_tolerance: 2,
        }
    }

    fn one_second_chunk(seq: u64) -> AudioChunk {
        // 16kHz mono 16-bit → 32000 bytes per second
        AudioChunk::new(vec![0u8; 32000], seq)
    }

    #[test]
    fn test_append_and_finalize() {
        let mut a = AudioAssembler::new(limits());
        a.append(one_second_chunk(0)).unwrap();
        a.append(one_second_chunk(1)).unwrap();
        assert!((a.duration_secs() - 2.0).abs() < 0.001);

        let audio = a.finalize().unwrap();
        assert_eq!(audio.len(), 64000);
        assert!(a.is_empty());
        assert!((a.duration_secs()).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rejects_empty_chunk() {
        let mut a = AudioAssembler::new(limits());
        let err = a.append(AudioChunk::new(vec![], 0)).unwrap_err();
        assert_eq!(err.code(), "AudioFormatError");
    }

    #[test]
    fn test_rejects_odd_length_chunk() {
        let mut a = AudioAssembler::new(limits());
        let err = a.append(AudioChunk::new(vec![0u8; 3], 0)).unwrap_err();
        assert_eq!(err.code(), "AudioFormatError");
    }

    #[test]
    fn test_sequence_tolerance_window() {
        let mut a = AudioAssembler::new(limits());
        a.append(AudioChunk::new(vec![0u8; 320], 0)).unwrap();
        // Expected 1; 2 is within the tolerance window of 2
        a.append(AudioChunk::new(vec![0u8; 320], 2)).unwrap();
        // Expected 3; 6 is out of the window
        let err = a.append(AudioChunk::new(vec![0u8; 320], 6)).unwrap_err();
        assert_eq!(err.code(), "AudioFormatError");
    }

    #[test]
    fn test_over_limit_warns_once_and_recording_continues() {
        let mut a = AudioAssembler::new(limits());
        assert_eq!(a.append(one_second_chunk(0)).unwrap(), AppendOutcome::Accepted);
        assert_eq!(a.append(one_second_chunk(1)).unwrap(), AppendOutcome::Accepted);
        // Crossing the 2s soft limit warns exactly once
        assert_eq!(
            a.append(one_second_chunk(2)).unwrap(),
            AppendOutcome::AcceptedOverLimit
        );
        assert_eq!(a.append(one_second_chunk(3)).unwrap(), AppendOutcome::Accepted);
        // The audio is all still there
        assert_eq!(a.len(), 4 * 32000);
    }

    #[test]
    fn test_finalize_empty_fails() {
        let mut a = AudioAssembler::new(limits());
        assert!(a.finalize().is_err());
    }

    #[test]
    fn test_finalize_over_hard_cap_fails_and_clears() {
        let mut config = limits();
        config.max_utterance_bytes = 1000;
        let mut a = AudioAssembler::new(config);
        a.append(AudioChunk::new(vec![0u8; 2048], 0)).unwrap();
        let err = a.finalize().unwrap_err();
        assert_eq!(err.code(), "AudioFormatError");
        assert!(a.is_empty());
    }

    #[test]
    fn test_nothing_accepted_after_final_chunk() {
        let mut a = AudioAssembler::new(limits());
        a.append(AudioChunk::new(vec![0u8; 320], 0)).unwrap();
        a.append(AudioChunk::final_chunk(vec![0u8; 320], 1)).unwrap();
        let err = a.append(AudioChunk::new(vec![0u8; 320], 2)).unwrap_err();
        assert_eq!(err.code(), "AudioFormatError");
        // The buffered audio is still intact and finalizes normally
        assert_eq!(a.finalize().unwrap().len(), 640);
    }

    #[test]
    fn test_clear_resets_sequence_tracking() {
        let mut a = AudioAssembler::new(limits());
        a.append(AudioChunk::new(vec![0u8; 320], 0)).unwrap();
        a.append(AudioChunk::new(vec![0u8; 320], 1)).unwrap();
        a.clear();
        // A fresh utterance starts back at sequence zero
        a.append(AudioChunk::new(vec![0u8; 320], 0)).unwrap();
        assert_eq!(a.len(), 320);
    }
}
