//! # Audio Module
//!
//! Utterance assembly for inbound PCM audio.

pub mod assembler;

pub use assembler::{AppendOutcome, AudioAssembler, AudioChunk};
