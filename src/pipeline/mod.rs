//! # Pipeline Module
//!
//! The STT → completion → TTS turn pipeline.
//!
//! ## Key Components:
//! - **Provider traits**: the three stages behind swappable trait objects
//! - **HTTP providers**: production implementations over reqwest
//! - **Orchestrator**: timeouts, retry policy, concurrency cap, cancellation

pub mod http;
pub mod orchestrator;
pub mod provider;

pub use orchestrator::{
    cancel_pair, CancelHandle, CancelToken, PipelineEvent, PipelineOrchestrator, TurnInput,
};
pub use provider::{
    Completion, CompletionProvider, PipelineResult, SourceRef, Stage, StageTimings, SttProvider,
    Transcript, TtsProvider,
};
