//! # Session Module
//!
//! Per-connection session lifecycle for the voice pipeline.
//!
//! ## Key Components:
//! - **State Machine**: explicit lifecycle with barge-in and error recovery
//! - **Voice Session**: identity, voice config, chat history, usage totals
//! - **Session Manager**: live-session registry with limits and idle sweep

pub mod manager;
pub mod state;
pub mod voice;

pub use manager::SessionManager;
pub use state::{SessionState, StartKind, StateMachine};
pub use voice::{AudioFormat, ChatTurn, VoiceConfig, VoiceSession};
