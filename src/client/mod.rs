//! # Client Module
//!
//! The client half of the voice channel: microphone capture and the
//! reconnecting WebSocket transport. Used by the bundled client tooling and
//! kept in-tree so both halves of the protocol evolve together.

pub mod recorder;
pub mod transport;

pub use recorder::{CaptureBackend, Recorder, RecorderConfig};
pub use transport::{connect, BackoffPolicy, TransportEvent, TransportHandle};
