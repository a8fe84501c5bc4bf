pub mod config;
pub mod voice;

pub use config::{get_config, update_config};
pub use voice::{voice_chat, voice_synthesize, voice_transcribe};
