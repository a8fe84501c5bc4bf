//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_PIPELINE_STT_TIMEOUT_SECS, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! The pipeline section carries the per-stage provider timeouts and the
//! retry policy; the session section carries lifecycle limits (idle timeout,
//! heartbeat, concurrent session cap).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub voice: VoiceLimitsConfig,
    pub pipeline: PipelineConfig,
    pub session: SessionsConfig,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Audio format and utterance limits.
///
/// Inbound audio is 16-bit little-endian PCM; the limits bound how much a
/// single utterance may accumulate before the assembler starts rejecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceLimitsConfig {
    /// Sample rate of inbound PCM audio (Hz)
    pub sample_rate: u32,

    /// Number of audio channels (mono expected)
    pub channels: u8,

    /// Bit depth of inbound PCM samples
    pub bit_depth: u8,

    /// Maximum duration of a single utterance (seconds). Exceeding this
    /// during recording produces a warning, not an aborted recording.
    pub max_utterance_secs: u32,

    /// Hard cap on assembled utterance size in bytes. Exceeding this at
    /// finalization fails the turn.
    pub max_utterance_bytes: usize,

    /// How far out of order a chunk sequence number may arrive before the
    /// chunk is rejected.
    pub sequence_tolerance: u64,
}

/// Pipeline orchestration settings: stage timeouts, retry policy, provider
/// endpoints and the cross-session concurrency cap for outbound calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Speech-to-text stage timeout (seconds)
    pub stt_timeout_secs: u64,

    /// Completion stage timeout (seconds)
    pub llm_timeout_secs: u64,

    /// Text-to-speech stage timeout (seconds)
    pub tts_timeout_secs: u64,

    /// When true, a failed or timed-out provider call gets exactly one
    /// retry before the stage error surfaces to the client.
    pub retry_transient_once: bool,

    /// Upper bound on concurrent outbound provider calls across all
    /// sessions (counting semaphore).
    pub max_concurrent_provider_calls: usize,

    /// Base URL of the speech-to-text provider
    pub stt_url: String,

    /// Base URL of the completion provider
    pub llm_url: String,

    /// Base URL of the text-to-speech provider
    pub tts_url: String,
}

impl PipelineConfig {
    pub fn stt_timeout(&self) -> Duration {
        Duration::from_secs(self.stt_timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn tts_timeout(&self) -> Duration {
        Duration::from_secs(self.tts_timeout_secs)
    }
}

/// Session lifecycle limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Maximum number of live sessions across all connections
    pub max_concurrent_sessions: usize,

    /// Seconds of inactivity after which a session is closed (close code 4002)
    pub idle_timeout_secs: u64,

    /// How often the server pings each connection (seconds)
    pub heartbeat_interval_secs: u64,

    /// Seconds without any client traffic before the connection is dropped
    pub heartbeat_timeout_secs: u64,

    /// Maximum chat turns retained per session for prompt construction
    pub history_limit: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            voice: VoiceLimitsConfig {
                sample_rate: 16000,
                channels: 1,
                bit_depth: 16,
                max_utterance_secs: 120,
                max_utterance_bytes: 16 * 1024 * 1024,
                sequence_tolerance: 2,
            },
            pipeline: PipelineConfig {
                stt_timeout_secs: 15,
                llm_timeout_secs: 30,
                tts_timeout_secs: 20,
                retry_transient_once: false,
                max_concurrent_provider_calls: 8,
                stt_url: "http://127.0.0.1:9001".to_string(),
                llm_url: "http://127.0.0.1:9002".to_string(),
                tts_url: "http://127.0.0.1:9003".to_string(),
            },
            session: SessionsConfig {
                max_concurrent_sessions: 64,
                idle_timeout_secs: 1800,
                heartbeat_interval_secs: 30,
                heartbeat_timeout_secs: 60,
                history_limit: 32,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml and APP_* environment
    /// variables, in that priority order.
    ///
    /// `HOST` and `PORT` (without the APP_ prefix) are honored as overrides
    /// because deployment platforms commonly inject them.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense before the server
    /// starts accepting connections.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.pipeline.max_concurrent_provider_calls == 0 {
            return Err(anyhow::anyhow!(
                "Max concurrent provider calls must be greater than 0"
            ));
        }

        if self.voice.max_utterance_secs == 0 || self.voice.max_utterance_bytes == 0 {
            return Err(anyhow::anyhow!("Utterance limits must be greater than 0"));
        }

        if self.voice.bit_depth != 16 {
            return Err(anyhow::anyhow!(
                "Only 16-bit PCM input is supported, got {} bits",
                self.voice.bit_depth
            ));
        }

        if self.pipeline.stt_timeout_secs == 0
            || self.pipeline.llm_timeout_secs == 0
            || self.pipeline.tts_timeout_secs == 0
        {
            return Err(anyhow::anyhow!("Stage timeouts must be greater than 0"));
        }

        if self.session.heartbeat_timeout_secs <= self.session.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Heartbeat timeout must exceed the heartbeat interval"
            ));
        }

        Ok(())
    }

    /// Apply a partial runtime update from a JSON document.
    ///
    /// Only the fields present in the JSON are touched, so a client can send
    /// `{"pipeline": {"retry_transient_once": true}}` without restating the
    /// rest of the configuration. The merged result is re-validated.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(pipeline) = partial.get("pipeline") {
            if let Some(v) = pipeline.get("stt_timeout_secs").and_then(|v| v.as_u64()) {
                self.pipeline.stt_timeout_secs = v;
            }
            if let Some(v) = pipeline.get("llm_timeout_secs").and_then(|v| v.as_u64()) {
                self.pipeline.llm_timeout_secs = v;
            }
            if let Some(v) = pipeline.get("tts_timeout_secs").and_then(|v| v.as_u64()) {
                self.pipeline.tts_timeout_secs = v;
            }
            if let Some(v) = pipeline.get("retry_transient_once").and_then(|v| v.as_bool()) {
                self.pipeline.retry_transient_once = v;
            }
            if let Some(v) = pipeline
                .get("max_concurrent_provider_calls")
                .and_then(|v| v.as_u64())
            {
                self.pipeline.max_concurrent_provider_calls = v as usize;
            }
        }

        if let Some(session) = partial.get("session") {
            if let Some(v) = session
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.session.max_concurrent_sessions = v as usize;
            }
            if let Some(v) = session.get("idle_timeout_secs").and_then(|v| v.as_u64()) {
                self.session.idle_timeout_secs = v;
            }
            if let Some(v) = session.get("history_limit").and_then(|v| v.as_u64()) {
                self.session.history_limit = v as usize;
            }
        }

        if let Some(voice) = partial.get("voice") {
            if let Some(v) = voice.get("max_utterance_secs").and_then(|v| v.as_u64()) {
                self.voice.max_utterance_secs = v as u32;
            }
            if let Some(v) = voice.get("max_utterance_bytes").and_then(|v| v.as_u64()) {
                self.voice.max_utterance_bytes = v as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}
