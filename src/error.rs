//! # Error Handling
//!
//! Defines the shared error taxonomy for the voice pipeline and how errors are
//! converted to HTTP responses and WebSocket error frames.
//!
//! ## Error Categories:
//! - **Auth**: Connection-level authentication failures (close the connection)
//! - **AudioFormat**: Oversized or malformed audio (non-fatal during recording)
//! - **Stt/Llm/Tts**: Stage-level provider failures (recovered at session level)
//! - **ConnectionTimeout**: Heartbeat or provider deadline exceeded
//! - **SessionNotFound**: Frame routed to an already-closed session
//! - **Unsupported**: Client platform lacks a required capability
//!
//! Every user-visible error carries a stable code (see [`VoiceError::code`])
//! so clients can react without parsing message text.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Shared error taxonomy for the voice chat pipeline.
///
/// Each variant holds a human-readable message; the stable wire code comes
/// from [`VoiceError::code`]. Stage errors (`Stt`, `Llm`, `Tts`) never crash
/// the connection — the session emits one `error` event and returns to idle.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceError {
    /// Connection-level authentication failure
    Auth(String),

    /// Oversized or malformed audio chunk / utterance
    AudioFormat(String),

    /// Speech-to-text provider failure or timeout
    Stt(String),

    /// Completion provider failure or timeout
    Llm(String),

    /// Text-to-speech provider failure or timeout
    Tts(String),

    /// Heartbeat or connection deadline exceeded
    ConnectionTimeout(String),

    /// Frame routed to an unknown (already closed) session
    SessionNotFound(String),

    /// Client capability missing (e.g. no microphone backend)
    Unsupported(String),

    /// Request or message failed validation rules
    Validation(String),

    /// Server-side problems that fit no other category
    Internal(String),
}

impl VoiceError {
    /// Stable machine-readable code, shared between REST responses and
    /// WebSocket `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            VoiceError::Auth(_) => "AuthError",
            VoiceError::AudioFormat(_) => "AudioFormatError",
            VoiceError::Stt(_) => "SttError",
            VoiceError::Llm(_) => "LlmError",
            VoiceError::Tts(_) => "TtsError",
            VoiceError::ConnectionTimeout(_) => "ConnectionTimeoutError",
            VoiceError::SessionNotFound(_) => "SessionNotFoundError",
            VoiceError::Unsupported(_) => "UnsupportedError",
            VoiceError::Validation(_) => "ValidationError",
            VoiceError::Internal(_) => "InternalError",
        }
    }

    /// The message half of the variant, without the code prefix.
    pub fn message(&self) -> &str {
        match self {
            VoiceError::Auth(msg)
            | VoiceError::AudioFormat(msg)
            | VoiceError::Stt(msg)
            | VoiceError::Llm(msg)
            | VoiceError::Tts(msg)
            | VoiceError::ConnectionTimeout(msg)
            | VoiceError::SessionNotFound(msg)
            | VoiceError::Unsupported(msg)
            | VoiceError::Validation(msg)
            | VoiceError::Internal(msg) => msg,
        }
    }

    /// Whether this error ends the connection (auth failures and unknown
    /// sessions) rather than being recovered at the session level.
    pub fn closes_connection(&self) -> bool {
        matches!(self, VoiceError::Auth(_) | VoiceError::SessionNotFound(_))
    }
}

impl fmt::Display for VoiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for VoiceError {}

/// Conversion to HTTP responses for the REST fallback surface.
///
/// ## Status Code Mapping:
/// - Auth → 401, AudioFormat/Validation/Unsupported → 400
/// - SessionNotFound → 404, ConnectionTimeout → 504
/// - Stt/Llm/Tts → 502 (upstream provider failed)
/// - Internal → 500
impl ResponseError for VoiceError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let status = match self {
            VoiceError::Auth(_) => StatusCode::UNAUTHORIZED,
            VoiceError::AudioFormat(_)
            | VoiceError::Validation(_)
            | VoiceError::Unsupported(_) => StatusCode::BAD_REQUEST,
            VoiceError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            VoiceError::ConnectionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            VoiceError::Stt(_) | VoiceError::Llm(_) | VoiceError::Tts(_) => {
                StatusCode::BAD_GATEWAY
            }
            VoiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for VoiceError {
    fn from(err: anyhow::Error) -> Self {
        VoiceError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Validation(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Internal(format!("configuration error: {}", err))
    }
}

/// Shorthand for results using the shared taxonomy.
pub type VoiceResult<T> = Result<T, VoiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(VoiceError::Stt("timeout".into()).code(), "SttError");
        assert_eq!(VoiceError::Llm("boom".into()).code(), "LlmError");
        assert_eq!(VoiceError::Tts("boom".into()).code(), "TtsError");
        assert_eq!(
            VoiceError::AudioFormat("too big".into()).code(),
            "AudioFormatError"
        );
        assert_eq!(VoiceError::Auth("bad token".into()).code(), "AuthError");
    }

    #[test]
    fn test_display_includes_code_and_message() {
        let err = VoiceError::SessionNotFound("abc123".into());
        assert_eq!(err.to_string(), "SessionNotFoundError: abc123");
    }

    #[test]
    fn test_connection_closing_errors() {
        assert!(VoiceError::Auth("nope".into()).closes_connection());
        assert!(VoiceError::SessionNotFound("gone".into()).closes_connection());
        assert!(!VoiceError::Stt("timeout".into()).closes_connection());
        assert!(!VoiceError::AudioFormat("odd length".into()).closes_connection());
    }
}
