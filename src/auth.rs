//! # Authentication
//!
//! Token validation for the WebSocket upgrade and the REST fallback. Actual
//! credential verification lives with the account service; this crate only
//! needs a seam that turns a bearer token into a principal, so the check is
//! behind a trait and the default implementation treats the token as an
//! opaque API key.

use crate::error::{VoiceError, VoiceResult};

/// The authenticated caller a token resolves to.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> VoiceResult<Principal>;
}

/// Accepts any non-empty API key and uses it as the principal identity.
/// Production deployments swap in an implementation that calls the account
/// service.
pub struct ApiKeyAuthenticator;

impl Authenticator for ApiKeyAuthenticator {
    fn authenticate(&self, token: &str) -> VoiceResult<Principal> {
        let token = token.trim();
        if token.is_empty() {
            return Err(VoiceError::Auth("missing auth token".into()));
        }
        Ok(Principal {
            id: token.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_token_rejected() {
        let auth = ApiKeyAuthenticator;
        assert!(auth.authenticate("").is_err());
        assert!(auth.authenticate("   ").is_err());
    }

    #[test]
    fn test_token_becomes_principal() {
        let auth = ApiKeyAuthenticator;
        let principal = auth.authenticate("key-123").unwrap();
        assert_eq!(principal.id, "key-123");
    }
}
