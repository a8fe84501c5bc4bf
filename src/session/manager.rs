//! # Session Registry
//!
//! Owns the set of live sessions. Registry mutation is the only shared
//! mutable state between connections, and it all funnels through this
//! type: create (with the concurrent-session cap), lookup, remove, and the
//! periodic idle sweep.

use crate::error::{VoiceError, VoiceResult};
use crate::session::state::SessionState;
use crate::session::voice::{VoiceConfig, VoiceSession};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

pub struct SessionManager {
    /// Live sessions keyed by session id
    sessions: Arc<RwLock<HashMap<String, Arc<VoiceSession>>>>,

    max_concurrent_sessions: usize,
    history_limit: usize,
}

/// Snapshot of registry state for health reporting.
#[derive(Debug)]
pub struct SessionManagerSummary {
    pub total_sessions: usize,
    pub max_sessions: usize,
    pub state_counts: HashMap<String, usize>,
}

impl SessionManager {
    pub fn new(max_concurrent_sessions: usize, history_limit: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_concurrent_sessions,
            history_limit,
        }
    }

    /// Register a new session for an authenticated principal.
    ///
    /// Fails when the concurrent-session cap is reached or the voice config
    /// is invalid. The generated session id is unique for the process
    /// lifetime.
    pub fn create_session(
        &self,
        principal_id: String,
        chatbot_id: String,
        config: VoiceConfig,
    ) -> VoiceResult<Arc<VoiceSession>> {
        let mut sessions = self.sessions.write().unwrap();

        if sessions.len() >= self.max_concurrent_sessions {
            return Err(VoiceError::Internal(format!(
                "maximum concurrent sessions ({}) reached",
                self.max_concurrent_sessions
            )));
        }

        let session_id = Uuid::new_v4().to_string();
        let session = Arc::new(VoiceSession::new(
            session_id.clone(),
            principal_id,
            chatbot_id,
            config,
            self.history_limit,
        )?);

        sessions.insert(session_id.clone(), Arc::clone(&session));
        info!(session_id = %session_id, "Voice session registered");

        Ok(session)
    }

    /// Look up a live session. Returns `SessionNotFoundError` for ids that
    /// have already been closed; callers racing a disconnect treat this as
    /// expected and only log it.
    pub fn get_session(&self, session_id: &str) -> VoiceResult<Arc<VoiceSession>> {
        self.sessions
            .read()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| VoiceError::SessionNotFound(session_id.to_string()))
    }

    /// Deregister a session. Missing ids are fine: disconnect and idle
    /// sweep can race.
    pub fn remove_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().unwrap().remove(session_id).is_some();
        if removed {
            info!(session_id = %session_id, "Voice session removed");
        } else {
            debug!(session_id = %session_id, "Remove for unknown session (already closed)");
        }
        removed
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Collect sessions idle past the configured timeout. The caller closes
    /// their connections; marking them closed here keeps the registry and
    /// state machine consistent even if the connection is already gone.
    pub fn sweep_idle(&self, idle_timeout_secs: u64) -> Vec<String> {
        let mut sessions = self.sessions.write().unwrap();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| {
                s.idle_seconds() > idle_timeout_secs as i64
                    || s.state() == SessionState::Closed
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                session.close();
                info!(session_id = %id, "Session expired (idle timeout)");
            }
        }

        expired
    }

    pub fn summary(&self) -> SessionManagerSummary {
        let sessions = self.sessions.read().unwrap();

        let mut state_counts = HashMap::new();
        for session in sessions.values() {
            *state_counts
                .entry(session.state().as_str().to_string())
                .or_insert(0) += 1;
        }

        SessionManagerSummary {
            total_sessions: sessions.len(),
            max_sessions: self.max_concurrent_sessions,
            state_counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max: usize) -> SessionManager {
        SessionManager::new(max, 8)
    }

    #[test]
    fn test_create_and_get() {
        let m = manager(4);
        let session = m
            .create_session("p1".into(), "bot1".into(), VoiceConfig::default())
            .unwrap();
        let found = m.get_session(&session.session_id).unwrap();
        assert_eq!(found.session_id, session.session_id);
        assert_eq!(m.active_session_count(), 1);
    }

    #[test]
    fn test_session_limit() {
        let m = manager(2);
        m.create_session("p".into(), "b".into(), VoiceConfig::default())
            .unwrap();
        m.create_session("p".into(), "b".into(), VoiceConfig::default())
            .unwrap();
        assert!(m
            .create_session("p".into(), "b".into(), VoiceConfig::default())
            .is_err());
    }

    #[test]
    fn test_unknown_session_lookup() {
        let m = manager(4);
        match m.get_session("nope") {
            Err(VoiceError::SessionNotFound(id)) => assert_eq!(id, "nope"),
            other => panic!("expected SessionNotFound, got {:?}", other.map(|s| s.session_id.clone())),
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let m = manager(4);
        let session = m
            .create_session("p".into(), "b".into(), VoiceConfig::default())
            .unwrap();
        assert!(m.remove_session(&session.session_id));
        assert!(!m.remove_session(&session.session_id));
        assert_eq!(m.active_session_count(), 0);
    }

    #[test]
    fn test_sweep_removes_closed_sessions() {
        let m = manager(4);
        let session = m
            .create_session("p".into(), "b".into(), VoiceConfig::default())
            .unwrap();
        session.close();
        let expired = m.sweep_idle(3600);
        assert_eq!(expired, vec![session.session_id.clone()]);
        assert_eq!(m.active_session_count(), 0);
    }

    #[test]
    fn test_sweep_keeps_active_sessions() {
        let m = manager(4);
        let session = m
            .create_session("p".into(), "b".into(), VoiceConfig::default())
            .unwrap();
        session.touch();
        assert!(m.sweep_idle(3600).is_empty());
        assert_eq!(m.active_session_count(), 1);
        let _ = session;
    }
}
