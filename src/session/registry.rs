//! # Session Registry
//!
//! Owns the mapping from client connection id to [`Session`]. At most one
//! session exists per client id at any moment.
//!
//! ## Session States:
//! ```text
//! Created → Active → Closing → Closed
//!    └─────────────────┘
//! ```
//! A session that is torn down before it activates goes straight from
//! `Created` to `Closing`. Transitions are compare-and-swap operations, so two
//! racing callers can never both win the same transition.

use super::SessionError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// One client's logical conversation with the engine.
///
/// Holds identity and state only. Tasks, the upstream handle and the
/// cancellation token live in the lifecycle manager.
#[derive(Debug)]
pub struct Session {
    pub client_id: String,
    /// Minted per session, so a stale teardown request for an old session
    /// never hits a newer one of the same client.
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    state: AtomicU8,
}

impl Session {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            session_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            state: AtomicU8::new(SessionState::Created as u8),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// `Created → Active`. Fails if teardown already started.
    pub fn activate(&self) -> bool {
        self.transition(SessionState::Created, SessionState::Active)
    }

    /// Claim the teardown. Exactly one caller ever gets `true`.
    pub fn begin_closing(&self) -> bool {
        self.transition(SessionState::Active, SessionState::Closing)
            || self.transition(SessionState::Created, SessionState::Closing)
    }

    pub fn mark_closed(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state(), SessionState::Created | SessionState::Active)
    }

    pub fn age_seconds(&self) -> f64 {
        Utc::now()
            .signed_duration_since(self.created_at)
            .num_milliseconds() as f64
            / 1000.0
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            client_id: self.client_id.clone(),
            session_id: self.session_id.clone(),
            state: self.state().as_str(),
            created_at: self.created_at,
            age_seconds: self.age_seconds(),
        }
    }
}

/// Serializable view used by the sessions endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub client_id: String,
    pub session_id: String,
    pub state: &'static str,
    pub created_at: DateTime<Utc>,
    pub age_seconds: f64,
}

/// Registry of live sessions, keyed by client id.
///
/// Cheap to clone; all clones share the same map.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    /// `max_sessions == 0` means unlimited.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
        }
    }

    /// Register a new session for `client_id` in the `Created` state.
    pub async fn create(&self, client_id: &str) -> Result<Arc<Session>, SessionError> {
        let mut sessions = self.sessions.write().await;

        if sessions.contains_key(client_id) {
            return Err(SessionError::Duplicate(client_id.to_string()));
        }

        if self.max_sessions > 0 && sessions.len() >= self.max_sessions {
            return Err(SessionError::CapacityReached(self.max_sessions));
        }

        let session = Arc::new(Session::new(client_id));
        sessions.insert(client_id.to_string(), session.clone());
        debug!(client_id, session_id = %session.session_id, "Session registered");

        Ok(session)
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(client_id).cloned()
    }

    /// Remove the entry for `client_id`. Removing a missing entry is a no-op.
    pub async fn remove(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(client_id)
    }

    /// Remove the entry only if it still belongs to `session_id`.
    pub async fn remove_session(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&session.client_id) {
            Some(current) if current.session_id == session.session_id => {
                sessions.remove(&session.client_id);
                true
            }
            _ => false,
        }
    }

    pub async fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let session = Session::new("client");
        assert_eq!(session.state(), SessionState::Created);

        assert!(session.activate());
        assert!(!session.activate());
        assert_eq!(session.state(), SessionState::Active);

        assert!(session.begin_closing());
        assert!(!session.begin_closing());
        assert!(!session.activate());

        session.mark_closed();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.begin_closing());
    }

    #[test]
    fn test_closing_before_activation() {
        let session = Session::new("client");
        assert!(session.begin_closing());
        assert!(!session.activate());
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn test_duplicate_client_rejected() {
        let registry = SessionRegistry::new(0);
        registry.create("a").await.unwrap();

        let err = registry.create("a").await.unwrap_err();
        assert!(matches!(err, SessionError::Duplicate(id) if id == "a"));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let registry = SessionRegistry::new(2);
        registry.create("a").await.unwrap();
        registry.create("b").await.unwrap();

        assert!(matches!(
            registry.create("c").await,
            Err(SessionError::CapacityReached(2))
        ));

        registry.remove("a").await;
        assert!(registry.create("c").await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new(0);
        registry.create("a").await.unwrap();

        assert!(registry.remove("a").await.is_some());
        assert!(registry.remove("a").await.is_none());
        assert!(registry.get("a").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_session_ignores_newer_entry() {
        let registry = SessionRegistry::new(0);
        let old = registry.create("a").await.unwrap();
        registry.remove("a").await;
        let newer = registry.create("a").await.unwrap();

        assert!(!registry.remove_session(&old).await);
        assert_eq!(
            registry.get("a").await.map(|s| s.session_id.clone()),
            Some(newer.session_id.clone())
        );
        assert!(registry.remove_session(&newer).await);
    }

    #[tokio::test]
    async fn test_concurrent_creates_admit_one() {
        let registry = SessionRegistry::new(0);

        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.create("same").await.is_ok() })
            })
            .collect();

        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(registry.len().await, 1);
    }
}
