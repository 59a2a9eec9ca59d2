//! # Session Core
//!
//! Everything between a client connection and the upstream engine:
//!
//! - **registry**: which client owns which session
//! - **relay**: the inbound and outbound pumps of one session
//! - **lifecycle**: session creation, wiring and the single teardown routine
//!
//! The client transport only talks to this module through
//! [`lifecycle::LifecycleManager`], a [`ClientSink`] and the chunk channel of a
//! [`lifecycle::SessionLink`].

pub mod lifecycle;
pub mod registry;
pub mod relay;

use crate::upstream::{ResponseModality, UpstreamError};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

pub use lifecycle::{LifecycleManager, SessionLink};
pub use registry::{SessionRegistry, SessionSummary};

/// Something the core tells a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    SessionStarted { session_id: String },
    Text(String),
    Audio(Vec<u8>),
    TurnComplete,
    Error { message: String },
    SessionEnded { reason: String },
}

/// Delivery channel back to one client.
///
/// Returns `false` when the client is gone. Delivery failures never stop
/// the core; they only mean nobody is listening anymore.
pub trait ClientSink: Send + Sync {
    fn notify(&self, notification: Notification) -> bool;
}

impl ClientSink for tokio::sync::mpsc::UnboundedSender<Notification> {
    fn notify(&self, notification: Notification) -> bool {
        self.send(notification).is_ok()
    }
}

/// Why a session is being torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownReason {
    ClientRequest,
    Disconnect,
    /// The engine closed its stream normally.
    StreamClosed,
    Fatal(String),
    Shutdown,
}

impl TeardownReason {
    pub fn as_str(&self) -> &str {
        match self {
            TeardownReason::ClientRequest => "client_request",
            TeardownReason::Disconnect => "disconnect",
            TeardownReason::StreamClosed => "stream_closed",
            TeardownReason::Fatal(_) => "error",
            TeardownReason::Shutdown => "shutdown",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TeardownReason::Fatal(_))
    }
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownReason::Fatal(message) => write!(f, "error: {}", message),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Per-session overrides a client may send with `start_session`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StartOptions {
    #[serde(default)]
    pub response_modality: Option<ResponseModality>,
    #[serde(default)]
    pub system_instruction: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("a session is already active for client '{0}'")]
    Duplicate(String),

    #[error("maximum concurrent sessions ({0}) reached")]
    CapacityReached(usize),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("session was ended before it became active")]
    Aborted,
}

impl SessionError {
    /// Whether the failed start had already claimed a session, which the
    /// client must then see end. Rejections leave any existing session alone.
    pub fn ends_attempt(&self) -> bool {
        matches!(self, SessionError::Upstream(_) | SessionError::Aborted)
    }
}
