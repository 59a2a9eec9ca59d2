//! # Upstream Connector
//!
//! Abstraction over the remote conversational streaming engine. The rest of
//! the service only ever sees:
//!
//! - [`UpstreamConnector::open`] to establish one streaming connection
//! - [`UpstreamHandle::send`] to push a chunk (order preserved per handle)
//! - [`UpstreamHandle::take_responses`] for the lazy [`ResponseEvent`] sequence
//! - [`UpstreamHandle::close`], which is idempotent
//!
//! Engine frames are translated into [`ResponseEvent`] exactly once, inside
//! the connector. Nothing downstream inspects raw engine payloads.

pub mod gemini;
#[cfg(test)]
pub mod mock;

use crate::media::Chunk;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

pub use gemini::GeminiConnector;

/// What the engine should answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseModality {
    #[default]
    Text,
    Audio,
}

impl ResponseModality {
    /// Name used by the engine's setup message.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ResponseModality::Text => "TEXT",
            ResponseModality::Audio => "AUDIO",
        }
    }
}

impl std::str::FromStr for ResponseModality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(ResponseModality::Text),
            "audio" => Ok(ResponseModality::Audio),
            _ => Err(format!("Unknown response modality: {}", s)),
        }
    }
}

impl fmt::Display for ResponseModality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Settings for one upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub model: String,
    pub response_modality: ResponseModality,
    pub system_instruction: Option<String>,
}

/// One unit of engine output, decided once at the connector boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    TextDelta(String),
    AudioDelta(Vec<u8>),
    TurnComplete,
    /// The engine closed the stream normally. Always the last event.
    StreamClosed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("failed to connect to upstream engine: {0}")]
    Connect(String),

    #[error("failed to send chunk upstream: {0}")]
    Send(String),

    #[error("upstream stream failed: {0}")]
    Receive(String),

    #[error("upstream handle is closed")]
    Closed,
}

/// Lazy sequence of engine responses for one connection.
pub type ResponseStream = BoxStream<'static, Result<ResponseEvent, UpstreamError>>;

/// The write side of an open connection, implemented per engine.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(&self, chunk: &Chunk) -> Result<(), UpstreamError>;

    /// Release the connection. Called at most once by [`UpstreamHandle`].
    async fn close(&self) -> Result<(), UpstreamError>;
}

/// Opens connections to the remote engine.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn open(&self, config: &UpstreamConfig) -> Result<UpstreamHandle, UpstreamError>;
}

/// Duplex handle to one upstream connection.
///
/// Shared between the inbound relay (send), the outbound relay (responses)
/// and the lifecycle manager (close), all of the same session.
pub struct UpstreamHandle {
    transport: Arc<dyn UpstreamTransport>,
    responses: Mutex<Option<ResponseStream>>,
    closed: AtomicBool,
}

impl UpstreamHandle {
    pub fn new(transport: Arc<dyn UpstreamTransport>, responses: ResponseStream) -> Self {
        Self {
            transport,
            responses: Mutex::new(Some(responses)),
            closed: AtomicBool::new(false),
        }
    }

    /// Transmit one chunk. Fails with [`UpstreamError::Closed`] once closed.
    pub async fn send(&self, chunk: &Chunk) -> Result<(), UpstreamError> {
        if self.is_closed() {
            return Err(UpstreamError::Closed);
        }
        self.transport.send(chunk).await
    }

    /// Hand out the response sequence. Only the first caller gets it.
    pub fn take_responses(&self) -> Option<ResponseStream> {
        match self.responses.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Close the connection. Closing an already closed handle is a no-op.
    pub async fn close(&self) -> Result<(), UpstreamError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Upstream handle already closed");
            return Ok(());
        }
        self.transport.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for UpstreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}
