//! # Session Relays
//!
//! Two pumps per active session:
//!
//! - [`run_inbound`]: client chunks → decode → upstream, in arrival order
//! - [`run_outbound`]: upstream responses → client (or local playback)
//!
//! Both observe the session's cancellation token at every suspension point
//! and report how they ended through [`RelayExit`]. Neither one tears the
//! session down itself; the lifecycle manager decides what an exit means.

use super::lifecycle::LifecycleStats;
use super::{ClientSink, Notification};
use crate::media::codec::decode_chunk;
use crate::media::playback::PlaybackQueue;
use crate::media::RawChunk;
use crate::upstream::{ResponseEvent, ResponseStream, UpstreamHandle};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a relay loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayExit {
    /// The session's cancellation token fired.
    Cancelled,
    /// The client side of the chunk channel went away.
    Drained,
    /// The engine closed its stream normally.
    StreamClosed,
    /// Unrecoverable upstream failure.
    Failed(String),
}

/// What both relays of one session share.
#[derive(Clone)]
pub struct RelayContext {
    pub client_id: String,
    pub session_id: String,
    pub sink: Arc<dyn ClientSink>,
    pub stats: Arc<LifecycleStats>,
    pub cancel: CancellationToken,
}

impl RelayContext {
    fn notify(&self, notification: Notification) {
        if !self.sink.notify(notification) {
            debug!(client_id = %self.client_id, "Client no longer listening, notification dropped");
        }
    }
}

/// Forward client chunks upstream until cancelled, drained or failed.
///
/// A chunk that fails to decode is reported to the client and skipped; the
/// session stays active. A failed upstream send ends the relay.
pub async fn run_inbound(
    mut chunks: mpsc::Receiver<RawChunk>,
    upstream: Arc<UpstreamHandle>,
    ctx: RelayContext,
) -> RelayExit {
    loop {
        let raw = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return RelayExit::Cancelled,
            next = chunks.recv() => match next {
                Some(raw) => raw,
                None => return RelayExit::Drained,
            },
        };

        let chunk = match decode_chunk(&raw) {
            Ok(chunk) => chunk,
            Err(err) => {
                ctx.stats.record_chunk_error();
                warn!(
                    client_id = %ctx.client_id,
                    mime_type = %raw.mime_type,
                    "Dropping malformed chunk: {}", err
                );
                ctx.notify(Notification::Error {
                    message: format!("Invalid chunk: {}", err),
                });
                continue;
            }
        };

        let sent = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return RelayExit::Cancelled,
            result = upstream.send(&chunk) => result,
        };

        match sent {
            Ok(()) => {
                ctx.stats.record_chunk_forwarded();
                debug!(
                    session_id = %ctx.session_id,
                    kind = %chunk.mime_kind(),
                    bytes = chunk.payload().len(),
                    "Chunk forwarded upstream"
                );
            }
            Err(err) => {
                warn!(session_id = %ctx.session_id, "Upstream send failed: {}", err);
                return RelayExit::Failed(err.to_string());
            }
        }
    }
}

/// Deliver engine responses until the stream ends, fails or is cancelled.
///
/// Nothing is delivered after `StreamClosed`. With a playback queue, engine
/// audio goes to the queue (waiting for room) instead of the client.
pub async fn run_outbound(
    mut responses: ResponseStream,
    playback: Option<PlaybackQueue>,
    ctx: RelayContext,
) -> RelayExit {
    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return RelayExit::Cancelled,
            next = responses.next() => next,
        };

        match next {
            Some(Ok(ResponseEvent::TextDelta(text))) => ctx.notify(Notification::Text(text)),
            Some(Ok(ResponseEvent::AudioDelta(audio))) => match &playback {
                Some(queue) => {
                    let queued = tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => return RelayExit::Cancelled,
                        result = queue.enqueue(audio) => result,
                    };
                    if let Err(err) = queued {
                        warn!(session_id = %ctx.session_id, "Local playback unavailable: {}", err);
                    }
                }
                None => ctx.notify(Notification::Audio(audio)),
            },
            Some(Ok(ResponseEvent::TurnComplete)) => {
                debug!(session_id = %ctx.session_id, "Turn complete");
                ctx.notify(Notification::TurnComplete);
            }
            Some(Ok(ResponseEvent::StreamClosed)) | None => {
                debug!(session_id = %ctx.session_id, "Upstream stream closed");
                return RelayExit::StreamClosed;
            }
            Some(Err(err)) => {
                warn!(session_id = %ctx.session_id, "Upstream receive failed: {}", err);
                return RelayExit::Failed(err.to_string());
            }
        }
    }
}
