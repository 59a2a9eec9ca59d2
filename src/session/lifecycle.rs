//! # Session Lifecycle Manager
//!
//! Creates sessions, wires their relays and owns the single teardown routine.
//!
//! ## Start:
//! 1. Register the session (`Created`)
//! 2. Open the upstream connection
//! 3. Activate (`Active`), tell the client `session_started`, spawn both relays
//!
//! ## Teardown (exactly once per session):
//! 1. Claim it with a compare-and-swap to `Closing`
//! 2. Cancel both relays and wait for them, aborting stragglers after the grace period
//! 3. Close the upstream handle and let the playback consumer drain
//! 4. Drop the registry entry, mark `Closed`, tell the client
//!
//! Explicit ends, disconnects, engine stream closure and relay failures all
//! converge on [`LifecycleManager::teardown`]. Relays never call it inline; a
//! relay that needs the session gone spawns a detached teardown request.

use super::registry::{Session, SessionRegistry};
use super::relay::{run_inbound, run_outbound, RelayContext, RelayExit};
use super::{ClientSink, Notification, SessionError, StartOptions, TeardownReason};
use crate::config::AppConfig;
use crate::media::playback::{playback_queue, spawn_consumer, WavRecorderSink};
use crate::media::wav::PcmFormat;
use crate::media::RawChunk;
use crate::upstream::{UpstreamConfig, UpstreamConnector, UpstreamError, UpstreamHandle};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Settings the lifecycle manager needs from the application config.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Defaults for every upstream connection; `start_session` may override
    /// the modality and the system instruction.
    pub upstream: UpstreamConfig,
    pub inbound_queue_capacity: usize,
    pub playback_queue_capacity: usize,
    pub teardown_grace: Duration,
    /// When set, engine audio is recorded here instead of sent to the client.
    pub audio_record_dir: Option<PathBuf>,
    pub output_format: PcmFormat,
}

impl LifecycleConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            upstream: UpstreamConfig {
                model: config.upstream.model.clone(),
                response_modality: config.upstream.response_modality,
                system_instruction: config.upstream.system_instruction.clone(),
            },
            inbound_queue_capacity: config.relay.inbound_queue_capacity,
            playback_queue_capacity: config.relay.playback_queue_capacity,
            teardown_grace: Duration::from_millis(config.relay.teardown_grace_ms),
            audio_record_dir: config.debug.audio_record_dir.as_ref().map(PathBuf::from),
            output_format: PcmFormat::mono_16bit(config.debug.output_sample_rate),
        }
    }
}

/// Counters across all sessions.
#[derive(Debug, Default)]
pub struct LifecycleStats {
    sessions_started: AtomicU64,
    sessions_ended: AtomicU64,
    start_failures: AtomicU64,
    fatal_teardowns: AtomicU64,
    chunks_forwarded: AtomicU64,
    chunk_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sessions_started: u64,
    pub sessions_ended: u64,
    pub start_failures: u64,
    pub fatal_teardowns: u64,
    pub chunks_forwarded: u64,
    pub chunk_errors: u64,
}

impl LifecycleStats {
    pub fn record_chunk_forwarded(&self) {
        self.chunks_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_error(&self) {
        self.chunk_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    fn record_start_failure(&self) {
        self.start_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_ended(&self, fatal: bool) {
        self.sessions_ended.fetch_add(1, Ordering::Relaxed);
        if fatal {
            self.fatal_teardowns.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_ended: self.sessions_ended.load(Ordering::Relaxed),
            start_failures: self.start_failures.load(Ordering::Relaxed),
            fatal_teardowns: self.fatal_teardowns.load(Ordering::Relaxed),
            chunks_forwarded: self.chunks_forwarded.load(Ordering::Relaxed),
            chunk_errors: self.chunk_errors.load(Ordering::Relaxed),
        }
    }
}

/// What the client transport keeps for a started session.
#[derive(Debug, Clone)]
pub struct SessionLink {
    pub session: Arc<Session>,
    chunks: mpsc::Sender<RawChunk>,
}

impl SessionLink {
    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    /// Sender feeding the inbound relay. Sending waits for queue room.
    pub fn chunk_sender(&self) -> mpsc::Sender<RawChunk> {
        self.chunks.clone()
    }

    /// Queue one chunk for the inbound relay. `false` once the relay is gone.
    pub async fn send(&self, chunk: RawChunk) -> bool {
        self.chunks.send(chunk).await.is_ok()
    }
}

/// Everything a live session owns besides its registry entry.
struct SessionResources {
    session: Arc<Session>,
    upstream: Arc<UpstreamHandle>,
    cancel: CancellationToken,
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
    playback: Option<JoinHandle<()>>,
    sink: Arc<dyn ClientSink>,
}

struct ManagerInner {
    registry: SessionRegistry,
    connector: Arc<dyn UpstreamConnector>,
    config: LifecycleConfig,
    resources: Mutex<HashMap<String, SessionResources>>,
    stats: Arc<LifecycleStats>,
}

/// Creates and tears down sessions. Cheap to clone.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<ManagerInner>,
}

impl LifecycleManager {
    pub fn new(
        registry: SessionRegistry,
        connector: Arc<dyn UpstreamConnector>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                connector,
                config,
                resources: Mutex::new(HashMap::new()),
                stats: Arc::new(LifecycleStats::default()),
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    fn upstream_config(&self, options: &StartOptions) -> UpstreamConfig {
        let defaults = &self.inner.config.upstream;
        UpstreamConfig {
            model: defaults.model.clone(),
            response_modality: options.response_modality.unwrap_or(defaults.response_modality),
            system_instruction: options
                .system_instruction
                .clone()
                .or_else(|| defaults.system_instruction.clone()),
        }
    }

    /// Start a session for `client_id`.
    ///
    /// The client receives `session_started` before anything either relay
    /// produces. On failure no registry entry and no open connection remain.
    pub async fn start(
        &self,
        client_id: &str,
        options: StartOptions,
        sink: Arc<dyn ClientSink>,
    ) -> Result<SessionLink, SessionError> {
        let session = match self.inner.registry.create(client_id).await {
            Ok(session) => session,
            Err(err) => {
                self.inner.stats.record_start_failure();
                return Err(err);
            }
        };

        let upstream_config = self.upstream_config(&options);
        let upstream = match self.inner.connector.open(&upstream_config).await {
            Ok(handle) => Arc::new(handle),
            Err(err) => {
                warn!(client_id, "Upstream connection failed: {}", err);
                self.abandon(&session).await;
                return Err(err.into());
            }
        };

        let Some(responses) = upstream.take_responses() else {
            if let Err(err) = upstream.close().await {
                warn!(client_id, "Failed to close upstream of failed start: {}", err);
            }
            self.abandon(&session).await;
            return Err(UpstreamError::Receive("response stream unavailable".to_string()).into());
        };

        // Holding the lock across activation means a teardown that wins the
        // state race after this point always finds the resources.
        let mut resources = self.inner.resources.lock().await;
        if !session.activate() {
            drop(resources);
            info!(client_id, session_id = %session.session_id, "Session ended while starting");
            if let Err(err) = upstream.close().await {
                warn!("Failed to close upstream of aborted session: {}", err);
            }
            self.inner.stats.record_start_failure();
            return Err(SessionError::Aborted);
        }

        sink.notify(Notification::SessionStarted {
            session_id: session.session_id.clone(),
        });

        let cancel = CancellationToken::new();
        let ctx = RelayContext {
            client_id: client_id.to_string(),
            session_id: session.session_id.clone(),
            sink: sink.clone(),
            stats: self.inner.stats.clone(),
            cancel: cancel.clone(),
        };

        let (playback, consumer) = match &self.inner.config.audio_record_dir {
            Some(dir) => {
                let (queue, receiver) = playback_queue(self.inner.config.playback_queue_capacity);
                let recorder = WavRecorderSink::for_session(
                    dir,
                    &session.session_id,
                    self.inner.config.output_format,
                );
                (Some(queue), Some(spawn_consumer(receiver, recorder)))
            }
            None => (None, None),
        };

        let (chunk_tx, chunk_rx) = mpsc::channel(self.inner.config.inbound_queue_capacity.max(1));

        let inbound = {
            let manager = self.clone();
            let session = session.clone();
            let upstream = upstream.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let exit = run_inbound(chunk_rx, upstream, ctx).await;
                manager.on_relay_exit(session, "inbound", exit);
            })
        };

        let outbound = {
            let manager = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                let exit = run_outbound(responses, playback, ctx).await;
                manager.on_relay_exit(session, "outbound", exit);
            })
        };

        resources.insert(
            client_id.to_string(),
            SessionResources {
                session: session.clone(),
                upstream,
                cancel,
                inbound,
                outbound,
                playback: consumer,
                sink,
            },
        );
        drop(resources);

        self.inner.stats.record_started();
        info!(
            client_id,
            session_id = %session.session_id,
            model = %upstream_config.model,
            modality = %upstream_config.response_modality,
            "Session started"
        );

        Ok(SessionLink {
            session,
            chunks: chunk_tx,
        })
    }

    /// Undo a start that never activated.
    async fn abandon(&self, session: &Arc<Session>) {
        self.inner.stats.record_start_failure();
        if session.begin_closing() {
            self.inner.registry.remove_session(session).await;
            session.mark_closed();
        }
    }

    fn on_relay_exit(&self, session: Arc<Session>, relay: &'static str, exit: RelayExit) {
        let reason = match exit {
            RelayExit::Cancelled | RelayExit::Drained => {
                debug!(session_id = %session.session_id, relay, ?exit, "Relay stopped");
                return;
            }
            RelayExit::StreamClosed => TeardownReason::StreamClosed,
            RelayExit::Failed(message) => {
                error!(session_id = %session.session_id, relay, "Relay failed: {}", message);
                TeardownReason::Fatal(message)
            }
        };

        let manager = self.clone();
        tokio::spawn(async move {
            manager.teardown(session, reason).await;
        });
    }

    /// End the live session of `client_id`, if any.
    ///
    /// Returns `true` when this call performed the teardown and notified the
    /// client; `false` when there was nothing (left) to end.
    pub async fn end(&self, client_id: &str, reason: TeardownReason) -> bool {
        match self.inner.registry.get(client_id).await {
            Some(session) => self.teardown(session, reason).await,
            None => {
                debug!(client_id, "No live session to end");
                false
            }
        }
    }

    /// The teardown routine. Only the caller that wins the transition to
    /// `Closing` does any work; everyone else returns `false` immediately.
    pub async fn teardown(&self, session: Arc<Session>, reason: TeardownReason) -> bool {
        if !session.begin_closing() {
            debug!(session_id = %session.session_id, "Teardown already in progress");
            return false;
        }

        info!(
            client_id = %session.client_id,
            session_id = %session.session_id,
            reason = %reason,
            "Tearing down session"
        );

        let resources = {
            let mut resources = self.inner.resources.lock().await;
            match resources.get(&session.client_id) {
                Some(owned) if owned.session.session_id == session.session_id => {
                    resources.remove(&session.client_id)
                }
                _ => None,
            }
        };

        let grace = self.inner.config.teardown_grace;
        let mut sink = None;
        // A session claimed before activation owns no resources; `start`
        // counts it as a start failure, not an ended session.
        if let Some(res) = resources {
            res.cancel.cancel();
            join_within(res.outbound, grace, "outbound", &session.session_id).await;
            join_within(res.inbound, grace, "inbound", &session.session_id).await;

            if let Err(err) = res.upstream.close().await {
                warn!(session_id = %session.session_id, "Failed to close upstream: {}", err);
            }

            if let Some(consumer) = res.playback {
                join_within(consumer, grace, "playback", &session.session_id).await;
            }
            sink = Some(res.sink);
            self.inner.stats.record_ended(reason.is_fatal());
        }

        self.inner.registry.remove_session(&session).await;
        session.mark_closed();

        let Some(sink) = sink else {
            return false;
        };

        if let TeardownReason::Fatal(message) = &reason {
            sink.notify(Notification::Error {
                message: message.clone(),
            });
        }
        sink.notify(Notification::SessionEnded {
            reason: reason.as_str().to_string(),
        });

        info!(session_id = %session.session_id, "Session closed");
        true
    }

    /// Tear down every live session.
    pub async fn shutdown(&self) {
        let sessions = self.inner.registry.list().await;
        if sessions.is_empty() {
            return;
        }

        info!(count = sessions.len(), "Shutting down live sessions");
        futures_util::future::join_all(
            sessions
                .into_iter()
                .map(|session| self.teardown(session, TeardownReason::Shutdown)),
        )
        .await;
    }
}

/// Wait for a task to finish, aborting it if it overstays the grace period.
async fn join_within(handle: JoinHandle<()>, grace: Duration, task: &str, session_id: &str) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.is_cancelled() => {}
        Ok(Err(err)) => error!(session_id, task, "Session task panicked: {}", err),
        Err(_) => {
            warn!(session_id, task, ?grace, "Session task did not stop in time, aborting");
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::codec::encode_payload;
    use crate::session::registry::SessionState;
    use crate::upstream::mock::MockConnector;
    use crate::upstream::{ResponseEvent, ResponseModality};

    fn config() -> LifecycleConfig {
        LifecycleConfig {
            upstream: UpstreamConfig {
                model: "test-model".to_string(),
                response_modality: ResponseModality::Text,
                system_instruction: Some("be brief".to_string()),
            },
            inbound_queue_capacity: 16,
            playback_queue_capacity: 4,
            teardown_grace: Duration::from_millis(500),
            audio_record_dir: None,
            output_format: PcmFormat::default(),
        }
    }

    fn manager_with(connector: &MockConnector, config: LifecycleConfig) -> LifecycleManager {
        LifecycleManager::new(SessionRegistry::new(0), Arc::new(connector.clone()), config)
    }

    fn client() -> (Arc<dyn ClientSink>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(tx), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("notification channel closed")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn audio(bytes: &[u8]) -> RawChunk {
        RawChunk::new("audio/pcm", encode_payload(bytes))
    }

    #[tokio::test]
    async fn test_start_chunk_text_end() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector, config());
        let (sink, mut rx) = client();

        let link = manager.start("c1", StartOptions::default(), sink).await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            Notification::SessionStarted {
                session_id: link.session_id().to_string()
            }
        );
        assert_eq!(link.session.state(), SessionState::Active);

        let remote = connector.remote(0);
        assert_eq!(remote.config.system_instruction.as_deref(), Some("be brief"));

        assert!(link.send(audio(&[1, 2])).await);
        wait_until(|| remote.sent().len() == 1).await;
        assert_eq!(remote.sent()[0].payload(), &[1, 2]);

        remote.emit(ResponseEvent::TextDelta("hi".to_string()));
        remote.emit(ResponseEvent::TurnComplete);
        assert_eq!(next(&mut rx).await, Notification::Text("hi".to_string()));
        assert_eq!(next(&mut rx).await, Notification::TurnComplete);

        assert!(manager.end("c1", TeardownReason::ClientRequest).await);
        assert_eq!(
            next(&mut rx).await,
            Notification::SessionEnded {
                reason: "client_request".to_string()
            }
        );

        assert_eq!(link.session.state(), SessionState::Closed);
        assert!(manager.registry().is_empty().await);
        assert_eq!(remote.close_count(), 1);
        assert!(!link.send(audio(&[3])).await);

        let stats = manager.stats();
        assert_eq!(stats.sessions_started, 1);
        assert_eq!(stats.sessions_ended, 1);
        assert_eq!(stats.chunks_forwarded, 1);
    }

    #[tokio::test]
    async fn test_chunks_reach_upstream_in_order() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector, config());
        let (sink, _rx) = client();

        let link = manager.start("c1", StartOptions::default(), sink).await.unwrap();
        for i in 0..50u8 {
            assert!(link.send(audio(&[i, i])).await);
        }

        let remote = connector.remote(0);
        wait_until(|| remote.sent().len() == 50).await;
        let payloads: Vec<u8> = remote.sent().iter().map(|c| c.payload()[0]).collect();
        assert_eq!(payloads, (0..50u8).collect::<Vec<_>>());

        manager.end("c1", TeardownReason::ClientRequest).await;
    }

    #[tokio::test]
    async fn test_end_and_disconnect_tear_down_once() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector, config());
        let (sink, mut rx) = client();
        manager.start("c1", StartOptions::default(), sink).await.unwrap();
        next(&mut rx).await;

        let (by_end, by_disconnect) = tokio::join!(
            manager.end("c1", TeardownReason::ClientRequest),
            manager.end("c1", TeardownReason::Disconnect),
        );

        assert!(by_end ^ by_disconnect);
        assert_eq!(connector.remote(0).close_count(), 1);
        assert!(matches!(next(&mut rx).await, Notification::SessionEnded { .. }));
        assert_eq!(manager.stats().sessions_ended, 1);

        // A late end is a no-op
        assert!(!manager.end("c1", TeardownReason::ClientRequest).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector, config());
        let (sink, _rx) = client();

        let first = manager.start("c1", StartOptions::default(), sink.clone()).await.unwrap();
        let second = manager.start("c1", StartOptions::default(), sink).await;

        assert!(matches!(second, Err(SessionError::Duplicate(_))));
        assert_eq!(connector.opened(), 1);
        assert_eq!(first.session.state(), SessionState::Active);
        assert_eq!(manager.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_no_session() {
        let connector = MockConnector::failing();
        let manager = manager_with(&connector, config());
        let (sink, mut rx) = client();

        let result = manager.start("c1", StartOptions::default(), sink).await;

        assert!(matches!(result, Err(SessionError::Upstream(UpstreamError::Connect(_)))));
        assert!(manager.registry().is_empty().await);
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.stats().start_failures, 1);

        // The client can try again once the engine is reachable
        assert!(manager.registry().create("c1").await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_chunk_keeps_session_active() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector, config());
        let (sink, mut rx) = client();
        let link = manager.start("c1", StartOptions::default(), sink).await.unwrap();
        next(&mut rx).await;

        link.send(RawChunk::new("audio/pcm", "%%%")).await;
        link.send(audio(&[9])).await;

        assert!(matches!(next(&mut rx).await, Notification::Error { .. }));
        let remote = connector.remote(0);
        wait_until(|| remote.sent().len() == 1).await;
        assert_eq!(link.session.state(), SessionState::Active);
        assert_eq!(manager.stats().chunk_errors, 1);
    }

    #[tokio::test]
    async fn test_disconnect_while_outbound_waits() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector, config());
        let (sink, _rx) = client();
        let link = manager.start("c1", StartOptions::default(), sink).await.unwrap();

        // The engine never answers; the outbound relay is parked on receive
        let ended = tokio::time::timeout(
            Duration::from_millis(200),
            manager.end("c1", TeardownReason::Disconnect),
        )
        .await
        .unwrap();

        assert!(ended);
        assert_eq!(link.session.state(), SessionState::Closed);
        assert_eq!(connector.remote(0).close_count(), 1);
        assert!(manager.registry().get("c1").await.is_none());
    }

    #[tokio::test]
    async fn test_send_failure_escalates() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector, config());
        let (sink, mut rx) = client();
        let link = manager.start("c1", StartOptions::default(), sink).await.unwrap();
        next(&mut rx).await;

        connector.remote(0).fail_sends();
        link.send(audio(&[1])).await;

        assert!(matches!(next(&mut rx).await, Notification::Error { .. }));
        assert_eq!(
            next(&mut rx).await,
            Notification::SessionEnded {
                reason: "error".to_string()
            }
        );
        assert!(manager.registry().is_empty().await);
        assert_eq!(connector.remote(0).close_count(), 1);
        assert_eq!(manager.stats().fatal_teardowns, 1);
    }

    #[tokio::test]
    async fn test_receive_failure_escalates() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector, config());
        let (sink, mut rx) = client();
        manager.start("c1", StartOptions::default(), sink).await.unwrap();
        next(&mut rx).await;

        connector.remote(0).fail("engine crashed");

        match next(&mut rx).await {
            Notification::Error { message } => assert!(message.contains("engine crashed")),
            other => panic!("unexpected notification: {:?}", other),
        }
        assert!(matches!(next(&mut rx).await, Notification::SessionEnded { .. }));
    }

    #[tokio::test]
    async fn test_stream_closed_ends_session_quietly() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector, config());
        let (sink, mut rx) = client();
        let link = manager.start("c1", StartOptions::default(), sink).await.unwrap();
        next(&mut rx).await;

        let remote = connector.remote(0);
        remote.emit(ResponseEvent::TextDelta("bye".to_string()));
        remote.emit(ResponseEvent::StreamClosed);
        remote.emit(ResponseEvent::TextDelta("ghost".to_string()));

        assert_eq!(next(&mut rx).await, Notification::Text("bye".to_string()));
        assert_eq!(
            next(&mut rx).await,
            Notification::SessionEnded {
                reason: "stream_closed".to_string()
            }
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(link.session.state(), SessionState::Closed);
        assert_eq!(manager.stats().fatal_teardowns, 0);
    }

    #[tokio::test]
    async fn test_stale_teardown_spares_new_session() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector, config());
        let (sink, _rx) = client();

        let old = manager.start("c1", StartOptions::default(), sink.clone()).await.unwrap();
        manager.end("c1", TeardownReason::ClientRequest).await;
        let newer = manager.start("c1", StartOptions::default(), sink).await.unwrap();

        assert!(!manager.teardown(old.session.clone(), TeardownReason::Disconnect).await);
        assert_eq!(newer.session.state(), SessionState::Active);
        assert_eq!(connector.remote(1).close_count(), 0);
    }

    #[tokio::test]
    async fn test_start_options_override_defaults() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector, config());
        let (sink, _rx) = client();

        let options = StartOptions {
            response_modality: Some(ResponseModality::Audio),
            system_instruction: None,
        };
        manager.start("c1", options, sink).await.unwrap();

        let remote = connector.remote(0);
        assert_eq!(remote.config.response_modality, ResponseModality::Audio);
        assert_eq!(remote.config.system_instruction.as_deref(), Some("be brief"));
    }

    #[tokio::test]
    async fn test_shutdown_ends_everything() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector, config());

        let mut receivers = Vec::new();
        for id in ["a", "b", "c"] {
            let (sink, rx) = client();
            manager.start(id, StartOptions::default(), sink).await.unwrap();
            receivers.push(rx);
        }

        manager.shutdown().await;

        assert!(manager.registry().is_empty().await);
        for i in 0..3 {
            assert_eq!(connector.remote(i).close_count(), 1);
        }
        for rx in receivers.iter_mut() {
            next(rx).await;
            assert_eq!(
                next(rx).await,
                Notification::SessionEnded {
                    reason: "shutdown".to_string()
                }
            );
        }
    }

    #[tokio::test]
    async fn test_recorded_audio_bypasses_client() {
        let dir = std::env::temp_dir().join(format!("live-relay-rec-{}", uuid::Uuid::new_v4()));
        let connector = MockConnector::new();
        let manager = manager_with(
            &connector,
            LifecycleConfig {
                audio_record_dir: Some(dir.clone()),
                ..config()
            },
        );
        let (sink, mut rx) = client();
        let link = manager.start("c1", StartOptions::default(), sink).await.unwrap();
        next(&mut rx).await;

        let remote = connector.remote(0);
        remote.emit(ResponseEvent::AudioDelta(vec![0x10, 0x00, 0x20, 0x00]));
        remote.emit(ResponseEvent::TurnComplete);
        assert_eq!(next(&mut rx).await, Notification::TurnComplete);

        manager.end("c1", TeardownReason::ClientRequest).await;
        assert!(matches!(next(&mut rx).await, Notification::SessionEnded { .. }));

        let wav = tokio::fs::read(dir.join(format!("{}.wav", link.session_id())))
            .await
            .unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_end_during_start_aborts_start() {
        let connector = MockConnector::slow(Duration::from_millis(100));
        let manager = manager_with(&connector, config());
        let (sink, mut rx) = client();

        let starting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start("c1", StartOptions::default(), sink).await })
        };

        let registry = manager.registry().clone();
        for _ in 0..100 {
            if registry.get("c1").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let session = registry.get("c1").await.expect("session registered while opening");
        assert_eq!(session.state(), SessionState::Created);

        // Nothing to notify yet; the pending start reports the outcome
        assert!(!manager.end("c1", TeardownReason::Disconnect).await);

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(SessionError::Aborted)));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(connector.remote(0).close_count(), 1);
        assert!(manager.registry().is_empty().await);
        assert!(rx.try_recv().is_err());

        let stats = manager.stats();
        assert_eq!(stats.sessions_started, 0);
        assert_eq!(stats.sessions_ended, 0);
        assert_eq!(stats.start_failures, 1);
    }

    #[tokio::test]
    async fn test_task_ignoring_cancel_is_aborted_after_grace() {
        struct DropFlag(Arc<std::sync::atomic::AtomicBool>);

        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let stuck = {
            let flag = DropFlag(dropped.clone());
            let token = cancel.clone();
            tokio::spawn(async move {
                let _flag = flag;
                // Holds the token but never checks it
                let _token = token;
                loop {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            })
        };

        cancel.cancel();
        let started = std::time::Instant::now();
        join_within(stuck, Duration::from_millis(50), "inbound", "s1").await;

        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_millis(500));
        wait_until(|| dropped.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_finished_task_joins_without_waiting() {
        let done = tokio::spawn(async {});
        let started = std::time::Instant::now();
        join_within(done, Duration::from_secs(5), "outbound", "s1").await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
