//! In-process upstream engine for tests.
//!
//! Every `open` creates a [`MockRemote`] that records sent chunks, counts
//! closes and lets the test push response events at will.

use super::{
    ResponseEvent, UpstreamConfig, UpstreamConnector, UpstreamError, UpstreamHandle,
    UpstreamTransport,
};
use crate::media::Chunk;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Default)]
struct RemoteState {
    sent: Mutex<Vec<Chunk>>,
    close_count: AtomicUsize,
    fail_send: AtomicBool,
}

/// Test-side view of one opened connection.
#[derive(Clone)]
pub struct MockRemote {
    state: Arc<RemoteState>,
    events: mpsc::UnboundedSender<Result<ResponseEvent, UpstreamError>>,
    pub config: UpstreamConfig,
}

impl MockRemote {
    pub fn sent(&self) -> Vec<Chunk> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.close_count.load(Ordering::SeqCst)
    }

    pub fn fail_sends(&self) {
        self.state.fail_send.store(true, Ordering::SeqCst);
    }

    pub fn emit(&self, event: ResponseEvent) {
        let _ = self.events.send(Ok(event));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.events.send(Err(UpstreamError::Receive(message.to_string())));
    }
}

struct MockTransport {
    state: Arc<RemoteState>,
}

#[async_trait]
impl UpstreamTransport for MockTransport {
    async fn send(&self, chunk: &Chunk) -> Result<(), UpstreamError> {
        if self.state.fail_send.load(Ordering::SeqCst) {
            return Err(UpstreamError::Send("mock transport rejected chunk".to_string()));
        }
        self.state.sent.lock().unwrap().push(chunk.clone());
        // Yield so concurrent sends interleave the way a real socket would
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        self.state.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out [`MockRemote`]s.
#[derive(Clone, Default)]
pub struct MockConnector {
    remotes: Arc<Mutex<Vec<MockRemote>>>,
    fail_connect: Arc<AtomicBool>,
    open_delay: Duration,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let connector = Self::default();
        connector.fail_connect.store(true, Ordering::SeqCst);
        connector
    }

    /// Connector whose `open` takes `delay` before it succeeds.
    pub fn slow(delay: Duration) -> Self {
        Self {
            open_delay: delay,
            ..Self::default()
        }
    }

    /// The `index`-th connection opened so far.
    pub fn remote(&self, index: usize) -> MockRemote {
        self.remotes.lock().unwrap()[index].clone()
    }

    pub fn opened(&self) -> usize {
        self.remotes.lock().unwrap().len()
    }
}

#[async_trait]
impl UpstreamConnector for MockConnector {
    async fn open(&self, config: &UpstreamConfig) -> Result<UpstreamHandle, UpstreamError> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(UpstreamError::Connect("mock engine unreachable".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(RemoteState::default());
        self.remotes.lock().unwrap().push(MockRemote {
            state: state.clone(),
            events: tx,
            config: config.clone(),
        });

        let transport = Arc::new(MockTransport { state });
        Ok(UpstreamHandle::new(
            transport,
            UnboundedReceiverStream::new(rx).boxed(),
        ))
    }
}
