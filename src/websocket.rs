//! # WebSocket Relay Endpoint
//!
//! Clients connect to `/ws`; each connection is one actor and gets its own
//! client id. A connection holds at most one live session at a time.
//!
//! ## WebSocket Protocol:
//! 1. **Start**: `{"type":"start_session","config":{...}}` → `session_started`
//! 2. **Stream**: `{"type":"send_chunk","mime_type":"audio/pcm","data":"<base64>"}`
//!    (`send_audio_chunk` and `send_image_frame` are accepted as aliases), or a
//!    batch `{"realtime_input":{"media_chunks":[{"mime_type":..,"data":..}]}}`
//! 3. **Responses**: `gemini_text`, `response` (base64 audio), `turn_complete`
//! 4. **End**: `{"type":"end_session"}` → `session_ended`
//!
//! A start that fails after claiming the session (engine unreachable, or
//! ended while connecting) answers `error` followed by `session_ended`.
//!
//! Closing the socket, or staying silent past the client timeout, ends the
//! session as a disconnect.

use crate::media::codec::encode_payload;
use crate::media::{MimeKind, RawChunk};
use crate::session::{
    ClientSink, Notification, SessionError, SessionLink, StartOptions, TeardownReason,
};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Messages a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartSession {
        #[serde(default)]
        config: Option<StartOptions>,
    },

    #[serde(alias = "send_audio_chunk", alias = "send_image_frame")]
    SendChunk { mime_type: String, data: String },

    EndSession,

    /// Untagged batch form, see [`ClientMessage::parse`].
    #[serde(skip)]
    RealtimeInput(RealtimeInput),
}

/// Several chunks in one frame, forwarded in array order.
#[derive(Debug, Default, Deserialize)]
pub struct RealtimeInput {
    #[serde(default)]
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Deserialize)]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

#[derive(Deserialize)]
struct BatchFrame {
    realtime_input: RealtimeInput,
}

impl ClientMessage {
    /// Parse a text frame: either a `type`-tagged message or a
    /// `realtime_input` batch without a tag.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("type").is_none() && value.get("realtime_input").is_some() {
            let batch: BatchFrame = serde_json::from_value(value)?;
            return Ok(ClientMessage::RealtimeInput(batch.realtime_input));
        }
        serde_json::from_value(value)
    }
}

/// Messages the server sends.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionStarted { session_id: String },

    GeminiText { text: String },

    /// Engine audio, base64 encoded PCM.
    Response { mime_type: &'static str, data: String },

    TurnComplete,

    Error { message: String },

    SessionEnded { reason: String },
}

impl From<Notification> for ServerMessage {
    fn from(notification: Notification) -> Self {
        match notification {
            Notification::SessionStarted { session_id } => ServerMessage::SessionStarted { session_id },
            Notification::Text(text) => ServerMessage::GeminiText { text },
            Notification::Audio(audio) => ServerMessage::Response {
                mime_type: MimeKind::AudioPcm.as_mime(),
                data: encode_payload(&audio),
            },
            Notification::TurnComplete => ServerMessage::TurnComplete,
            Notification::Error { message } => ServerMessage::Error { message },
            Notification::SessionEnded { reason } => ServerMessage::SessionEnded { reason },
        }
    }
}

/// A notification on its way into the actor's mailbox.
#[derive(Message)]
#[rtype(result = "()")]
struct Deliver(Notification);

/// Delivers session notifications through the actor mailbox, so they reach
/// the socket in the order the session produced them.
struct ActorSink(Addr<RelaySocket>);

impl ClientSink for ActorSink {
    fn notify(&self, notification: Notification) -> bool {
        if !self.0.connected() {
            return false;
        }
        self.0.do_send(Deliver(notification));
        true
    }
}

/// WebSocket actor for one client connection.
pub struct RelaySocket {
    client_id: String,
    state: AppState,
    /// Present while this connection has a session it can feed.
    link: Option<SessionLink>,
    last_heartbeat: Instant,
}

impl RelaySocket {
    pub fn new(state: AppState) -> Self {
        Self {
            client_id: Uuid::new_v4().to_string(),
            state,
            link: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: ServerMessage) {
        match serde_json::to_string(&message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(client_id = %self.client_id, "Failed to encode message: {}", err),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, message: impl Into<String>) {
        self.send(ctx, ServerMessage::Error { message: message.into() });
    }

    /// The current link, dropping it first if its session has ended.
    fn live_link(&mut self) -> Option<&SessionLink> {
        if self.link.as_ref().is_some_and(|link| !link.session.is_live()) {
            self.link = None;
        }
        self.link.as_ref()
    }

    fn handle_start(&mut self, options: StartOptions, ctx: &mut ws::WebsocketContext<Self>) {
        let manager = self.state.manager.clone();
        let client_id = self.client_id.clone();
        let sink: Arc<dyn ClientSink> = Arc::new(ActorSink(ctx.address()));

        // Nothing else from this client is processed until the start resolves
        ctx.wait(
            async move { manager.start(&client_id, options, sink).await }
                .into_actor(self)
                .map(|result, act, ctx| match result {
                    Ok(link) => {
                        debug!(client_id = %act.client_id, session_id = link.session_id(), "Session linked");
                        act.link = Some(link);
                    }
                    Err(err) => act.start_failed(err, ctx),
                }),
        );
    }

    fn start_failed(&mut self, err: SessionError, ctx: &mut ws::WebsocketContext<Self>) {
        warn!(client_id = %self.client_id, "Failed to start session: {}", err);
        let ends_attempt = err.ends_attempt();
        let reason = TeardownReason::Fatal(err.to_string());

        self.send_error(ctx, err.to_string());
        if ends_attempt {
            self.send(
                ctx,
                ServerMessage::SessionEnded {
                    reason: reason.as_str().to_string(),
                },
            );
        }
    }

    /// Queue chunks for the inbound relay in order. When the queue is full the
    /// remaining chunks are sent from a `ctx.wait` future, which pauses reading
    /// this client until they are all queued.
    fn handle_chunks(&mut self, chunks: Vec<RawChunk>, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(link) = self.live_link().cloned() else {
            self.send_error(ctx, "No live session");
            return;
        };

        let sender = link.chunk_sender();
        let mut pending = chunks.into_iter();
        while let Some(chunk) = pending.next() {
            match sender.try_send(chunk) {
                Ok(()) => {}
                Err(TrySendError::Full(chunk)) => {
                    debug!(client_id = %self.client_id, "Inbound queue full, pausing client");
                    let rest: Vec<RawChunk> = std::iter::once(chunk).chain(pending).collect();
                    ctx.wait(
                        async move {
                            for chunk in rest {
                                if !link.send(chunk).await {
                                    return false;
                                }
                            }
                            true
                        }
                        .into_actor(self)
                        .map(|queued, act, ctx| {
                            if !queued {
                                act.link = None;
                                act.send_error(ctx, "No live session");
                            }
                        }),
                    );
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    self.link = None;
                    self.send_error(ctx, "No live session");
                    return;
                }
            }
        }
    }

    fn handle_end(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        self.link = None;
        let manager = self.state.manager.clone();
        let client_id = self.client_id.clone();

        ctx.wait(
            async move { manager.end(&client_id, TeardownReason::ClientRequest).await }
                .into_actor(self)
                .map(|ended, act, ctx| {
                    // Teardown notifies the client itself; answer here only
                    // when there was nothing to end
                    if !ended {
                        act.send(
                            ctx,
                            ServerMessage::SessionEnded {
                                reason: TeardownReason::ClientRequest.as_str().to_string(),
                            },
                        );
                    }
                }),
        );
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, "WebSocket connection started");
        self.state.connection_opened();

        let interval = Duration::from_secs(self.state.config.relay.heartbeat_interval_secs);
        let timeout = Duration::from_secs(self.state.config.relay.client_timeout_secs);

        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(client_id = %act.client_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, "WebSocket connection stopped");
        self.state.connection_closed();
        self.link = None;

        let manager = self.state.manager.clone();
        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            manager.end(&client_id, TeardownReason::Disconnect).await;
        });
    }
}

impl Handler<Deliver> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) {
        self.send(ctx, ServerMessage::from(msg.0));
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match ClientMessage::parse(&text) {
                    Ok(ClientMessage::StartSession { config }) => {
                        self.handle_start(config.unwrap_or_default(), ctx)
                    }
                    Ok(ClientMessage::SendChunk { mime_type, data }) => {
                        self.handle_chunks(vec![RawChunk::new(mime_type, data)], ctx)
                    }
                    Ok(ClientMessage::RealtimeInput(input)) => {
                        let chunks = input
                            .media_chunks
                            .into_iter()
                            .map(|chunk| RawChunk::new(chunk.mime_type, chunk.data))
                            .collect();
                        self.handle_chunks(chunks, ctx)
                    }
                    Ok(ClientMessage::EndSession) => self.handle_end(ctx),
                    Err(err) => self.send_error(ctx, format!("Invalid message: {}", err)),
                }
            }
            Ok(ws::Message::Binary(_)) => {
                self.send_error(ctx, "Binary frames are not supported, send JSON text frames");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(client_id = %self.client_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(client_id = %self.client_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(client_id = %self.client_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// `GET /ws`: upgrade to a relay connection.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let socket = RelaySocket::new(state.get_ref().clone());
    debug!(
        client_id = %socket.client_id,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );
    ws::start(socket, &req, stream)
}
