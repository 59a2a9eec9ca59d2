//! # Gemini Live Connector
//!
//! Speaks the `BidiGenerateContent` websocket protocol of the Gemini Live API.
//!
//! ## Connection Protocol:
//! 1. **Connect**: `wss://…/BidiGenerateContent?key=<API_KEY>`
//! 2. **Setup**: first frame selects the model, response modality and system instruction
//! 3. **Handshake**: the engine answers with `setupComplete`
//! 4. **Streaming**: media goes up as `realtimeInput`, text as `clientContent`
//! 5. **Responses**: `serverContent` frames carry text parts, inline audio and `turnComplete`
//!
//! Engine frames arrive as text or binary websocket messages; both carry JSON.

use super::{
    ResponseEvent, ResponseStream, UpstreamConfig, UpstreamConnector, UpstreamError,
    UpstreamHandle, UpstreamTransport,
};
use crate::config::UpstreamSettings;
use crate::media::codec::{decode_payload, encode_payload};
use crate::media::{Chunk, MimeKind};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector for the Gemini Live API.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    endpoint: String,
    api_key: String,
    connect_timeout: Duration,
}

impl GeminiConnector {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            connect_timeout,
        }
    }

    pub fn from_settings(settings: &UpstreamSettings) -> Self {
        Self::new(
            settings.endpoint.clone(),
            settings.api_key.clone(),
            Duration::from_secs(settings.connect_timeout_secs),
        )
    }

    /// Endpoint URL with the API key attached as the `key` query parameter.
    fn request_url(&self) -> Result<Url, UpstreamError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| UpstreamError::Connect(format!("invalid endpoint '{}': {}", self.endpoint, e)))?;
        if !self.api_key.is_empty() {
            url.query_pairs_mut().append_pair("key", &self.api_key);
        }
        Ok(url)
    }
}

#[async_trait]
impl UpstreamConnector for GeminiConnector {
    async fn open(&self, config: &UpstreamConfig) -> Result<UpstreamHandle, UpstreamError> {
        let url = self.request_url()?;

        let (socket, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| UpstreamError::Connect("connection timed out".to_string()))?
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        let (mut sink, mut stream) = socket.split();

        sink.send(Message::Text(setup_message(config).to_string()))
            .await
            .map_err(|e| UpstreamError::Connect(format!("setup failed: {}", e)))?;

        tokio::time::timeout(self.connect_timeout, wait_for_setup(&mut stream))
            .await
            .map_err(|_| UpstreamError::Connect("setup handshake timed out".to_string()))??;

        info!(
            model = %config.model,
            modality = %config.response_modality,
            "Connected to Gemini Live API"
        );

        let transport = Arc::new(GeminiTransport {
            sink: Mutex::new(sink),
        });
        Ok(UpstreamHandle::new(transport, response_stream(stream)))
    }
}

/// First frame of every connection.
pub fn setup_message(config: &UpstreamConfig) -> serde_json::Value {
    let model = if config.model.starts_with("models/") {
        config.model.clone()
    } else {
        format!("models/{}", config.model)
    };

    let mut setup = json!({
        "model": model,
        "generationConfig": {
            "responseModalities": [config.response_modality.wire_name()]
        }
    });

    if let Some(instruction) = &config.system_instruction {
        setup["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
    }

    json!({ "setup": setup })
}

/// Frame carrying one client chunk.
///
/// Media rides in `realtimeInput`; text becomes a complete user turn.
pub fn client_frame(chunk: &Chunk) -> serde_json::Value {
    match chunk.mime_kind() {
        MimeKind::Text => json!({
            "clientContent": {
                "turns": [{
                    "role": "user",
                    "parts": [{ "text": chunk.as_text().unwrap_or_default() }]
                }],
                "turnComplete": true
            }
        }),
        kind => json!({
            "realtimeInput": {
                "mediaChunks": [{
                    "mimeType": kind.as_mime(),
                    "data": encode_payload(chunk.payload())
                }]
            }
        }),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: Option<String>,
    data: String,
}

fn parse_frame(payload: &[u8]) -> Result<ServerMessage, UpstreamError> {
    serde_json::from_slice(payload)
        .map_err(|e| UpstreamError::Receive(format!("undecodable engine frame: {}", e)))
}

/// Translate one engine frame into response events, in part order.
fn translate(message: ServerMessage) -> Result<Vec<ResponseEvent>, UpstreamError> {
    let mut events = Vec::new();

    if message.go_away.is_some() {
        warn!("Gemini announced the connection will close soon");
    }

    let Some(content) = message.server_content else {
        if message.setup_complete.is_none() && message.go_away.is_none() {
            debug!("Skipping engine frame without server content");
        }
        return Ok(events);
    };

    if content.interrupted {
        debug!("Engine generation interrupted");
    }

    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(text) = part.text {
                events.push(ResponseEvent::TextDelta(text));
            } else if let Some(inline) = part.inline_data {
                let audio = decode_payload(&inline.data)
                    .map_err(|e| UpstreamError::Receive(format!("bad inline data: {}", e)))?;
                debug!(
                    mime_type = inline.mime_type.as_deref().unwrap_or("unknown"),
                    bytes = audio.len(),
                    "Engine audio received"
                );
                events.push(ResponseEvent::AudioDelta(audio));
            }
        }
    }

    if content.turn_complete {
        events.push(ResponseEvent::TurnComplete);
    }

    Ok(events)
}

async fn wait_for_setup(stream: &mut SplitStream<WsStream>) -> Result<(), UpstreamError> {
    while let Some(frame) = stream.next().await {
        let payload = match frame.map_err(|e| UpstreamError::Connect(e.to_string()))? {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(reason) => {
                return Err(UpstreamError::Connect(format!(
                    "engine closed during setup: {:?}",
                    reason
                )))
            }
            _ => continue,
        };

        let message = parse_frame(&payload).map_err(|e| UpstreamError::Connect(e.to_string()))?;
        if message.setup_complete.is_some() {
            return Ok(());
        }
    }

    Err(UpstreamError::Connect("engine closed during setup".to_string()))
}

struct ReceiveState<S> {
    stream: S,
    pending: VecDeque<ResponseEvent>,
    finished: bool,
}

/// Lazily read engine frames, yielding events until the stream ends.
///
/// A normal close (or clean EOF) yields a final `StreamClosed`; anything else
/// yields one error. Nothing is produced after either.
fn response_stream<S>(stream: S) -> ResponseStream
where
    S: Stream<Item = Result<Message, WsError>> + Send + Unpin + 'static,
{
    let state = ReceiveState {
        stream,
        pending: VecDeque::new(),
        finished: false,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if st.finished {
                return None;
            }

            let payload = match st.stream.next().await {
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(bytes))) => bytes,
                Some(Ok(Message::Close(frame))) => {
                    st.finished = true;
                    match frame {
                        Some(frame) if !matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
                            let err = UpstreamError::Receive(format!(
                                "engine closed the stream with code {}: {}",
                                frame.code, frame.reason
                            ));
                            return Some((Err(err), st));
                        }
                        _ => {
                            st.pending.push_back(ResponseEvent::StreamClosed);
                            continue;
                        }
                    }
                }
                Some(Ok(_)) => continue,
                None | Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    st.finished = true;
                    st.pending.push_back(ResponseEvent::StreamClosed);
                    continue;
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(UpstreamError::Receive(e.to_string())), st));
                }
            };

            match parse_frame(&payload).and_then(translate) {
                Ok(events) => st.pending.extend(events),
                Err(err) => {
                    st.finished = true;
                    return Some((Err(err), st));
                }
            }
        }
    })
    .boxed()
}

struct GeminiTransport {
    sink: Mutex<SplitSink<WsStream, Message>>,
}

#[async_trait]
impl UpstreamTransport for GeminiTransport {
    async fn send(&self, chunk: &Chunk) -> Result<(), UpstreamError> {
        let frame = client_frame(chunk).to_string();
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(frame))
            .await
            .map_err(|e| UpstreamError::Send(e.to_string()))
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        let mut sink = self.sink.lock().await;
        match sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(UpstreamError::Send(e.to_string())),
        }
    }
}
