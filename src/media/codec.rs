//! # Chunk Codec
//!
//! Decodes client payloads into immutable [`Chunk`]s and encodes engine bytes
//! back into the base64 text the websocket protocol carries.
//!
//! ## Accepted mime types:
//! - `audio/pcm` (parameters such as `;rate=16000` are ignored)
//! - `image/jpeg`
//! - `text` / `text/plain` (payload must be UTF-8 once decoded)
//!
//! The codec is stateless; every function here is a pure transformation.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The kind of media a chunk carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MimeKind {
    AudioPcm,
    ImageJpeg,
    Text,
}

impl MimeKind {
    /// Parse a wire mime type into a kind.
    ///
    /// Matching is case-insensitive and ignores mime parameters, so
    /// `Audio/PCM; rate=16000` is still `AudioPcm`.
    pub fn parse(mime_type: &str) -> Result<Self, DecodeError> {
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "audio/pcm" => Ok(MimeKind::AudioPcm),
            "image/jpeg" => Ok(MimeKind::ImageJpeg),
            "text" | "text/plain" => Ok(MimeKind::Text),
            _ => Err(DecodeError::UnknownMimeType(mime_type.to_string())),
        }
    }

    /// Canonical mime type sent upstream.
    pub fn as_mime(&self) -> &'static str {
        match self {
            MimeKind::AudioPcm => "audio/pcm",
            MimeKind::ImageJpeg => "image/jpeg",
            MimeKind::Text => "text/plain",
        }
    }
}

impl fmt::Display for MimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_mime())
    }
}

/// Per-chunk decode failures. These never end a session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported mime type: {0}")]
    UnknownMimeType(String),

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("text chunk is not valid UTF-8")]
    InvalidUtf8,

    #[error("chunk payload is empty")]
    Empty,
}

/// A chunk exactly as the client sent it, before decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChunk {
    pub mime_type: String,
    pub data: String,
}

impl RawChunk {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }
}

/// One decoded unit of media. Fields are private so a chunk cannot change
/// after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    mime_kind: MimeKind,
    payload: Vec<u8>,
}

impl Chunk {
    pub fn new(mime_kind: MimeKind, payload: Vec<u8>) -> Self {
        Self { mime_kind, payload }
    }

    /// Build a text chunk from a string.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MimeKind::Text, text.into().into_bytes())
    }

    pub fn mime_kind(&self) -> MimeKind {
        self.mime_kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload as text, for `Text` chunks.
    pub fn as_text(&self) -> Option<&str> {
        match self.mime_kind {
            MimeKind::Text => std::str::from_utf8(&self.payload).ok(),
            _ => None,
        }
    }
}

/// Decode a raw client chunk.
///
/// ## Validation order:
/// 1. Mime type must be one of the supported kinds
/// 2. Data must be standard base64 (surrounding whitespace is trimmed)
/// 3. Decoded payload must not be empty
/// 4. Text payloads must be UTF-8
pub fn decode_chunk(raw: &RawChunk) -> Result<Chunk, DecodeError> {
    let mime_kind = MimeKind::parse(&raw.mime_type)?;

    let payload = STANDARD
        .decode(raw.data.trim())
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;

    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }

    if mime_kind == MimeKind::Text && std::str::from_utf8(&payload).is_err() {
        return Err(DecodeError::InvalidUtf8);
    }

    Ok(Chunk::new(mime_kind, payload))
}

/// Encode bytes as standard base64 for the wire.
pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64 coming from the engine.
pub fn decode_payload(data: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))
}
