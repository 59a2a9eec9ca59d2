//! # Media Module
//!
//! Everything that touches the bytes of a chunk rather than its routing.
//!
//! ## Key Components:
//! - **Codec**: base64 transport payloads ↔ raw bytes, tagged with a mime kind
//! - **WAV**: wraps 16-bit PCM from the engine into a playable WAV container
//! - **Playback**: bounded queue feeding an optional local audio sink
//!
//! ## Audio Formats:
//! - **Client → engine**: 16kHz, 16-bit, mono, little-endian PCM
//! - **Engine → client**: 24kHz, 16-bit, mono, little-endian PCM

pub mod codec;       // Chunk decoding and mime kinds
pub mod playback;    // Bounded playback queue and WAV recorder sink
pub mod wav;         // PCM to WAV conversion

pub use codec::{Chunk, MimeKind, RawChunk};
