//! # Local Playback Queue
//!
//! When a local audio sink is configured, engine audio is not sent back to the
//! client but pushed through a bounded queue to a consumer task. The queue
//! decouples the outbound relay from the sink: a slow sink makes the relay
//! wait for capacity instead of buffering without limit.
//!
//! ## Pieces:
//! - **PlaybackQueue**: producer half, owned by the outbound relay
//! - **AudioSink**: whatever consumes the audio (the shipped one streams it into a WAV file)
//! - **spawn_consumer**: drains the queue into a sink until the queue closes

use crate::media::wav::{pcm_samples, wav_header, PcmFormat};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Producer side of the bounded playback queue.
#[derive(Debug, Clone)]
pub struct PlaybackQueue {
    tx: mpsc::Sender<Vec<u8>>,
}

/// Consumer side, handed to [`spawn_consumer`].
#[derive(Debug)]
pub struct PlaybackReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Create a playback queue holding at most `capacity` audio chunks.
pub fn playback_queue(capacity: usize) -> (PlaybackQueue, PlaybackReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PlaybackQueue { tx }, PlaybackReceiver { rx })
}

impl PlaybackQueue {
    /// Enqueue one chunk of audio, waiting for capacity if the queue is full.
    ///
    /// Fails only when the consumer has gone away.
    pub async fn enqueue(&self, audio: Vec<u8>) -> Result<(), String> {
        self.tx
            .send(audio)
            .await
            .map_err(|_| "Playback consumer has stopped".to_string())
    }
}

impl PlaybackReceiver {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// A local consumer of engine audio.
#[async_trait]
pub trait AudioSink: Send {
    /// Consume one chunk of PCM audio.
    async fn play(&mut self, audio: Vec<u8>) -> Result<(), String>;

    /// Called once after the queue closes.
    async fn finish(&mut self) -> Result<(), String>;
}

/// Streams a session's engine audio into a WAV file.
///
/// The file is created on the first chunk with a placeholder header; samples
/// are appended as they arrive and `finish` rewrites the header with the
/// final size. Memory use stays at one chunk regardless of session length.
pub struct WavRecorderSink {
    path: PathBuf,
    format: PcmFormat,
    file: Option<File>,
    data_len: u32,
}

impl WavRecorderSink {
    pub fn new(path: impl Into<PathBuf>, format: PcmFormat) -> Self {
        Self {
            path: path.into(),
            format,
            file: None,
            data_len: 0,
        }
    }

    /// Recorder writing `<dir>/<session_id>.wav`.
    pub fn for_session(dir: impl Into<PathBuf>, session_id: &str, format: PcmFormat) -> Self {
        let mut path = dir.into();
        path.push(format!("{}.wav", session_id));
        Self::new(path, format)
    }

    async fn create(&self) -> Result<File, String> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
        }

        let header = wav_header(self.format, 0)?;
        let mut file = File::create(&self.path)
            .await
            .map_err(|e| format!("Failed to create {}: {}", self.path.display(), e))?;
        file.write_all(&header)
            .await
            .map_err(|e| format!("Failed to write {}: {}", self.path.display(), e))?;
        Ok(file)
    }
}

#[async_trait]
impl AudioSink for WavRecorderSink {
    async fn play(&mut self, audio: Vec<u8>) -> Result<(), String> {
        pcm_samples(&audio)?;

        // The RIFF size field is 32 bits wide
        let data_len = u32::try_from(audio.len())
            .ok()
            .and_then(|len| self.data_len.checked_add(len))
            .filter(|len| *len <= u32::MAX - 36)
            .ok_or_else(|| format!("WAV size limit reached for {}", self.path.display()))?;

        if self.file.is_none() {
            let file = self.create().await?;
            self.file = Some(file);
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| format!("Recording file {} unavailable", self.path.display()))?;

        file.write_all(&audio)
            .await
            .map_err(|e| format!("Failed to write {}: {}", self.path.display(), e))?;
        self.data_len = data_len;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), String> {
        let Some(mut file) = self.file.take() else {
            debug!(path = %self.path.display(), "No engine audio recorded, skipping WAV file");
            return Ok(());
        };

        let header = wav_header(self.format, self.data_len)?;
        let write = async {
            file.seek(SeekFrom::Start(0)).await?;
            file.write_all(&header).await?;
            file.flush().await
        };
        write
            .await
            .map_err(|e| format!("Failed to finalize {}: {}", self.path.display(), e))?;

        info!(
            path = %self.path.display(),
            samples = self.data_len / 2,
            "Recorded engine audio"
        );
        Ok(())
    }
}

/// Drain the queue into `sink` until every producer is dropped.
///
/// A chunk the sink rejects is logged and skipped; the consumer keeps going.
pub fn spawn_consumer<S>(mut receiver: PlaybackReceiver, mut sink: S) -> JoinHandle<()>
where
    S: AudioSink + 'static,
{
    tokio::spawn(async move {
        while let Some(audio) = receiver.recv().await {
            if let Err(err) = sink.play(audio).await {
                warn!("Audio sink rejected chunk: {}", err);
            }
        }

        if let Err(err) = sink.finish().await {
            warn!("Audio sink failed to finish: {}", err);
        }
    })
}
