//! # Client Recorder
//!
//! Microphone capture for the client side of the voice channel. The actual
//! audio device sits behind the `CaptureBackend` trait; the recorder adds
//! the protocol around it: `audio_start` framing, chunked binary upload,
//! per-chunk RMS level for UI metering, and the final flush + `audio_stop`.
//!
//! The recorder does not own a timer. The caller drives `pump()` at the
//! chunk interval (`chunk_interval()`), which keeps the recorder free of
//! spawned tasks and easy to test.

use crate::client::transport::TransportHandle;
use crate::error::{VoiceError, VoiceResult};
use crate::websocket::WsFrame;
use byteorder::{ByteOrder, LittleEndian};
use std::time::Duration;
use tracing::{debug, info};

/// Platform audio capture. `read_chunk` returns whatever PCM accumulated
/// since the last call; empty means no new audio yet.
pub trait CaptureBackend: Send {
    fn start(&mut self) -> VoiceResult<()>;
    fn read_chunk(&mut self) -> VoiceResult<Vec<u8>>;
    fn stop(&mut self);
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// How much audio each binary frame carries
    pub chunk_interval: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            chunk_interval: Duration::from_millis(250),
        }
    }
}

pub struct Recorder {
    backend: Option<Box<dyn CaptureBackend>>,
    config: RecorderConfig,
    recording: bool,
    chunks_sent: u64,
}

impl Recorder {
    /// A recorder with no capture backend; `start_recording` reports
    /// `UnsupportedError` (headless environments, tests of the error path).
    pub fn without_backend(config: RecorderConfig) -> Self {
        Self {
            backend: None,
            config,
            recording: false,
            chunks_sent: 0,
        }
    }

    pub fn new(backend: Box<dyn CaptureBackend>, config: RecorderConfig) -> Self {
        Self {
            backend: Some(backend),
            config,
            recording: false,
            chunks_sent: 0,
        }
    }

    pub fn chunk_interval(&self) -> Duration {
        self.config.chunk_interval
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Open the capture device and announce the utterance.
    pub async fn start_recording(&mut self, transport: &TransportHandle) -> VoiceResult<()> {
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| VoiceError::Unsupported("no audio capture backend available".into()))?;

        backend.start()?;
        send_frame(transport, &WsFrame::AudioStart).await?;
        self.recording = true;
        self.chunks_sent = 0;
        info!("Recording started");
        Ok(())
    }

    /// Ship one chunk of captured audio. Returns the chunk's RMS level in
    /// [0.0, 1.0] for UI metering, or `None` when no audio accumulated since
    /// the last call. The caller invokes this at `chunk_interval()`.
    pub async fn pump(&mut self, transport: &TransportHandle) -> VoiceResult<Option<f32>> {
        if !self.recording {
            return Err(VoiceError::Validation("recorder is not recording".into()));
        }
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| VoiceError::Unsupported("no audio capture backend available".into()))?;

        let chunk = backend.read_chunk()?;
        if chunk.is_empty() {
            return Ok(None);
        }

        let level = rms_level(&chunk);
        transport
            .send_binary(chunk)
            .await
            .map_err(|_| VoiceError::Internal("transport closed".into()))?;
        self.chunks_sent += 1;
        Ok(Some(level))
    }

    /// Flush the remaining audio, close the device and end the utterance.
    pub async fn stop_recording(&mut self, transport: &TransportHandle) -> VoiceResult<()> {
        if !self.recording {
            return Err(VoiceError::Validation("recorder is not recording".into()));
        }
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| VoiceError::Unsupported("no audio capture backend available".into()))?;

        let remainder = backend.read_chunk()?;
        if !remainder.is_empty() {
            transport
                .send_binary(remainder)
                .await
                .map_err(|_| VoiceError::Internal("transport closed".into()))?;
            self.chunks_sent += 1;
        }
        backend.stop();

        send_frame(transport, &WsFrame::AudioStop).await?;
        self.recording = false;
        debug!(chunks = self.chunks_sent, "Recording stopped");
        Ok(())
    }
}

async fn send_frame(transport: &TransportHandle, frame: &WsFrame) -> VoiceResult<()> {
    let json = serde_json::to_string(frame)?;
    transport
        .send_text(json)
        .await
        .map_err(|_| VoiceError::Internal("transport closed".into()))
}

/// Root-mean-square of 16-bit LE PCM samples, normalized to [0.0, 1.0].
pub fn rms_level(pcm: &[u8]) -> f32 {
    let sample_count = pcm.len() / 2;
    if sample_count == 0 {
        return 0.0;
    }

    let mut sum_squares = 0.0f64;
    for i in 0..sample_count {
        let sample = LittleEndian::read_i16(&pcm[i * 2..]) as f64 / i16::MAX as f64;
        sum_squares += sample * sample;
    }

    (sum_squares / sample_count as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::Command;
    use tokio::sync::mpsc;

    struct FakeBackend {
        chunks: Vec<Vec<u8>>,
        started: bool,
    }

    impl FakeBackend {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks,
                started: false,
            }
        }
    }

    impl CaptureBackend for FakeBackend {
        fn start(&mut self) -> VoiceResult<()> {
            self.started = true;
            Ok(())
        }

        fn read_chunk(&mut self) -> VoiceResult<Vec<u8>> {
            if self.chunks.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(self.chunks.remove(0))
            }
        }

        fn stop(&mut self) {
            self.started = false;
        }
    }

    fn test_transport() -> (TransportHandle, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(16);
        (TransportHandle::new(tx), rx)
    }

    fn sine_chunk() -> Vec<u8> {
        let mut pcm = vec![0u8; 640];
        for i in 0..320 {
            let sample = ((i as f32 * 0.2).sin() * 8000.0) as i16;
            LittleEndian::write_i16(&mut pcm[i * 2..], sample);
        }
        pcm
    }

    #[test]
    fn test_rms_of_silence_is_zero() {
        assert_eq!(rms_level(&vec![0u8; 320]), 0.0);
        assert_eq!(rms_level(&[]), 0.0);
    }

    #[test]
    fn test_rms_of_full_scale() {
        let mut pcm = vec![0u8; 64];
        for i in 0..32 {
            LittleEndian::write_i16(&mut pcm[i * 2..], i16::MAX);
        }
        let level = rms_level(&pcm);
        assert!((level - 1.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_start_without_backend_is_unsupported() {
        let (transport, _rx) = test_transport();
        let mut recorder = Recorder::without_backend(RecorderConfig::default());
        let err = recorder.start_recording(&transport).await.unwrap_err();
        assert_eq!(err.code(), "UnsupportedError");
    }

    #[tokio::test]
    async fn test_full_recording_flow() {
        let (transport, mut rx) = test_transport();
        let backend = FakeBackend::new(vec![sine_chunk(), sine_chunk()]);
        let mut recorder = Recorder::new(Box::new(backend), RecorderConfig::default());

        recorder.start_recording(&transport).await.unwrap();
        assert!(recorder.is_recording());

        let level = recorder.pump(&transport).await.unwrap();
        assert!(level.unwrap() > 0.0);

        recorder.stop_recording(&transport).await.unwrap();
        assert!(!recorder.is_recording());

        // audio_start, one pumped chunk, the flushed remainder, audio_stop
        match rx.recv().await.unwrap() {
            Command::Text(frame) => assert!(frame.contains("audio_start")),
            other => panic!("expected audio_start, got {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), Command::Binary(_)));
        assert!(matches!(rx.recv().await.unwrap(), Command::Binary(_)));
        match rx.recv().await.unwrap() {
            Command::Text(frame) => assert!(frame.contains("audio_stop")),
            other => panic!("expected audio_stop, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pump_with_no_audio_yields_nothing() {
        let (transport, _rx) = test_transport();
        let backend = FakeBackend::new(vec![]);
        let mut recorder = Recorder::new(Box::new(backend), RecorderConfig::default());

        recorder.start_recording(&transport).await.unwrap();
        assert!(recorder.pump(&transport).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pump_while_idle_is_rejected() {
        let (transport, _rx) = test_transport();
        let backend = FakeBackend::new(vec![]);
        let mut recorder = Recorder::new(Box::new(backend), RecorderConfig::default());
        assert!(recorder.pump(&transport).await.is_err());
    }
}
