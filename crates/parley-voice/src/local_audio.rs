//! Bare-metal audio I/O using CPAL and Rodio
//!
//! [`MicCapture`] feeds the default input device into a session's frame
//! channel; [`LocalSpeakerConnection`] plays replies on the default output
//! device. CPAL streams and Rodio output streams are not `Send`, so each
//! lives on its own thread for as long as its handle is alive.

use crate::buffer::{AudioFrame, CapturedFrame, FrameSender, SpeakerId};
use crate::connection::VoiceConnection;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use parley_core::CaptureConfig;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use tracing::{info, warn};

/// Microphone frames are cut to 20 ms.
const FRAME_MS: u32 = 20;

/// Root mean square of normalized samples.
fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

fn to_frame(samples: &[f32]) -> AudioFrame {
    let pcm: Vec<i16> = samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)
        .collect();
    AudioFrame::from_samples(&pcm)
}

/// Live capture from the default input device. Capture stops when dropped.
pub struct MicCapture {
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MicCapture {
    /// Start sending 20 ms frames above the silence threshold as `speaker`.
    pub fn start(speaker: SpeakerId, frames: FrameSender, config: &CaptureConfig) -> VoiceResult<Self> {
        let config = config.clone();
        let (ready_tx, ready_rx) = mpsc::channel::<VoiceResult<()>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("parley-mic".to_string())
            .spawn(move || {
                let stream = match build_input_stream(speaker, frames, &config) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Blocks until the handle is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
                info!("🎤 Microphone capture stopped");
            })?;

        ready_rx
            .recv()
            .map_err(|_| VoiceError::AudioStream("capture thread exited".to_string()))??;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// List available input devices.
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let devices = cpal::default_host().input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn build_input_stream(
    speaker: SpeakerId,
    frames: FrameSender,
    config: &CaptureConfig,
) -> VoiceResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
    info!(
        "🎤 Capturing from {} ({}Hz, {} channels)",
        device.name().unwrap_or_else(|_| "Unknown".to_string()),
        config.sample_rate,
        config.channels
    );

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let frame_len = (config.sample_rate * FRAME_MS / 1000) as usize * config.channels as usize;
    let threshold = config.silence_threshold;
    let mut pending: Vec<f32> = Vec::with_capacity(frame_len);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                pending.push(sample);
                if pending.len() >= frame_len {
                    if rms(&pending) >= threshold {
                        frames.send(CapturedFrame::new(speaker, to_frame(&pending)));
                    }
                    pending.clear();
                }
            }
        },
        move |err| {
            warn!("Audio stream error: {}", err);
        },
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

/// Voice connection backed by the default output device.
pub struct LocalSpeakerConnection {
    handle: OutputStreamHandle,
    sink: Mutex<Arc<Sink>>,
    connected: AtomicBool,
    shutdown: Mutex<Option<mpsc::Sender<()>>>,
}

impl LocalSpeakerConnection {
    pub fn open() -> VoiceResult<Self> {
        info!("🔊 Initializing audio playback");
        let (ready_tx, ready_rx) = mpsc::channel::<VoiceResult<OutputStreamHandle>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        thread::Builder::new()
            .name("parley-speaker".to_string())
            .spawn(move || {
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(handle));
                let _ = shutdown_rx.recv();
                drop(stream);
            })?;

        let handle = ready_rx
            .recv()
            .map_err(|_| VoiceError::Playback("output thread exited".to_string()))??;
        let sink = Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()))?;

        info!("✅ Audio playback initialized");
        Ok(Self {
            handle,
            sink: Mutex::new(Arc::new(sink)),
            connected: AtomicBool::new(true),
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }

    fn sink(&self) -> Arc<Sink> {
        Arc::clone(&self.sink.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl VoiceConnection for LocalSpeakerConnection {
    fn is_playing(&self) -> bool {
        !self.sink().empty()
    }

    async fn play(&self, artifact: &Path) -> VoiceResult<()> {
        if !self.is_connected() {
            return Err(VoiceError::Connection("speaker closed".to_string()));
        }
        let bytes = tokio::fs::read(artifact).await?;
        let source = Decoder::new(Cursor::new(bytes))
            .map_err(|e| VoiceError::Playback(format!("decode: {}", e)))?;

        let sink = self.sink();
        sink.append(source.convert_samples::<f32>());
        sink.play();
        Ok(())
    }

    fn stop(&self) {
        // A stopped sink may drop later appends, so swap in a fresh one.
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        sink.stop();
        match Sink::try_new(&self.handle) {
            Ok(fresh) => *sink = Arc::new(fresh),
            Err(e) => warn!(error = %e, "could not recreate output sink"),
        }
        info!("⏹️ Audio playback stopped");
    }

    async fn disconnect(&self) -> VoiceResult<()> {
        self.sink().stop();
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_to_frame_clamps() {
        let frame = to_frame(&[2.0, -2.0, 0.0]);
        assert_eq!(frame.len(), 6);
        assert_eq!(&frame.as_bytes()[..2], &i16::MAX.to_le_bytes());
    }

    #[test]
    fn test_list_devices() {
        // This might fail in CI environments without audio devices
        if let Ok(devices) = MicCapture::list_input_devices() {
            println!("Available input devices: {:?}", devices);
        }
    }
}
