//! Shared fakes for the session and pipeline tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parley_core::{
    ConversationStore, CushionConfig, EndpointConfig, HistoryEntry, ParleyConfig, PlaybackConfig,
};
use parley_voice::{
    AudioFrame, CapturedFrame, FileSinkConnection, NotificationChannel, Responder, SledSettings,
    SpeakerId, Synthesizer, Transcriber, TurnServices, VoiceConnection, VoiceError, VoiceResult,
    VoiceSession,
};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

pub const FILLERS: [&str; 2] = ["hmm", "let me think"];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Config with millisecond timings so tests run in real time.
pub fn test_config(artifact_dir: &Path) -> ParleyConfig {
    ParleyConfig {
        artifact_dir: Some(artifact_dir.to_path_buf()),
        endpoint: EndpointConfig {
            poll_interval_ms: 10,
            max_wait_ms: 300,
            grace_ms: 20,
        },
        cushion: CushionConfig {
            interval_ms: 20,
            phrases: FILLERS.iter().map(|s| s.to_string()).collect(),
        },
        playback: PlaybackConfig {
            settle_ms: 5,
            poll_interval_ms: 5,
        },
        ..ParleyConfig::default()
    }
}

/// 50 ms of mono silence at 16 kHz, as WAV bytes.
pub fn short_wav() -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..800 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

pub fn frame() -> AudioFrame {
    AudioFrame::from_samples(&[100, -100, 200, -200])
}

// ---------------------------------------------------------------------------
// Service fakes
// ---------------------------------------------------------------------------

pub struct FakeTranscriber {
    text: Mutex<Result<String, String>>,
    pub calls: AtomicUsize,
    /// Paths that existed when transcription ran.
    pub saw_wav: AtomicUsize,
}

impl FakeTranscriber {
    pub fn new(text: &str) -> Self {
        Self {
            text: Mutex::new(Ok(text.to_string())),
            calls: AtomicUsize::new(0),
            saw_wav: AtomicUsize::new(0),
        }
    }

    pub fn say(&self, text: &str) {
        *self.text.lock().unwrap() = Ok(text.to_string());
    }

    pub fn fail(&self, message: &str) {
        *self.text.lock().unwrap() = Err(message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> VoiceResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if wav.starts_with(b"RIFF") {
            self.saw_wav.fetch_add(1, Ordering::SeqCst);
        }
        self.text.lock().unwrap().clone().map_err(VoiceError::Stt)
    }
}

pub struct FakeResponder {
    reply: Mutex<Result<String, String>>,
    delay: Duration,
    pub calls: AtomicUsize,
    /// (utterance, history length, system prompt) per call.
    pub seen: Mutex<Vec<(String, usize, String)>>,
}

impl FakeResponder {
    pub fn new(reply: &str, delay: Duration) -> Self {
        Self {
            reply: Mutex::new(Ok(reply.to_string())),
            delay,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn fail(&self, message: &str) {
        *self.reply.lock().unwrap() = Err(message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Responder for FakeResponder {
    async fn respond(
        &self,
        text: &str,
        history: &[HistoryEntry],
        system_prompt: &str,
    ) -> VoiceResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push((
            text.to_string(),
            history.len(),
            system_prompt.to_string(),
        ));
        tokio::time::sleep(self.delay).await;
        self.reply.lock().unwrap().clone().map_err(VoiceError::Chat)
    }
}

#[derive(Default)]
pub struct FakeSynthesizer {
    failing: Mutex<bool>,
    pub calls: AtomicUsize,
}

impl FakeSynthesizer {
    pub fn fail(&self) {
        *self.failing.lock().unwrap() = true;
    }
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, _text: &str) -> VoiceResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.failing.lock().unwrap() {
            return Err(VoiceError::Tts("engine offline".to_string()));
        }
        Ok(short_wav())
    }
}

#[derive(Default)]
pub struct RecordingChannel {
    pub texts: Mutex<Vec<String>>,
    pub files: Mutex<Vec<PathBuf>>,
}

impl RecordingChannel {
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub fn filler_count(&self) -> usize {
        self.texts()
            .iter()
            .filter(|t| FILLERS.contains(&t.as_str()))
            .count()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn send_text(&self, text: &str) -> VoiceResult<()> {
        self.texts.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn send_file(&self, path: &Path, _caption: Option<&str>) -> VoiceResult<()> {
        assert!(path.exists(), "uploaded artifact must still exist");
        self.files.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// File sink that also records every start and stop it is asked for.
pub struct WatchedConnection {
    pub inner: FileSinkConnection,
    pub stops: AtomicUsize,
    /// (start time, whether earlier audio was still playing) per `play`.
    pub starts: Mutex<Vec<(Instant, bool)>>,
}

impl WatchedConnection {
    pub fn new(outbox: &Path) -> Self {
        Self {
            inner: FileSinkConnection::new(outbox).unwrap(),
            stops: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
        }
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> Vec<(Instant, bool)> {
        self.starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl VoiceConnection for WatchedConnection {
    fn is_playing(&self) -> bool {
        self.inner.is_playing()
    }

    async fn play(&self, artifact: &Path) -> VoiceResult<()> {
        let (at, busy) = (Instant::now(), self.inner.is_playing());
        self.inner.play(artifact).await?;
        self.starts.lock().unwrap().push((at, busy));
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.inner.stop();
    }

    async fn disconnect(&self) -> VoiceResult<()> {
        self.inner.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub artifacts: TempDir,
    pub outbox: TempDir,
    pub store: ConversationStore,
    pub transcriber: Arc<FakeTranscriber>,
    pub responder: Arc<FakeResponder>,
    pub synthesizer: Arc<FakeSynthesizer>,
    pub channel: Arc<RecordingChannel>,
    pub sink: Arc<WatchedConnection>,
    pub session: Arc<VoiceSession>,
}

impl Harness {
    /// Session wired to fakes. Must run inside a Tokio runtime.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut ParleyConfig)) -> Self {
        init_tracing();
        let artifacts = tempfile::tempdir().unwrap();
        let outbox = tempfile::tempdir().unwrap();
        let mut config = test_config(artifacts.path());
        adjust(&mut config);

        let store = ConversationStore::open_temporary().unwrap();
        let transcriber = Arc::new(FakeTranscriber::new("hello"));
        let responder = Arc::new(FakeResponder::new("hi there", Duration::from_millis(70)));
        let synthesizer = Arc::new(FakeSynthesizer::default());
        let channel = Arc::new(RecordingChannel::default());
        let sink = Arc::new(WatchedConnection::new(outbox.path()));

        let services = TurnServices {
            transcriber: transcriber.clone(),
            responder: responder.clone(),
            synthesizer: synthesizer.clone(),
            store: Arc::new(SledSettings::new(
                store.clone(),
                config.default_system_prompt.clone(),
            )),
        };
        let channel_dyn: Arc<dyn NotificationChannel> = channel.clone();
        let session = VoiceSession::new("guild-1", &config, services, sink.clone(), Some(channel_dyn));

        Self {
            artifacts,
            outbox,
            store,
            transcriber,
            responder,
            synthesizer,
            channel,
            sink,
            session,
        }
    }

    /// Put `count` frames from `speaker` straight into the buffer.
    pub fn speak(&self, speaker: SpeakerId, count: usize) {
        for _ in 0..count {
            assert!(self
                .session
                .buffer()
                .append(CapturedFrame::new(speaker, frame())));
        }
    }

    /// Files left behind in the artifact directory.
    pub fn artifact_count(&self) -> usize {
        std::fs::read_dir(self.artifacts.path()).unwrap().count()
    }
}
