//! Turn pipeline tests without a session around it.
//!
//! Run with: `cargo test -p parley-voice --test pipeline_test`

mod common;

use common::{init_tracing, test_config, FakeResponder, FakeSynthesizer, FakeTranscriber};
use parley_core::{ConversationStore, ParleyConfig};
use parley_voice::{
    AbortReason, AudioBuffer, CapturedFrame, FileSinkConnection, PlaybackSerializer, SledSettings,
    Speaker, TurnPipeline, TurnServices, TurnSettings,
};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    artifacts: tempfile::TempDir,
    _outbox: tempfile::TempDir,
    transcriber: Arc<FakeTranscriber>,
    pipeline: TurnPipeline,
    playback: PlaybackSerializer,
    buffer: AudioBuffer,
}

fn fixture(adjust: impl FnOnce(&mut ParleyConfig)) -> Fixture {
    init_tracing();
    let artifacts = tempfile::tempdir().unwrap();
    let outbox = tempfile::tempdir().unwrap();
    let mut config = test_config(artifacts.path());
    adjust(&mut config);

    let transcriber = Arc::new(FakeTranscriber::new("hello"));
    let services = TurnServices {
        transcriber: transcriber.clone(),
        responder: Arc::new(FakeResponder::new("hi", Duration::from_millis(1))),
        synthesizer: Arc::new(FakeSynthesizer::default()),
        store: Arc::new(SledSettings::new(
            ConversationStore::open_temporary().unwrap(),
            "prompt",
        )),
    };
    let sink = Arc::new(FileSinkConnection::new(outbox.path()).unwrap());

    Fixture {
        pipeline: TurnPipeline::new(services, TurnSettings::from_config(&config)),
        playback: PlaybackSerializer::new(sink, &config.playback),
        buffer: AudioBuffer::new(config.buffer.capacity),
        artifacts,
        _outbox: outbox,
        transcriber,
    }
}

#[tokio::test]
async fn test_empty_snapshot_skips_transcription() {
    let f = fixture(|_| {});

    let outcome = f
        .pipeline
        .run(&Speaker::new(1, "A"), None, &f.buffer, &f.playback, None)
        .await
        .unwrap();

    assert_eq!(outcome.abort_reason(), Some(&AbortReason::EmptySnapshot));
    assert_eq!(f.transcriber.calls(), 0);
    assert_eq!(std::fs::read_dir(f.artifacts.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_runs_without_text_channel() {
    let f = fixture(|_| {});
    f.buffer
        .append(CapturedFrame::new(1, common::frame()));

    let outcome = f
        .pipeline
        .run(&Speaker::new(1, "A"), None, &f.buffer, &f.playback, None)
        .await
        .unwrap();

    let report = outcome.report().unwrap();
    assert!(report.played);
    assert!(!report.notified);
    assert!(report.fillers.is_empty());
    assert!(f.buffer.is_empty(1));
    assert!(!f.playback.state().is_playing);
}

#[tokio::test]
async fn test_unwritable_artifact_dir_aborts() {
    let f = fixture(|c| c.artifact_dir = Some("/nonexistent/parley/artifacts".into()));
    f.buffer
        .append(CapturedFrame::new(1, common::frame()));

    let outcome = f
        .pipeline
        .run(&Speaker::new(1, "A"), None, &f.buffer, &f.playback, None)
        .await
        .unwrap();

    assert!(matches!(
        outcome.abort_reason(),
        Some(AbortReason::ArtifactWrite(_))
    ));
    assert_eq!(f.transcriber.calls(), 0);
}
