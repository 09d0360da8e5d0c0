//! Voice session tests: full turns against fake services.
//!
//! Run with: `cargo test -p parley-voice --test session_test`

mod common;

use common::{Harness, FILLERS};
use parley_core::Role;
use parley_voice::{
    exchange_message, AbortReason, CapturedFrame, SessionRegistry, Speaker, TurnOutcome,
    VoiceConnection, VoiceError,
};
use std::time::Duration;

fn alice() -> Speaker {
    Speaker::new(42, "Alice")
}

#[tokio::test]
async fn test_end_to_end_turn_for_one_speaker() {
    let h = Harness::new();
    h.speak(42, 3);

    let outcome = h.session.run_turn(&alice()).await.unwrap();
    let report = outcome.report().expect("turn should reply");

    assert_eq!(report.speaker, 42);
    assert_eq!(report.utterance, "hello");
    assert_eq!(report.reply, "hi there");
    assert!(report.played);
    assert!(report.notified);
    assert!(report.synthesis_error.is_none());

    // Transcriber got the WAV artifact.
    assert_eq!(h.transcriber.calls(), 1);
    assert_eq!(
        h.transcriber.saw_wav.load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    // Store holds the exchange, oldest first.
    let history = h.store.history(42, 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!((history[0].role, history[0].content.as_str()), (Role::User, "hello"));
    assert_eq!(
        (history[1].role, history[1].content.as_str()),
        (Role::Assistant, "hi there")
    );

    // Fillers were posted while the reply was pending, then the exchange.
    assert!(!report.fillers.is_empty());
    assert!(report.fillers.iter().all(|f| FILLERS.contains(&f.as_str())));
    let texts = h.channel.texts();
    assert_eq!(texts.first().unwrap(), "Listening to **Alice**...");
    assert_eq!(
        texts.last().unwrap(),
        &exchange_message("Alice", "hello", "hi there")
    );
    assert_eq!(h.channel.filler_count(), report.fillers.len());

    // One reply played, nothing left behind.
    assert_eq!(h.sink.inner.played().len(), 1);
    assert_eq!(h.artifact_count(), 0);
    assert!(h.session.buffer().is_empty(42));
    assert!(!h.session.is_turn_running(42));
}

#[tokio::test]
async fn test_history_and_prompt_feed_the_responder() {
    let h = Harness::new();
    h.store.set_user_prompt(42, "answer like a pirate").unwrap();

    h.speak(42, 2);
    h.session.run_turn(&alice()).await.unwrap();
    h.transcriber.say("and then?");
    h.speak(42, 2);
    h.session.run_turn(&alice()).await.unwrap();

    let seen = h.responder.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], ("hello".to_string(), 0, "answer like a pirate".to_string()));
    // Second call sees the first exchange but not its own utterance.
    assert_eq!(seen[1].0, "and then?");
    assert_eq!(seen[1].1, 2);
    assert_eq!(h.store.history_len(42).unwrap(), 4);
}

#[tokio::test]
async fn test_timeout_without_audio() {
    let h = Harness::new();

    let outcome = h.session.run_turn(&alice()).await.unwrap();

    assert_eq!(outcome.abort_reason(), Some(&AbortReason::EndpointTimeout));
    assert_eq!(h.transcriber.calls(), 0);
    assert_eq!(h.artifact_count(), 0);
}

#[tokio::test]
async fn test_keyword_gate_stops_then_allows() {
    let h = Harness::new();
    h.store
        .set_recording_setting(42, true, Some("Computer"))
        .unwrap();

    h.transcriber.say("what time is it");
    h.speak(42, 3);
    let outcome = h.session.run_turn(&alice()).await.unwrap();
    assert_eq!(
        outcome.abort_reason(),
        Some(&AbortReason::KeywordMismatch {
            transcript: "what time is it".to_string()
        })
    );
    assert_eq!(h.responder.calls(), 0);
    assert_eq!(h.store.history_len(42).unwrap(), 0);
    assert_eq!(
        h.session.last_gated_transcript(42).as_deref(),
        Some("what time is it")
    );

    h.transcriber.say("computer, what time is it");
    h.speak(42, 3);
    let outcome = h.session.run_turn(&alice()).await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Replied(_)));
    assert_eq!(h.responder.calls(), 1);
    assert_eq!(h.artifact_count(), 0);
}

#[tokio::test]
async fn test_disabled_speaker_is_not_recorded() {
    let h = Harness::new();
    h.store.set_recording_setting(42, false, None).unwrap();

    let outcome = h.session.run_turn(&alice()).await.unwrap();
    assert_eq!(outcome.abort_reason(), Some(&AbortReason::RecordingDisabled));

    assert!(!h
        .session
        .buffer()
        .append(CapturedFrame::new(42, common::frame())));
    assert!(h.session.on_voice_activity(alice()).await.is_none());
}

#[tokio::test]
async fn test_first_contact_creates_recording_row() {
    let h = Harness::new();
    assert!(h.store.recording_setting(7).unwrap().is_none());

    let _ = h.session.run_turn(&Speaker::new(7, "Bob")).await.unwrap();

    let setting = h.store.recording_setting(7).unwrap().unwrap();
    assert!(setting.enabled);
    assert!(setting.keyword.is_none());
}

#[tokio::test]
async fn test_transcription_failure_cleans_up() {
    let h = Harness::new();
    h.transcriber.fail("whisper down");
    h.speak(42, 3);

    let outcome = h.session.run_turn(&alice()).await.unwrap();

    assert!(matches!(
        outcome.abort_reason(),
        Some(AbortReason::TranscriptionFailed(_))
    ));
    assert_eq!(h.responder.calls(), 0);
    assert_eq!(h.artifact_count(), 0);
}

#[tokio::test]
async fn test_empty_transcript_aborts() {
    let h = Harness::new();
    h.transcriber.say("   ");
    h.speak(42, 1);

    let outcome = h.session.run_turn(&alice()).await.unwrap();
    assert_eq!(outcome.abort_reason(), Some(&AbortReason::EmptyTranscript));
    assert_eq!(h.store.history_len(42).unwrap(), 0);
}

#[tokio::test]
async fn test_response_failure_stops_fillers_and_cleans_up() {
    let h = Harness::new();
    h.responder.fail("quota exceeded");
    h.speak(42, 3);

    let outcome = h.session.run_turn(&alice()).await.unwrap();
    assert!(matches!(
        outcome.abort_reason(),
        Some(AbortReason::ResponseFailed(_))
    ));
    assert_eq!(h.artifact_count(), 0);
    assert_eq!(h.synthesizer.calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    // The utterance was persisted before the reply was requested.
    assert_eq!(h.store.history_len(42).unwrap(), 1);

    let fillers = h.channel.filler_count();
    assert!(fillers >= 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.channel.filler_count(), fillers);
}

#[tokio::test]
async fn test_synthesis_failure_still_posts_text() {
    let h = Harness::new();
    h.synthesizer.fail();
    h.speak(42, 3);

    let outcome = h.session.run_turn(&alice()).await.unwrap();
    let report = outcome.report().unwrap();

    assert!(!report.played);
    assert!(report.notified);
    assert!(report.synthesis_error.is_some());
    assert!(h.sink.inner.played().is_empty());
    assert_eq!(
        h.channel.texts().last().unwrap(),
        &exchange_message("Alice", "hello", "hi there")
    );
    assert_eq!(h.artifact_count(), 0);
}

#[tokio::test]
async fn test_reply_audio_posted_before_cleanup() {
    let h = Harness::with_config(|c| c.post_reply_audio = true);
    h.speak(42, 3);

    h.session.run_turn(&alice()).await.unwrap();

    let files = h.channel.files.lock().unwrap().clone();
    assert_eq!(files.len(), 1);
    assert!(!files[0].exists());
    assert_eq!(h.artifact_count(), 0);
}

#[tokio::test]
async fn test_unusable_connection_is_fatal() {
    let h = Harness::new();
    h.sink.disconnect().await.unwrap();
    h.speak(42, 3);

    let result = h.session.run_turn(&alice()).await;

    assert!(matches!(result, Err(VoiceError::Connection(_))));
    assert_eq!(h.artifact_count(), 0);
    assert!(!h.session.is_turn_running(42));
}

#[tokio::test]
async fn test_two_speakers_play_in_turn() {
    let h = Harness::new();
    h.speak(1, 2);
    h.speak(2, 2);

    let bob = Speaker::new(1, "Bob");
    let carol = Speaker::new(2, "Carol");
    let (a, b) = tokio::join!(h.session.run_turn(&bob), h.session.run_turn(&carol));

    assert!(a.unwrap().report().unwrap().played);
    assert!(b.unwrap().report().unwrap().played);
    assert_eq!(h.sink.inner.played().len(), 2);
    assert_eq!(std::fs::read_dir(h.outbox.path()).unwrap().count(), 2);
    assert_eq!(h.artifact_count(), 0);

    // Neither reply cut the other off: no stop, and the second started
    // only after the first had played to its end.
    assert_eq!(h.sink.stops(), 0);
    let starts = h.sink.starts();
    assert_eq!(starts.len(), 2);
    assert!(starts.iter().all(|(_, busy)| !busy));
    let reply_length = Duration::from_millis(50);
    assert!(starts[1].0 - starts[0].0 >= reply_length);
}

#[tokio::test]
async fn test_voice_activity_spawns_single_turn() {
    let h = Harness::new();
    // Stale audio from before the activity event is dropped.
    h.speak(42, 5);

    let handle = h
        .session
        .on_voice_activity(alice())
        .await
        .expect("turn should start");
    assert!(h.session.buffer().is_empty(42));
    assert!(h.session.is_turn_running(42));

    // A second event while the first turn runs is ignored.
    assert!(h.session.on_voice_activity(alice()).await.is_none());

    let sender = h.session.frame_sender();
    for _ in 0..3 {
        assert!(sender.send(CapturedFrame::new(42, common::frame())));
    }
    assert!(sender.send(CapturedFrame::from_bot(999, common::frame())));

    let outcome = handle.await.unwrap().unwrap();
    assert!(matches!(outcome, TurnOutcome::Replied(_)));
    assert!(!h.session.is_turn_running(42));
    assert!(h.session.buffer().is_empty(999));
    assert_eq!(h.session.active_speakers(), vec![42]);
}

#[tokio::test]
async fn test_registry_disconnects_on_remove() {
    let h = Harness::new();
    let registry = SessionRegistry::new();
    assert!(registry.insert(h.session.clone()).is_none());
    assert_eq!(registry.ids(), vec!["guild-1".to_string()]);
    assert!(registry.get("guild-1").is_some());

    assert!(registry.remove("guild-1").await.unwrap());
    assert!(!registry.remove("guild-1").await.unwrap());
    assert!(registry.is_empty());
    assert!(!h.sink.is_connected());
}
