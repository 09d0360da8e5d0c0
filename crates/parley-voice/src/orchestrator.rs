//! Voice session orchestration
//!
//! A [`VoiceSession`] is one live voice connection plus everything that runs
//! on top of it: the frame pump, the per-speaker buffer, the recording gate,
//! the endpoint detector, the turn pipeline and the playback serializer.
//! [`SessionRegistry`] keeps one session per guild (or per local device).

use crate::buffer::{frame_channel, pump_frames, AudioBuffer, FrameSender, SpeakerId};
use crate::connection::VoiceConnection;
use crate::endpoint::{Endpoint, EndpointDetector};
use crate::error::VoiceResult;
use crate::gate::RecordingGate;
use crate::notify::NotificationChannel;
use crate::playback::{PlaybackSerializer, PlaybackState};
use crate::turn::{AbortReason, Speaker, TurnOutcome, TurnPipeline, TurnServices, TurnSettings};
use dashmap::{DashMap, DashSet};
use parley_core::{ParleyConfig, RecordingSetting};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Marks a speaker as having a turn in flight until dropped.
struct InFlight {
    speakers: Arc<DashSet<SpeakerId>>,
    speaker: SpeakerId,
}

impl InFlight {
    fn claim(speakers: &Arc<DashSet<SpeakerId>>, speaker: SpeakerId) -> Option<Self> {
        speakers.insert(speaker).then(|| Self {
            speakers: Arc::clone(speakers),
            speaker,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.speakers.remove(&self.speaker);
    }
}

/// One voice connection and its conversation machinery.
pub struct VoiceSession {
    id: String,
    buffer: Arc<AudioBuffer>,
    frames: FrameSender,
    pump: Mutex<Option<JoinHandle<()>>>,
    playback: PlaybackSerializer,
    channel: Option<Arc<dyn NotificationChannel>>,
    gate: RecordingGate,
    endpoint: EndpointDetector,
    pipeline: TurnPipeline,
    active_threshold: Duration,
    in_flight: Arc<DashSet<SpeakerId>>,
    last_gated: DashMap<SpeakerId, String>,
}

impl VoiceSession {
    /// Create a session and start its frame pump. Must be called inside a Tokio runtime.
    pub fn new(
        id: impl Into<String>,
        config: &ParleyConfig,
        services: TurnServices,
        connection: Arc<dyn VoiceConnection>,
        channel: Option<Arc<dyn NotificationChannel>>,
    ) -> Arc<Self> {
        let id = id.into();
        let buffer = Arc::new(AudioBuffer::new(config.buffer.capacity));
        let (frames, rx) = frame_channel();
        let pump = tokio::spawn(pump_frames(Arc::clone(&buffer), rx));

        info!(
            session = %id,
            channel = channel.as_ref().map(|c| c.name()).unwrap_or("none"),
            "🎭 Voice session started"
        );

        Arc::new(Self {
            gate: RecordingGate::new(Arc::clone(&services.store)),
            pipeline: TurnPipeline::new(services, TurnSettings::from_config(config)),
            endpoint: EndpointDetector::from_config(&config.endpoint),
            playback: PlaybackSerializer::new(connection, &config.playback),
            active_threshold: config.buffer.active_threshold(),
            id,
            buffer,
            frames,
            pump: Mutex::new(Some(pump)),
            channel,
            in_flight: Arc::new(DashSet::new()),
            last_gated: DashMap::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle for the receive path to push captured frames.
    pub fn frame_sender(&self) -> FrameSender {
        self.frames.clone()
    }

    pub fn buffer(&self) -> &Arc<AudioBuffer> {
        &self.buffer
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.playback.state()
    }

    /// Speakers heard within the activity threshold.
    pub fn active_speakers(&self) -> Vec<SpeakerId> {
        self.buffer.active_speakers(self.active_threshold)
    }

    /// Most recent transcript dropped for lacking the speaker's keyword.
    pub fn last_gated_transcript(&self, speaker: SpeakerId) -> Option<String> {
        self.last_gated.get(&speaker).map(|t| t.value().clone())
    }

    pub fn is_turn_running(&self, speaker: SpeakerId) -> bool {
        self.in_flight.contains(&speaker)
    }

    /// React to a speaker starting to talk.
    ///
    /// Consults the recording gate, drops audio buffered before this point,
    /// and spawns a turn. Returns `None` when recording is disabled for the
    /// speaker or a turn for them is already running.
    pub async fn on_voice_activity(
        self: &Arc<Self>,
        speaker: Speaker,
    ) -> Option<JoinHandle<VoiceResult<TurnOutcome>>> {
        let setting = self.gate.should_process(speaker.id).await;
        if !setting.enabled {
            self.buffer.set_enabled(speaker.id, false);
            debug!(speaker = speaker.id, "recording disabled, ignoring");
            return None;
        }
        self.buffer.set_enabled(speaker.id, true);

        let Some(claim) = InFlight::claim(&self.in_flight, speaker.id) else {
            debug!(speaker = speaker.id, "turn already running");
            return None;
        };
        self.buffer.clear(speaker.id);

        let session = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _claim = claim;
            session.listen_and_respond(&speaker, &setting).await
        }))
    }

    /// Run a full turn for `speaker` in the calling task, using audio already buffered.
    pub async fn run_turn(&self, speaker: &Speaker) -> VoiceResult<TurnOutcome> {
        let setting = self.gate.should_process(speaker.id).await;
        if !setting.enabled {
            self.buffer.set_enabled(speaker.id, false);
            return Ok(TurnOutcome::Aborted(AbortReason::RecordingDisabled));
        }
        self.buffer.set_enabled(speaker.id, true);

        let Some(_claim) = InFlight::claim(&self.in_flight, speaker.id) else {
            return Ok(TurnOutcome::Aborted(AbortReason::TurnInProgress));
        };
        self.listen_and_respond(speaker, &setting).await
    }

    async fn listen_and_respond(
        &self,
        speaker: &Speaker,
        setting: &RecordingSetting,
    ) -> VoiceResult<TurnOutcome> {
        info!(session = %self.id, speaker = speaker.id, "👂 Listening to {}", speaker.display_name);
        if let Some(channel) = &self.channel {
            let notice = format!("Listening to **{}**...", speaker.display_name);
            if let Err(e) = channel.send_text(&notice).await {
                warn!(channel = channel.name(), error = %e, "listening notice not posted");
            }
        }

        if let Endpoint::TimedOut { waited } = self
            .endpoint
            .wait_for_utterance(&self.buffer, speaker.id)
            .await
        {
            debug!(speaker = speaker.id, ?waited, "no utterance");
            return Ok(TurnOutcome::Aborted(AbortReason::EndpointTimeout));
        }

        let outcome = self
            .pipeline
            .run(
                speaker,
                setting.keyword.as_deref(),
                &self.buffer,
                &self.playback,
                self.channel.as_ref(),
            )
            .await?;

        if let TurnOutcome::Aborted(AbortReason::KeywordMismatch { transcript }) = &outcome {
            self.last_gated.insert(speaker.id, transcript.clone());
        }
        Ok(outcome)
    }

    /// Stop playback, leave the voice channel and stop the frame pump.
    pub async fn disconnect(&self) -> VoiceResult<()> {
        self.playback.stop();
        let result = self.playback.connection().disconnect().await;

        let pump = self
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }
        self.buffer.clear_all();

        info!(session = %self.id, "👋 Voice session disconnected");
        result
    }
}

/// Live sessions keyed by guild (or device) id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<VoiceSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning the one it replaced (not disconnected).
    pub fn insert(&self, session: Arc<VoiceSession>) -> Option<Arc<VoiceSession>> {
        self.sessions.insert(session.id().to_string(), session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<VoiceSession>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Remove and disconnect a session. Returns false if no session had that id.
    pub async fn remove(&self, id: &str) -> VoiceResult<bool> {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.disconnect().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Disconnect every session, logging failures.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.ids();
        for id in ids {
            if let Err(e) = self.remove(&id).await {
                warn!(session = %id, error = %e, "disconnect failed");
            }
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
