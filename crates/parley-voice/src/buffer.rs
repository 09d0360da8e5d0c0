//! Per-speaker audio buffering
//!
//! The receive path hands frames to a [`FrameSender`] and never waits on the
//! buffer. A pump task drains the channel into the shared [`AudioBuffer`],
//! where each speaker keeps a bounded queue of recent frames plus the time
//! of their last frame.

use dashmap::{DashMap, DashSet};
use parley_core::UserId;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Speakers are identified the same way as store rows.
pub type SpeakerId = UserId;

/// One chunk of decoded PCM (16-bit little-endian, interleaved).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame(pub Vec<u8>);

impl AudioFrame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode signed 16-bit samples as a frame.
    pub fn from_samples(samples: &[i16]) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        Self(bytes)
    }
}

/// A frame as delivered by the receive path, tagged with its sender.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub speaker: SpeakerId,
    pub is_bot: bool,
    pub frame: AudioFrame,
}

impl CapturedFrame {
    pub fn new(speaker: SpeakerId, frame: AudioFrame) -> Self {
        Self {
            speaker,
            is_bot: false,
            frame,
        }
    }

    /// A frame sent by a bot account (including ourselves). Never buffered.
    pub fn from_bot(speaker: SpeakerId, frame: AudioFrame) -> Self {
        Self {
            speaker,
            is_bot: true,
            frame,
        }
    }
}

struct SpeakerBuffer {
    frames: VecDeque<AudioFrame>,
    last_activity: Instant,
}

/// Bounded per-speaker frame store.
///
/// Safe to share between the pump task and turn tasks: every operation
/// locks only the shard holding that speaker.
pub struct AudioBuffer {
    capacity: usize,
    speakers: DashMap<SpeakerId, SpeakerBuffer>,
    disabled: DashSet<SpeakerId>,
    recording: AtomicBool,
}

impl AudioBuffer {
    /// Create a buffer that keeps at most `capacity` frames per speaker.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            speakers: DashMap::new(),
            disabled: DashSet::new(),
            recording: AtomicBool::new(true),
        }
    }

    /// Store a captured frame, evicting the speaker's oldest frame when full.
    ///
    /// Returns false when the frame was dropped (bot sender, recording
    /// paused, or speaker disabled).
    pub fn append(&self, captured: CapturedFrame) -> bool {
        if captured.is_bot
            || !self.recording.load(Ordering::Relaxed)
            || self.disabled.contains(&captured.speaker)
        {
            return false;
        }

        let now = Instant::now();
        let mut entry = self
            .speakers
            .entry(captured.speaker)
            .or_insert_with(|| SpeakerBuffer {
                frames: VecDeque::with_capacity(self.capacity.min(64)),
                last_activity: now,
            });

        if entry.frames.len() >= self.capacity {
            entry.frames.pop_front();
        }
        entry.frames.push_back(captured.frame);
        entry.last_activity = now;
        true
    }

    /// Copy of the speaker's frames in arrival order.
    pub fn read(&self, speaker: SpeakerId) -> Vec<AudioFrame> {
        self.speakers
            .get(&speaker)
            .map(|b| b.frames.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot and clear in one step, so frames arriving afterwards start a
    /// fresh utterance.
    pub fn take(&self, speaker: SpeakerId) -> Vec<AudioFrame> {
        self.speakers
            .get_mut(&speaker)
            .map(|mut b| b.frames.drain(..).collect())
            .unwrap_or_default()
    }

    /// Empty the speaker's frames. The activity timestamp is kept.
    pub fn clear(&self, speaker: SpeakerId) {
        if let Some(mut b) = self.speakers.get_mut(&speaker) {
            b.frames.clear();
        }
    }

    /// Number of frames currently held for the speaker.
    pub fn len(&self, speaker: SpeakerId) -> usize {
        self.speakers.get(&speaker).map(|b| b.frames.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, speaker: SpeakerId) -> bool {
        self.len(speaker) == 0
    }

    /// Speakers whose last frame arrived within `threshold` of now.
    pub fn active_speakers(&self, threshold: Duration) -> Vec<SpeakerId> {
        let now = Instant::now();
        let mut active: Vec<SpeakerId> = self
            .speakers
            .iter()
            .filter(|b| now.saturating_duration_since(b.last_activity) < threshold)
            .map(|b| *b.key())
            .collect();
        active.sort_unstable();
        active
    }

    /// Stop or resume buffering for one speaker. Disabling drops held frames.
    pub fn set_enabled(&self, speaker: SpeakerId, enabled: bool) {
        if enabled {
            self.disabled.remove(&speaker);
        } else {
            self.disabled.insert(speaker);
            self.clear(speaker);
        }
    }

    pub fn is_enabled(&self, speaker: SpeakerId) -> bool {
        !self.disabled.contains(&speaker)
    }

    /// Pause or resume buffering for everyone.
    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Relaxed);
    }

    /// Drop every speaker's frames and timestamps.
    pub fn clear_all(&self) {
        self.speakers.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Non-blocking handle for the receive path.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<CapturedFrame>,
}

impl FrameSender {
    /// Queue a frame for buffering. Returns false once the pump has stopped.
    pub fn send(&self, captured: CapturedFrame) -> bool {
        self.tx.send(captured).is_ok()
    }
}

/// Receiving half of [`frame_channel`].
pub type FrameReceiver = mpsc::UnboundedReceiver<CapturedFrame>;

/// Channel between the receive path and [`pump_frames`].
pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FrameSender { tx }, rx)
}

/// Drain captured frames into the buffer until every sender is dropped.
pub async fn pump_frames(buffer: Arc<AudioBuffer>, mut rx: FrameReceiver) {
    let mut stored: u64 = 0;
    while let Some(captured) = rx.recv().await {
        let speaker = captured.speaker;
        if buffer.append(captured) {
            stored += 1;
        } else {
            trace!(speaker, "frame dropped");
        }
    }
    debug!(stored, "frame pump stopped");
}
