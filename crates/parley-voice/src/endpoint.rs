//! Endpoint detection
//!
//! Decides when a speaker's utterance is ready to be processed. The detector
//! polls the speaker's buffer at a fixed interval; once any frame shows up it
//! allows a short grace period for the rest of the sentence to arrive and
//! then reports the utterance as ready. If nothing arrives within the
//! maximum wait it gives up.
//!
//! ```text
//!  WaitingForAudio ──frames──▶ Accumulating ──grace──▶ Ready
//!        │
//!        └──max wait elapsed──▶ TimedOut
//! ```

use crate::buffer::{AudioBuffer, SpeakerId};
use parley_core::EndpointConfig;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Detector state while waiting on one speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    WaitingForAudio,
    Accumulating,
    Ready,
    TimedOut,
}

/// Result of waiting for an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Audio arrived and the grace period has passed.
    Ready { waited: Duration },
    /// No audio arrived before the maximum wait.
    TimedOut { waited: Duration },
}

impl Endpoint {
    pub fn is_ready(&self) -> bool {
        matches!(self, Endpoint::Ready { .. })
    }
}

/// Polling endpoint detector.
#[derive(Debug, Clone)]
pub struct EndpointDetector {
    poll_interval: Duration,
    max_wait: Duration,
    grace: Duration,
}

impl EndpointDetector {
    pub fn new(poll_interval: Duration, max_wait: Duration, grace: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            max_wait,
            grace,
        }
    }

    pub fn from_config(config: &EndpointConfig) -> Self {
        Self::new(config.poll_interval(), config.max_wait(), config.grace())
    }

    /// Wait until `speaker` has an utterance ready, or time out.
    ///
    /// The buffer is only observed, never cleared; the caller snapshots it
    /// once this returns `Ready`.
    pub async fn wait_for_utterance(&self, buffer: &AudioBuffer, speaker: SpeakerId) -> Endpoint {
        let started = Instant::now();
        let mut state = EndpointState::WaitingForAudio;

        loop {
            state = match state {
                EndpointState::WaitingForAudio => {
                    if !buffer.is_empty(speaker) {
                        debug!(speaker, frames = buffer.len(speaker), "audio arrived");
                        EndpointState::Accumulating
                    } else if started.elapsed() >= self.max_wait {
                        EndpointState::TimedOut
                    } else {
                        sleep(self.poll_interval).await;
                        EndpointState::WaitingForAudio
                    }
                }
                EndpointState::Accumulating => {
                    sleep(self.grace).await;
                    EndpointState::Ready
                }
                EndpointState::Ready => {
                    return Endpoint::Ready {
                        waited: started.elapsed(),
                    }
                }
                EndpointState::TimedOut => {
                    debug!(speaker, "no audio before max wait");
                    return Endpoint::TimedOut {
                        waited: started.elapsed(),
                    };
                }
            };
        }
    }
}

impl Default for EndpointDetector {
    fn default() -> Self {
        Self::from_config(&EndpointConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AudioFrame, CapturedFrame};
    use std::sync::Arc;

    fn detector() -> EndpointDetector {
        EndpointDetector::new(
            Duration::from_millis(500),
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_audio() {
        let buffer = AudioBuffer::new(10);
        let endpoint = detector().wait_for_utterance(&buffer, 1).await;

        match endpoint {
            Endpoint::TimedOut { waited } => assert_eq!(waited, Duration::from_secs(10)),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_grace_when_audio_present() {
        let buffer = AudioBuffer::new(10);
        buffer.append(CapturedFrame::new(1, AudioFrame(vec![0; 4])));

        let endpoint = detector().wait_for_utterance(&buffer, 1).await;
        assert_eq!(
            endpoint,
            Endpoint::Ready {
                waited: Duration::from_secs(1)
            }
        );
        assert_eq!(buffer.len(1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_audio_is_picked_up_on_next_poll() {
        let buffer = Arc::new(AudioBuffer::new(10));
        let writer = Arc::clone(&buffer);
        tokio::spawn(async move {
            sleep(Duration::from_millis(1200)).await;
            writer.append(CapturedFrame::new(5, AudioFrame(vec![1; 4])));
        });

        let endpoint = detector().wait_for_utterance(&buffer, 5).await;
        // Seen at the 1.5s poll, then one second of grace.
        assert_eq!(
            endpoint,
            Endpoint::Ready {
                waited: Duration::from_millis(2500)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_speakers_do_not_count() {
        let buffer = AudioBuffer::new(10);
        buffer.append(CapturedFrame::new(2, AudioFrame(vec![0; 4])));
        assert!(!detector().wait_for_utterance(&buffer, 1).await.is_ready());
    }
}
