//! Filler phrases while the reply is being generated
//!
//! A cushion task posts a short random phrase ("Let me think...") to the
//! text channel, then every `interval` until it is cancelled. Cancellation
//! interrupts the wait immediately, so the task never outlives the work it
//! covers by more than one in-flight send.

use crate::notify::NotificationChannel;
use parley_core::CushionConfig;
use rand::seq::SliceRandom;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle to a running filler task.
///
/// Dropping the handle cancels the task; [`CushionTask::finish`] also waits
/// for it and returns the phrases that were posted.
pub struct CushionTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<Vec<String>>>,
}

impl CushionTask {
    /// Start posting filler phrases to `channel`.
    pub fn spawn(
        channel: Arc<dyn NotificationChannel>,
        phrases: Vec<String>,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(channel, phrases, interval, cancel.clone()));
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub fn from_config(channel: Arc<dyn NotificationChannel>, config: &CushionConfig) -> Self {
        Self::spawn(channel, config.phrases_or_default(), config.interval())
    }

    /// Signal the task to stop without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the task, wait for it to end, and return the phrases it posted.
    pub async fn finish(mut self) -> Vec<String> {
        self.cancel.cancel();
        let Some(handle) = self.handle.take() else {
            return Vec::new();
        };
        match handle.await {
            Ok(sent) => sent,
            Err(e) => {
                warn!(error = %e, "cushion task did not finish cleanly");
                Vec::new()
            }
        }
    }
}

impl Drop for CushionTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    channel: Arc<dyn NotificationChannel>,
    phrases: Vec<String>,
    interval: Duration,
    cancel: CancellationToken,
) -> Vec<String> {
    let mut sent = Vec::new();
    if phrases.is_empty() {
        return sent;
    }

    while !cancel.is_cancelled() {
        let phrase = pick_phrase(&phrases);
        match channel.send_text(&phrase).await {
            Ok(()) => {
                debug!(%phrase, "filler posted");
                sent.push(phrase);
            }
            Err(e) => warn!(channel = channel.name(), error = %e, "filler not delivered"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }
    sent
}

fn pick_phrase(phrases: &[String]) -> String {
    phrases
        .choose(&mut rand::thread_rng())
        .cloned()
        .unwrap_or_default()
}

/// Run `work` with a filler task posting to `channel` (if any).
///
/// The filler is cancelled and joined as soon as `work` completes, whatever
/// it returned. Yields the work's output plus the phrases posted meanwhile.
pub async fn with_cushion<F>(
    channel: Option<Arc<dyn NotificationChannel>>,
    config: &CushionConfig,
    work: F,
) -> (F::Output, Vec<String>)
where
    F: Future,
{
    let cushion = channel.map(|channel| CushionTask::from_config(channel, config));
    let output = work.await;
    let sent = match cushion {
        Some(task) => task.finish().await,
        None => Vec::new(),
    };
    (output, sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoiceResult;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        texts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationChannel for Recorder {
        async fn send_text(&self, text: &str) -> VoiceResult<()> {
            self.texts.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_file(&self, _: &Path, _: Option<&str>) -> VoiceResult<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    fn phrases() -> Vec<String> {
        vec!["hmm".to_string(), "one moment".to_string()]
    }

    #[tokio::test(start_paused = true)]
    async fn test_posts_until_cancelled() {
        let recorder = Arc::new(Recorder::default());
        let task = CushionTask::spawn(recorder.clone(), phrases(), Duration::from_secs(3));

        // Emissions at t=0, 3, 6.
        sleep(Duration::from_millis(7000)).await;
        let sent = task.finish().await;

        assert_eq!(sent.len(), 3);
        assert_eq!(*recorder.texts.lock().unwrap(), sent);
        assert!(sent.iter().all(|p| phrases().contains(p)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_emission_terminates() {
        let recorder = Arc::new(Recorder::default());
        let task = CushionTask::spawn(recorder.clone(), phrases(), Duration::from_secs(3));
        task.cancel();

        let sent = task.finish().await;
        assert!(sent.is_empty());
        assert!(recorder.texts.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_cushion_stops_when_work_fails() {
        let recorder = Arc::new(Recorder::default());
        let config = CushionConfig {
            interval_ms: 3000,
            phrases: phrases(),
        };
        let channel: Arc<dyn NotificationChannel> = recorder.clone();

        let (result, sent) = with_cushion(Some(channel), &config, async {
            sleep(Duration::from_millis(4000)).await;
            Err::<(), &str>("upstream down")
        })
        .await;

        assert!(result.is_err());
        assert_eq!(sent.len(), 2);

        // Nothing more arrives after the work has finished.
        sleep(Duration::from_secs(10)).await;
        assert_eq!(recorder.texts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_with_cushion_without_channel() {
        let (value, sent) = with_cushion(None, &CushionConfig::default(), async { 7 }).await;
        assert_eq!(value, 7);
        assert!(sent.is_empty());
    }
}
