//! Parley daemon
//!
//! Runs voice turns outside a chat platform, and exposes the store's admin
//! operations.
//!
//! ```text
//! parley-daemon [--speaker ID] [--name NAME] FILE.wav...   answer each file as one utterance
//! parley-daemon --mic [--speaker ID] [--name NAME]         live microphone (feature `local-audio`)
//! parley-daemon stats | users | user ID | reset ID | clear ID | prune DAYS
//! parley-daemon default-prompt [TEXT]
//! parley-daemon recording ID on [KEYWORD] | recording ID off
//! parley-daemon prompt ID [TEXT]
//! ```

use anyhow::{anyhow, bail, Context};
use parley_core::{CaptureConfig, ConversationStore, ParleyConfig, UserId};
use parley_voice::{
    synthesizer_from_config, AudioFrame, CapturedFrame, ChatResponder, DiscordTextChannel,
    FileSinkConnection, LogChannel, NotificationChannel, SledSettings, Speaker, TurnOutcome,
    TurnServices, VoiceSession, WhisperTranscriber,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Where the file sink copies played replies.
const DEFAULT_OUTBOX: &str = "./data/outbox";

/// Frames cut from input WAV files are 20 ms long, like live capture.
const FRAME_MS: u32 = 20;

#[derive(Debug, PartialEq)]
enum Command {
    Files { paths: Vec<PathBuf>, speaker: Speaker },
    Mic { speaker: Speaker },
    Stats,
    Users,
    User(UserId),
    Reset(UserId),
    Clear(UserId),
    Prune(i64),
    DefaultPrompt(Option<String>),
    /// Turn recording on (optionally keyword-gated) or off for one user.
    Recording {
        user: UserId,
        enabled: bool,
        keyword: Option<String>,
    },
    /// Show (`None`) or set a user's system prompt.
    Prompt {
        user: UserId,
        text: Option<String>,
    },
}

fn parse_id(value: Option<String>, what: &str) -> anyhow::Result<u64> {
    let value = value.ok_or_else(|| anyhow!("{} requires a value", what))?;
    value
        .parse()
        .with_context(|| format!("{} must be a number, got {:?}", what, value))
}

/// Remaining words joined by spaces, or `None` if there are none.
fn rest_text(args: impl Iterator<Item = String>) -> Option<String> {
    let words: Vec<String> = args.collect();
    (!words.is_empty()).then(|| words.join(" "))
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Command> {
    let mut args = args.into_iter().peekable();
    let first = args.peek().cloned();

    match first.as_deref() {
        Some("stats") => return Ok(Command::Stats),
        Some("users") => return Ok(Command::Users),
        Some("user") => {
            args.next();
            return Ok(Command::User(parse_id(args.next(), "user")?));
        }
        Some("reset") => {
            args.next();
            return Ok(Command::Reset(parse_id(args.next(), "reset")?));
        }
        Some("clear") => {
            args.next();
            return Ok(Command::Clear(parse_id(args.next(), "clear")?));
        }
        Some("prune") => {
            args.next();
            let days = parse_id(args.next(), "prune")?;
            return Ok(Command::Prune(i64::try_from(days)?));
        }
        Some("default-prompt") => {
            args.next();
            return Ok(Command::DefaultPrompt(rest_text(args)));
        }
        Some("recording") => {
            args.next();
            let user = parse_id(args.next(), "recording")?;
            return match args.next().as_deref() {
                Some("on") => Ok(Command::Recording {
                    user,
                    enabled: true,
                    keyword: rest_text(args),
                }),
                Some("off") if args.peek().is_none() => Ok(Command::Recording {
                    user,
                    enabled: false,
                    keyword: None,
                }),
                Some("off") => bail!("recording off takes no keyword"),
                _ => bail!("usage: recording ID on [KEYWORD] | recording ID off"),
            };
        }
        Some("prompt") => {
            args.next();
            let user = parse_id(args.next(), "prompt")?;
            return Ok(Command::Prompt {
                user,
                text: rest_text(args),
            });
        }
        _ => {}
    }

    let mut speaker = Speaker::new(1, "local");
    let mut mic = false;
    let mut paths = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mic" => mic = true,
            "--speaker" => speaker.id = parse_id(args.next(), "--speaker")?,
            "--name" => {
                speaker.display_name = args
                    .next()
                    .ok_or_else(|| anyhow!("--name requires a value"))?
            }
            flag if flag.starts_with("--") => bail!("unknown flag {}", flag),
            _ => paths.push(PathBuf::from(arg)),
        }
    }

    match (mic, paths.is_empty()) {
        (true, true) => Ok(Command::Mic { speaker }),
        (true, false) => bail!("--mic does not take input files"),
        (false, true) => bail!("nothing to do: pass WAV files, --mic, or an admin command"),
        (false, false) => Ok(Command::Files { paths, speaker }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[parley-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let command = parse_args(std::env::args().skip(1))?;
    let config = ParleyConfig::load().context("load ParleyConfig")?;
    let store = ConversationStore::open_path(&config.storage_path)
        .with_context(|| format!("open store at {}", config.storage_path))?;

    match command {
        Command::Files { paths, speaker } => run_files(&config, store, &paths, &speaker).await,
        Command::Mic { speaker } => run_mic(&config, store, speaker).await,
        admin => run_admin(&config, &store, admin),
    }
}

fn build_services(config: &ParleyConfig, store: ConversationStore) -> anyhow::Result<TurnServices> {
    Ok(TurnServices {
        transcriber: Arc::new(WhisperTranscriber::from_config(&config.stt)?),
        responder: Arc::new(ChatResponder::from_config(&config.llm)?),
        synthesizer: synthesizer_from_config(&config.tts)?,
        store: Arc::new(SledSettings::new(store, config.default_system_prompt.clone())),
    })
}

fn build_channel(config: &ParleyConfig) -> Arc<dyn NotificationChannel> {
    match DiscordTextChannel::from_config(&config.discord) {
        Some(channel) => {
            tracing::info!(channel_id = channel.channel_id(), "Posting to Discord text channel");
            Arc::new(channel)
        }
        None => Arc::new(LogChannel),
    }
}

/// Decode a WAV file into 16-bit frames plus the format they are in.
fn load_wav_frames(path: &Path) -> anyhow::Result<(CaptureConfig, Vec<AudioFrame>)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("open {}", path.display()))?;
    let spec = reader.spec();

    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader.samples::<i16>().collect::<Result<_, _>>()?,
        (hound::SampleFormat::Int, bits) => {
            let shift = i32::from(bits).saturating_sub(16);
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| if shift >= 0 { (v >> shift) as i16 } else { (v << -shift) as i16 }))
                .collect::<Result<_, _>>()?
        }
        (hound::SampleFormat::Float, _) => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<Result<_, _>>()?,
    };

    let frame_len =
        (spec.sample_rate * FRAME_MS / 1000) as usize * usize::from(spec.channels.max(1));
    let frames = samples
        .chunks(frame_len.max(1))
        .map(AudioFrame::from_samples)
        .collect();

    let format = CaptureConfig {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        ..CaptureConfig::default()
    };
    Ok((format, frames))
}

async fn run_files(
    config: &ParleyConfig,
    store: ConversationStore,
    paths: &[PathBuf],
    speaker: &Speaker,
) -> anyhow::Result<()> {
    let services = build_services(config, store)?;
    let channel = build_channel(config);
    let outbox = std::env::var("PARLEY_OUTBOX").unwrap_or_else(|_| DEFAULT_OUTBOX.to_string());

    tracing::info!(files = paths.len(), outbox = %outbox, "Parley daemon started (file mode)");

    let mut played = 0;
    for (index, path) in paths.iter().enumerate() {
        let (format, frames) = load_wav_frames(path)?;
        tracing::info!(file = %path.display(), frames = frames.len(), "Feeding utterance");

        // Each file keeps its own sample format.
        let mut file_config = config.clone();
        file_config.capture = format;
        let connection = Arc::new(FileSinkConnection::new(&outbox)?);
        let session = VoiceSession::new(
            format!("file-{}", index),
            &file_config,
            services.clone(),
            connection.clone(),
            Some(Arc::clone(&channel)),
        );

        let outcome = answer_utterance(&session, frames, speaker).await?;
        played += connection.played().len();
        match outcome {
            TurnOutcome::Replied(report) => {
                println!("{}: {}", speaker.display_name, report.utterance);
                println!("AI: {}", report.reply);
            }
            TurnOutcome::Aborted(reason) => println!("{}: no reply ({})", path.display(), reason),
        }
    }

    tracing::info!(played, "Parley daemon finished");
    Ok(())
}

/// Feed one utterance into `session`, run its turn, then disconnect the session.
async fn answer_utterance(
    session: &VoiceSession,
    frames: Vec<AudioFrame>,
    speaker: &Speaker,
) -> anyhow::Result<TurnOutcome> {
    let sender = session.frame_sender();
    for frame in frames {
        sender.send(CapturedFrame::new(speaker.id, frame));
    }

    let outcome = session.run_turn(speaker).await;
    session.disconnect().await?;
    Ok(outcome?)
}

#[cfg(feature = "local-audio")]
async fn run_mic(config: &ParleyConfig, store: ConversationStore, speaker: Speaker) -> anyhow::Result<()> {
    use parley_voice::{LocalSpeakerConnection, MicCapture, SessionRegistry};

    let services = build_services(config, store)?;
    let connection = Arc::new(LocalSpeakerConnection::open()?);
    let registry = SessionRegistry::new();
    let session = VoiceSession::new("local", config, services, connection, Some(build_channel(config)));
    registry.insert(Arc::clone(&session));
    let _mic = MicCapture::start(speaker.id, session.frame_sender(), &config.capture)?;

    tracing::info!(speaker = speaker.id, "Parley daemon started (microphone mode)");

    loop {
        tokio::select! {
            result = session.run_turn(&speaker) => match result {
                Ok(TurnOutcome::Replied(report)) => {
                    println!("{}: {}", speaker.display_name, report.utterance);
                    println!("AI: {}", report.reply);
                }
                Ok(TurnOutcome::Aborted(reason)) => tracing::debug!(%reason, "no reply"),
                Err(e) => {
                    tracing::error!(error = %e, "voice connection lost");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down daemon");
                break;
            }
        }
    }

    registry.shutdown().await;
    Ok(())
}

#[cfg(not(feature = "local-audio"))]
async fn run_mic(_config: &ParleyConfig, _store: ConversationStore, _speaker: Speaker) -> anyhow::Result<()> {
    bail!("--mic needs a build with `--features local-audio`")
}

fn run_admin(config: &ParleyConfig, store: &ConversationStore, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Stats => {
            let stats = store.stats()?;
            println!("history entries:    {}", stats.history_count);
            println!("users with history: {}", stats.unique_users);
            println!("custom prompts:     {}", stats.prompt_count);
            println!("recording settings: {}", stats.recording_settings_count);
            if let (Some(oldest), Some(newest)) = (stats.oldest_message, stats.newest_message) {
                println!("oldest / newest:    {} / {}", oldest, newest);
            }
        }
        Command::Users => {
            for user in store.users()? {
                let s = store.user_summary(user)?;
                println!(
                    "{}\tmessages={}\trecording={}\tkeyword={}\tcustom_prompt={}",
                    s.user_id,
                    s.message_count,
                    s.recording_enabled,
                    s.keyword.as_deref().unwrap_or("-"),
                    s.has_custom_prompt
                );
            }
        }
        Command::User(user) => {
            let s = store.user_summary(user)?;
            println!("{:#?}", s);
            for entry in store.history(user, config.history_limit)? {
                println!("[{}] {}: {}", entry.timestamp, entry.role.as_str(), entry.content);
            }
        }
        Command::Reset(user) => {
            store.reset_user(user)?;
            println!("user {} reset", user);
        }
        Command::Clear(user) => {
            println!("removed {} messages", store.clear_history(user)?);
        }
        Command::Prune(days) => {
            println!("removed {} messages older than {} days", store.prune_history(days)?, days);
        }
        Command::DefaultPrompt(Some(prompt)) => {
            store.set_default_prompt(&prompt)?;
            println!("default prompt updated");
        }
        Command::DefaultPrompt(None) => {
            let prompt = store.default_prompt()?;
            println!("{}", prompt.as_deref().unwrap_or(&config.default_system_prompt));
        }
        Command::Recording {
            user,
            enabled,
            keyword,
        } => {
            let setting = store.set_recording_setting(user, enabled, keyword.as_deref())?;
            match (setting.enabled, setting.keyword) {
                (false, _) => println!("recording off for {}", user),
                (true, Some(keyword)) => {
                    println!("recording on for {} (keyword {:?})", user, keyword)
                }
                (true, None) => println!("recording on for {}", user),
            }
        }
        Command::Prompt {
            user,
            text: Some(prompt),
        } => {
            store.set_user_prompt(user, &prompt)?;
            println!("prompt for {} updated", user);
        }
        Command::Prompt { user, text: None } => {
            println!(
                "{}",
                store.effective_prompt(user, &config.default_system_prompt)?
            );
        }
        Command::Files { .. } | Command::Mic { .. } => bail!("not an admin command"),
    }
    store.flush()?;
    Ok(())
}
