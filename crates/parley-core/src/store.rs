//! Sled-backed store for per-user recording settings, system prompts and conversation history.
//!
//! | Tree | Key | Value (JSON) |
//! |------|-----|--------------|
//! | `recording_settings` | user id (u64 BE) | [`RecordingSetting`] |
//! | `system_prompts` | user id (u64 BE) | [`StoredPrompt`] |
//! | `history` | user id (u64 BE) ++ sequence (u64 BE) | [`HistoryEntry`] |
//! | `meta` | `default_prompt` | [`StoredPrompt`] |
//!
//! History keys sort by user and then by sled's monotonic id, so a prefix scan returns
//! one user's history oldest→newest.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

/// Chat platform user id.
pub type UserId = u64;

const RECORDING_TREE: &str = "recording_settings";
const PROMPT_TREE: &str = "system_prompts";
const HISTORY_TREE: &str = "history";
const META_TREE: &str = "meta";
const DEFAULT_PROMPT_KEY: &[u8] = b"default_prompt";

/// Per-user capture settings. Absent means enabled with no keyword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingSetting {
    pub enabled: bool,
    /// Replies are only produced when the transcript contains this keyword (case-insensitive).
    pub keyword: Option<String>,
}

impl Default for RecordingSetting {
    fn default() -> Self {
        Self {
            enabled: true,
            keyword: None,
        }
    }
}

/// Speaker of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPrompt {
    prompt: String,
    updated_at: DateTime<Utc>,
}

/// Per-user overview (admin listing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSummary {
    pub user_id: UserId,
    pub has_custom_prompt: bool,
    pub recording_enabled: bool,
    pub keyword: Option<String>,
    pub message_count: usize,
}

/// Whole-database counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub history_count: usize,
    pub unique_users: usize,
    pub prompt_count: usize,
    pub recording_settings_count: usize,
    pub oldest_message: Option<DateTime<Utc>>,
    pub newest_message: Option<DateTime<Utc>>,
}

/// Persistent settings/history store. Cheap to clone (sled handles are reference counted).
#[derive(Clone)]
pub struct ConversationStore {
    db: Db,
    recording: Tree,
    prompts: Tree,
    history: Tree,
    meta: Tree,
}

fn user_key(user: UserId) -> [u8; 8] {
    user.to_be_bytes()
}

fn history_key(user: UserId, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&user.to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn key_user(key: &[u8]) -> Option<UserId> {
    let head: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(head))
}

fn normalize_keyword(keyword: Option<&str>) -> Option<String> {
    keyword
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

impl ConversationStore {
    /// Opens or creates the store at `path`.
    pub fn open_path<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory store removed on drop.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        Ok(Self {
            recording: db.open_tree(RECORDING_TREE)?,
            prompts: db.open_tree(PROMPT_TREE)?,
            history: db.open_tree(HISTORY_TREE)?,
            meta: db.open_tree(META_TREE)?,
            db,
        })
    }

    // ---------------------------------------------------------------------
    // Recording settings
    // ---------------------------------------------------------------------

    /// Stored setting, if any.
    pub fn recording_setting(&self, user: UserId) -> StoreResult<Option<RecordingSetting>> {
        match self.recording.get(user_key(user))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Stored setting, persisting the default on first read.
    ///
    /// Returns `(setting, created)`; `created` is true only for the call that wrote the default.
    pub fn recording_setting_or_default(
        &self,
        user: UserId,
    ) -> StoreResult<(RecordingSetting, bool)> {
        if let Some(existing) = self.recording_setting(user)? {
            return Ok((existing, false));
        }
        let default = RecordingSetting::default();
        let bytes = serde_json::to_vec(&default)?;
        match self
            .recording
            .compare_and_swap(user_key(user), None as Option<&[u8]>, Some(bytes))?
        {
            Ok(()) => {
                debug!(user_id = user, "recording setting created with defaults");
                Ok((default, true))
            }
            // Another writer got there first; theirs wins.
            Err(cas) => match cas.current {
                Some(raw) => Ok((serde_json::from_slice(&raw)?, false)),
                None => Ok((default, false)),
            },
        }
    }

    /// Overwrite a user's setting. A blank keyword is stored as no keyword.
    pub fn set_recording_setting(
        &self,
        user: UserId,
        enabled: bool,
        keyword: Option<&str>,
    ) -> StoreResult<RecordingSetting> {
        let setting = RecordingSetting {
            enabled,
            keyword: normalize_keyword(keyword),
        };
        self.recording
            .insert(user_key(user), serde_json::to_vec(&setting)?)?;
        info!(user_id = user, enabled, keyword = ?setting.keyword, "recording setting updated");
        Ok(setting)
    }

    // ---------------------------------------------------------------------
    // History
    // ---------------------------------------------------------------------

    /// Append one message to a user's history.
    pub fn append_history(
        &self,
        user: UserId,
        role: Role,
        content: &str,
    ) -> StoreResult<HistoryEntry> {
        let entry = HistoryEntry {
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        let seq = self.db.generate_id()?;
        self.history
            .insert(history_key(user, seq), serde_json::to_vec(&entry)?)?;
        Ok(entry)
    }

    /// Most recent `limit` messages, oldest→newest.
    pub fn history(&self, user: UserId, limit: usize) -> StoreResult<Vec<HistoryEntry>> {
        let mut newest_first = Vec::new();
        for item in self.history.scan_prefix(user_key(user)).rev().take(limit) {
            let (_, raw) = item?;
            newest_first.push(serde_json::from_slice::<HistoryEntry>(&raw)?);
        }
        newest_first.reverse();
        Ok(newest_first)
    }

    /// Number of stored messages for a user.
    pub fn history_len(&self, user: UserId) -> StoreResult<usize> {
        let mut n = 0;
        for item in self.history.scan_prefix(user_key(user)) {
            item?;
            n += 1;
        }
        Ok(n)
    }

    /// Delete a user's history. Returns the number of removed messages.
    pub fn clear_history(&self, user: UserId) -> StoreResult<usize> {
        let mut removed = 0;
        for item in self.history.scan_prefix(user_key(user)) {
            let (key, _) = item?;
            self.history.remove(key)?;
            removed += 1;
        }
        info!(user_id = user, removed, "history cleared");
        Ok(removed)
    }

    /// Delete every message older than `days` days. Returns the number of removed messages.
    pub fn prune_history(&self, days: i64) -> StoreResult<usize> {
        if days <= 0 {
            return Err(StoreError::InvalidArgument(format!(
                "days must be at least 1, got {days}"
            )));
        }
        let cutoff = ChronoDuration::try_days(days)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or_else(|| {
                StoreError::InvalidArgument(format!("days out of range, got {days}"))
            })?;
        let mut removed = 0;
        for item in self.history.iter() {
            let (key, raw) = item?;
            let entry: HistoryEntry = serde_json::from_slice(&raw)?;
            if entry.timestamp < cutoff {
                self.history.remove(key)?;
                removed += 1;
            }
        }
        info!(days, removed, "history pruned");
        Ok(removed)
    }

    // ---------------------------------------------------------------------
    // System prompts
    // ---------------------------------------------------------------------

    pub fn set_user_prompt(&self, user: UserId, prompt: &str) -> StoreResult<()> {
        let stored = StoredPrompt {
            prompt: prompt.to_string(),
            updated_at: Utc::now(),
        };
        self.prompts
            .insert(user_key(user), serde_json::to_vec(&stored)?)?;
        Ok(())
    }

    pub fn user_prompt(&self, user: UserId) -> StoreResult<Option<String>> {
        match self.prompts.get(user_key(user))? {
            Some(raw) => Ok(Some(serde_json::from_slice::<StoredPrompt>(&raw)?.prompt)),
            None => Ok(None),
        }
    }

    pub fn clear_user_prompt(&self, user: UserId) -> StoreResult<bool> {
        Ok(self.prompts.remove(user_key(user))?.is_some())
    }

    /// Replace the stored default prompt (overrides the configured one).
    pub fn set_default_prompt(&self, prompt: &str) -> StoreResult<()> {
        let stored = StoredPrompt {
            prompt: prompt.to_string(),
            updated_at: Utc::now(),
        };
        self.meta
            .insert(DEFAULT_PROMPT_KEY, serde_json::to_vec(&stored)?)?;
        Ok(())
    }

    pub fn default_prompt(&self) -> StoreResult<Option<String>> {
        match self.meta.get(DEFAULT_PROMPT_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_slice::<StoredPrompt>(&raw)?.prompt)),
            None => Ok(None),
        }
    }

    /// User prompt, else stored default, else `fallback`.
    pub fn effective_prompt(&self, user: UserId, fallback: &str) -> StoreResult<String> {
        if let Some(p) = self.user_prompt(user)? {
            return Ok(p);
        }
        Ok(self
            .default_prompt()?
            .unwrap_or_else(|| fallback.to_string()))
    }

    // ---------------------------------------------------------------------
    // Administration
    // ---------------------------------------------------------------------

    /// Remove every row belonging to `user`.
    pub fn reset_user(&self, user: UserId) -> StoreResult<()> {
        self.clear_history(user)?;
        self.prompts.remove(user_key(user))?;
        self.recording.remove(user_key(user))?;
        info!(user_id = user, "user reset");
        Ok(())
    }

    /// Every user id with a setting, a prompt or history, ascending.
    pub fn users(&self) -> StoreResult<Vec<UserId>> {
        let mut ids = BTreeSet::new();
        for tree in [&self.recording, &self.prompts, &self.history] {
            for item in tree.iter() {
                let (key, _) = item?;
                let id = key_user(&key).ok_or_else(|| {
                    StoreError::Corrupt(String::from_utf8_lossy(&key).into_owned())
                })?;
                ids.insert(id);
            }
        }
        Ok(ids.into_iter().collect())
    }

    pub fn user_summary(&self, user: UserId) -> StoreResult<UserSummary> {
        let setting = self.recording_setting(user)?.unwrap_or_default();
        Ok(UserSummary {
            user_id: user,
            has_custom_prompt: self.prompts.contains_key(user_key(user))?,
            recording_enabled: setting.enabled,
            keyword: setting.keyword,
            message_count: self.history_len(user)?,
        })
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let mut stats = StoreStats {
            prompt_count: self.prompts.len(),
            recording_settings_count: self.recording.len(),
            ..Default::default()
        };
        let mut users = BTreeSet::new();
        for item in self.history.iter() {
            let (key, raw) = item?;
            let entry: HistoryEntry = serde_json::from_slice(&raw)?;
            stats.history_count += 1;
            if let Some(id) = key_user(&key) {
                users.insert(id);
            }
            stats.oldest_message = Some(match stats.oldest_message {
                Some(t) if t <= entry.timestamp => t,
                _ => entry.timestamp,
            });
            stats.newest_message = Some(match stats.newest_message {
                Some(t) if t >= entry.timestamp => t,
                _ => entry.timestamp,
            });
        }
        stats.unique_users = users.len();
        Ok(stats)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
