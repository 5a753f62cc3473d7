//! Save/load of game progress, settings, and achievement progress.
//!
//! The core only sees the [`Storage`] capability: a small key-value
//! interface with typed helpers layered on top. Two backends ship with the
//! crate, an in-process [`MemoryStore`] and a directory-backed [`FileStore`].

use crate::config::Settings;
use crate::state::GameState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

/// Key for the saved game.
pub const SAVE_KEY: &str = "rpg_game_save";

/// Key for user settings.
pub const SETTINGS_KEY: &str = "rpg_game_settings";

/// Key for the unlocked achievement ids.
pub const ACHIEVEMENTS_KEY: &str = "rpg_game_achievements";

/// Current save format version.
const SAVE_VERSION: u32 = 1;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error(
        "Inconsistent save: turnCount {turn_count} with {passages} passages, \
         choiceCount {choice_count} with {choices} choices"
    )]
    Inconsistent {
        turn_count: u32,
        passages: usize,
        choice_count: u32,
        choices: usize,
    },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Structured result of a user-facing persistence action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveOutcome {
    pub success: bool,
    pub message: String,
}

impl SaveOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    /// Convert a persistence result, logging failures.
    pub fn from_result(
        result: Result<(), PersistError>,
        success_message: &str,
        failure_prefix: &str,
    ) -> Self {
        match result {
            Ok(()) => Self::ok(success_message),
            Err(e) => {
                tracing::warn!(error = %e, "{failure_prefix}");
                Self::failed(format!("{failure_prefix}: {e}"))
            }
        }
    }
}

/// On-disk envelope for a saved game.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedGame {
    /// Save format version for compatibility checking.
    pub version: u32,

    /// When the save was created (RFC 3339).
    pub timestamp: String,

    pub game_state: GameState,
}

impl SavedGame {
    pub fn new(game_state: GameState) -> Self {
        Self {
            version: SAVE_VERSION,
            timestamp: chrono::Utc::now().to_rfc3339(),
            game_state,
        }
    }

    pub fn info(&self) -> SaveInfo {
        SaveInfo {
            timestamp: self.timestamp.clone(),
            turn_count: self.game_state.turn_count,
            choice_count: self.game_state.choice_count,
        }
    }
}

fn check_version(found: u32) -> Result<(), PersistError> {
    if found != SAVE_VERSION {
        return Err(PersistError::VersionMismatch {
            expected: SAVE_VERSION,
            found,
        });
    }
    Ok(())
}

/// Counters must agree with the recorded sequences.
fn check_consistent(state: &GameState) -> Result<(), PersistError> {
    if !state.is_consistent() {
        return Err(PersistError::Inconsistent {
            turn_count: state.turn_count,
            passages: state.history.len(),
            choice_count: state.choice_count,
            choices: state.choices.len(),
        });
    }
    Ok(())
}

/// Summary of a saved game, readable without restoring it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveInfo {
    pub timestamp: String,
    pub turn_count: u32,
    pub choice_count: u32,
}

/// Persisted achievement progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockedAchievements {
    #[serde(default)]
    pub unlocked: Vec<String>,
}

/// Key-value persistence capability.
///
/// Implementors provide raw string access; the typed operations are
/// provided on top. Calls are synchronous so they can run inside the
/// achievement scan without a suspension point.
pub trait Storage: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn read(&self, key: &str) -> Result<Option<String>, PersistError>;

    /// Store `value` under `key`, replacing any previous value.
    fn write(&self, key: &str, value: &str) -> Result<(), PersistError>;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), PersistError>;

    fn save_game(&self, state: &GameState) -> Result<(), PersistError> {
        let saved = SavedGame::new(state.clone());
        self.write(SAVE_KEY, &serde_json::to_string(&saved)?)
    }

    fn load_game(&self) -> Result<Option<GameState>, PersistError> {
        let Some(content) = self.read(SAVE_KEY)? else {
            return Ok(None);
        };
        let saved: SavedGame = serde_json::from_str(&content)?;
        check_version(saved.version)?;
        check_consistent(&saved.game_state)?;
        Ok(Some(saved.game_state))
    }

    fn has_save(&self) -> bool {
        matches!(self.read(SAVE_KEY), Ok(Some(_)))
    }

    /// Peek at the saved game's metadata.
    fn save_info(&self) -> Result<Option<SaveInfo>, PersistError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Partial {
            version: u32,
            timestamp: String,
            #[serde(default)]
            game_state: PartialState,
        }

        #[derive(Default, Deserialize)]
        #[serde(default, rename_all = "camelCase")]
        struct PartialState {
            turn_count: u32,
            choice_count: u32,
        }

        let Some(content) = self.read(SAVE_KEY)? else {
            return Ok(None);
        };
        let partial: Partial = serde_json::from_str(&content)?;
        check_version(partial.version)?;

        Ok(Some(SaveInfo {
            timestamp: partial.timestamp,
            turn_count: partial.game_state.turn_count,
            choice_count: partial.game_state.choice_count,
        }))
    }

    fn delete_save(&self) -> Result<(), PersistError> {
        self.remove(SAVE_KEY)
    }

    /// Stored settings, or the defaults when none are stored or they cannot be read.
    fn load_settings(&self) -> Settings {
        let stored = self
            .read(SETTINGS_KEY)
            .and_then(|content| match content {
                Some(content) => Ok(Some(serde_json::from_str::<Settings>(&content)?)),
                None => Ok(None),
            });

        match stored {
            Ok(Some(settings)) => settings,
            Ok(None) => Settings::default(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read settings, using defaults");
                Settings::default()
            }
        }
    }

    fn save_settings(&self, settings: &Settings) -> Result<(), PersistError> {
        self.write(SETTINGS_KEY, &serde_json::to_string(settings)?)
    }

    fn load_achievements(&self) -> Result<Option<UnlockedAchievements>, PersistError> {
        match self.read(ACHIEVEMENTS_KEY)? {
            Some(content) => Ok(Some(serde_json::from_str(&content)?)),
            None => Ok(None),
        }
    }

    fn save_achievements(&self, unlocked: &UnlockedAchievements) -> Result<(), PersistError> {
        self.write(ACHIEVEMENTS_KEY, &serde_json::to_string(unlocked)?)
    }

    /// Remove the saved game and achievement progress. Settings are kept.
    fn reset_all(&self) -> Result<(), PersistError> {
        self.remove(SAVE_KEY)?;
        self.remove(ACHIEVEMENTS_KEY)
    }
}

/// In-process storage backed by a map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> PersistError {
    PersistError::Unavailable("memory store lock poisoned".to_string())
}

impl Storage for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>, PersistError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), PersistError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.remove(key);
        Ok(())
    }
}

/// Storage that keeps one pretty-printed JSON file per key in a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Use `dir` for storage. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let sanitized = key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
            .collect::<String>();
        self.dir.join(format!("{sanitized}.json"))
    }
}

impl Storage for FileStore {
    fn read(&self, key: &str) -> Result<Option<String>, PersistError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), PersistError> {
        std::fs::create_dir_all(&self.dir)?;
        // Re-indent so the files stay readable by hand.
        let content = match serde_json::from_str::<serde_json::Value>(value) {
            Ok(json) => serde_json::to_string_pretty(&json)?,
            Err(_) => value.to_string(),
        };
        std::fs::write(self.path_for(key), content)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
