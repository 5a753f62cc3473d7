//! Achievement definitions and unlock tracking.
//!
//! The engine owns the unlocked-id set. Every unlock is persisted through
//! the storage capability and announced to registered listeners. A failed
//! write is logged and kept as a pending [`SaveOutcome`]; the id stays
//! unlocked in memory, so memory can run ahead of storage until the next
//! successful write.

use crate::condition::{self, Condition};
use crate::persist::{SaveOutcome, Storage, UnlockedAchievements};
use crate::state::GameState;
use crate::story::DefinitionError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// An unlockable achievement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Achievement {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// A missing or malformed condition never matches.
    #[serde(default, deserialize_with = "condition::deserialize_lenient")]
    pub condition: Condition,
}

/// The achievement definitions file: `{"achievements": [...]}`.
///
/// Entries that are not achievements at all (no `id`, not an object) are
/// skipped with a warning instead of failing the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AchievementDefinitions {
    #[serde(default, deserialize_with = "skip_malformed")]
    pub achievements: Vec<Achievement>,
}

fn skip_malformed<'de, D>(deserializer: D) -> Result<Vec<Achievement>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value(entry) {
            Ok(achievement) => Some(achievement),
            Err(e) => {
                tracing::warn!(index, error = %e, "skipping malformed achievement definition");
                None
            }
        })
        .collect())
}

impl AchievementDefinitions {
    pub fn from_json_str(json: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&content)
    }
}

/// Kind of achievement notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AchievementEventKind {
    Unlock,
}

impl AchievementEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AchievementEventKind::Unlock => "unlock",
        }
    }
}

impl fmt::Display for AchievementEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listener callback, invoked with the event kind and achievement id.
pub type AchievementListener = Box<dyn Fn(AchievementEventKind, &str) + Send + Sync>;

/// Progress summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AchievementStats {
    pub total: usize,
    pub unlocked: usize,
    /// Rounded; 0 when there are no definitions.
    pub percentage: u32,
}

/// Tracks which achievements are unlocked and evaluates the rest.
pub struct AchievementEngine {
    definitions: Vec<Achievement>,
    unlocked: BTreeSet<String>,
    listeners: Vec<AchievementListener>,
    storage: Arc<dyn Storage>,
    persist_failure: Option<SaveOutcome>,
}

impl AchievementEngine {
    /// Create an engine with nothing unlocked.
    pub fn new(definitions: Vec<Achievement>, storage: Arc<dyn Storage>) -> Self {
        Self {
            definitions,
            unlocked: BTreeSet::new(),
            listeners: Vec::new(),
            storage,
            persist_failure: None,
        }
    }

    /// Create an engine and restore previously unlocked ids from storage.
    ///
    /// Unreadable progress is logged and treated as empty.
    pub fn load(definitions: Vec<Achievement>, storage: Arc<dyn Storage>) -> Self {
        let unlocked = match storage.load_achievements() {
            Ok(Some(saved)) => saved.unlocked.into_iter().collect(),
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load achievement progress");
                BTreeSet::new()
            }
        };

        Self {
            unlocked,
            ..Self::new(definitions, storage)
        }
    }

    /// Mark `ids` as already unlocked without persisting or notifying.
    pub fn with_unlocked<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unlocked.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn definitions(&self) -> &[Achievement] {
        &self.definitions
    }

    pub fn get(&self, id: &str) -> Option<&Achievement> {
        self.definitions.iter().find(|a| a.id == id)
    }

    pub fn is_unlocked(&self, id: &str) -> bool {
        self.unlocked.contains(id)
    }

    pub fn unlocked_ids(&self) -> impl Iterator<Item = &str> {
        self.unlocked.iter().map(String::as_str)
    }

    /// Register a listener. Listeners run in registration order.
    pub fn add_listener<F>(&mut self, listener: F)
    where
        F: Fn(AchievementEventKind, &str) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Evaluate every locked achievement against `state`, in definition order.
    ///
    /// Returns the achievements unlocked by this call.
    pub fn check_all(&mut self, state: &GameState) -> Vec<Achievement> {
        let matched: Vec<Achievement> = self
            .definitions
            .iter()
            .filter(|a| !self.unlocked.contains(&a.id))
            .filter(|a| a.condition.evaluate(state))
            .cloned()
            .collect();

        matched
            .into_iter()
            .filter(|achievement| self.unlock(&achievement.id))
            .collect()
    }

    /// Unlock `id`. Returns false, without persisting, if it was already unlocked.
    pub fn unlock(&mut self, id: &str) -> bool {
        if !self.unlocked.insert(id.to_string()) {
            return false;
        }

        tracing::info!(achievement = id, "achievement unlocked");

        match self.storage.save_achievements(&self.snapshot()) {
            Ok(()) => self.persist_failure = None,
            Err(e) => {
                tracing::warn!(achievement = id, error = %e, "failed to persist achievement unlock");
                self.persist_failure = Some(SaveOutcome::failed(format!("成就儲存失敗: {e}")));
            }
        }

        self.notify(AchievementEventKind::Unlock, id);
        true
    }

    /// The failure from the latest unlock write, if it failed. Cleared by
    /// taking it or by the next successful write.
    pub fn take_persist_failure(&mut self) -> Option<SaveOutcome> {
        self.persist_failure.take()
    }

    /// Clear all progress and persist the empty set.
    pub fn reset(&mut self) -> SaveOutcome {
        self.unlocked.clear();
        self.persist_failure = None;
        SaveOutcome::from_result(
            self.storage.save_achievements(&self.snapshot()),
            "成就已重置！",
            "成就重置失敗",
        )
    }

    pub fn stats(&self) -> AchievementStats {
        let total = self.definitions.len();
        let unlocked = self.unlocked.len();
        let percentage = if total > 0 {
            ((unlocked as f64 / total as f64) * 100.0).round() as u32
        } else {
            0
        };

        AchievementStats {
            total,
            unlocked,
            percentage,
        }
    }

    fn snapshot(&self) -> UnlockedAchievements {
        UnlockedAchievements {
            unlocked: self.unlocked.iter().cloned().collect(),
        }
    }

    fn notify(&self, kind: AchievementEventKind, id: &str) {
        for listener in &self.listeners {
            listener(kind, id);
        }
    }
}

impl fmt::Debug for AchievementEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AchievementEngine")
            .field("definitions", &self.definitions.len())
            .field("unlocked", &self.unlocked)
            .field("listeners", &self.listeners.len())
            .field("persist_failure", &self.persist_failure)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Operator;
    use crate::persist::MemoryStore;
    use crate::testing::FailingStore;
    use std::sync::Mutex;

    const DEFINITIONS: &str = r#"{
        "achievements": [
            {"id": "first_steps", "name": "First Steps", "description": "Finish a turn",
             "condition": {"type": "counter", "key": "turnCount", "value": 1}},
            {"id": "veteran", "name": "Veteran", "description": "Five turns",
             "condition": {"type": "counter", "key": "turnCount", "value": 5, "operator": "gte"}},
            {"id": "mystery", "name": "???", "description": "Unknown shape",
             "condition": {"type": "weather", "value": "rain"}},
            {"id": "no_condition", "name": "Nothing", "description": "No condition"}
        ]
    }"#;

    fn definitions() -> Vec<Achievement> {
        AchievementDefinitions::from_json_str(DEFINITIONS)
            .unwrap()
            .achievements
    }

    fn state_with_turns(turns: u32) -> GameState {
        let mut state = GameState::new();
        for i in 0..turns {
            state.record_passage(format!("passage {i}"));
        }
        state
    }

    #[test]
    fn test_check_all_unlocks_in_definition_order() {
        let storage = Arc::new(MemoryStore::new());
        let mut engine = AchievementEngine::new(definitions(), storage.clone());

        let unlocked = engine.check_all(&state_with_turns(6));
        let ids: Vec<_> = unlocked.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["first_steps", "veteran"]);

        let saved = storage.load_achievements().unwrap().unwrap();
        assert_eq!(saved.unlocked, vec!["first_steps", "veteran"]);
    }

    #[test]
    fn test_counter_achievement_fires_once() {
        let storage = Arc::new(MemoryStore::new());
        let mut engine = AchievementEngine::new(definitions(), storage);

        for turns in 0..5 {
            let unlocked = engine.check_all(&state_with_turns(turns));
            assert!(unlocked.iter().all(|a| a.id != "veteran"));
        }

        let unlocked = engine.check_all(&state_with_turns(5));
        assert!(unlocked.iter().any(|a| a.id == "veteran"));

        for turns in 5..9 {
            assert!(engine.check_all(&state_with_turns(turns)).is_empty());
        }
    }

    #[test]
    fn test_unlock_is_idempotent_and_skips_persistence() {
        let storage = Arc::new(MemoryStore::new());
        let mut engine = AchievementEngine::new(definitions(), storage.clone());

        assert!(engine.unlock("veteran"));
        storage.remove(crate::persist::ACHIEVEMENTS_KEY).unwrap();

        assert!(!engine.unlock("veteran"));
        assert!(storage.load_achievements().unwrap().is_none());
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut engine = AchievementEngine::new(definitions(), Arc::new(MemoryStore::new()));

        for name in ["first", "second"] {
            let log = log.clone();
            engine.add_listener(move |kind, id| {
                log.lock().unwrap().push(format!("{name}:{kind}:{id}"));
            });
        }

        engine.unlock("first_steps");
        engine.unlock("first_steps");

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:unlock:first_steps", "second:unlock:first_steps"]
        );
    }

    #[test]
    fn test_persistence_failure_keeps_unlock_in_memory() {
        let mut engine = AchievementEngine::new(definitions(), Arc::new(FailingStore));

        let unlocked = engine.check_all(&state_with_turns(1));
        assert_eq!(unlocked.len(), 1);
        assert!(engine.is_unlocked("first_steps"));

        let failure = engine.take_persist_failure().unwrap();
        assert!(!failure.success);
        assert!(failure.message.starts_with("成就儲存失敗: "));
        assert!(engine.take_persist_failure().is_none());

        let outcome = engine.reset();
        assert!(!outcome.success);
        assert!(!engine.is_unlocked("first_steps"));
    }

    #[test]
    fn test_load_restores_progress_and_reset_clears_it() {
        let storage = Arc::new(MemoryStore::new());
        storage
            .save_achievements(&UnlockedAchievements {
                unlocked: vec!["first_steps".to_string()],
            })
            .unwrap();

        let mut engine = AchievementEngine::load(definitions(), storage.clone());
        assert!(engine.is_unlocked("first_steps"));
        assert!(engine.check_all(&state_with_turns(1)).is_empty());

        assert!(engine.reset().success);
        assert_eq!(engine.unlocked_ids().count(), 0);
        assert_eq!(
            storage.load_achievements().unwrap(),
            Some(UnlockedAchievements::default())
        );
    }

    #[test]
    fn test_stats() {
        let mut engine = AchievementEngine::new(definitions(), Arc::new(MemoryStore::new()));
        assert_eq!(engine.stats().percentage, 0);

        engine.unlock("first_steps");
        let stats = engine.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.unlocked, 1);
        assert_eq!(stats.percentage, 25);

        let empty = AchievementEngine::new(Vec::new(), Arc::new(MemoryStore::new()));
        assert_eq!(empty.stats().percentage, 0);
    }

    #[test]
    fn test_malformed_conditions_do_not_block_scan() {
        let mut defs = definitions();
        defs.insert(
            0,
            Achievement {
                id: "broken".to_string(),
                name: "Broken".to_string(),
                description: String::new(),
                condition: Condition::counter("turnCount", Operator::Unknown, 0.0),
            },
        );
        let mut engine = AchievementEngine::new(defs, Arc::new(MemoryStore::new()));

        let unlocked = engine.check_all(&state_with_turns(1));
        let ids: Vec<_> = unlocked.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["first_steps"]);
    }

    #[test]
    fn test_bad_definitions_do_not_reject_the_file() {
        let json = r#"{
            "achievements": [
                {"id": "first_steps", "condition": {"type": "counter", "key": "turnCount", "value": 1}},
                {"id": "stringly", "condition": {"type": "counter", "key": "turnCount", "value": "5"}},
                {"id": "keyless", "condition": {"type": "flag"}},
                {"name": "no id at all"},
                42
            ]
        }"#;

        let defs = AchievementDefinitions::from_json_str(json).unwrap().achievements;
        let ids: Vec<_> = defs.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["first_steps", "stringly", "keyless"]);
        assert_eq!(defs[1].condition, Condition::Unknown);
        assert_eq!(defs[2].condition, Condition::Unknown);

        let mut engine = AchievementEngine::new(defs, Arc::new(MemoryStore::new()));
        let unlocked = engine.check_all(&state_with_turns(10));
        let ids: Vec<_> = unlocked.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["first_steps"]);
    }
}
