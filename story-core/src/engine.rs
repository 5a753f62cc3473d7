//! NarrativeEngine - one session of the branching story.
//!
//! The engine owns the live [`GameState`] and runs turns one at a time:
//! build the prompt, generate the passage (streamed or not), update the
//! state, detect the scene, scan achievements, and ask for the next choices.
//! Progress is reported to subscribers as [`TurnEvent`]s.

use crate::achievement::{Achievement, AchievementEngine, AchievementEventKind, AchievementStats};
use crate::choices::{default_choices, fallback_choices, parse_choices};
use crate::config::{EngineConfig, Settings};
use crate::model::StoryModel;
use crate::persist::{PersistError, SaveInfo, SaveOutcome, Storage};
use crate::prompt::{build_choices_prompt, build_story_prompt};
use crate::reader::read_response;
use crate::state::GameState;
use crate::story::StoryDefinition;
use ollama::{GenerateRequest, ModelInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

/// Passage used when a non-streaming call returns no text.
pub const EMPTY_PASSAGE: &str = "（無法生成回應）";

/// Errors from engine operations.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("A turn is already in progress")]
    Busy,

    #[error("Model error: {0}")]
    Transport(#[from] ollama::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] PersistError),
}

/// Progress notifications, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    LoadingStarted,
    /// A streamed fragment of the passage being generated.
    Token(String),
    SceneChanged { scene_id: String, image: String },
    AchievementUnlocked(Achievement),
    /// Unlocked achievements could not be written; memory is ahead of storage.
    PersistenceFailed(SaveOutcome),
    ChoicesReady(Vec<String>),
    /// The turn failed; the message is user-presentable.
    Error(String),
    LoadingFinished,
}

/// Result of a completed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub passage: String,
    /// Scene entered by this turn, if any.
    pub scene: Option<String>,
    pub unlocked: Vec<Achievement>,
    pub choices: Vec<String>,
    /// Set when the unlocks of this turn were not persisted.
    pub persist_failure: Option<SaveOutcome>,
}

/// Whether a passage or choice set is being generated. Exclusive
/// maintenance operations such as [`NarrativeEngine::reset_game`] reject
/// concurrent calls but leave the phase at `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Generating,
}

/// Result of probing the model server.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub success: bool,
    pub message: String,
    pub models: Vec<ModelInfo>,
}

/// A narrative session.
pub struct NarrativeEngine {
    story: StoryDefinition,
    model: RwLock<Arc<dyn StoryModel>>,
    storage: Arc<dyn Storage>,
    achievements: Mutex<AchievementEngine>,
    state: Mutex<GameState>,
    /// Single-flight flag, held by every mutating operation.
    busy: AtomicBool,
    /// Set only while a turn-like operation generates text.
    generating: AtomicBool,
    config: EngineConfig,
    subscribers: Vec<UnboundedSender<TurnEvent>>,
}

/// Holds the single-flight flag for the duration of an operation.
struct TurnGuard<'a> {
    engine: &'a NarrativeEngine,
    announce: bool,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if self.announce {
            self.engine.generating.store(false, Ordering::Release);
        }
        self.engine.busy.store(false, Ordering::Release);
        if self.announce {
            self.engine.emit(TurnEvent::LoadingFinished);
        }
    }
}

impl NarrativeEngine {
    /// Create an engine. Previously unlocked achievements are restored from `storage`.
    pub fn new(
        story: StoryDefinition,
        model: Arc<dyn StoryModel>,
        storage: Arc<dyn Storage>,
        achievements: Vec<Achievement>,
        config: EngineConfig,
    ) -> Self {
        let achievements = AchievementEngine::load(achievements, storage.clone());
        Self {
            story,
            model: RwLock::new(model),
            storage,
            achievements: Mutex::new(achievements),
            state: Mutex::new(GameState::new()),
            busy: AtomicBool::new(false),
            generating: AtomicBool::new(false),
            config,
            subscribers: Vec::new(),
        }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&mut self) -> UnboundedReceiver<TurnEvent> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    // ========================================================================
    // Turns
    // ========================================================================

    /// Play one turn with `choice`. An empty choice plays the opening turn
    /// when there is no history yet.
    ///
    /// Returns [`TurnError::Busy`] without side effects if a turn is running.
    pub async fn start_turn(&self, choice: &str) -> Result<TurnOutcome, TurnError> {
        let _guard = self.begin_turn()?;
        self.run_turn(choice).await
    }

    /// Reset to a fresh game in the start scene and play the opening turn.
    pub async fn new_game(&self) -> Result<TurnOutcome, TurnError> {
        let _guard = self.begin_turn()?;
        *self.state.lock().await = GameState::new_game();
        self.run_turn("").await
    }

    /// Ask for a new set of choices for the current passage.
    pub async fn refresh_choices(&self) -> Result<Vec<String>, TurnError> {
        let _guard = self.begin_turn()?;
        let current_story = self.state.lock().await.current_story.clone();

        let choices = self.generate_choices(&current_story).await;
        self.emit(TurnEvent::ChoicesReady(choices.clone()));
        Ok(choices)
    }

    async fn run_turn(&self, choice: &str) -> Result<TurnOutcome, TurnError> {
        tracing::info!(choice, "starting turn");

        let prompt = {
            let state = self.state.lock().await;
            build_story_prompt(&self.story, &state.history, choice)
        };

        let passage = match self.generate_passage(prompt).await {
            Ok(passage) => passage,
            Err(e) => {
                tracing::warn!(error = %e, "story generation failed");
                self.emit(TurnEvent::Error(e.to_string()));
                return Err(e.into());
            }
        };

        let (scene, unlocked, persist_failure) = {
            let mut state = self.state.lock().await;
            state.record_passage(passage.clone());
            state.record_choice(choice);

            let scene = self.story.find_scene(&passage);
            if let Some(scene) = scene {
                state.enter_scene(scene);
                self.emit(TurnEvent::SceneChanged {
                    scene_id: scene.id.clone(),
                    image: scene.image.clone(),
                });
            }

            let mut achievements = self.achievements.lock().await;
            let unlocked = achievements.check_all(&state);
            let persist_failure = achievements.take_persist_failure();
            tracing::info!(turn = state.turn_count, "turn recorded");
            (scene.map(|s| s.id.clone()), unlocked, persist_failure)
        };

        for achievement in &unlocked {
            self.emit(TurnEvent::AchievementUnlocked(achievement.clone()));
        }
        if let Some(outcome) = &persist_failure {
            self.emit(TurnEvent::PersistenceFailed(outcome.clone()));
        }

        let choices = self.generate_choices(&passage).await;
        self.emit(TurnEvent::ChoicesReady(choices.clone()));

        Ok(TurnOutcome {
            passage,
            scene,
            unlocked,
            choices,
            persist_failure,
        })
    }

    async fn generate_passage(&self, prompt: String) -> Result<String, ollama::Error> {
        let request =
            GenerateRequest::new(prompt).with_options(self.config.story_options.clone());

        if self.config.stream {
            let stream = self.model().generate_stream(request).await?;
            read_response(stream, |token| self.emit(TurnEvent::Token(token.to_string()))).await
        } else {
            let text = self.model().generate(request).await?;
            if text.is_empty() {
                Ok(EMPTY_PASSAGE.to_string())
            } else {
                Ok(text)
            }
        }
    }

    /// Never fails: an unusable reply or a failed call falls back to a fixed set.
    async fn generate_choices(&self, passage: &str) -> Vec<String> {
        let count = self.config.choice_count;
        let request = GenerateRequest::new(build_choices_prompt(passage, count))
            .with_options(self.config.choice_options.clone());

        match self.model().generate(request).await {
            Ok(raw) => {
                let choices = parse_choices(&raw, count);
                if choices.is_empty() {
                    tracing::debug!(raw = %raw, "no choices in model output, using defaults");
                    default_choices()
                } else {
                    choices
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "choice generation failed, using fallback choices");
                fallback_choices()
            }
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub async fn save_game(&self) -> SaveOutcome {
        let state = self.state.lock().await;
        SaveOutcome::from_result(self.storage.save_game(&state), "遊戲已儲存！", "儲存失敗")
    }

    /// Restore the saved game and generate choices for it.
    ///
    /// Returns `Ok(None)` when there is no save.
    pub async fn load_game(&self) -> Result<Option<Vec<String>>, TurnError> {
        let _guard = self.begin_turn()?;

        let Some(saved) = self.storage.load_game()? else {
            return Ok(None);
        };

        if let (Some(scene_id), Some(image)) = (&saved.current_scene, &saved.current_image) {
            self.emit(TurnEvent::SceneChanged {
                scene_id: scene_id.clone(),
                image: image.clone(),
            });
        }

        let current_story = saved.current_story.clone();
        *self.state.lock().await = saved;
        tracing::info!("game loaded");

        let choices = self.generate_choices(&current_story).await;
        self.emit(TurnEvent::ChoicesReady(choices.clone()));
        Ok(Some(choices))
    }

    pub fn has_save(&self) -> bool {
        self.storage.has_save()
    }

    pub fn save_info(&self) -> Result<Option<SaveInfo>, TurnError> {
        Ok(self.storage.save_info()?)
    }

    pub fn delete_save(&self) -> SaveOutcome {
        SaveOutcome::from_result(self.storage.delete_save(), "存檔已刪除！", "刪除失敗")
    }

    /// Erase the save and achievement progress and start from an empty state.
    /// Settings are kept.
    pub async fn reset_game(&self) -> Result<SaveOutcome, TurnError> {
        let _guard = self.exclusive()?;

        let outcome =
            SaveOutcome::from_result(self.storage.reset_all(), "所有資料已重置！", "重置失敗");
        let achievements = self.achievements.lock().await.reset();
        *self.state.lock().await = GameState::new();

        if outcome.success && !achievements.success {
            return Ok(achievements);
        }
        Ok(outcome)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Persist `settings` and switch to an Ollama client built from them.
    ///
    /// The new client is used even when the write fails; the outcome reports
    /// the failure. Returns [`TurnError::Busy`] while another operation runs.
    pub fn update_settings(&self, settings: &Settings) -> Result<SaveOutcome, TurnError> {
        let _guard = self.exclusive()?;

        let outcome = SaveOutcome::from_result(
            self.storage.save_settings(settings),
            "設定已儲存！",
            "設定儲存失敗",
        );
        self.replace_model(Arc::new(settings.client()));
        tracing::info!(url = %settings.ollama_url, model = %settings.model_name, "settings updated");
        Ok(outcome)
    }

    /// Switch to another model backend. Returns [`TurnError::Busy`] while
    /// another operation runs.
    pub fn set_model(&self, model: Arc<dyn StoryModel>) -> Result<(), TurnError> {
        let _guard = self.exclusive()?;
        self.replace_model(model);
        Ok(())
    }

    /// Check that the model server is reachable and list its models.
    pub async fn test_connection(&self) -> ConnectionStatus {
        match self.model().list_models().await {
            Ok(models) => ConnectionStatus {
                success: true,
                message: "連線成功！".to_string(),
                models,
            },
            Err(e) => {
                tracing::warn!(error = %e, "connection test failed");
                ConnectionStatus {
                    success: false,
                    message: format!("連線失敗: {e}"),
                    models: Vec::new(),
                }
            }
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// A snapshot of the current state.
    pub async fn state(&self) -> GameState {
        self.state.lock().await.clone()
    }

    pub async fn achievement_stats(&self) -> AchievementStats {
        self.achievements.lock().await.stats()
    }

    pub async fn is_unlocked(&self, id: &str) -> bool {
        self.achievements.lock().await.is_unlocked(id)
    }

    /// Unlocked achievement ids, sorted.
    pub async fn unlocked_achievements(&self) -> Vec<String> {
        self.achievements
            .lock()
            .await
            .unlocked_ids()
            .map(str::to_string)
            .collect()
    }

    pub async fn achievement_definitions(&self) -> Vec<Achievement> {
        self.achievements.lock().await.definitions().to_vec()
    }

    /// Register an achievement listener. Listeners run while the turn holds
    /// the achievement lock, so they must not wait on this engine.
    pub async fn add_achievement_listener<F>(&self, listener: F)
    where
        F: Fn(AchievementEventKind, &str) + Send + Sync + 'static,
    {
        self.achievements.lock().await.add_listener(listener);
    }

    pub fn phase(&self) -> EnginePhase {
        if self.is_generating() {
            EnginePhase::Generating
        } else {
            EnginePhase::Idle
        }
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::Acquire)
    }

    /// Whether any operation, generating or not, holds the engine.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn story(&self) -> &StoryDefinition {
        &self.story
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn begin_turn(&self) -> Result<TurnGuard<'_>, TurnError> {
        let guard = self.acquire(true)?;
        self.emit(TurnEvent::LoadingStarted);
        Ok(guard)
    }

    fn exclusive(&self) -> Result<TurnGuard<'_>, TurnError> {
        self.acquire(false)
    }

    fn acquire(&self, announce: bool) -> Result<TurnGuard<'_>, TurnError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TurnError::Busy)?;
        if announce {
            self.generating.store(true, Ordering::Release);
        }
        Ok(TurnGuard {
            engine: self,
            announce,
        })
    }

    fn model(&self) -> Arc<dyn StoryModel> {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_model(&self, model: Arc<dyn StoryModel>) {
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = model;
    }

    fn emit(&self, event: TurnEvent) {
        for subscriber in &self.subscribers {
            // A dropped receiver just stops listening.
            let _ = subscriber.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{MemoryStore, SAVE_KEY};
    use crate::testing::{sample_achievements, sample_story, FailingStore, ScriptedModel, ScriptedReply};
    use std::time::Duration;

    fn engine(model: ScriptedModel, config: EngineConfig) -> NarrativeEngine {
        NarrativeEngine::new(
            sample_story(),
            Arc::new(model),
            Arc::new(MemoryStore::new()),
            sample_achievements(),
            config,
        )
    }

    #[tokio::test]
    async fn test_non_streaming_empty_reply_uses_placeholder() {
        let model = ScriptedModel::new([ScriptedReply::text(""), ScriptedReply::text("1. 前進")]);
        let engine = engine(model, EngineConfig::default().with_streaming(false));

        let outcome = engine.start_turn("").await.unwrap();
        assert_eq!(outcome.passage, EMPTY_PASSAGE);
        assert_eq!(outcome.choices, vec!["前進"]);
    }

    #[tokio::test]
    async fn test_unparseable_choices_use_defaults() {
        let model = ScriptedModel::new([
            ScriptedReply::text("你站在門前。"),
            ScriptedReply::text("沒有編號的回答"),
        ]);
        let engine = engine(model, EngineConfig::default());

        let outcome = engine.start_turn("").await.unwrap();
        assert_eq!(outcome.choices, default_choices());
    }

    #[tokio::test]
    async fn test_choice_count_limits_choices() {
        let model = ScriptedModel::new([
            ScriptedReply::text("你站在門前。"),
            ScriptedReply::text("1. 甲\n2. 乙\n3. 丙"),
        ]);
        let engine = engine(model, EngineConfig::default().with_choice_count(2));

        let outcome = engine.start_turn("").await.unwrap();
        assert_eq!(outcome.choices, vec!["甲", "乙"]);
    }

    #[tokio::test]
    async fn test_phase_returns_to_idle() {
        let engine = engine(ScriptedModel::new([]), EngineConfig::default());
        assert_eq!(engine.phase(), EnginePhase::Idle);

        engine.start_turn("").await.unwrap();
        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert!(!engine.is_generating());
    }

    #[tokio::test]
    async fn test_save_failure_is_reported() {
        let engine = NarrativeEngine::new(
            sample_story(),
            Arc::new(ScriptedModel::new([])),
            Arc::new(FailingStore),
            sample_achievements(),
            EngineConfig::default(),
        );

        let outcome = engine.save_game().await;
        assert!(!outcome.success);
        assert!(outcome.message.starts_with("儲存失敗: "));

        assert!(matches!(engine.load_game().await, Err(TurnError::Storage(_))));
        assert!(!engine.is_generating());
    }

    #[tokio::test]
    async fn test_connection_status() {
        let model = ScriptedModel::new([]).with_models(["llama2", "mistral"]);
        let engine = engine(model, EngineConfig::default());

        let status = engine.test_connection().await;
        assert!(status.success);
        assert_eq!(status.message, "連線成功！");
        assert_eq!(status.models.len(), 2);
    }

    #[tokio::test]
    async fn test_unlock_write_failure_is_surfaced() {
        let mut engine = NarrativeEngine::new(
            sample_story(),
            Arc::new(ScriptedModel::new([])),
            Arc::new(FailingStore),
            sample_achievements(),
            EngineConfig::default(),
        );
        let mut events = engine.subscribe();

        let outcome = engine.start_turn("").await.unwrap();
        let failure = outcome.persist_failure.unwrap();
        assert!(!failure.success);
        assert!(failure.message.starts_with("成就儲存失敗: "));
        assert!(engine.is_unlocked("first_turn").await);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&TurnEvent::PersistenceFailed(failure)));
    }

    #[tokio::test]
    async fn test_achievement_accessors_do_not_block_turns() {
        let engine = engine(ScriptedModel::new([]), EngineConfig::default());
        let fired = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = fired.clone();
        engine
            .add_achievement_listener(move |kind, id| {
                sink.lock().unwrap().push(format!("{kind}:{id}"));
            })
            .await;

        assert_eq!(engine.achievement_stats().await.unlocked, 0);
        assert_eq!(engine.achievement_definitions().await.len(), 4);

        let outcome = tokio::time::timeout(Duration::from_secs(2), engine.start_turn(""))
            .await
            .expect("turn should not wait on achievement readers")
            .unwrap();
        assert_eq!(outcome.unlocked.len(), 1);

        assert!(engine.is_unlocked("first_turn").await);
        assert_eq!(engine.unlocked_achievements().await, vec!["first_turn"]);
        assert_eq!(*fired.lock().unwrap(), vec!["unlock:first_turn"]);
    }

    #[tokio::test]
    async fn test_inconsistent_save_is_not_restored() {
        let storage = Arc::new(MemoryStore::new());
        storage
            .write(
                SAVE_KEY,
                r#"{"version":1,"timestamp":"t","gameState":{"turnCount":7,"history":["a"]}}"#,
            )
            .unwrap();
        let engine = NarrativeEngine::new(
            sample_story(),
            Arc::new(ScriptedModel::new([])),
            storage,
            sample_achievements(),
            EngineConfig::default(),
        );

        assert!(matches!(
            engine.load_game().await,
            Err(TurnError::Storage(PersistError::Inconsistent { turn_count: 7, .. }))
        ));
        assert_eq!(engine.state().await, GameState::new());
        assert!(!engine.is_busy());
    }

    #[tokio::test]
    async fn test_exclusive_operations_leave_phase_idle() {
        let engine = engine(ScriptedModel::new([]), EngineConfig::default());

        let guard = engine.exclusive().unwrap();
        assert!(engine.is_busy());
        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert!(matches!(engine.start_turn("").await, Err(TurnError::Busy)));
        drop(guard);

        let guard = engine.begin_turn().unwrap();
        assert_eq!(engine.phase(), EnginePhase::Generating);
        drop(guard);

        assert!(!engine.is_busy());
        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert!(engine.reset_game().await.unwrap().success);
        assert_eq!(engine.phase(), EnginePhase::Idle);
    }

    #[tokio::test]
    async fn test_update_settings_persists_and_swaps_model() {
        let storage = Arc::new(MemoryStore::new());
        let engine = NarrativeEngine::new(
            sample_story(),
            Arc::new(ScriptedModel::new([]).with_models(["llama2"])),
            storage.clone(),
            sample_achievements(),
            EngineConfig::default(),
        );
        assert!(engine.test_connection().await.success);

        // Nothing listens on the discard port.
        let settings = Settings::new("http://127.0.0.1:9/", "mistral");
        let outcome = engine.update_settings(&settings).unwrap();
        assert_eq!(outcome, SaveOutcome::ok("設定已儲存！"));
        assert_eq!(storage.load_settings(), settings);

        let status = engine.test_connection().await;
        assert!(!status.success);
        assert!(status.message.starts_with("連線失敗: "));

        engine
            .set_model(Arc::new(ScriptedModel::new([]).with_models(["phi"])))
            .unwrap();
        let status = engine.test_connection().await;
        assert_eq!(status.models[0].name, "phi");
    }

    #[tokio::test]
    async fn test_settings_cannot_change_mid_operation() {
        let engine = engine(ScriptedModel::new([]), EngineConfig::default());

        let guard = engine.begin_turn().unwrap();
        assert!(matches!(
            engine.update_settings(&Settings::default()),
            Err(TurnError::Busy)
        ));
        assert!(matches!(
            engine.set_model(Arc::new(ScriptedModel::new([]))),
            Err(TurnError::Busy)
        ));
        drop(guard);

        assert!(engine.set_model(Arc::new(ScriptedModel::new([]))).is_ok());
    }
}
