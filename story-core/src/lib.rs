//! Branching narrative engine driven by a local language model.
//!
//! This crate provides:
//! - Prompt assembly from a structured story definition
//! - Token-by-token passage streaming over Ollama's NDJSON protocol
//! - Choice extraction from free-form model output
//! - A single-flight turn engine with scene detection
//! - Declarative achievements and save/load persistence
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use story_core::{
//!     AchievementDefinitions, EngineConfig, FileStore, NarrativeEngine, Settings, Storage,
//!     StoryDefinition,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Arc::new(FileStore::new("saves"));
//!     let settings = storage.load_settings().with_env_overrides();
//!     let story = StoryDefinition::load_or_default("data/story.json").await;
//!     let achievements = AchievementDefinitions::load_json("data/achievements.json").await?;
//!
//!     let mut engine = NarrativeEngine::new(
//!         story,
//!         Arc::new(settings.client()),
//!         storage,
//!         achievements.achievements,
//!         EngineConfig::default(),
//!     );
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("{event:?}");
//!         }
//!     });
//!
//!     let outcome = engine.new_game().await?;
//!     let next = engine.start_turn(&outcome.choices[0]).await?;
//!     println!("{}", next.passage);
//!
//!     engine.save_game().await;
//!     Ok(())
//! }
//! ```

pub mod achievement;
pub mod choices;
pub mod condition;
pub mod config;
pub mod engine;
pub mod model;
pub mod persist;
pub mod prompt;
pub mod reader;
pub mod state;
pub mod story;
pub mod testing;

// Primary public API
pub use achievement::{
    Achievement, AchievementDefinitions, AchievementEngine, AchievementEventKind,
    AchievementStats,
};
pub use choices::parse_choices;
pub use condition::{evaluate, Condition, Operator};
pub use config::{EngineConfig, Settings};
pub use engine::{ConnectionStatus, EnginePhase, NarrativeEngine, TurnError, TurnEvent, TurnOutcome};
pub use model::StoryModel;
pub use persist::{FileStore, MemoryStore, PersistError, SaveInfo, SaveOutcome, Storage};
pub use reader::read_response;
pub use state::GameState;
pub use story::{Character, DefinitionError, Scene, StoryDefinition};
