//! Story definitions: world, characters, and keyword-triggered scenes.
//!
//! Definitions are loaded once and never mutated during a session.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::fs;

/// Errors from loading definition files.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The authored setting a story is generated from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryDefinition {
    #[serde(default)]
    pub world_setting: String,

    #[serde(default)]
    pub tone: String,

    #[serde(default)]
    pub characters: Vec<Character>,

    #[serde(default)]
    pub plot_guidelines: String,

    #[serde(default)]
    pub scenes: Vec<Scene>,
}

/// A character the model should keep consistent.
///
/// Absent fields are left out of the prompt entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Character {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goals: Option<String>,
}

impl Character {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_personality(mut self, personality: impl Into<String>) -> Self {
        self.personality = Some(personality.into());
        self
    }

    pub fn with_background(mut self, background: impl Into<String>) -> Self {
        self.background = Some(background.into());
        self
    }

    pub fn with_goals(mut self, goals: impl Into<String>) -> Self {
        self.goals = Some(goals.into());
        self
    }
}

/// A visual context switch, triggered when generated text mentions a keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub keywords: Vec<String>,
}

impl Scene {
    /// Whether any non-empty keyword occurs in `text`.
    pub fn matches(&self, text: &str) -> bool {
        self.keywords
            .iter()
            .any(|keyword| !keyword.is_empty() && text.contains(keyword.as_str()))
    }
}

impl StoryDefinition {
    /// Parse a story definition from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a story definition from a JSON file.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let content = fs::read_to_string(path).await?;
        Self::from_json_str(&content)
    }

    /// Load a story definition, falling back to the built-in story on any failure.
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_json(path).await {
            Ok(story) => {
                tracing::info!(path = %path.display(), "loaded story definition");
                story
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "using built-in story definition");
                Self::default()
            }
        }
    }

    /// The first scene, in definition order, whose keywords occur in `text`.
    pub fn find_scene(&self, text: &str) -> Option<&Scene> {
        self.scenes.iter().find(|scene| scene.matches(text))
    }
}

impl Default for StoryDefinition {
    /// A generic fantasy adventure.
    fn default() -> Self {
        Self {
            world_setting: "這是一個奇幻世界".to_string(),
            tone: "冒險、神秘".to_string(),
            characters: Vec::new(),
            plot_guidelines: "玩家是一位冒險者，在這個世界探索未知。".to_string(),
            scenes: Vec::new(),
        }
    }
}
