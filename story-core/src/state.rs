//! The live progress record for one play session.

use crate::story::Scene;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scene id assigned when a new game starts.
pub const START_SCENE: &str = "start";

/// Mutable game progress.
///
/// `choice_count` always equals `choices.len()` and `turn_count` always
/// equals `history.len()` when the state is only changed through its methods.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GameState {
    pub turn_count: u32,
    pub choice_count: u32,
    /// Latest generated passage.
    pub current_story: String,
    /// Every passage, oldest first.
    pub history: Vec<String>,
    pub flags: BTreeMap<String, bool>,
    /// Every choice the player made, oldest first.
    pub choices: Vec<String>,
    pub current_scene: Option<String>,
    pub current_image: Option<String>,
}

impl GameState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State for a freshly started game, placed in the start scene.
    pub fn new_game() -> Self {
        Self {
            current_scene: Some(START_SCENE.to_string()),
            ..Self::default()
        }
    }

    /// Append a generated passage and advance the turn counter.
    pub fn record_passage(&mut self, passage: impl Into<String>) {
        let passage = passage.into();
        self.current_story = passage.clone();
        self.history.push(passage);
        self.turn_count += 1;
    }

    /// Record a player choice. Empty choices (the opening turn) are not recorded.
    pub fn record_choice(&mut self, choice: &str) {
        if choice.is_empty() {
            return;
        }
        self.choices.push(choice.to_string());
        self.choice_count += 1;
    }

    pub fn enter_scene(&mut self, scene: &Scene) {
        self.current_scene = Some(scene.id.clone());
        self.current_image = Some(scene.image.clone());
    }

    pub fn set_flag(&mut self, key: impl Into<String>, value: bool) {
        self.flags.insert(key.into(), value);
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        self.flags.get(key).copied()
    }

    /// Numeric counter lookup for achievement conditions. Unknown keys read as 0.
    pub fn counter(&self, key: &str) -> f64 {
        match key {
            "turnCount" | "turn_count" => f64::from(self.turn_count),
            "choiceCount" | "choice_count" => f64::from(self.choice_count),
            _ => 0.0,
        }
    }

    pub fn has_chosen(&self, choice: &str) -> bool {
        self.choices.iter().any(|c| c == choice)
    }

    /// Whether the counters agree with the recorded sequences.
    pub fn is_consistent(&self) -> bool {
        self.turn_count as usize == self.history.len()
            && self.choice_count as usize == self.choices.len()
    }
}
