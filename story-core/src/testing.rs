//! Testing utilities for the narrative engine.
//!
//! This module provides tools for integration testing:
//! - `ScriptedModel` for deterministic turns without a model server
//! - `FailingStore` for exercising persistence failures
//! - Sample story and achievement fixtures

use crate::achievement::{Achievement, AchievementDefinitions};
use crate::model::StoryModel;
use crate::persist::{PersistError, Storage};
use crate::story::{Character, Scene, StoryDefinition};
use async_trait::async_trait;
use futures::stream;
use ollama::{decode_ndjson, ChunkStream, GenerateChunk, GenerateRequest, ModelInfo};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Returned once the script runs out.
pub const EXHAUSTED_REPLY: &str = "The model has no more scripted replies.";

/// One scripted model reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Text delivered as the given tokens (joined for non-streaming calls).
    Tokens(Vec<String>),

    /// Raw NDJSON wire text, decoded exactly as a server response would be.
    Ndjson(String),

    /// The server answers with a non-2xx status.
    Failure { status: u16, message: String },

    /// The stream delivers `tokens`, then the connection drops.
    Broken { tokens: Vec<String>, error: String },
}

impl ScriptedReply {
    /// A reply delivered as a single token.
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedReply::Tokens(vec![text.into()])
    }

    pub fn tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptedReply::Tokens(tokens.into_iter().map(Into::into).collect())
    }

    pub fn failure(status: u16, message: impl Into<String>) -> Self {
        ScriptedReply::Failure {
            status,
            message: message.into(),
        }
    }

    fn into_text(self) -> Result<String, ollama::Error> {
        match self {
            ScriptedReply::Tokens(tokens) => Ok(tokens.concat()),
            ScriptedReply::Ndjson(raw) => Ok(raw
                .lines()
                .filter_map(|line| ollama::decode_line(line.as_bytes()))
                .filter_map(|chunk| chunk.response)
                .collect()),
            ScriptedReply::Failure { status, message } => {
                Err(ollama::Error::Api { status, message })
            }
            ScriptedReply::Broken { error, .. } => Err(ollama::Error::Network(error)),
        }
    }

    fn into_stream(self) -> Result<ChunkStream, ollama::Error> {
        match self {
            ScriptedReply::Tokens(tokens) => {
                let chunks = tokens.into_iter().map(|token| Ok::<_, ollama::Error>(chunk(token)));
                Ok(Box::pin(stream::iter(chunks)))
            }
            ScriptedReply::Ndjson(raw) => {
                let source = stream::iter([Ok::<_, String>(raw.into_bytes())]);
                Ok(Box::pin(decode_ndjson(source)))
            }
            ScriptedReply::Failure { status, message } => {
                Err(ollama::Error::Api { status, message })
            }
            ScriptedReply::Broken { tokens, error } => {
                let chunks = tokens
                    .into_iter()
                    .map(|token| Ok::<_, ollama::Error>(chunk(token)))
                    .chain(std::iter::once(Err(ollama::Error::Network(error))));
                Ok(Box::pin(stream::iter(chunks)))
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn chunk(token: String) -> GenerateChunk {
    GenerateChunk {
        response: Some(token),
        done: false,
    }
}

/// A model that replays scripted replies in order.
///
/// Streaming and non-streaming calls draw from the same queue. Every prompt
/// is recorded for later inspection.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ScriptedReply>>,
    prompts: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
    models: Vec<ModelInfo>,
}

impl ScriptedModel {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Hold the next call until `gate` is notified.
    pub fn with_gate(self, gate: Arc<Notify>) -> Self {
        *lock(&self.gate) = Some(gate);
        self
    }

    /// Models reported by `list_models`.
    pub fn with_models<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = names
            .into_iter()
            .map(|name| ModelInfo {
                name: name.into(),
                size: None,
                modified_at: None,
            })
            .collect();
        self
    }

    /// Queue another reply.
    pub fn push(&self, reply: ScriptedReply) {
        lock(&self.replies).push_back(reply);
    }

    /// Every prompt received so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.replies).len()
    }

    async fn next_reply(&self, request: GenerateRequest) -> ScriptedReply {
        lock(&self.prompts).push(request.prompt);

        let gate = lock(&self.gate).take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        lock(&self.replies)
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::text(EXHAUSTED_REPLY))
    }
}

#[async_trait]
impl StoryModel for ScriptedModel {
    async fn generate(&self, request: GenerateRequest) -> Result<String, ollama::Error> {
        self.next_reply(request).await.into_text()
    }

    async fn generate_stream(&self, request: GenerateRequest) -> Result<ChunkStream, ollama::Error> {
        self.next_reply(request).await.into_stream()
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ollama::Error> {
        Ok(self.models.clone())
    }
}

/// Storage where every operation fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingStore;

impl Storage for FailingStore {
    fn read(&self, _key: &str) -> Result<Option<String>, PersistError> {
        Err(PersistError::Unavailable("storage offline".to_string()))
    }

    fn write(&self, _key: &str, _value: &str) -> Result<(), PersistError> {
        Err(PersistError::Unavailable("storage offline".to_string()))
    }

    fn remove(&self, _key: &str) -> Result<(), PersistError> {
        Err(PersistError::Unavailable("storage offline".to_string()))
    }
}

/// A small story with two keyword-triggered scenes.
pub fn sample_story() -> StoryDefinition {
    StoryDefinition {
        world_setting: "一座被霧籠罩的邊境小鎮".to_string(),
        tone: "懸疑".to_string(),
        characters: vec![Character::new("守夜人")
            .with_personality("沉默寡言")
            .with_goals("守住鎮門")],
        plot_guidelines: "玩家在調查失蹤的商隊。".to_string(),
        scenes: vec![
            Scene {
                id: "forest".to_string(),
                image: "images/forest.png".to_string(),
                keywords: vec!["森林".to_string(), "樹林".to_string()],
            },
            Scene {
                id: "cave".to_string(),
                image: "images/cave.png".to_string(),
                keywords: vec!["洞穴".to_string()],
            },
        ],
    }
}

/// Achievements covering each condition type.
pub fn sample_achievements() -> Vec<Achievement> {
    const JSON: &str = r#"{
        "achievements": [
            {"id": "first_turn", "name": "啟程", "description": "完成第一回合",
             "condition": {"type": "counter", "key": "turnCount", "value": 1}},
            {"id": "five_turns", "name": "老練旅人", "description": "完成五個回合",
             "condition": {"type": "counter", "key": "turnCount", "value": 5, "operator": "gte"}},
            {"id": "into_the_woods", "name": "入林", "description": "進入森林",
             "condition": {"type": "story_progress", "value": "forest"}},
            {"id": "curious", "name": "好奇心", "description": "環顧四周",
             "condition": {"type": "choice", "value": "環顧四周"}}
        ]
    }"#;

    AchievementDefinitions::from_json_str(JSON)
        .map(|defs| defs.achievements)
        .unwrap_or_default()
}
