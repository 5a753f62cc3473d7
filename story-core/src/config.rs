//! Connection settings and engine configuration.

use ollama::{GenerateOptions, Ollama, DEFAULT_BASE_URL, DEFAULT_MODEL};
use serde::{Deserialize, Serialize};

/// User-editable connection settings, persisted through storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_url")]
    pub ollama_url: String,

    #[serde(default = "default_model")]
    pub model_name: String,
}

fn default_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ollama_url: default_url(),
            model_name: default_model(),
        }
    }
}

impl Settings {
    pub fn new(ollama_url: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            ollama_url: ollama_url.into(),
            model_name: model_name.into(),
        }
    }

    /// Defaults, overridden by `OLLAMA_BASE_URL` / `OLLAMA_MODEL` when set.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `OLLAMA_BASE_URL` / `OLLAMA_MODEL` on top of these settings.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("OLLAMA_BASE_URL") {
            self.ollama_url = url;
        }
        if let Ok(model) = std::env::var("OLLAMA_MODEL") {
            self.model_name = model;
        }
        self
    }

    /// Build a client for these settings.
    pub fn client(&self) -> Ollama {
        Ollama::new(&self.ollama_url, self.model_name.clone())
    }
}

/// Tuning for the turn engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Stream passages token by token.
    pub stream: bool,

    /// How many choices to ask for each turn.
    pub choice_count: usize,

    /// Sampling for story passages.
    pub story_options: GenerateOptions,

    /// Sampling for the next-choices request.
    pub choice_options: GenerateOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream: true,
            choice_count: 3,
            story_options: GenerateOptions::default()
                .with_temperature(0.8)
                .with_top_p(0.9)
                .with_top_k(40),
            choice_options: GenerateOptions::default()
                .with_temperature(0.7)
                .with_max_tokens(200),
        }
    }
}

impl EngineConfig {
    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set the number of choices per turn (at least one).
    pub fn with_choice_count(mut self, count: usize) -> Self {
        self.choice_count = count.max(1);
        self
    }

    pub fn with_story_options(mut self, options: GenerateOptions) -> Self {
        self.story_options = options;
        self
    }

    pub fn with_choice_options(mut self, options: GenerateOptions) -> Self {
        self.choice_options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.ollama_url, "http://localhost:11434");
        assert_eq!(settings.model_name, "llama2");
    }

    #[test]
    fn test_settings_json_shape() {
        let settings: Settings = serde_json::from_str(r#"{"modelName":"mistral"}"#).unwrap();
        assert_eq!(settings.ollama_url, DEFAULT_BASE_URL);
        assert_eq!(settings.model_name, "mistral");

        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["ollamaUrl"], DEFAULT_BASE_URL);
    }

    #[test]
    fn test_settings_client() {
        let client = Settings::new("http://box:11434/", "phi3").client();
        assert_eq!(client.base_url(), "http://box:11434");
        assert_eq!(client.model(), "phi3");
    }

    #[test]
    fn test_engine_config() {
        let config = EngineConfig::default();
        assert!(config.stream);
        assert_eq!(config.choice_count, 3);
        assert_eq!(config.story_options.top_k, Some(40));
        assert_eq!(config.choice_options.max_tokens, Some(200));

        let config = config.with_streaming(false).with_choice_count(0);
        assert!(!config.stream);
        assert_eq!(config.choice_count, 1);
    }
}
