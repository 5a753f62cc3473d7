//! The language-model seam.

use async_trait::async_trait;
use ollama::{ChunkStream, GenerateRequest, ModelInfo, Ollama};

/// A text generation backend.
///
/// [`Ollama`] is the production implementation; tests use
/// [`ScriptedModel`](crate::testing::ScriptedModel).
#[async_trait]
pub trait StoryModel: Send + Sync {
    /// Generate a complete response. An empty response is returned as-is.
    async fn generate(&self, request: GenerateRequest) -> Result<String, ollama::Error>;

    /// Open a token stream for `request`.
    async fn generate_stream(&self, request: GenerateRequest) -> Result<ChunkStream, ollama::Error>;

    /// Models available on the backend.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ollama::Error>;
}

#[async_trait]
impl StoryModel for Ollama {
    async fn generate(&self, request: GenerateRequest) -> Result<String, ollama::Error> {
        Ok(Ollama::generate(self, request).await?.response)
    }

    async fn generate_stream(&self, request: GenerateRequest) -> Result<ChunkStream, ollama::Error> {
        Ollama::generate_stream(self, request).await
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ollama::Error> {
        Ollama::list_models(self).await
    }
}
