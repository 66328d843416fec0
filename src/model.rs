//! Collaborator traits for the pieces this crate does not implement itself:
//! embedding, generative inference, document fetch and text extraction.
//!
//! All traits are dyn-safe and async so hosts can plug in on-device models,
//! remote APIs, or test fakes interchangeably.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::AmaError;
use crate::protocol::ChatMessage;

/// Produces a fixed-dimension embedding for a piece of text.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AmaError>;
}

/// A stream of answer deltas. Each item is one text fragment in order.
pub type DeltaStream = BoxStream<'static, Result<String, AmaError>>;

/// An open conversation with the generative model, seeded with initial prompts.
#[async_trait]
pub trait GenerativeSession: Send {
    /// Stream the completion for `input`. Deltas arrive in order; the stream
    /// ends after the final delta or yields an error item and stops.
    async fn stream_complete(&mut self, input: &str) -> Result<DeltaStream, AmaError>;
}

/// Factory for generative sessions.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Fails with [`AmaError::ModelUnavailable`] when the model is not ready.
    async fn create_session(
        &self,
        initial_prompts: Vec<ChatMessage>,
    ) -> Result<Box<dyn GenerativeSession>, AmaError>;
}

/// Fetches the raw bytes of a document by its canonical URL.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, AmaError>;
}

/// Turns raw document bytes into plain text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8]) -> Result<String, AmaError>;
}
