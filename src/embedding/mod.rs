pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;

pub use mock::MockProvider;
pub use provider::{create_provider, EmbeddingProvider};
