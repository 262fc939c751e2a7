// Skein Core Library
// Retrieval-augmented chat agent runtime

pub mod agent;
pub mod config;
pub mod llm;
pub mod memory;
pub mod retrieval;
pub mod tokens;
pub mod tools;

// Export core types
pub use agent::{Agent, AgentBackends, ResponseStream, TurnOutput, TurnRequest};
pub use config::{AgentConfig, RetrievalConfig};
pub use llm::{CompletionRequest, LlmClient};
pub use retrieval::{HybridRetriever, ScoredDocument, SearchScope};
pub use tokens::{TokenBudget, Tokenizer};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SkeinError {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SkeinError>;
