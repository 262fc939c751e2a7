use skein_core::config::AgentConfig;
use skein_core::llm::LlmClientConfig;
use skein_core::retrieval::{ChromaConfig, HttpRerankerConfig, RedisKeywordIndexConfig};

/// High-level configuration for the chat agent demo.
///
/// Everything is driven by environment variables through the component
/// defaults; the demo only decides whether to stream and whether the
/// rerank pass is on.
#[derive(Clone, Debug)]
pub struct ChatDemoConfig {
    pub agent: AgentConfig,
    pub llm: LlmClientConfig,
    pub chroma: ChromaConfig,
    pub redis: RedisKeywordIndexConfig,
    pub reranker: HttpRerankerConfig,
    pub use_reranker: bool,
}

impl ChatDemoConfig {
    pub fn load() -> Self {
        let mut agent = AgentConfig::default();
        agent.streaming = std::env::var("CHAT_STREAMING")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(true);

        Self {
            agent,
            llm: LlmClientConfig::default(),
            chroma: ChromaConfig::default(),
            redis: RedisKeywordIndexConfig::default(),
            reranker: HttpRerankerConfig::default(),
            use_reranker: std::env::var("USE_RERANKER")
                .ok()
                .and_then(|v| v.parse::<bool>().ok())
                .unwrap_or(true),
        }
    }
}
