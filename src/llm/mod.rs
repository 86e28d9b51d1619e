//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

use crate::config::LlmSection;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{ChatMessage, ChatRole, LlmClient, LlmError};

/// 按 [llm] 配置创建客户端；keyword 模式不需要 LLM，返回 None
pub fn create_client(cfg: &LlmSection) -> Option<Arc<dyn LlmClient>> {
    match cfg.provider.as_str() {
        "openai" => {
            tracing::info!(model = %cfg.model, "Using OpenAI-compatible oracle backend");
            Some(Arc::new(OpenAiClient::new(
                cfg.base_url.as_deref(),
                &cfg.model,
                cfg.api_key.as_deref(),
            )))
        }
        "deepseek" => {
            tracing::info!("Using DeepSeek oracle backend");
            Some(Arc::new(OpenAiClient::deepseek(Some(cfg.model.as_str()))))
        }
        "keyword" => None,
        other => {
            tracing::warn!(provider = %other, "Unknown LLM provider, falling back to keyword oracle");
            None
        }
    }
}
