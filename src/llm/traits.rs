//! LLM 客户端抽象
//!
//! 后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient::complete（非流式），由 LlmOracle 调用。

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM request timed out")]
    Timeout,

    /// 网络错误、限流、服务端 5xx 等
    #[error("LLM backend unavailable: {0}")]
    Unavailable(String),

    #[error("API error: {0}")]
    ApiError(String),
}

impl LlmError {
    /// 瞬时错误，可退避重试
    pub fn is_transient(&self) -> bool {
        !matches!(self, LlmError::ApiError(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// 发送给模型的单条消息
#[derive(Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;
}
