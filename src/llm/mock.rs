//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预设回复，用完后重复最后一条；记录收到的每次请求。

use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{ChatMessage, LlmClient, LlmError};

#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<Vec<Result<String, LlmError>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockLlmClient {
    pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
        let mut replies = replies;
        replies.reverse();
        Self {
            replies: Mutex::new(replies),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(reply: impl Into<String>) -> Self {
        Self::new(vec![Ok(reply.into())])
    }

    /// 已收到的请求
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        let mut replies = self
            .replies
            .lock()
            .map_err(|_| LlmError::ApiError("mock poisoned".to_string()))?;
        match replies.len() {
            0 => Ok(String::new()),
            1 => replies[0].clone(),
            _ => replies.pop().unwrap_or_else(|| Ok(String::new())),
        }
    }
}
