//! OpenAI 兼容端点上的 oracle 后端
//!
//! 决策需要可复现，因此固定 temperature = 0，只取第一条候选。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{ChatMessage, ChatRole, LlmClient, LlmError};

const DEEPSEEK_API_BASE: &str = "https://api.deepseek.com";
const DEEPSEEK_DEFAULT_MODEL: &str = "deepseek-chat";

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiClient {
    /// api_key 缺省时读 OPENAI_API_KEY
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let key = api_key
            .map(str::to_string)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        if key.is_empty() {
            tracing::warn!("No API key configured for the oracle backend; requests will be rejected");
        }
        let mut config = OpenAIConfig::new().with_api_key(key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    /// DeepSeek 端点；DEEPSEEK_API_KEY 优先
    pub fn deepseek(model: Option<&str>) -> Self {
        let key = std::env::var("DEEPSEEK_API_KEY").ok();
        Self::new(
            Some(DEEPSEEK_API_BASE),
            model.unwrap_or(DEEPSEEK_DEFAULT_MODEL),
            key.as_deref(),
        )
    }
}

fn request_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage, LlmError> {
    let text = message.content.clone();
    let built = match message.role {
        ChatRole::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(text)
            .build()
            .map(ChatCompletionRequestMessage::System),
        ChatRole::User => ChatCompletionRequestUserMessageArgs::default()
            .content(text)
            .build()
            .map(ChatCompletionRequestMessage::User),
        ChatRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(text)
            .build()
            .map(ChatCompletionRequestMessage::Assistant),
    };
    built.map_err(|e| LlmError::ApiError(format!("building request: {e}")))
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let messages = messages
            .iter()
            .map(request_message)
            .collect::<Result<Vec<_>, _>>()?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.as_str())
            .temperature(0.0)
            .messages(messages)
            .build()
            .map_err(|e| LlmError::ApiError(format!("building request: {e}")))?;

        // 网络、限流与服务端错误一律按瞬时处理，由网关决定是否重试
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        if let Some(usage) = &response.usage {
            tracing::debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "oracle completion"
            );
        }
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Unavailable("empty completion".to_string()))
    }
}
