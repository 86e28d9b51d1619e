//! 消息日志：对话轮次与工具结果的有序、只追加记录
//!
//! 追加即定序：seq 从 0 开始单调递增，已追加的消息永不改写、永不删除。
//! 引擎与所有 Agent 只通过 append / read / window 访问日志。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
            Role::Tool => "tool",
        }
    }
}

/// 消息内容：纯文本或结构化载荷（工具结果、人工决策等）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Content {
    Text(String),
    Structured(serde_json::Value),
}

impl Content {
    /// 文本视图：结构化内容按紧凑 JSON 输出（供 oracle 上下文与日志使用）
    pub fn as_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Structured(v) => v.to_string(),
        }
    }
}

/// 单条消息；seq 与 at 由 MessageLog::append 填写
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// Agent 标识或能力名；用户消息为 None
    pub author: Option<String>,
    pub content: Content,
    pub seq: u64,
    pub at: DateTime<Utc>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, None, Content::Text(text.into()))
    }

    pub fn agent(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Role::Agent, Some(author.into()), Content::Text(text.into()))
    }

    pub fn tool(capability: impl Into<String>, result: serde_json::Value) -> Self {
        Self::new(Role::Tool, Some(capability.into()), Content::Structured(result))
    }

    fn new(role: Role, author: Option<String>, content: Content) -> Self {
        Self {
            role,
            author,
            content,
            seq: 0,
            at: Utc::now(),
        }
    }

    pub fn text(&self) -> String {
        self.content.as_text()
    }
}

/// 只追加日志
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条消息，返回分配的序号
    pub fn append(&mut self, mut message: Message) -> u64 {
        let seq = self.messages.len() as u64;
        message.seq = seq;
        self.messages.push(message);
        seq
    }

    /// 从 from_seq（含）开始读取；越界返回空切片
    pub fn read(&self, from_seq: u64) -> &[Message] {
        let start = (from_seq as usize).min(self.messages.len());
        &self.messages[start..]
    }

    /// 最近 n 条消息（Agent 上下文窗口）
    pub fn window(&self, n: usize) -> &[Message] {
        &self.messages[self.messages.len().saturating_sub(n)..]
    }

    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(Message::text)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_assigns_monotonic_seq() {
        let mut log = MessageLog::new();
        assert_eq!(log.append(Message::user("hello")), 0);
        assert_eq!(log.append(Message::agent("supervisor", "hi")), 1);
        assert_eq!(log.append(Message::tool("inventory.lookup_part", serde_json::json!({"qty": 15}))), 2);
        let seqs: Vec<u64> = log.read(0).iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_read_is_restartable_from_any_offset() {
        let mut log = MessageLog::new();
        for i in 0..5 {
            log.append(Message::user(format!("m{i}")));
        }
        assert_eq!(log.read(3).len(), 2);
        assert_eq!(log.read(3)[0].text(), "m3");
        assert_eq!(log.read(3), log.read(3));
        assert!(log.read(99).is_empty());
    }

    #[test]
    fn test_window_and_last_user_text() {
        let mut log = MessageLog::new();
        log.append(Message::user("first"));
        log.append(Message::agent("supervisor", "ack"));
        log.append(Message::user("second"));
        log.append(Message::agent("inventory", "done"));
        assert_eq!(log.window(2).len(), 2);
        assert_eq!(log.window(2)[0].text(), "second");
        assert_eq!(log.window(10).len(), 4);
        assert_eq!(log.last_user_text().as_deref(), Some("second"));
    }

    #[test]
    fn test_structured_content_serde() {
        let mut log = MessageLog::new();
        log.append(Message::tool("tickets.list_open", serde_json::json!([{"id": "CM-1"}])));
        let json = serde_json::to_string(&log).unwrap();
        let back: MessageLog = serde_json::from_str(&json).unwrap();
        assert_eq!(back, log);
        assert_eq!(back.read(0)[0].role, Role::Tool);
    }
}
