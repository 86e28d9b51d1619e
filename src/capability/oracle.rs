//! 推理 oracle：ask(context, available_actions) → OracleDecision
//!
//! - LlmOracle：OpenAI 兼容模型，按 JSON 协议输出决策
//! - KeywordOracle：关键词与正则快速匹配，离线可用
//! - ScriptedOracle：按脚本返回（测试与故障注入）

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CapabilityError;
use crate::core::state::AgentId;
use crate::llm::{ChatMessage, LlmClient, LlmError};
use crate::memory::{Message, Role};

/// 询问目的（决定 KeywordOracle 的匹配规则，也写入 LLM 提示）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OraclePurpose {
    /// 将用户请求分类为意图令牌
    ClassifyIntent,
    /// 为临时查询挑选只读能力及参数
    SelectQuery,
    /// 解析技术员的自由文本答复
    ParseDecision,
    /// 直接回答一般问题
    Answer,
}

/// 可选动作
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

impl ActionSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Value::Null,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OracleRequest {
    pub agent: AgentId,
    pub purpose: OraclePurpose,
    pub instruction: String,
    /// 需要推理的文本（用户请求或技术员答复）
    pub input: String,
    /// 最近的对话窗口
    pub context: Vec<Message>,
    pub actions: Vec<ActionSpec>,
}

impl OracleRequest {
    pub fn offers(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a.name == action)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OracleDecision {
    pub action: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub arguments: Value,
}

impl OracleDecision {
    pub fn new(action: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            rationale: rationale.into(),
            arguments: Value::Object(Default::default()),
        }
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn argument_str(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    fn name(&self) -> &str;

    async fn ask(&self, request: &OracleRequest) -> Result<OracleDecision, CapabilityError>;
}

// ---------------------------------------------------------------------------
// LlmOracle
// ---------------------------------------------------------------------------

pub struct LlmOracle {
    llm: Arc<dyn LlmClient>,
}

impl LlmOracle {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn build_messages(request: &OracleRequest) -> Vec<ChatMessage> {
        let actions = serde_json::to_string_pretty(&request.actions).unwrap_or_else(|_| "[]".into());
        let system = format!(
            "You are the {agent} agent of a plant maintenance team.\n\
             Task ({purpose:?}): {instruction}\n\n\
             Available actions:\n{actions}\n\n\
             Reply with exactly one JSON object and nothing else:\n\
             {{\"action\": \"<one action name>\", \"rationale\": \"<short reason>\", \"arguments\": {{...}}}}",
            agent = request.agent,
            purpose = request.purpose,
            instruction = request.instruction,
        );
        let mut messages = vec![ChatMessage::system(system)];
        for m in &request.context {
            let line = match &m.author {
                Some(author) => format!("[{author}] {}", m.text()),
                None => m.text(),
            };
            messages.push(match m.role {
                Role::User => ChatMessage::user(line),
                Role::Agent | Role::Tool => ChatMessage::assistant(line),
            });
        }
        messages.push(ChatMessage::user(format!("Input: {}", request.input)));
        messages
    }
}

/// 从模型输出中截取第一个 `{` 到最后一个 `}` 并解析
pub fn parse_decision(raw: &str) -> Option<OracleDecision> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

#[async_trait]
impl ReasoningOracle for LlmOracle {
    fn name(&self) -> &str {
        "llm"
    }

    async fn ask(&self, request: &OracleRequest) -> Result<OracleDecision, CapabilityError> {
        let raw = self
            .llm
            .complete(&Self::build_messages(request))
            .await
            .map_err(|e| match e {
                LlmError::Timeout => CapabilityError::Unavailable("llm timeout".to_string()),
                e if e.is_transient() => CapabilityError::Unavailable(e.to_string()),
                e => CapabilityError::Failed(e.to_string()),
            })?;
        // 格式错误或未提供的动作都视为瞬时失败，交给网关重试
        let decision = parse_decision(&raw).ok_or_else(|| {
            CapabilityError::Unavailable(format!(
                "oracle reply is not a decision: {}",
                raw.chars().take(200).collect::<String>()
            ))
        })?;
        if !request.actions.is_empty() && !request.offers(&decision.action) {
            return Err(CapabilityError::Unavailable(format!(
                "oracle chose '{}', which was not offered",
                decision.action
            )));
        }
        Ok(decision)
    }
}

// ---------------------------------------------------------------------------
// KeywordOracle
// ---------------------------------------------------------------------------

static WORK_ORDER_RE: OnceLock<Regex> = OnceLock::new();
static TICKET_RE: OnceLock<Regex> = OnceLock::new();
static PART_RE: OnceLock<Regex> = OnceLock::new();

fn work_order_re() -> &'static Regex {
    WORK_ORDER_RE.get_or_init(|| Regex::new(r"\bWO-[A-Z0-9]+(?:-[A-Z0-9]+)*\b").expect("valid regex"))
}

fn ticket_re() -> &'static Regex {
    TICKET_RE.get_or_init(|| Regex::new(r"\b(?:CM|PM)-\d{4}-\d{3,4}\b").expect("valid regex"))
}

fn part_re() -> &'static Regex {
    PART_RE.get_or_init(|| Regex::new(r"\b[A-Z]{2,5}-[A-Z0-9]{2,8}(?:-[A-Z0-9]{1,6})*\b").expect("valid regex"))
}

/// 文本中的零件号（排除工单号、维修单号、请购单号）
pub fn extract_part_numbers(text: &str) -> Vec<String> {
    let upper = text.to_uppercase();
    let mut parts: Vec<String> = Vec::new();
    for m in part_re().find_iter(&upper) {
        let s = m.as_str();
        let excluded = ["WO-", "CM-", "PM-", "PR-"].iter().any(|p| s.starts_with(p));
        if !excluded && !parts.iter().any(|p| p == s) {
            parts.push(s.to_string());
        }
    }
    parts
}

pub fn extract_work_order(text: &str) -> Option<String> {
    work_order_re()
        .find(&text.to_uppercase())
        .map(|m| m.as_str().to_string())
}

pub fn extract_ticket(text: &str) -> Option<String> {
    ticket_re().find(&text.to_uppercase()).map(|m| m.as_str().to_string())
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// 规则 oracle：不调用模型
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordOracle;

impl KeywordOracle {
    pub fn new() -> Self {
        Self
    }

    fn classify(input: &str) -> OracleDecision {
        let lower = input.to_lowercase();

        if let Some(wo) = extract_work_order(input) {
            return OracleDecision::new("work_order_review", format!("request concerns work order {wo}"))
                .with_arguments(serde_json::json!({ "work_order_id": wo }));
        }
        if contains_any(&lower, &["email", "report", "报告", "邮件"]) {
            return OracleDecision::new("email_report", "user asked for a status report");
        }
        if let Some(ticket) = extract_ticket(input) {
            let action = if contains_any(&lower, &["execute", "start", "work on", "process", "fix", "执行"]) {
                "execute_single_ticket"
            } else {
                "ticket_query"
            };
            return OracleDecision::new(action, format!("request names ticket {ticket}"))
                .with_arguments(serde_json::json!({ "ticket_number": ticket }));
        }
        if contains_any(
            &lower,
            &["execute", "run maintenance", "start maintenance", "today's maintenance", "dispatch", "执行维护"],
        ) {
            return OracleDecision::new("execute_maintenance", "user wants the maintenance plan executed");
        }
        if contains_any(&lower, &["priority", "critical", "urgent", "优先"]) {
            return OracleDecision::new("priority_query", "user asked about ticket priorities");
        }
        if contains_any(&lower, &["ticket", "工单"]) {
            return OracleDecision::new("ticket_query", "user asked about tickets");
        }
        if !extract_part_numbers(input).is_empty()
            || contains_any(&lower, &["stock", "inventory", "how many", "on hand", "parts", "库存", "备件"])
        {
            return OracleDecision::new("inventory_query", "user asked about inventory");
        }
        OracleDecision::new("general_qa", "no maintenance action recognised")
    }

    fn select_query(input: &str) -> OracleDecision {
        let lower = input.to_lowercase();
        if let Some(wo) = extract_work_order(input) {
            return OracleDecision::new("work_orders.get", format!("look up {wo}"))
                .with_arguments(serde_json::json!({ "work_order_id": wo }));
        }
        if let Some(ticket) = extract_ticket(input) {
            return OracleDecision::new("tickets.get", format!("look up {ticket}"))
                .with_arguments(serde_json::json!({ "ticket_number": ticket }));
        }
        if let Some(part) = extract_part_numbers(input).into_iter().next() {
            return OracleDecision::new("inventory.lookup_part", format!("stock level of {part}"))
                .with_arguments(serde_json::json!({ "part_number": part }));
        }
        if contains_any(&lower, &["ticket", "priority", "critical", "urgent", "工单", "优先"]) {
            return OracleDecision::new("tickets.list_open", "list open tickets by priority");
        }
        OracleDecision::new("inventory.low_stock", "parts at or below reorder point")
    }

    fn parse_decision(input: &str) -> OracleDecision {
        let lower = input.to_lowercase();
        let parts = extract_part_numbers(input);
        if contains_any(&lower, &["reschedule", "postpone", "tomorrow", "later", "next week", "改期"]) {
            return OracleDecision::new("reschedule", "technician wants to reschedule");
        }
        if !parts.is_empty() || contains_any(&lower, &["need part", "need parts", "request part", "missing", "缺件"]) {
            return OracleDecision::new("request_parts", "technician needs parts")
                .with_arguments(serde_json::json!({ "parts_requested": parts }));
        }
        if contains_any(&lower, &["done", "complete", "finished", "fixed", "replaced", "完成"]) {
            return OracleDecision::new("complete", "technician reports the job finished");
        }
        OracleDecision::new("add_notes", "free-form technician note")
            .with_arguments(serde_json::json!({ "notes": input }))
    }

    fn answer() -> OracleDecision {
        OracleDecision::new(
            "answer",
            "I coordinate plant maintenance. Ask me about stock levels (for example \
             \"how many BRG-6205-2RS do we have?\"), open or priority tickets, executing \
             today's maintenance, closing out a work order, or sending a status report email.",
        )
    }
}

#[async_trait]
impl ReasoningOracle for KeywordOracle {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn ask(&self, request: &OracleRequest) -> Result<OracleDecision, CapabilityError> {
        let decision = match request.purpose {
            OraclePurpose::ClassifyIntent => Self::classify(&request.input),
            OraclePurpose::SelectQuery => Self::select_query(&request.input),
            OraclePurpose::ParseDecision => Self::parse_decision(&request.input),
            OraclePurpose::Answer => Self::answer(),
        };
        if request.offers(&decision.action) || request.actions.is_empty() {
            return Ok(decision);
        }
        // 规则命中的动作未被提供时退回首个可选动作
        request
            .actions
            .first()
            .map(|a| OracleDecision::new(a.name.clone(), "fallback to first offered action"))
            .ok_or_else(|| CapabilityError::Failed("no actions offered".to_string()))
    }
}

// ---------------------------------------------------------------------------
// ScriptedOracle
// ---------------------------------------------------------------------------

/// 按顺序返回脚本中的结果；脚本用完后交给 fallback（未设置则失败）
#[derive(Default)]
pub struct ScriptedOracle {
    script: Mutex<VecDeque<Result<OracleDecision, CapabilityError>>>,
    requests: Mutex<Vec<OracleRequest>>,
    fallback: Option<Arc<dyn ReasoningOracle>>,
}

impl ScriptedOracle {
    pub fn new(script: Vec<Result<OracleDecision, CapabilityError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ReasoningOracle>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// 收到的请求（按时间顺序）
    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReasoningOracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn ask(&self, request: &OracleRequest) -> Result<OracleDecision, CapabilityError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self
            .script
            .lock()
            .map_err(|_| CapabilityError::Failed("scripted oracle poisoned".to_string()))?
            .pop_front();
        match (next, &self.fallback) {
            (Some(result), _) => result,
            (None, Some(fallback)) => fallback.ask(request).await,
            (None, None) => Err(CapabilityError::Failed("oracle script exhausted".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::router::USER_INTENTS;
    use crate::llm::MockLlmClient;

    fn classify_request(input: &str) -> OracleRequest {
        OracleRequest {
            agent: AgentId::Supervisor,
            purpose: OraclePurpose::ClassifyIntent,
            instruction: "classify".into(),
            input: input.into(),
            context: Vec::new(),
            actions: USER_INTENTS.iter().map(|i| ActionSpec::new(*i, *i)).collect(),
        }
    }

    #[tokio::test]
    async fn test_keyword_classification() {
        let oracle = KeywordOracle::new();
        for (input, expected) in [
            ("How many BRG-6205-2RS do we have?", "inventory_query"),
            ("Execute today's maintenance", "execute_maintenance"),
            ("Work on CM-2026-0001 please", "execute_single_ticket"),
            ("Any critical tickets?", "priority_query"),
            ("Send the maintenance report email", "email_report"),
            ("Close out WO-PS-015", "work_order_review"),
            ("What is your name?", "general_qa"),
        ] {
            let d = oracle.ask(&classify_request(input)).await.unwrap();
            assert_eq!(d.action, expected, "input: {input}");
        }
    }

    #[test]
    fn test_part_extraction_skips_document_numbers() {
        assert_eq!(
            extract_part_numbers("WO-PS-015 needs BRG-6205-2RS and blt-a42, see CM-2026-0001"),
            vec!["BRG-6205-2RS".to_string(), "BLT-A42".to_string()]
        );
        assert_eq!(extract_work_order("mark wo-ps-015 done").as_deref(), Some("WO-PS-015"));
    }

    #[test]
    fn test_parse_free_text_decision() {
        assert_eq!(KeywordOracle::parse_decision("All done, bearing replaced").action, "complete");
        assert_eq!(
            KeywordOracle::parse_decision("Need FLT-HYD-10 before I can finish").action,
            "request_parts"
        );
        assert_eq!(KeywordOracle::parse_decision("Let's do it tomorrow").action, "reschedule");
        assert_eq!(KeywordOracle::parse_decision("Noise from gearbox").action, "add_notes");
    }

    #[tokio::test]
    async fn test_llm_oracle_parses_json_reply() {
        let llm = Arc::new(MockLlmClient::replying(
            "Sure! {\"action\": \"inventory_query\", \"rationale\": \"stock question\"}",
        ));
        let oracle = LlmOracle::new(llm.clone());
        let d = oracle.ask(&classify_request("how many bearings?")).await.unwrap();
        assert_eq!(d.action, "inventory_query");
        let sent = &llm.requests()[0];
        assert!(sent[0].content.contains("inventory_query"));
        assert!(sent.last().unwrap().content.contains("how many bearings?"));
    }

    #[tokio::test]
    async fn test_llm_oracle_garbage_is_transient() {
        let oracle = LlmOracle::new(Arc::new(MockLlmClient::replying("I cannot help")));
        let err = oracle.ask(&classify_request("x")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_llm_oracle_rejects_unoffered_action() {
        let oracle = LlmOracle::new(Arc::new(MockLlmClient::replying(
            "{\"action\": \"inventory.set_level\", \"arguments\": {\"part_number\": \"BRG-6205-2RS\", \"on_hand\": 0}}",
        )));
        let err = oracle.ask(&classify_request("how many bearings?")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_scripted_oracle_then_fallback() {
        let oracle = ScriptedOracle::new(vec![
            Err(CapabilityError::Unavailable("down".into())),
            Ok(OracleDecision::new("ticket_query", "scripted")),
        ])
        .with_fallback(Arc::new(KeywordOracle::new()));
        let req = classify_request("How many BRG-6205-2RS?");
        assert!(oracle.ask(&req).await.is_err());
        assert_eq!(oracle.ask(&req).await.unwrap().action, "ticket_query");
        assert_eq!(oracle.ask(&req).await.unwrap().action, "inventory_query");
        assert_eq!(oracle.requests().len(), 3);
    }
}
