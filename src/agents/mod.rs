//! 维护团队 Agent（固定变体集合）
//!
//! 每个 Agent 是一个 async 函数：读取 TaskState 与最近消息窗口，经 StepScope 调用能力，
//! 返回 AgentStep（状态增量 + 新消息 + 可选中断）。Agent 不直接修改状态，也不写检查点。

mod inventory;
mod procurement;
mod reporter;
mod supervisor;
mod technician;
mod work_order;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::capability::StepScope;
use crate::config::AppConfig;
use crate::core::error::OrchestratorError;
use crate::core::interrupt::InterruptRequest;
use crate::core::state::{AgentId, PartRequirement, StateDelta, TaskState};
use crate::memory::Message;
use crate::plant::{Part, Ticket, WorkOrder};

/// Agent 运行参数（来自配置）
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub report_recipient: String,
    /// 技术员中断超时；None 表示无限等待
    pub interrupt_timeout: Option<Duration>,
    pub interrupt_default_choice: String,
}

impl AgentSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            report_recipient: cfg.app.report_recipient.clone(),
            interrupt_timeout: cfg.engine.interrupt_timeout(),
            interrupt_default_choice: cfg.engine.interrupt_default_choice.clone(),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 一次 Agent 执行的输入
pub struct AgentContext<'a> {
    pub state: &'a TaskState,
    /// 最近的消息窗口
    pub window: &'a [Message],
    /// 会话中最近一条用户消息
    pub user_text: Option<String>,
    pub scope: &'a StepScope,
    pub settings: &'a AgentSettings,
    pub now: DateTime<Utc>,
}

impl AgentContext<'_> {
    pub fn agent(&self) -> AgentId {
        self.scope.agent()
    }

    fn intent(&self) -> Option<&str> {
        self.state.routing_intent.as_deref()
    }
}

/// 一次 Agent 执行的输出
#[derive(Debug, Default)]
pub struct AgentStep {
    pub delta: StateDelta,
    pub messages: Vec<Message>,
    pub interrupt: Option<InterruptRequest>,
}

impl AgentStep {
    pub fn new(delta: StateDelta) -> Self {
        Self {
            delta,
            ..Self::default()
        }
    }

    pub fn say(mut self, agent: AgentId, text: impl Into<String>) -> Self {
        self.messages.push(Message::agent(agent.as_str(), text));
        self
    }

    pub fn tool(mut self, capability: &str, result: Value) -> Self {
        self.messages.push(Message::tool(capability, result));
        self
    }

    pub fn interrupt(mut self, request: InterruptRequest) -> Self {
        self.interrupt = Some(request);
        self
    }
}

/// 按变体分派
pub async fn run_agent(ctx: &AgentContext<'_>) -> Result<AgentStep, OrchestratorError> {
    let agent = ctx.agent();
    tracing::debug!(%agent, intent = ?ctx.intent(), session = %ctx.state.session_id, "agent step");
    match agent {
        AgentId::Supervisor => supervisor::run(ctx).await,
        AgentId::Inventory => inventory::run(ctx).await,
        AgentId::WorkOrder => work_order::run(ctx).await,
        AgentId::Procurement => procurement::run(ctx).await,
        AgentId::Technician => technician::run(ctx).await,
        AgentId::Reporter => reporter::run(ctx).await,
    }
}

// ---- 文本格式化（各 Agent 共用） ----

fn describe_ticket(t: &Ticket) -> String {
    let due = t.due_date.as_deref().unwrap_or("no due date");
    format!(
        "{} [{}] {} ({}, {}, due {})",
        t.number,
        t.priority.as_str(),
        t.title,
        t.machine_code,
        t.status.as_str(),
        due
    )
}

fn describe_part(p: &Part) -> String {
    format!(
        "{} ({}): {} on hand at bin {}, reorder point {}",
        p.part_number, p.name, p.on_hand, p.bin_location, p.reorder_point
    )
}

fn describe_work_order(w: &WorkOrder) -> String {
    let mut line = format!(
        "{} for ticket {} on {}: {} (technician {}, status {})",
        w.number,
        w.ticket_number,
        w.machine_code,
        w.description,
        w.technician_id,
        w.status.as_str()
    );
    if !w.notes.is_empty() {
        line.push_str(&format!("; notes: {}", w.notes.join(" | ")));
    }
    line
}

fn describe_parts(parts: &[PartRequirement]) -> String {
    parts
        .iter()
        .map(|p| format!("{} x{}", p.part_number, p.quantity))
        .collect::<Vec<_>>()
        .join(", ")
}

fn bullet_list<T>(items: &[T], describe: impl Fn(&T) -> String) -> String {
    items
        .iter()
        .map(|i| format!("- {}", describe(i)))
        .collect::<Vec<_>>()
        .join("\n")
}
