//! 任务状态：会话级可变快照（当前 Agent、路由意图、迭代计数、挂起中断）
//!
//! TaskState 在一个引擎步骤内由引擎独占（单写者）；Agent 只返回 StateDelta，
//! 由引擎在提交前应用到状态副本上，提交失败则副本整体丢弃。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::interrupt::{PendingInterrupt, ResolvedInterrupt, TechnicianDecision};

/// 固定的 Agent 变体集合；新增 Agent = 新增变体 + 路由表条目
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentId {
    /// 维护计划员：意图分类、最终汇总、一般问答
    Supervisor,
    /// 库管：库存查询、工单备件校验与发放
    Inventory,
    /// 维护主管：建工单、派技术员
    WorkOrder,
    /// 采购：请购单与供应商邮件
    Procurement,
    /// 人工技术员（人在回路）
    Technician,
    /// 邮件报告
    Reporter,
}

impl AgentId {
    pub const ALL: [AgentId; 6] = [
        AgentId::Supervisor,
        AgentId::Inventory,
        AgentId::WorkOrder,
        AgentId::Procurement,
        AgentId::Technician,
        AgentId::Reporter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentId::Supervisor => "supervisor",
            AgentId::Inventory => "inventory",
            AgentId::WorkOrder => "work_order",
            AgentId::Procurement => "procurement",
            AgentId::Technician => "technician",
            AgentId::Reporter => "reporter",
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentId::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown agent: {s}"))
    }
}

/// 会话终止原因（诊断用，随终止检查点持久化）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    RoutingLoopExceeded { limit: u32 },
    Cancelled,
    Closed,
}

/// 调用方可见的会话状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Running,
    Suspended,
    Terminated,
}

/// 备件需求（零件号 + 数量）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PartRequirement {
    pub part_number: String,
    pub quantity: u32,
}

/// Agent 之间交接的业务上下文
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkContext {
    pub ticket_id: Option<String>,
    pub machine_id: Option<String>,
    pub work_order_id: Option<String>,
    pub technician_id: Option<String>,
    #[serde(default)]
    pub required_parts: Vec<PartRequirement>,
    #[serde(default)]
    pub issued_parts: Vec<PartRequirement>,
    #[serde(default)]
    pub out_of_stock: Vec<PartRequirement>,
    #[serde(default)]
    pub requisition_ids: Vec<String>,
    pub technician_action: Option<TechnicianDecision>,
    /// 各 Agent 的阶段结论，供 Supervisor 汇总
    #[serde(default)]
    pub findings: Vec<String>,
    /// 最终答复；一旦写入，路由器即终止会话
    pub answer: Option<String>,
}

/// 会话任务状态
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub session_id: String,
    pub current_agent: Option<AgentId>,
    /// 自由格式的意图令牌（如 inventory_query、create_work_order）
    pub routing_intent: Option<String>,
    pub iteration_count: u32,
    pub pending_interrupt: Option<PendingInterrupt>,
    /// 已消费的中断，用于区分迟到答复与重复答复
    #[serde(default)]
    pub resolved_interrupts: Vec<ResolvedInterrupt>,
    pub terminal: bool,
    pub outcome: Option<SessionOutcome>,
    #[serde(default)]
    pub work: WorkContext,
    /// 与本状态配对的消息日志长度（检查点加载时校验一致性）
    pub log_len: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            current_agent: None,
            routing_intent: None,
            iteration_count: 0,
            pending_interrupt: None,
            resolved_interrupts: Vec::new(),
            terminal: false,
            outcome: None,
            work: WorkContext::default(),
            log_len: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> SessionStatus {
        if self.terminal {
            SessionStatus::Terminated
        } else if self.is_suspended() {
            SessionStatus::Suspended
        } else {
            SessionStatus::Running
        }
    }

    /// 存在中断且尚未收到人工答复
    pub fn is_suspended(&self) -> bool {
        self.pending_interrupt
            .as_ref()
            .is_some_and(|p| p.response.is_none())
    }

    pub fn terminate(&mut self, outcome: SessionOutcome) {
        self.terminal = true;
        self.outcome = Some(outcome);
        self.updated_at = Utc::now();
    }

    pub fn apply(&mut self, delta: StateDelta) {
        if let Some(change) = delta.intent {
            self.routing_intent = match change {
                IntentChange::Set(intent) => Some(intent),
                IntentChange::Clear => None,
            };
        }
        for update in delta.work {
            update.apply_to(&mut self.work);
        }
        self.updated_at = Utc::now();
    }
}

/// 路由意图变更
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum IntentChange {
    Set(String),
    Clear,
}

/// 单项业务上下文更新
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WorkUpdate {
    Ticket { ticket_id: String, machine_id: String },
    WorkOrder { work_order_id: String, technician_id: String },
    /// 用户点名的工单（仅 id，详情由下游 Agent 查询）
    RequestedTicket(String),
    RequestedWorkOrder(String),
    RequiredParts(Vec<PartRequirement>),
    IssuedParts(Vec<PartRequirement>),
    OutOfStock(Vec<PartRequirement>),
    Requisitions(Vec<String>),
    TechnicianAction(TechnicianDecision),
    Finding(String),
    Answer(String),
}

impl WorkUpdate {
    fn apply_to(self, work: &mut WorkContext) {
        match self {
            WorkUpdate::Ticket { ticket_id, machine_id } => {
                work.ticket_id = Some(ticket_id);
                work.machine_id = Some(machine_id);
            }
            WorkUpdate::WorkOrder {
                work_order_id,
                technician_id,
            } => {
                work.work_order_id = Some(work_order_id);
                work.technician_id = Some(technician_id);
            }
            WorkUpdate::RequestedTicket(ticket_id) => work.ticket_id = Some(ticket_id),
            WorkUpdate::RequestedWorkOrder(work_order_id) => work.work_order_id = Some(work_order_id),
            WorkUpdate::RequiredParts(parts) => work.required_parts = parts,
            WorkUpdate::IssuedParts(parts) => work.issued_parts.extend(parts),
            WorkUpdate::OutOfStock(parts) => work.out_of_stock = parts,
            WorkUpdate::Requisitions(ids) => work.requisition_ids.extend(ids),
            WorkUpdate::TechnicianAction(action) => work.technician_action = Some(action),
            WorkUpdate::Finding(text) => work.findings.push(text),
            WorkUpdate::Answer(text) => work.answer = Some(text),
        }
    }
}

/// Agent 一步产出的状态增量
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub intent: Option<IntentChange>,
    pub work: Vec<WorkUpdate>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(IntentChange::Set(intent.into()));
        self
    }

    pub fn clear_intent(mut self) -> Self {
        self.intent = Some(IntentChange::Clear);
        self
    }

    pub fn update(mut self, update: WorkUpdate) -> Self {
        self.work.push(update);
        self
    }

    pub fn finding(self, text: impl Into<String>) -> Self {
        self.update(WorkUpdate::Finding(text.into()))
    }

    pub fn answer(self, text: impl Into<String>) -> Self {
        self.update(WorkUpdate::Answer(text.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_running() {
        let state = TaskState::new("s1");
        assert_eq!(state.status(), SessionStatus::Running);
        assert_eq!(state.iteration_count, 0);
        assert!(state.routing_intent.is_none());
    }

    #[test]
    fn test_apply_delta() {
        let mut state = TaskState::new("s1");
        state.apply(
            StateDelta::new()
                .intent("parts_check")
                .update(WorkUpdate::WorkOrder {
                    work_order_id: "WO-PS-015".into(),
                    technician_id: "T-01".into(),
                })
                .finding("work order created"),
        );
        assert_eq!(state.routing_intent.as_deref(), Some("parts_check"));
        assert_eq!(state.work.work_order_id.as_deref(), Some("WO-PS-015"));
        assert_eq!(state.work.findings.len(), 1);

        state.apply(StateDelta::new().clear_intent());
        assert!(state.routing_intent.is_none());
    }

    #[test]
    fn test_terminate_sets_status() {
        let mut state = TaskState::new("s1");
        state.terminate(SessionOutcome::Cancelled);
        assert_eq!(state.status(), SessionStatus::Terminated);
        assert_eq!(state.outcome, Some(SessionOutcome::Cancelled));
    }

    #[test]
    fn test_agent_id_round_trip() {
        for agent in AgentId::ALL {
            assert_eq!(agent.as_str().parse::<AgentId>().unwrap(), agent);
        }
        assert!("nobody".parse::<AgentId>().is_err());
    }
}
