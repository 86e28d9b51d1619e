//! 路由器：从 TaskState 计算下一个 Agent 或终止
//!
//! 纯函数，无副作用、无 I/O。规则按优先级：
//! 已终止 → 中断固定到 owner → 迭代上限 → 已有最终答复 → 意图查表（未设置/未知回落到 Supervisor）。

use serde::{Deserialize, Serialize};

use crate::core::state::{AgentId, TaskState};

/// 意图令牌 → Agent 的静态表
const INTENT_TABLE: &[(&str, AgentId)] = &[
    ("inventory_query", AgentId::Inventory),
    ("ticket_query", AgentId::Inventory),
    ("priority_query", AgentId::Inventory),
    ("parts_check", AgentId::Inventory),
    ("execute_maintenance", AgentId::WorkOrder),
    ("execute_single_ticket", AgentId::WorkOrder),
    ("create_work_order", AgentId::WorkOrder),
    ("procurement", AgentId::Procurement),
    ("technician_review", AgentId::Technician),
    ("work_order_review", AgentId::Technician),
    ("email_report", AgentId::Reporter),
    ("general_qa", AgentId::Supervisor),
    ("summarize", AgentId::Supervisor),
];

/// Supervisor 分类时可选的用户意图（交接令牌不在其中）
pub const USER_INTENTS: &[&str] = &[
    "execute_maintenance",
    "execute_single_ticket",
    "inventory_query",
    "ticket_query",
    "priority_query",
    "work_order_review",
    "email_report",
    "general_qa",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// 会话此前已终止
    AlreadyTerminal,
    /// 某个 Agent 给出了最终答复
    Completed,
    /// 迭代次数达到上限
    RoutingLoop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Run(AgentId),
    Terminate(TerminationReason),
}

#[derive(Debug, Clone)]
pub struct Router {
    max_iterations: u32,
}

impl Router {
    pub fn new(max_iterations: u32) -> Self {
        Self { max_iterations }
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn decide(&self, state: &TaskState) -> Decision {
        if state.terminal {
            return Decision::Terminate(TerminationReason::AlreadyTerminal);
        }
        if let Some(pending) = &state.pending_interrupt {
            return Decision::Run(pending.owner);
        }
        if state.iteration_count >= self.max_iterations {
            return Decision::Terminate(TerminationReason::RoutingLoop);
        }
        if state.work.answer.is_some() {
            return Decision::Terminate(TerminationReason::Completed);
        }
        Decision::Run(
            state
                .routing_intent
                .as_deref()
                .and_then(lookup_intent)
                .unwrap_or(AgentId::Supervisor),
        )
    }
}

/// 查表；未知意图返回 None
pub fn lookup_intent(intent: &str) -> Option<AgentId> {
    INTENT_TABLE
        .iter()
        .find(|(token, _)| *token == intent)
        .map(|(_, agent)| *agent)
}
