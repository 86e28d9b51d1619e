//! 中断控制器：挂起等待人工决策，并在答复到达后以确定的方式恢复
//!
//! 状态迁移：RUNNING → SUSPENDED → RUNNING（收到答复，恢复 owner Agent）或 RUNNING → RESOLVED（无需人工）。
//! 挂起期间会话只以检查点形式存在，不占用任何内存资源。
//! 答复只能被消费一次：owner 步骤提交后 pending_interrupt 被清空。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::OrchestratorError;
use crate::core::state::{AgentId, TaskState};

/// 中断类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    /// 技术员对工单的处理决定
    TechnicianDecision,
}

/// 技术员可做出的决定
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechnicianDecision {
    Complete,
    RequestParts,
    Reschedule,
    AddNotes,
}

impl TechnicianDecision {
    pub const CHOICES: [&'static str; 4] = ["complete", "request_parts", "reschedule", "add_notes"];

    pub fn as_str(&self) -> &'static str {
        match self {
            TechnicianDecision::Complete => "complete",
            TechnicianDecision::RequestParts => "request_parts",
            TechnicianDecision::Reschedule => "reschedule",
            TechnicianDecision::AddNotes => "add_notes",
        }
    }
}

impl fmt::Display for TechnicianDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TechnicianDecision {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "complete" | "completed" | "confirm_completion" | "done" => Ok(Self::Complete),
            "request_parts" | "parts" => Ok(Self::RequestParts),
            "reschedule" => Ok(Self::Reschedule),
            "add_notes" | "notes" => Ok(Self::AddNotes),
            other => Err(OrchestratorError::InvalidDecision(format!(
                "unknown technician decision '{other}'"
            ))),
        }
    }
}

/// Agent 发起的中断请求
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterruptRequest {
    pub id: String,
    pub kind: InterruptKind,
    pub prompt: String,
    pub choices: Vec<String>,
    pub target_entity_id: Option<String>,
    /// 展示给技术员的工单卡片等
    #[serde(default)]
    pub payload: serde_json::Value,
    /// 超时后自动采用 default_choice
    pub deadline: Option<DateTime<Utc>>,
    pub default_choice: Option<String>,
}

impl InterruptRequest {
    pub fn technician(prompt: impl Into<String>, target_entity_id: Option<String>) -> Self {
        Self {
            id: format!("int_{}", uuid::Uuid::new_v4()),
            kind: InterruptKind::TechnicianDecision,
            prompt: prompt.into(),
            choices: TechnicianDecision::CHOICES.iter().map(|c| c.to_string()).collect(),
            target_entity_id,
            payload: serde_json::Value::Null,
            deadline: None,
            default_choice: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>, default_choice: impl Into<String>) -> Self {
        self.deadline = Some(deadline);
        self.default_choice = Some(default_choice.into());
        self
    }
}

/// 调用方提交的原始决策载荷（respond 边界）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionPayload {
    pub choice: Option<String>,
    pub text: Option<String>,
    pub parts_requested: Vec<String>,
}

impl DecisionPayload {
    pub fn choice(choice: impl Into<String>) -> Self {
        Self {
            choice: Some(choice.into()),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_parts(mut self, parts: Vec<String>) -> Self {
        self.parts_requested = parts;
        self
    }
}

/// 已校验的中断答复；choice 为 None 时由 owner Agent 解析 text
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterruptResponse {
    pub interrupt_id: String,
    pub choice: Option<TechnicianDecision>,
    pub text: Option<String>,
    #[serde(default)]
    pub parts_requested: Vec<String>,
    pub responded_at: DateTime<Utc>,
    /// 超时默认值注入，而非人工答复
    #[serde(default)]
    pub defaulted: bool,
}

/// 挂起中的中断：请求、所属 Agent、（可能已注入的）答复
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingInterrupt {
    pub request: InterruptRequest,
    pub owner: AgentId,
    pub response: Option<InterruptResponse>,
}

/// 已消费的中断；defaulted 表示由超时默认值解决
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedInterrupt {
    pub id: String,
    pub defaulted: bool,
}

/// 中断控制器（无状态，操作显式传入的 TaskState）
#[derive(Debug, Default, Clone, Copy)]
pub struct InterruptController;

impl InterruptController {
    pub fn new() -> Self {
        Self
    }

    /// 进入 SUSPENDED：记录请求与 owner
    pub fn suspend(&self, state: &mut TaskState, owner: AgentId, request: InterruptRequest) {
        state.pending_interrupt = Some(PendingInterrupt {
            request,
            owner,
            response: None,
        });
    }

    /// 校验答复身份
    ///
    /// - 已被超时默认值解决的中断 → StaleInterrupt（会话已越过该中断）
    /// - 无挂起，或人工答复已注入 → NoPendingInterrupt
    /// - id 不符 → StaleInterrupt
    pub fn validate<'a>(
        &self,
        state: &'a TaskState,
        interrupt_id: &str,
    ) -> Result<&'a PendingInterrupt, OrchestratorError> {
        let stale = |outstanding: Option<&str>| OrchestratorError::StaleInterrupt {
            session_id: state.session_id.clone(),
            got: interrupt_id.to_string(),
            outstanding: outstanding.unwrap_or("none").to_string(),
        };
        let pending = match &state.pending_interrupt {
            Some(p) if p.response.is_none() => p,
            Some(p) if p.request.id == interrupt_id && p.response.as_ref().is_some_and(|r| r.defaulted) => {
                return Err(stale(None));
            }
            _ => {
                let defaulted = state
                    .resolved_interrupts
                    .iter()
                    .any(|r| r.id == interrupt_id && r.defaulted);
                if defaulted {
                    return Err(stale(None));
                }
                return Err(OrchestratorError::NoPendingInterrupt {
                    session_id: state.session_id.clone(),
                });
            }
        };
        if pending.request.id != interrupt_id {
            return Err(stale(Some(pending.request.id.as_str())));
        }
        Ok(pending)
    }

    /// 校验并构造答复；不修改状态
    pub fn accept(
        &self,
        state: &TaskState,
        interrupt_id: &str,
        payload: DecisionPayload,
        now: DateTime<Utc>,
    ) -> Result<InterruptResponse, OrchestratorError> {
        let pending = self.validate(state, interrupt_id)?;
        let choice = match payload.choice.as_deref() {
            Some(raw) => {
                let decision: TechnicianDecision = raw.parse()?;
                if !pending.request.choices.iter().any(|c| c == decision.as_str()) {
                    return Err(OrchestratorError::InvalidDecision(format!(
                        "'{decision}' is not offered by interrupt {interrupt_id}"
                    )));
                }
                Some(decision)
            }
            None => None,
        };
        if choice.is_none() && payload.text.as_deref().map_or(true, |t| t.trim().is_empty()) {
            return Err(OrchestratorError::InvalidDecision(
                "a decision needs a choice or free text".to_string(),
            ));
        }
        Ok(InterruptResponse {
            interrupt_id: interrupt_id.to_string(),
            choice,
            text: payload.text,
            parts_requested: payload.parts_requested,
            responded_at: now,
            defaulted: false,
        })
    }

    /// 超时且配置了默认选项时生成默认答复
    pub fn default_response(&self, state: &TaskState, now: DateTime<Utc>) -> Option<InterruptResponse> {
        let pending = state.pending_interrupt.as_ref()?;
        if pending.response.is_some() {
            return None;
        }
        let deadline = pending.request.deadline?;
        if now < deadline {
            return None;
        }
        let choice = pending
            .request
            .default_choice
            .as_deref()
            .and_then(|c| c.parse::<TechnicianDecision>().ok())?;
        Some(InterruptResponse {
            interrupt_id: pending.request.id.clone(),
            choice: Some(choice),
            text: Some(format!("No technician response before {deadline}; applied default")),
            parts_requested: Vec::new(),
            responded_at: now,
            defaulted: true,
        })
    }

    /// 注入答复（SUSPENDED → RUNNING），路由仍固定到 owner
    pub fn inject(&self, state: &mut TaskState, response: InterruptResponse) {
        if let Some(pending) = state.pending_interrupt.as_mut() {
            pending.response = Some(response);
        }
    }

    /// 供 owner Agent 读取已注入的答复
    pub fn response_for<'a>(&self, state: &'a TaskState, agent: AgentId) -> Option<&'a InterruptResponse> {
        state
            .pending_interrupt
            .as_ref()
            .filter(|p| p.owner == agent)
            .and_then(|p| p.response.as_ref())
    }

    /// owner 步骤消费答复后清空中断并记入 resolved_interrupts；未答复时保持不变
    pub fn consume(&self, state: &mut TaskState) -> Option<InterruptResponse> {
        if state.pending_interrupt.as_ref()?.response.is_none() {
            return None;
        }
        let response = state.pending_interrupt.take().and_then(|p| p.response)?;
        state.resolved_interrupts.push(ResolvedInterrupt {
            id: response.interrupt_id.clone(),
            defaulted: response.defaulted,
        });
        Some(response)
    }
}
