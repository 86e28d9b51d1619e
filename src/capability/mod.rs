//! 能力网关层：Agent 访问 oracle 与外部系统的唯一通道
//!
//! 每个能力声明参数 schema（schemars 生成）与副作用等级；
//! 网关负责权限表、参数校验、超时、瞬时错误重试与审计日志。

pub mod gateway;
pub mod notify;
pub mod oracle;
pub mod plant;
pub mod registry;
pub mod schema;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use gateway::{permitted, CapabilityGateway, StepScope, ORACLE_CAPABILITY};
pub use notify::{Email, LogNotifier, Notifier, NotifyOutcome};
pub use oracle::{
    ActionSpec, KeywordOracle, LlmOracle, OracleDecision, OraclePurpose, OracleRequest,
    ReasoningOracle, ScriptedOracle,
};
pub use registry::{Capability, CapabilityRegistry, Typed, TypedCapability};

/// 副作用等级，决定重试策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    ReadOnly,
    IdempotentWrite,
    NonIdempotentWrite,
}

impl SideEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffect::ReadOnly => "read_only",
            SideEffect::IdempotentWrite => "idempotent_write",
            SideEffect::NonIdempotentWrite => "non_idempotent_write",
        }
    }
}

/// 单个能力调用的失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    /// schema 校验失败，未产生任何副作用
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// 调用超时；对非幂等写入而言结果未知
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// 服务不可用，调用未被执行（可安全重试）
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Failed(String),
}

impl CapabilityError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityError::Timeout(_) | CapabilityError::Unavailable(_))
    }
}
