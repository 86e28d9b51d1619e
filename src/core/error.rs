//! 编排错误分类
//!
//! 引擎边界以下的错误要么在本地重试（瞬时错误，见 RecoveryPolicy），
//! 要么转换为以下某个已分类结果返回调用方；不存在“半应用”的状态。

use thiserror::Error;

use crate::checkpoint::CheckpointError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// oracle 或外部服务超时/不可用，网关重试耗尽后才会出现
    #[error("Transient failure in capability {capability} after {attempts} attempts: {message}")]
    TransientCapability {
        capability: String,
        attempts: u32,
        message: String,
    },

    #[error("Routing loop exceeded in session {session_id}: {limit} iterations")]
    RoutingLoopExceeded { session_id: String, limit: u32 },

    #[error("Stale interrupt {got} for session {session_id} (outstanding: {outstanding})")]
    StaleInterrupt {
        session_id: String,
        got: String,
        outstanding: String,
    },

    #[error("No pending interrupt for session {session_id}")]
    NoPendingInterrupt { session_id: String },

    /// 检查点写入失败；会话停留在上一个有效检查点
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// schema 校验失败，发生在任何副作用之前
    #[error("Invalid arguments for capability {capability}: {message}")]
    InvalidCapabilityArguments { capability: String, message: String },

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Capability {capability} is not permitted for agent {agent}")]
    CapabilityNotPermitted { capability: String, agent: String },

    #[error("Capability {capability} failed: {message}")]
    CapabilityFailed { capability: String, message: String },

    #[error("Invalid decision: {0}")]
    InvalidDecision(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Session {0} is closed")]
    SessionClosed(String),

    #[error("Session {0} is awaiting a technician decision")]
    AwaitingInterrupt(String),

    #[error("Agent {agent} failed: {message}")]
    AgentFailed { agent: String, message: String },

    #[error("Config error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// 调用方可原样重试整个请求（会话仍停在上一个检查点）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::TransientCapability { .. }
                | OrchestratorError::PersistenceFailure(_)
                | OrchestratorError::CapabilityFailed { .. }
                | OrchestratorError::AgentFailed { .. }
        )
    }
}

impl From<CheckpointError> for OrchestratorError {
    fn from(err: CheckpointError) -> Self {
        OrchestratorError::PersistenceFailure(err.to_string())
    }
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(err: config::ConfigError) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}
