//! 核心编排层：状态、路由、中断、错误与恢复、引擎主循环

pub mod builder;
pub mod engine;
pub mod error;
pub mod interrupt;
pub mod recovery;
pub mod router;
pub mod state;

pub use builder::{create_engine_builder, EngineBuilder, EngineComponents};
pub use engine::{Engine, RunOutcome, SessionReport};
pub use error::OrchestratorError;
pub use interrupt::{
    DecisionPayload, InterruptController, InterruptRequest, InterruptResponse, ResolvedInterrupt, TechnicianDecision,
};
pub use recovery::{RecoveryAction, RecoveryPolicy};
pub use router::{Decision, Router, TerminationReason};
pub use state::{AgentId, SessionOutcome, SessionStatus, StateDelta, TaskState, WorkContext};
