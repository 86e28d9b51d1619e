//! Maint - 维护计划多智能体编排引擎
//!
//! 模块划分：
//! - **agents**: 固定的 Agent 变体（Supervisor、Inventory、WorkOrder、Procurement、Technician、Reporter）
//! - **capability**: 能力网关（注册表、schema、权限、重试、审计）、oracle、工厂数据与邮件能力
//! - **checkpoint**: 检查点存储（内存 / 文件 / SQLite）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务状态、路由、中断、错误与恢复、编排引擎
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 会话消息日志
//! - **observability**: 日志初始化
//! - **plant**: 工厂数据存储（维修单、BOM、库存、工单、请购单）

pub mod agents;
pub mod capability;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod plant;

pub use crate::core::{Engine, EngineBuilder, OrchestratorError, RunOutcome, SessionReport};
