//! 记忆层：会话消息日志（引擎其余组件的基础）

pub mod log;

pub use log::{Content, Message, MessageLog, Role};
