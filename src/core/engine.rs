//! 编排引擎：持久、可恢复的会话状态机
//!
//! 每个步骤：加载最新检查点 → Router 决策 → 经网关运行 Agent → 追加消息、应用增量、iteration += 1 → 保存检查点。
//! 保存成功即提交；保存前的任何失败都不留下痕迹，会话停在上一个检查点，可用 drive 重试。
//! 同一会话单写者（会话级异步锁），不同会话并发执行；挂起的会话只以检查点形式存在。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::agents::{run_agent, AgentContext, AgentSettings};
use crate::capability::CapabilityGateway;
use crate::checkpoint::{Checkpoint, CheckpointMeta, CheckpointStore};
use crate::core::error::OrchestratorError;
use crate::core::interrupt::{DecisionPayload, InterruptController, InterruptRequest, InterruptResponse};
use crate::core::router::{Decision, Router, TerminationReason};
use crate::core::state::{AgentId, SessionOutcome, SessionStatus, TaskState};
use crate::memory::{Message, MessageLog};

/// start / respond / drive 的结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Suspended {
        session_id: String,
        interrupt: InterruptRequest,
    },
    Terminated {
        session_id: String,
        outcome: SessionOutcome,
        answer: Option<String>,
    },
}

impl RunOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            RunOutcome::Suspended { session_id, .. } | RunOutcome::Terminated { session_id, .. } => session_id,
        }
    }

    pub fn interrupt(&self) -> Option<&InterruptRequest> {
        match self {
            RunOutcome::Suspended { interrupt, .. } => Some(interrupt),
            RunOutcome::Terminated { .. } => None,
        }
    }

    pub fn answer(&self) -> Option<&str> {
        match self {
            RunOutcome::Terminated { answer, .. } => answer.as_deref(),
            RunOutcome::Suspended { .. } => None,
        }
    }
}

/// resume 返回的只读会话视图
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub pending: Option<InterruptRequest>,
    pub outcome: Option<SessionOutcome>,
    pub answer: Option<String>,
    pub current_agent: Option<AgentId>,
    pub iteration_count: u32,
    pub last_step: u64,
}

impl SessionReport {
    fn from_checkpoint(cp: &Checkpoint) -> Self {
        let state = &cp.state;
        Self {
            session_id: state.session_id.clone(),
            status: state.status(),
            // 已终止的会话不再展示待答复的提示
            pending: state
                .pending_interrupt
                .as_ref()
                .filter(|p| !state.terminal && p.response.is_none())
                .map(|p| p.request.clone()),
            outcome: state.outcome.clone(),
            answer: state.work.answer.clone(),
            current_agent: state.current_agent,
            iteration_count: state.iteration_count,
            last_step: cp.step,
        }
    }

    pub fn pending_prompt(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.prompt.as_str())
    }
}

pub struct Engine {
    store: Arc<dyn CheckpointStore>,
    gateway: Arc<CapabilityGateway>,
    router: Router,
    interrupts: InterruptController,
    settings: AgentSettings,
    context_window: usize,
    /// 会话级单写者锁；空闲会话的锁会被回收
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// 步间取消令牌
    cancels: Mutex<HashMap<String, CancellationToken>>,
}

impl Engine {
    pub fn new(store: Arc<dyn CheckpointStore>, gateway: Arc<CapabilityGateway>) -> Self {
        let settings = AgentSettings::default();
        Self {
            store,
            gateway,
            router: Router::new(15),
            interrupts: InterruptController::new(),
            settings,
            context_window: 20,
            locks: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.router = Router::new(max_iterations);
        self
    }

    pub fn with_context_window(mut self, context_window: usize) -> Self {
        self.context_window = context_window.max(1);
        self
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn gateway(&self) -> &Arc<CapabilityGateway> {
        &self.gateway
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    // ---- 调用方接口 ----

    /// 以第一条用户消息创建会话（step 0）并驱动到挂起或终止
    pub async fn start(&self, session_id: Option<String>, user_text: &str) -> Result<RunOutcome, OrchestratorError> {
        let session_id = session_id.unwrap_or_else(|| format!("sess_{}", uuid::Uuid::new_v4().simple()));
        let guard = self.lock_session(&session_id).await;
        let result = self.start_locked(&session_id, user_text).await;
        self.release(&session_id, guard);
        result
    }

    async fn start_locked(&self, session_id: &str, user_text: &str) -> Result<RunOutcome, OrchestratorError> {
        if self.store.load_latest(session_id).await?.is_some() {
            return Err(OrchestratorError::SessionExists(session_id.to_string()));
        }
        let mut log = MessageLog::new();
        log.append(Message::user(user_text));
        let mut state = TaskState::new(session_id);
        state.log_len = log.len() as u64;
        self.commit(Checkpoint::new(0, state, log)).await?;
        tracing::info!(session = %session_id, "session started");
        self.drive_locked(session_id).await
    }

    /// 技术员答复：校验 → 注入并提交 → 恢复 owner Agent
    pub async fn respond(
        &self,
        session_id: &str,
        interrupt_id: &str,
        payload: DecisionPayload,
    ) -> Result<RunOutcome, OrchestratorError> {
        let guard = self.lock_session(session_id).await;
        let result = self.respond_locked(session_id, interrupt_id, payload).await;
        self.release(session_id, guard);
        result
    }

    async fn respond_locked(
        &self,
        session_id: &str,
        interrupt_id: &str,
        payload: DecisionPayload,
    ) -> Result<RunOutcome, OrchestratorError> {
        let cp = self.latest(session_id).await?;
        let response = self.interrupts.accept(&cp.state, interrupt_id, payload, Utc::now())?;
        // 挂起期间被取消或归档的会话不再接受答复
        if cp.state.terminal {
            return Err(OrchestratorError::SessionClosed(session_id.to_string()));
        }
        tracing::info!(session = %session_id, interrupt = %interrupt_id, choice = ?response.choice, "technician responded");
        self.inject(cp, response).await?;
        self.drive_locked(session_id).await
    }

    /// 中断超时：注入默认决定；未超时或无中断返回 None
    pub async fn expire_interrupt(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RunOutcome>, OrchestratorError> {
        let guard = self.lock_session(session_id).await;
        let result = self.expire_locked(session_id, now).await;
        self.release(session_id, guard);
        result
    }

    async fn expire_locked(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RunOutcome>, OrchestratorError> {
        let cp = self.latest(session_id).await?;
        if cp.state.terminal {
            return Ok(None);
        }
        let Some(response) = self.interrupts.default_response(&cp.state, now) else {
            return Ok(None);
        };
        tracing::warn!(session = %session_id, interrupt = %response.interrupt_id, "interrupt expired, applying default");
        self.inject(cp, response).await?;
        self.drive_locked(session_id).await.map(Some)
    }

    /// 对所有会话并发执行 expire_interrupt，返回实际被恢复的会话
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<RunOutcome>, OrchestratorError> {
        let sessions = self.store.sessions().await?;
        let results = join_all(sessions.iter().map(|id| self.expire_interrupt(id, now))).await;
        let mut resumed = Vec::new();
        for (id, result) in sessions.iter().zip(results) {
            match result {
                Ok(Some(outcome)) => resumed.push(outcome),
                Ok(None) => {}
                Err(e) => tracing::warn!(session = %id, error = %e, "expiring interrupt failed"),
            }
        }
        Ok(resumed)
    }

    /// 只读视图；可重复调用，无副作用
    pub async fn resume(&self, session_id: &str) -> Result<SessionReport, OrchestratorError> {
        let cp = self.latest(session_id).await?;
        Ok(SessionReport::from_checkpoint(&cp))
    }

    /// 失败步骤之后由调用方重试驱动
    pub async fn drive(&self, session_id: &str) -> Result<RunOutcome, OrchestratorError> {
        let guard = self.lock_session(session_id).await;
        let result = self.retry_locked(session_id).await;
        self.release(session_id, guard);
        result
    }

    async fn retry_locked(&self, session_id: &str) -> Result<RunOutcome, OrchestratorError> {
        let cp = self.latest(session_id).await?;
        if cp.state.is_suspended() {
            return Err(OrchestratorError::AwaitingInterrupt(session_id.to_string()));
        }
        self.drive_locked(session_id).await
    }

    /// 请求取消：正在运行的会话在当前步骤提交后停止；空闲会话立即写入 Cancelled 终止检查点
    pub async fn cancel(&self, session_id: &str) -> Result<SessionReport, OrchestratorError> {
        self.cancel_token(session_id).cancel();
        let guard = self.lock_session(session_id).await;
        let result = self.finish(session_id, SessionOutcome::Cancelled).await;
        self.clear_cancel(session_id);
        self.release(session_id, guard);
        result
    }

    /// 显式归档
    pub async fn close(&self, session_id: &str) -> Result<SessionReport, OrchestratorError> {
        let guard = self.lock_session(session_id).await;
        let result = self.finish(session_id, SessionOutcome::Closed).await;
        self.release(session_id, guard);
        result
    }

    /// 审计历史
    pub async fn history(&self, session_id: &str) -> Result<Vec<CheckpointMeta>, OrchestratorError> {
        let history = self.store.history(session_id).await?;
        if history.is_empty() {
            return Err(OrchestratorError::SessionNotFound(session_id.to_string()));
        }
        Ok(history)
    }

    /// 从 from_seq 起的消息
    pub async fn transcript(&self, session_id: &str, from_seq: u64) -> Result<Vec<Message>, OrchestratorError> {
        let cp = self.latest(session_id).await?;
        Ok(cp.log.read(from_seq).to_vec())
    }

    pub async fn checkpoint(&self, session_id: &str, step: u64) -> Result<Checkpoint, OrchestratorError> {
        self.store
            .load(session_id, step)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(format!("{session_id}@{step}")))
    }

    pub async fn sessions(&self) -> Result<Vec<String>, OrchestratorError> {
        Ok(self.store.sessions().await?)
    }

    // ---- 状态机 ----

    async fn drive_locked(&self, session_id: &str) -> Result<RunOutcome, OrchestratorError> {
        let mut cp = self.latest(session_id).await?;
        loop {
            if cp.state.terminal {
                return Ok(terminated(&cp.state));
            }
            if let Some(interrupt) = cp
                .state
                .pending_interrupt
                .as_ref()
                .filter(|p| p.response.is_none())
            {
                tracing::info!(session = %session_id, interrupt = %interrupt.request.id, "session suspended");
                return Ok(RunOutcome::Suspended {
                    session_id: session_id.to_string(),
                    interrupt: interrupt.request.clone(),
                });
            }
            if self.is_cancelled(session_id) {
                let cp = self.terminate(cp, SessionOutcome::Cancelled).await?;
                self.clear_cancel(session_id);
                return Ok(terminated(&cp.state));
            }

            match self.router.decide(&cp.state) {
                Decision::Run(agent) => {
                    cp = self.execute(cp, agent).await?;
                }
                Decision::Terminate(TerminationReason::AlreadyTerminal) => {
                    return Ok(terminated(&cp.state));
                }
                Decision::Terminate(TerminationReason::Completed) => {
                    let cp = self.terminate(cp, SessionOutcome::Completed).await?;
                    tracing::info!(session = %session_id, iterations = cp.state.iteration_count, "session completed");
                    return Ok(terminated(&cp.state));
                }
                Decision::Terminate(TerminationReason::RoutingLoop) => {
                    let limit = self.router.max_iterations();
                    self.terminate(cp, SessionOutcome::RoutingLoopExceeded { limit }).await?;
                    tracing::warn!(session = %session_id, limit, "routing loop exceeded");
                    return Err(OrchestratorError::RoutingLoopExceeded {
                        session_id: session_id.to_string(),
                        limit,
                    });
                }
            }
        }
    }

    /// 运行一个 Agent 步骤并提交；失败时不提交任何东西
    async fn execute(&self, cp: Checkpoint, agent: AgentId) -> Result<Checkpoint, OrchestratorError> {
        let session_id = cp.session_id.clone();
        let step = cp.step + 1;
        let scope = self.gateway.scope(agent, &session_id, step);
        let ctx = AgentContext {
            state: &cp.state,
            window: cp.log.window(self.context_window),
            user_text: cp.log.last_user_text(),
            scope: &scope,
            settings: &self.settings,
            now: Utc::now(),
        };
        let output = match run_agent(&ctx).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(session = %session_id, %agent, step, error = %e, "agent step failed, nothing committed");
                return Err(e);
            }
        };

        let mut state = cp.state.clone();
        let mut log = cp.log.clone();
        for message in output.messages {
            log.append(message);
        }
        let resumed = self.interrupts.response_for(&state, agent).is_some();
        state.apply(output.delta);
        if resumed {
            self.interrupts.consume(&mut state);
        }
        if let Some(request) = output.interrupt {
            self.interrupts.suspend(&mut state, agent, request);
        }
        state.current_agent = Some(agent);
        state.iteration_count += 1;
        state.log_len = log.len() as u64;

        let next = Checkpoint::new(step, state, log);
        self.commit(next.clone()).await?;
        tracing::info!(
            session = %session_id,
            step,
            %agent,
            iteration = next.state.iteration_count,
            intent = ?next.state.routing_intent,
            "step committed"
        );
        Ok(next)
    }

    async fn inject(&self, cp: Checkpoint, response: InterruptResponse) -> Result<Checkpoint, OrchestratorError> {
        let mut state = cp.state.clone();
        let mut log = cp.log.clone();
        let mut message = Message::user(describe_response(&response));
        message.author = Some("technician".to_string());
        log.append(message);
        self.interrupts.inject(&mut state, response);
        state.log_len = log.len() as u64;
        let next = Checkpoint::new(cp.step + 1, state, log);
        self.commit(next.clone()).await?;
        Ok(next)
    }

    async fn terminate(&self, cp: Checkpoint, outcome: SessionOutcome) -> Result<Checkpoint, OrchestratorError> {
        let mut state = cp.state.clone();
        state.terminate(outcome);
        let next = Checkpoint::new(cp.step + 1, state, cp.log);
        self.commit(next.clone()).await?;
        Ok(next)
    }

    async fn finish(&self, session_id: &str, outcome: SessionOutcome) -> Result<SessionReport, OrchestratorError> {
        let cp = self.latest(session_id).await?;
        if cp.state.terminal {
            return Ok(SessionReport::from_checkpoint(&cp));
        }
        tracing::info!(session = %session_id, ?outcome, "session archived");
        let cp = self.terminate(cp, outcome).await?;
        Ok(SessionReport::from_checkpoint(&cp))
    }

    async fn commit(&self, checkpoint: Checkpoint) -> Result<(), OrchestratorError> {
        self.store.save(&checkpoint).await.map_err(|e| {
            tracing::error!(session = %checkpoint.session_id, step = checkpoint.step, error = %e, "checkpoint save failed");
            OrchestratorError::from(e)
        })?;
        Ok(())
    }

    async fn latest(&self, session_id: &str) -> Result<Checkpoint, OrchestratorError> {
        self.store
            .load_latest(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }

    // ---- 会话锁与取消令牌 ----

    async fn lock_session(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = match self.locks.lock() {
            Ok(mut locks) => locks.entry(session_id.to_string()).or_default().clone(),
            Err(poisoned) => poisoned.into_inner().entry(session_id.to_string()).or_default().clone(),
        };
        lock.lock_owned().await
    }

    /// 释放锁；无人等待时回收
    fn release(&self, session_id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        if let Ok(mut locks) = self.locks.lock() {
            if locks.get(session_id).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(session_id);
            }
        }
    }

    fn cancel_token(&self, session_id: &str) -> CancellationToken {
        match self.cancels.lock() {
            Ok(mut cancels) => cancels.entry(session_id.to_string()).or_default().clone(),
            Err(_) => CancellationToken::new(),
        }
    }

    fn is_cancelled(&self, session_id: &str) -> bool {
        self.cancels
            .lock()
            .ok()
            .and_then(|c| c.get(session_id).map(CancellationToken::is_cancelled))
            .unwrap_or(false)
    }

    fn clear_cancel(&self, session_id: &str) {
        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.remove(session_id);
        }
    }
}

fn terminated(state: &TaskState) -> RunOutcome {
    RunOutcome::Terminated {
        session_id: state.session_id.clone(),
        outcome: state.outcome.clone().unwrap_or(SessionOutcome::Completed),
        answer: state.work.answer.clone(),
    }
}

fn describe_response(response: &InterruptResponse) -> String {
    let mut parts = Vec::new();
    if let Some(choice) = response.choice {
        parts.push(choice.to_string());
    }
    if !response.parts_requested.is_empty() {
        parts.push(format!("parts: {}", response.parts_requested.join(", ")));
    }
    if let Some(text) = &response.text {
        parts.push(text.clone());
    }
    if response.defaulted {
        parts.push("(default)".to_string());
    }
    parts.join(" | ")
}
