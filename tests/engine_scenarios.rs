//! 引擎端到端场景：查询、人工中断、崩溃恢复、并发会话、持久化后端

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use futures_util::future::join_all;
use maint::agents::AgentSettings;
use maint::capability::{
    plant::standard_registry, CapabilityError, CapabilityGateway, Email, KeywordOracle, LogNotifier, Notifier,
    NotifyOutcome, OracleDecision, ReasoningOracle, ScriptedOracle, ORACLE_CAPABILITY,
};
use maint::checkpoint::{
    Checkpoint, CheckpointError, CheckpointId, CheckpointMeta, CheckpointStore, FileCheckpointStore,
    InMemoryCheckpointStore, SqliteCheckpointStore,
};
use maint::config::AppConfig;
use maint::core::{
    DecisionPayload, Engine, EngineBuilder, OrchestratorError, RecoveryPolicy, RunOutcome, SessionOutcome,
    SessionStatus,
};
use maint::memory::Role;
use maint::plant::{PlantStore, WorkOrderStatus, REQUISITION_CANCELLED, REQUISITION_REQUESTED};

const STOCK_QUESTION: &str = "How many BRG-6205-2RS do we have?";
const CLOSE_OUT: &str = "Close out WO-PS-015";

/// 在指定 step 上失败一次的存储
struct FailOnceStore {
    inner: InMemoryCheckpointStore,
    fail_step: u64,
    armed: AtomicBool,
}

impl FailOnceStore {
    fn new(fail_step: u64) -> Self {
        Self {
            inner: InMemoryCheckpointStore::new(),
            fail_step,
            armed: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl CheckpointStore for FailOnceStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointId, CheckpointError> {
        if checkpoint.step == self.fail_step && self.armed.swap(false, Ordering::SeqCst) {
            return Err(CheckpointError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.save(checkpoint).await
    }

    async fn load_latest(&self, session_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        self.inner.load_latest(session_id).await
    }

    async fn load(&self, session_id: &str, step: u64) -> Result<Option<Checkpoint>, CheckpointError> {
        self.inner.load(session_id, step).await
    }

    async fn history(&self, session_id: &str) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        self.inner.history(session_id).await
    }

    async fn sessions(&self) -> Result<Vec<String>, CheckpointError> {
        self.inner.sessions().await
    }
}

struct Harness {
    engine: Arc<Engine>,
    plant: Arc<PlantStore>,
    gateway: Arc<CapabilityGateway>,
}

async fn harness_with(store: Arc<dyn CheckpointStore>, plant: Arc<PlantStore>) -> Harness {
    let components = EngineBuilder::new(AppConfig::default())
        .with_store(store)
        .with_plant(plant)
        .with_oracle(Arc::new(KeywordOracle::new()))
        .build()
        .await
        .unwrap();
    Harness {
        engine: components.engine,
        plant: components.plant,
        gateway: components.gateway,
    }
}

async fn harness() -> Harness {
    harness_with(
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(PlantStore::demo().unwrap()),
    )
    .await
}

/// 手工组装：自定义 oracle、重试策略与 Agent 设置
fn custom_engine(oracle: Arc<dyn ReasoningOracle>, settings: AgentSettings) -> (Engine, Arc<PlantStore>) {
    let plant = Arc::new(PlantStore::demo().unwrap());
    let registry = standard_registry(plant.clone(), Arc::new(LogNotifier::new()));
    let gateway = CapabilityGateway::new(registry, oracle).with_policy(RecoveryPolicy::new(
        2,
        Duration::from_millis(1),
        Duration::from_millis(5),
    ));
    let engine = Engine::new(Arc::new(InMemoryCheckpointStore::new()), Arc::new(gateway)).with_settings(settings);
    (engine, plant)
}

/// 对指定收件人返回 Failed，其余交给 LogNotifier
struct BouncingNotifier {
    bounce: Vec<&'static str>,
    inner: LogNotifier,
}

#[async_trait]
impl Notifier for BouncingNotifier {
    async fn send(&self, email: &Email) -> NotifyOutcome {
        if self.bounce.contains(&email.recipient.as_str()) {
            return NotifyOutcome::Failed {
                reason: "mailbox unavailable".to_string(),
            };
        }
        self.inner.send(email).await
    }
}

async fn harness_bouncing(bounce: Vec<&'static str>) -> (Harness, Arc<BouncingNotifier>) {
    let notifier = Arc::new(BouncingNotifier {
        bounce,
        inner: LogNotifier::new(),
    });
    let components = EngineBuilder::new(AppConfig::default())
        .with_store(Arc::new(InMemoryCheckpointStore::new()))
        .with_plant(Arc::new(PlantStore::demo().unwrap()))
        .with_notifier(notifier.clone())
        .with_oracle(Arc::new(KeywordOracle::new()))
        .build()
        .await
        .unwrap();
    let h = Harness {
        engine: components.engine,
        plant: components.plant,
        gateway: components.gateway,
    };
    (h, notifier)
}

/// 本年度的单号，如 WO-2026-0001
fn numbered(prefix: &str, n: u32) -> String {
    format!("{prefix}-{}-{n:04}", Utc::now().year())
}

fn pending_id(outcome: &RunOutcome) -> String {
    outcome.interrupt().expect("session should be suspended").id.clone()
}

#[tokio::test]
async fn test_inventory_question_answered_in_four_checkpoints() {
    let h = harness().await;
    let outcome = h.engine.start(Some("inv-1".into()), STOCK_QUESTION).await.unwrap();

    assert!(matches!(
        outcome,
        RunOutcome::Terminated { outcome: SessionOutcome::Completed, .. }
    ));
    let answer = outcome.answer().unwrap();
    assert!(answer.contains("15 on hand"), "answer: {answer}");

    let history = h.engine.history("inv-1").await.unwrap();
    let steps: Vec<u64> = history.iter().map(|m| m.step).collect();
    assert_eq!(steps, vec![0, 1, 2, 3]);
    assert_eq!(history[1].current_agent.as_deref(), Some("supervisor"));
    assert_eq!(history[2].current_agent.as_deref(), Some("inventory"));
    assert_eq!(history[3].status, SessionStatus::Terminated);

    let log = h.engine.transcript("inv-1", 0).await.unwrap();
    assert_eq!(log.first().unwrap().role, Role::User);
    assert_eq!(log.first().unwrap().text(), STOCK_QUESTION);
    assert!(log.last().unwrap().text().contains("15 on hand"));
    assert!(log.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[tokio::test]
async fn test_close_out_suspends_then_completes_on_response() {
    let h = harness().await;
    let outcome = h.engine.start(Some("wo-1".into()), CLOSE_OUT).await.unwrap();
    let interrupt = outcome.interrupt().unwrap().clone();
    assert_eq!(interrupt.prompt, "Mark WO-PS-015 complete, request parts, or reschedule?");
    assert_eq!(interrupt.target_entity_id.as_deref(), Some("WO-PS-015"));

    let report = h.engine.resume("wo-1").await.unwrap();
    assert_eq!(report.status, SessionStatus::Suspended);
    assert_eq!(report.last_step, 2);
    assert_eq!(h.gateway.invocations("work_orders.update_status"), 0);

    let outcome = h
        .engine
        .respond("wo-1", &interrupt.id, DecisionPayload::choice("complete").with_text("seals replaced"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Terminated { outcome: SessionOutcome::Completed, .. }
    ));
    assert!(outcome.answer().unwrap().contains("WO-PS-015 marked completed"));

    let report = h.engine.resume("wo-1").await.unwrap();
    assert!(report.pending.is_none());
    assert_eq!(report.status, SessionStatus::Terminated);
    assert_eq!(h.gateway.invocations("work_orders.update_status"), 1);

    let wo = h.plant.get_work_order("WO-PS-015").await.unwrap();
    assert_eq!(wo.status, WorkOrderStatus::Completed);
    assert!(wo.notes.iter().any(|n| n.contains("seals replaced")));

    let steps: Vec<u64> = h.engine.history("wo-1").await.unwrap().iter().map(|m| m.step).collect();
    assert_eq!(steps, vec![0, 1, 2, 3, 4, 5, 6]);
    let injected = h.engine.checkpoint("wo-1", 3).await.unwrap();
    assert_eq!(injected.log.last().unwrap().author.as_deref(), Some("technician"));
}

#[tokio::test]
async fn test_second_response_is_rejected() {
    let h = harness().await;
    let outcome = h.engine.start(Some("wo-2".into()), CLOSE_OUT).await.unwrap();
    let id = pending_id(&outcome);
    h.engine
        .respond("wo-2", &id, DecisionPayload::choice("complete"))
        .await
        .unwrap();

    let err = h
        .engine
        .respond("wo-2", &id, DecisionPayload::choice("complete"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NoPendingInterrupt { .. }));
    assert_eq!(h.gateway.invocations("work_orders.update_status"), 1);
}

#[tokio::test]
async fn test_stale_and_invalid_responses_change_nothing() {
    let h = harness().await;
    let outcome = h.engine.start(Some("wo-3".into()), CLOSE_OUT).await.unwrap();
    let id = pending_id(&outcome);

    let err = h
        .engine
        .respond("wo-3", "int_does_not_exist", DecisionPayload::choice("complete"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::StaleInterrupt { .. }));

    let err = h
        .engine
        .respond("wo-3", &id, DecisionPayload::choice("make_coffee"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidDecision(_)));

    let report = h.engine.resume("wo-3").await.unwrap();
    assert_eq!(report.status, SessionStatus::Suspended);
    assert_eq!(report.last_step, 2);
    assert_eq!(report.pending.unwrap().id, id);
}

#[tokio::test]
async fn test_resume_is_read_only() {
    let h = harness().await;
    h.engine.start(Some("wo-4".into()), CLOSE_OUT).await.unwrap();
    let first = h.engine.resume("wo-4").await.unwrap();
    let second = h.engine.resume("wo-4").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.engine.history("wo-4").await.unwrap().len(), 3);
    assert_eq!(
        first.pending_prompt(),
        Some("Mark WO-PS-015 complete, request parts, or reschedule?")
    );
}

#[tokio::test]
async fn test_drive_while_suspended_is_refused() {
    let h = harness().await;
    h.engine.start(Some("wo-5".into()), CLOSE_OUT).await.unwrap();
    let err = h.engine.drive("wo-5").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AwaitingInterrupt(_)));
}

#[tokio::test]
async fn test_failed_save_leaves_previous_checkpoint_and_retry_completes() {
    let store = Arc::new(FailOnceStore::new(2));
    let h = harness_with(store, Arc::new(PlantStore::demo().unwrap())).await;

    let err = h.engine.start(Some("crash-1".into()), STOCK_QUESTION).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::PersistenceFailure(_)));
    assert!(err.is_retryable());

    let report = h.engine.resume("crash-1").await.unwrap();
    assert_eq!(report.last_step, 1);
    assert_eq!(report.status, SessionStatus::Running);
    assert!(report.answer.is_none());

    let outcome = h.engine.drive("crash-1").await.unwrap();
    assert!(outcome.answer().unwrap().contains("15 on hand"));
    let steps: Vec<u64> = h.engine.history("crash-1").await.unwrap().iter().map(|m| m.step).collect();
    assert_eq!(steps, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_retried_parts_step_issues_stock_once() {
    // step 3 是 parts_check：先发料，再保存失败
    let store = Arc::new(FailOnceStore::new(3));
    let h = harness_with(store, Arc::new(PlantStore::demo().unwrap())).await;

    let err = h
        .engine
        .start(Some("crash-2".into()), "Execute today's maintenance")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::PersistenceFailure(_)));
    assert_eq!(h.plant.lookup_part("BRG-6205-2RS").await.unwrap().on_hand, 13);

    let outcome = h.engine.drive("crash-2").await.unwrap();
    assert!(outcome.interrupt().is_some());
    assert_eq!(h.plant.lookup_part("BRG-6205-2RS").await.unwrap().on_hand, 13);
    let prefix = format!("WO-{}-", Utc::now().year());
    assert_eq!(
        h.plant.work_orders().await.iter().filter(|w| w.number.starts_with(&prefix)).count(),
        1
    );
}

#[tokio::test]
async fn test_retried_technician_step_updates_work_order_once() {
    // step 3 是注入的答复，step 4 是技术员更新工单
    let store = Arc::new(FailOnceStore::new(4));
    let h = harness_with(store, Arc::new(PlantStore::demo().unwrap())).await;

    let outcome = h.engine.start(Some("crash-3".into()), CLOSE_OUT).await.unwrap();
    let id = pending_id(&outcome);
    let err = h
        .engine
        .respond("crash-3", &id, DecisionPayload::choice("complete").with_text("seals replaced"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::PersistenceFailure(_)));

    // 答复已提交，不需要再次 respond
    let report = h.engine.resume("crash-3").await.unwrap();
    assert_eq!(report.last_step, 3);
    assert!(report.pending.is_none());

    let outcome = h.engine.drive("crash-3").await.unwrap();
    assert!(matches!(outcome, RunOutcome::Terminated { .. }));
    let wo = h.plant.get_work_order("WO-PS-015").await.unwrap();
    assert_eq!(wo.status, WorkOrderStatus::Completed);
    assert_eq!(wo.notes.iter().filter(|n| n.contains("seals replaced")).count(), 1);
}

#[tokio::test]
async fn test_same_inputs_produce_same_transcript() {
    // 工具结果带时间戳，只比较对话轮次
    async fn run() -> Vec<(Role, Option<String>, String)> {
        let h = harness().await;
        let outcome = h.engine.start(Some("det".into()), CLOSE_OUT).await.unwrap();
        let id = pending_id(&outcome);
        h.engine
            .respond("det", &id, DecisionPayload::choice("reschedule"))
            .await
            .unwrap();
        h.engine
            .transcript("det", 0)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.role != Role::Tool)
            .map(|m| (m.role, m.author.clone(), m.text()))
            .collect()
    }
    let first = run().await;
    let second = run().await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_iteration_ceiling_terminates_with_routing_loop() {
    let h = harness().await;
    let engine = Engine::new(h.engine.store().clone(), h.gateway.clone()).with_max_iterations(1);

    let err = engine.start(Some("loop".into()), STOCK_QUESTION).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::RoutingLoopExceeded { limit: 1, .. }));

    let report = engine.resume("loop").await.unwrap();
    assert_eq!(report.status, SessionStatus::Terminated);
    assert_eq!(report.outcome, Some(SessionOutcome::RoutingLoopExceeded { limit: 1 }));
    assert_eq!(report.iteration_count, 1);
}

#[tokio::test]
async fn test_transient_oracle_failure_is_retried() {
    let oracle = ScriptedOracle::new(vec![
        Err(CapabilityError::Unavailable("model overloaded".into())),
        Ok(OracleDecision::new("inventory_query", "stock question")),
    ])
    .with_fallback(Arc::new(KeywordOracle::new()));
    let oracle = Arc::new(oracle);
    let (engine, _) = custom_engine(oracle.clone(), AgentSettings::default());

    let outcome = engine.start(Some("flaky".into()), STOCK_QUESTION).await.unwrap();
    assert!(outcome.answer().unwrap().contains("15 on hand"));
    assert_eq!(engine.gateway().invocations(ORACLE_CAPABILITY), 3);
    assert_eq!(oracle.requests().len(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_leave_session_at_start() {
    let oracle = ScriptedOracle::new(vec![
        Err(CapabilityError::Unavailable("down".into())),
        Err(CapabilityError::Unavailable("down".into())),
        Err(CapabilityError::Unavailable("down".into())),
    ]);
    let (engine, _) = custom_engine(Arc::new(oracle), AgentSettings::default());

    let err = engine.start(Some("down".into()), STOCK_QUESTION).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::TransientCapability { attempts: 3, .. }));
    let report = engine.resume("down").await.unwrap();
    assert_eq!(report.last_step, 0);
    assert_eq!(report.iteration_count, 0);
}

#[tokio::test]
async fn test_stock_question_never_runs_a_write() {
    let oracle = ScriptedOracle::new(vec![
        Ok(OracleDecision::new("inventory_query", "stock question")),
        Ok(OracleDecision::new("inventory.set_level", "overwrite the count")
            .with_arguments(serde_json::json!({"part_number": "BRG-6205-2RS", "on_hand": 0}))),
    ]);
    let (engine, plant) = custom_engine(Arc::new(oracle), AgentSettings::default());

    let outcome = engine.start(Some("ro".into()), STOCK_QUESTION).await.unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Terminated { outcome: SessionOutcome::Completed, .. }
    ));
    assert!(outcome.answer().unwrap().contains("inventory.set_level"));
    assert_eq!(plant.lookup_part("BRG-6205-2RS").await.unwrap().on_hand, 15);
}

#[tokio::test]
async fn test_execute_maintenance_raises_requisition_then_asks_technician() {
    let h = harness().await;
    let outcome = h
        .engine
        .start(Some("exec".into()), "Execute today's maintenance")
        .await
        .unwrap();

    let interrupt = outcome.interrupt().unwrap();
    assert_eq!(
        interrupt.prompt,
        format!("Mark {} complete, request parts, or reschedule?", numbered("WO", 1))
    );

    let requisitions = h.plant.requisitions().await;
    assert_eq!(requisitions.len(), 1);
    assert_eq!(requisitions[0].part_number, "BLT-A42");
    assert_eq!(requisitions[0].quantity, 2);
    assert_eq!(requisitions[0].vendor_id, "V-02");

    let ticket = h.plant.get_ticket("CM-2026-0001").await.unwrap();
    assert_eq!(ticket.assigned_technician.as_deref(), Some("T-01"));
    assert_eq!(h.gateway.invocations("notify.send_email"), 1);

    let outcome = h
        .engine
        .respond("exec", &interrupt.id, DecisionPayload::choice("reschedule"))
        .await
        .unwrap();
    let answer = outcome.answer().unwrap();
    assert!(answer.contains(&numbered("PR", 1)), "answer: {answer}");
    assert!(answer.contains("rescheduled"));
}

#[tokio::test]
async fn test_bounced_vendor_email_moves_requisition_to_next_vendor() {
    let (h, notifier) = harness_bouncing(vec!["sales@beltpro.example"]).await;
    let outcome = h
        .engine
        .start(Some("bounce".into()), "Execute today's maintenance")
        .await
        .unwrap();
    let interrupt = outcome.interrupt().unwrap().clone();

    let requisitions = h.plant.requisitions().await;
    assert_eq!(requisitions.len(), 2);
    assert_eq!(requisitions[0].vendor_id, "V-02");
    assert_eq!(requisitions[0].status, REQUISITION_CANCELLED);
    assert_eq!(requisitions[1].vendor_id, "V-01");
    assert_eq!(requisitions[1].part_number, "BLT-A42");
    assert_eq!(requisitions[1].status, REQUISITION_REQUESTED);

    let sent = notifier.inner.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "orders@industrial-supply.example");
    assert!(sent[0].body.contains(&numbered("PR", 2)));

    let outcome = h
        .engine
        .respond("bounce", &interrupt.id, DecisionPayload::choice("reschedule"))
        .await
        .unwrap();
    let answer = outcome.answer().unwrap();
    assert!(answer.contains(&numbered("PR", 2)), "answer: {answer}");
}

#[tokio::test]
async fn test_every_vendor_bouncing_reports_no_vendor_available() {
    let (h, notifier) =
        harness_bouncing(vec!["sales@beltpro.example", "orders@industrial-supply.example"]).await;
    let outcome = h
        .engine
        .start(Some("no-vendor".into()), "Execute today's maintenance")
        .await
        .unwrap();
    assert!(outcome.interrupt().is_some());

    let requisitions = h.plant.requisitions().await;
    assert_eq!(requisitions.len(), 2);
    assert!(requisitions.iter().all(|r| r.status == REQUISITION_CANCELLED));
    assert!(notifier.inner.sent().is_empty());
    assert_eq!(h.gateway.invocations("notify.send_email"), 2);

    let log = h.engine.transcript("no-vendor", 0).await.unwrap();
    assert!(log.iter().any(|m| m.text().contains("No vendor available for BLT-A42")));
}

#[tokio::test]
async fn test_status_report_is_emailed() {
    let plant = Arc::new(PlantStore::demo().unwrap());
    let notifier = Arc::new(LogNotifier::new());
    let components = EngineBuilder::new(AppConfig::default())
        .with_store(Arc::new(InMemoryCheckpointStore::new()))
        .with_plant(plant)
        .with_notifier(notifier.clone())
        .with_oracle(Arc::new(KeywordOracle::new()))
        .build()
        .await
        .unwrap();

    let outcome = components
        .engine
        .start(Some("report".into()), "Email me a status report")
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Terminated { .. }));

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "maintenance-manager@plant.local");
    assert!(sent[0].body.contains("BLT-A42"));
}

#[tokio::test]
async fn test_interrupt_default_applies_after_deadline() {
    let settings = AgentSettings {
        interrupt_timeout: Some(Duration::from_secs(600)),
        ..AgentSettings::default()
    };
    let (engine, plant) = custom_engine(Arc::new(KeywordOracle::new()), settings);
    let outcome = engine.start(Some("timeout".into()), CLOSE_OUT).await.unwrap();
    assert!(outcome.interrupt().unwrap().deadline.is_some());

    assert!(engine.expire_interrupt("timeout", Utc::now()).await.unwrap().is_none());

    let later = Utc::now() + chrono::Duration::hours(1);
    let resumed = engine.expire_due(later).await.unwrap();
    assert_eq!(resumed.len(), 1);
    assert!(matches!(resumed[0], RunOutcome::Terminated { .. }));

    let wo = plant.get_work_order("WO-PS-015").await.unwrap();
    assert_eq!(wo.status, WorkOrderStatus::Rescheduled);
    let log = engine.transcript("timeout", 0).await.unwrap();
    assert!(log.iter().any(|m| m.text().contains("(default)")));
}

#[tokio::test]
async fn test_answer_after_timeout_default_is_stale() {
    let settings = AgentSettings {
        interrupt_timeout: Some(Duration::from_secs(60)),
        ..AgentSettings::default()
    };
    let (engine, plant) = custom_engine(Arc::new(KeywordOracle::new()), settings);
    let outcome = engine.start(Some("late".into()), CLOSE_OUT).await.unwrap();
    let id = pending_id(&outcome);

    let later = Utc::now() + chrono::Duration::hours(1);
    assert!(engine.expire_interrupt("late", later).await.unwrap().is_some());
    let steps_before = engine.history("late").await.unwrap().len();

    let err = engine
        .respond("late", &id, DecisionPayload::choice("complete"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::StaleInterrupt { .. }), "{err:?}");
    assert_eq!(engine.history("late").await.unwrap().len(), steps_before);
    let wo = plant.get_work_order("WO-PS-015").await.unwrap();
    assert_eq!(wo.status, WorkOrderStatus::Rescheduled);
}

#[tokio::test]
async fn test_cancel_suspended_session() {
    let h = harness().await;
    let outcome = h.engine.start(Some("cancel".into()), CLOSE_OUT).await.unwrap();
    let id = pending_id(&outcome);

    let report = h.engine.cancel("cancel").await.unwrap();
    assert_eq!(report.status, SessionStatus::Terminated);
    assert_eq!(report.outcome, Some(SessionOutcome::Cancelled));
    assert!(report.pending.is_none());
    assert!(h.engine.resume("cancel").await.unwrap().pending.is_none());

    let err = h
        .engine
        .respond("cancel", &id, DecisionPayload::choice("complete"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::SessionClosed(_)));
    assert_eq!(h.gateway.invocations("work_orders.update_status"), 0);
}

#[tokio::test]
async fn test_close_is_idempotent_on_terminated_session() {
    let h = harness().await;
    h.engine.start(Some("done".into()), STOCK_QUESTION).await.unwrap();
    let before = h.engine.history("done").await.unwrap().len();
    let report = h.engine.close("done").await.unwrap();
    assert_eq!(report.outcome, Some(SessionOutcome::Completed));
    assert_eq!(h.engine.history("done").await.unwrap().len(), before);

    h.engine.start(Some("open".into()), CLOSE_OUT).await.unwrap();
    let report = h.engine.close("open").await.unwrap();
    assert_eq!(report.outcome, Some(SessionOutcome::Closed));
}

#[tokio::test]
async fn test_concurrent_sessions_do_not_interfere() {
    let h = harness().await;
    let ids: Vec<String> = (0..6).map(|i| format!("par-{i}")).collect();
    let outcomes = join_all(ids.iter().map(|id| h.engine.start(Some(id.clone()), STOCK_QUESTION))).await;

    for outcome in outcomes {
        assert!(outcome.unwrap().answer().unwrap().contains("15 on hand"));
    }
    let mut sessions = h.engine.sessions().await.unwrap();
    sessions.sort();
    assert_eq!(sessions, ids);
    for id in &ids {
        assert_eq!(h.engine.history(id).await.unwrap().len(), 4);
    }
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let plant = Arc::new(PlantStore::demo().unwrap());

    let id = {
        let h = harness_with(Arc::new(FileCheckpointStore::new(dir.path())), plant.clone()).await;
        let outcome = h.engine.start(Some("durable".into()), CLOSE_OUT).await.unwrap();
        pending_id(&outcome)
    };

    let h = harness_with(Arc::new(FileCheckpointStore::new(dir.path())), plant).await;
    let report = h.engine.resume("durable").await.unwrap();
    assert_eq!(report.status, SessionStatus::Suspended);
    let outcome = h
        .engine
        .respond("durable", &id, DecisionPayload::choice("complete"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Terminated { outcome: SessionOutcome::Completed, .. }
    ));
    assert_eq!(h.gateway.invocations("work_orders.update_status"), 1);
}

#[tokio::test]
async fn test_sqlite_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");
    let plant = Arc::new(PlantStore::demo().unwrap());

    let id = {
        let store = SqliteCheckpointStore::open(&path).await.unwrap();
        let h = harness_with(Arc::new(store), plant.clone()).await;
        let outcome = h.engine.start(Some("durable".into()), CLOSE_OUT).await.unwrap();
        pending_id(&outcome)
    };

    let store = SqliteCheckpointStore::open(&path).await.unwrap();
    let h = harness_with(Arc::new(store), plant.clone()).await;
    let outcome = h
        .engine
        .respond("durable", &id, DecisionPayload::choice("reschedule"))
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Terminated { .. }));
    assert_eq!(
        plant.get_work_order("WO-PS-015").await.unwrap().status,
        WorkOrderStatus::Rescheduled
    );
    assert_eq!(h.engine.history("durable").await.unwrap().len(), 7);
}
