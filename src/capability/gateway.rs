//! 能力网关
//!
//! Agent 调用 oracle 与外部系统的唯一路径：权限表 → 参数校验 → 超时 → 瞬时错误退避重试 → 审计日志。
//! 非幂等写入按 `{session}:{step}:{ordinal}` 生成幂等键；未提交步骤重跑时 step 不变，键也不变。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::timeout;

use super::oracle::{ActionSpec, OracleDecision, OracleRequest, ReasoningOracle};
use super::{CapabilityError, CapabilityRegistry, SideEffect};
use crate::config::GatewaySection;
use crate::core::error::OrchestratorError;
use crate::core::recovery::{RecoveryAction, RecoveryPolicy};
use crate::core::state::AgentId;

/// oracle 在权限表与审计日志中的能力名
pub const ORACLE_CAPABILITY: &str = "oracle.ask";

/// 每个 Agent 可调用的能力；`prefix.*` 匹配整个命名空间
const PERMISSIONS: &[(AgentId, &[&str])] = &[
    (AgentId::Supervisor, &[ORACLE_CAPABILITY, "tickets.list_open"]),
    (
        AgentId::Inventory,
        &[ORACLE_CAPABILITY, "inventory.*", "machines.bom", "tickets.*", "work_orders.get"],
    ),
    (
        AgentId::WorkOrder,
        &["tickets.*", "machines.*", "technicians.available", "work_orders.create"],
    ),
    (AgentId::Procurement, &["procurement.*", "notify.send_email"]),
    (
        AgentId::Technician,
        &[ORACLE_CAPABILITY, "work_orders.get", "work_orders.update_status", "work_orders.add_notes"],
    ),
    (AgentId::Reporter, &["tickets.list_open", "inventory.low_stock", "notify.send_email"]),
];

/// 权限表查询
pub fn permitted(agent: AgentId, capability: &str) -> bool {
    PERMISSIONS
        .iter()
        .filter(|(a, _)| *a == agent)
        .flat_map(|(_, patterns)| patterns.iter())
        .any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => capability.starts_with(prefix),
            None => *pattern == capability,
        })
}

pub struct CapabilityGateway {
    registry: CapabilityRegistry,
    oracle: Arc<dyn ReasoningOracle>,
    policy: RecoveryPolicy,
    call_timeout: Duration,
    /// 每个能力实际被调用的次数（含重试）
    invocations: Mutex<BTreeMap<String, u64>>,
}

impl CapabilityGateway {
    pub fn new(registry: CapabilityRegistry, oracle: Arc<dyn ReasoningOracle>) -> Self {
        Self::from_config(registry, oracle, &GatewaySection::default())
    }

    pub fn from_config(
        registry: CapabilityRegistry,
        oracle: Arc<dyn ReasoningOracle>,
        cfg: &GatewaySection,
    ) -> Self {
        Self {
            registry,
            oracle,
            policy: RecoveryPolicy::from_config(cfg),
            call_timeout: Duration::from_secs(cfg.call_timeout_secs),
            invocations: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// 为一个引擎步骤创建调用作用域
    pub fn scope(self: &Arc<Self>, agent: AgentId, session_id: &str, step: u64) -> StepScope {
        StepScope {
            gateway: Arc::clone(self),
            agent,
            session_id: session_id.to_string(),
            step,
            ordinal: AtomicU32::new(0),
        }
    }

    pub fn side_effect(&self, capability: &str) -> Option<SideEffect> {
        self.registry.get(capability).map(|c| c.side_effect())
    }

    /// agent 可用的只读能力，作为 oracle 的候选动作
    pub fn read_actions(&self, agent: AgentId) -> Vec<ActionSpec> {
        self.registry
            .names()
            .into_iter()
            .filter(|name| permitted(agent, name))
            .filter_map(|name| self.registry.get(&name))
            .filter(|cap| cap.side_effect() == SideEffect::ReadOnly)
            .map(|cap| ActionSpec::new(cap.name(), cap.description()).with_parameters(cap.parameters_schema()))
            .collect()
    }

    pub fn invocations(&self, capability: &str) -> u64 {
        self.invocations
            .lock()
            .ok()
            .and_then(|m| m.get(capability).copied())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BTreeMap<String, u64> {
        self.invocations.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn count(&self, capability: &str) {
        if let Ok(mut m) = self.invocations.lock() {
            *m.entry(capability.to_string()).or_insert(0) += 1;
        }
    }

    /// 调用能力；瞬时错误按 RecoveryPolicy 重试，其余错误分类后返回
    pub async fn invoke(
        &self,
        agent: AgentId,
        name: &str,
        args: Value,
        idempotency_key: Option<&str>,
    ) -> Result<Value, OrchestratorError> {
        let capability = self
            .registry
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownCapability(name.to_string()))?;
        if !permitted(agent, name) {
            return Err(OrchestratorError::CapabilityNotPermitted {
                capability: name.to_string(),
                agent: agent.to_string(),
            });
        }
        let side_effect = capability.side_effect();
        let mut attempt = 0u32;
        loop {
            let start = Instant::now();
            self.count(name);
            let result = match timeout(self.call_timeout, capability.invoke(args.clone(), idempotency_key)).await {
                Ok(r) => r,
                Err(_) => Err(CapabilityError::Timeout(self.call_timeout)),
            };
            audit(Audit {
                capability: name,
                agent,
                side_effect,
                attempt,
                idempotency_key,
                args: &args,
                error: result.as_ref().err(),
                elapsed: start.elapsed(),
            });
            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match self.policy.handle(&err, side_effect, attempt) {
                RecoveryAction::RetryWithBackoff(delay) => {
                    tracing::warn!(capability = %name, attempt, ?delay, error = %err, "retrying capability");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RecoveryAction::FailStep => return Err(classify(name, err, attempt + 1)),
            }
        }
    }

    /// 询问 oracle；与其他只读能力一样受权限、超时与重试约束
    pub async fn ask(&self, request: &OracleRequest) -> Result<OracleDecision, OrchestratorError> {
        if !permitted(request.agent, ORACLE_CAPABILITY) {
            return Err(OrchestratorError::CapabilityNotPermitted {
                capability: ORACLE_CAPABILITY.to_string(),
                agent: request.agent.to_string(),
            });
        }
        let preview = Value::String(request.input.clone());
        let mut attempt = 0u32;
        loop {
            let start = Instant::now();
            self.count(ORACLE_CAPABILITY);
            let result = match timeout(self.call_timeout, self.oracle.ask(request)).await {
                Ok(r) => r,
                Err(_) => Err(CapabilityError::Timeout(self.call_timeout)),
            };
            audit(Audit {
                capability: ORACLE_CAPABILITY,
                agent: request.agent,
                side_effect: SideEffect::ReadOnly,
                attempt,
                idempotency_key: None,
                args: &preview,
                error: result.as_ref().err(),
                elapsed: start.elapsed(),
            });
            let err = match result {
                Ok(decision) => {
                    tracing::debug!(
                        oracle = %self.oracle.name(),
                        action = %decision.action,
                        rationale = %decision.rationale,
                        "oracle decision"
                    );
                    return Ok(decision);
                }
                Err(e) => e,
            };
            match self.policy.handle(&err, SideEffect::ReadOnly, attempt) {
                RecoveryAction::RetryWithBackoff(delay) => {
                    tracing::warn!(attempt, ?delay, error = %err, "retrying oracle");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RecoveryAction::FailStep => return Err(classify(ORACLE_CAPABILITY, err, attempt + 1)),
            }
        }
    }
}

fn classify(capability: &str, err: CapabilityError, attempts: u32) -> OrchestratorError {
    match err {
        CapabilityError::InvalidArguments(message) => OrchestratorError::InvalidCapabilityArguments {
            capability: capability.to_string(),
            message,
        },
        e if e.is_transient() => OrchestratorError::TransientCapability {
            capability: capability.to_string(),
            attempts,
            message: e.to_string(),
        },
        e => OrchestratorError::CapabilityFailed {
            capability: capability.to_string(),
            message: e.to_string(),
        },
    }
}

struct Audit<'a> {
    capability: &'a str,
    agent: AgentId,
    side_effect: SideEffect,
    attempt: u32,
    idempotency_key: Option<&'a str>,
    args: &'a Value,
    error: Option<&'a CapabilityError>,
    elapsed: Duration,
}

fn audit(record: Audit<'_>) {
    let outcome = match record.error {
        None => "ok",
        Some(CapabilityError::Timeout(_)) => "timeout",
        Some(CapabilityError::InvalidArguments(_)) => "invalid_arguments",
        Some(_) => "error",
    };
    let audit = serde_json::json!({
        "event": "capability_audit",
        "capability": record.capability,
        "agent": record.agent.as_str(),
        "side_effect": record.side_effect.as_str(),
        "attempt": record.attempt,
        "idempotency_key": record.idempotency_key,
        "ok": record.error.is_none(),
        "outcome": outcome,
        "duration_ms": record.elapsed.as_millis() as u64,
        "args_preview": args_preview(record.args),
    });
    tracing::info!(audit = %audit.to_string(), "capability");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

/// 单个引擎步骤内的调用作用域：固定 Agent、会话与步骤号，并分配幂等键序号
pub struct StepScope {
    gateway: Arc<CapabilityGateway>,
    agent: AgentId,
    session_id: String,
    step: u64,
    ordinal: AtomicU32,
}

impl StepScope {
    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn gateway(&self) -> &CapabilityGateway {
        &self.gateway
    }

    fn next_key(&self) -> String {
        let ordinal = self.ordinal.fetch_add(1, Ordering::SeqCst);
        format!("{}:{}:{}", self.session_id, self.step, ordinal)
    }

    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, OrchestratorError> {
        let key = match self.gateway.side_effect(name) {
            Some(SideEffect::NonIdempotentWrite) => Some(self.next_key()),
            _ => None,
        };
        self.gateway.invoke(self.agent, name, args, key.as_deref()).await
    }

    /// 调用并把结果反序列化为 T
    pub async fn invoke_as<T: DeserializeOwned>(&self, name: &str, args: Value) -> Result<T, OrchestratorError> {
        let value = self.invoke(name, args).await?;
        serde_json::from_value(value).map_err(|e| OrchestratorError::CapabilityFailed {
            capability: name.to_string(),
            message: format!("unexpected result shape: {e}"),
        })
    }

    pub async fn ask(&self, mut request: OracleRequest) -> Result<OracleDecision, OrchestratorError> {
        request.agent = self.agent;
        self.gateway.ask(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::oracle::{KeywordOracle, OraclePurpose, ScriptedOracle};
    use crate::capability::TypedCapability;
    use async_trait::async_trait;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;

    #[derive(Deserialize, JsonSchema)]
    struct PingArgs {
        #[allow(dead_code)]
        n: u32,
    }

    /// 前 `failures` 次返回 Unavailable，并记录收到的幂等键
    struct Flaky {
        failures: usize,
        calls: Arc<AtomicUsize>,
        keys: Arc<Mutex<Vec<Option<String>>>>,
    }

    #[async_trait]
    impl TypedCapability for Flaky {
        type Args = PingArgs;
        const NAME: &'static str = "procurement.create_requisition";
        const DESCRIPTION: &'static str = "test";
        const SIDE_EFFECT: SideEffect = SideEffect::NonIdempotentWrite;

        async fn run(&self, _args: PingArgs, key: Option<&str>) -> Result<Value, CapabilityError> {
            self.keys.lock().unwrap().push(key.map(str::to_string));
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(CapabilityError::Unavailable("erp down".into()));
            }
            Ok(serde_json::json!({"ok": true}))
        }
    }

    struct Slow;

    #[async_trait]
    impl TypedCapability for Slow {
        type Args = PingArgs;
        const NAME: &'static str = "work_orders.create";
        const DESCRIPTION: &'static str = "test";
        const SIDE_EFFECT: SideEffect = SideEffect::NonIdempotentWrite;

        async fn run(&self, _args: PingArgs, _key: Option<&str>) -> Result<Value, CapabilityError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Value::Null)
        }
    }

    fn gateway(failures: usize) -> (Arc<CapabilityGateway>, Arc<Mutex<Vec<Option<String>>>>) {
        let keys = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CapabilityRegistry::new();
        registry.register_typed(Flaky {
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
            keys: keys.clone(),
        });
        registry.register_typed(Slow);
        let gw = CapabilityGateway::new(registry, Arc::new(KeywordOracle::new()))
            .with_policy(RecoveryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)))
            .with_call_timeout(Duration::from_millis(20));
        (Arc::new(gw), keys)
    }

    #[test]
    fn test_permission_table() {
        assert!(permitted(AgentId::Inventory, "inventory.lookup_part"));
        assert!(permitted(AgentId::WorkOrder, "machines.bom"));
        assert!(!permitted(AgentId::Inventory, "work_orders.create"));
        assert!(!permitted(AgentId::Reporter, ORACLE_CAPABILITY));
        assert!(permitted(AgentId::Technician, "work_orders.update_status"));
        assert!(permitted(AgentId::Procurement, "procurement.cancel_requisition"));
        assert!(!permitted(AgentId::Inventory, "procurement.create_requisition"));
    }

    #[tokio::test]
    async fn test_unknown_and_forbidden() {
        let (gw, _) = gateway(0);
        let scope = gw.scope(AgentId::Reporter, "s1", 1);
        let err = scope.invoke("nope.nothing", Value::Null).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownCapability(_)));
        let err = scope
            .invoke("procurement.create_requisition", serde_json::json!({"n": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::CapabilityNotPermitted { .. }));
        assert_eq!(gw.invocations("procurement.create_requisition"), 0);
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_not_retried() {
        let (gw, keys) = gateway(0);
        let scope = gw.scope(AgentId::Procurement, "s1", 1);
        let err = scope
            .invoke("procurement.create_requisition", serde_json::json!({"n": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidCapabilityArguments { .. }));
        assert!(keys.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_retried_with_same_key() {
        let (gw, keys) = gateway(2);
        let scope = gw.scope(AgentId::Procurement, "s1", 4);
        scope
            .invoke("procurement.create_requisition", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        scope
            .invoke("procurement.create_requisition", serde_json::json!({"n": 2}))
            .await
            .unwrap();
        let keys = keys.lock().unwrap().clone();
        assert_eq!(keys.len(), 4);
        assert!(keys[..3].iter().all(|k| k.as_deref() == Some("s1:4:0")));
        assert_eq!(keys[3].as_deref(), Some("s1:4:1"));
        assert_eq!(gw.invocations("procurement.create_requisition"), 4);
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_transient() {
        let (gw, _) = gateway(10);
        let scope = gw.scope(AgentId::Procurement, "s1", 1);
        let err = scope
            .invoke("procurement.create_requisition", serde_json::json!({"n": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::TransientCapability { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn test_non_idempotent_timeout_not_retried() {
        let (gw, _) = gateway(0);
        let scope = gw.scope(AgentId::WorkOrder, "s1", 1);
        let err = scope
            .invoke("work_orders.create", serde_json::json!({"n": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::TransientCapability { attempts: 1, .. }));
        assert_eq!(gw.invocations("work_orders.create"), 1);
    }

    #[tokio::test]
    async fn test_oracle_retry() {
        let oracle = ScriptedOracle::new(vec![
            Err(CapabilityError::Unavailable("rate limited".into())),
            Ok(OracleDecision::new("inventory_query", "scripted")),
        ]);
        let gw = Arc::new(
            CapabilityGateway::new(CapabilityRegistry::new(), Arc::new(oracle))
                .with_policy(RecoveryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2))),
        );
        let scope = gw.scope(AgentId::Supervisor, "s1", 1);
        let decision = scope
            .ask(OracleRequest {
                agent: AgentId::Supervisor,
                purpose: OraclePurpose::ClassifyIntent,
                instruction: "classify".into(),
                input: "how many bearings".into(),
                context: Vec::new(),
                actions: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(decision.action, "inventory_query");
        assert_eq!(gw.invocations(ORACLE_CAPABILITY), 2);
    }
}
