//! 能力注册表
//!
//! 所有能力实现 Capability trait（name / description / side_effect / parameters_schema / invoke），
//! 由 CapabilityRegistry 按名注册与查找；CapabilityGateway 在调用时加权限、超时与重试。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::schema::{parse_args, schema_of};
use super::{CapabilityError, SideEffect};

/// 能力 trait：args 为未校验的 JSON
#[async_trait]
pub trait Capability: Send + Sync {
    /// 能力名，形如 `inventory.lookup_part`
    fn name(&self) -> &str;

    /// 能力描述（供 oracle 理解功能）
    fn description(&self) -> &str;

    fn side_effect(&self) -> SideEffect;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行；非幂等写入会收到幂等键，重复键必须返回首次结果
    async fn invoke(&self, args: Value, idempotency_key: Option<&str>) -> Result<Value, CapabilityError>;
}

/// 类型化能力：参数先按 Args 反序列化，再执行
#[async_trait]
pub trait TypedCapability: Send + Sync + 'static {
    type Args: DeserializeOwned + JsonSchema + Send;

    const NAME: &'static str;
    const DESCRIPTION: &'static str;
    const SIDE_EFFECT: SideEffect;

    async fn run(&self, args: Self::Args, idempotency_key: Option<&str>) -> Result<Value, CapabilityError>;
}

/// TypedCapability → Capability 适配器
pub struct Typed<C>(pub C);

#[async_trait]
impl<C: TypedCapability> Capability for Typed<C> {
    fn name(&self) -> &str {
        C::NAME
    }

    fn description(&self) -> &str {
        C::DESCRIPTION
    }

    fn side_effect(&self) -> SideEffect {
        C::SIDE_EFFECT
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<C::Args>()
    }

    async fn invoke(&self, args: Value, idempotency_key: Option<&str>) -> Result<Value, CapabilityError> {
        let args = parse_args::<C::Args>(args)?;
        self.0.run(args, idempotency_key).await
    }
}

/// 能力注册表：按名称存储 Arc<dyn Capability>（有序，便于稳定地生成 oracle 动作列表）
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: impl Capability + 'static) {
        let name = capability.name().to_string();
        self.capabilities.insert(name, Arc::new(capability));
    }

    pub fn register_typed<C: TypedCapability>(&mut self, capability: C) {
        self.register(Typed(capability));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }

    /// 动态生成能力 schema JSON（name / description / side_effect / parameters）
    pub fn to_schema_json(&self) -> String {
        let caps: Vec<Value> = self
            .capabilities
            .iter()
            .map(|(name, cap)| {
                serde_json::json!({
                    "name": name,
                    "description": cap.description(),
                    "side_effect": cap.side_effect().as_str(),
                    "parameters": cap.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&caps).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema)]
    struct EchoArgs {
        text: String,
    }

    struct Echo;

    #[async_trait]
    impl TypedCapability for Echo {
        type Args = EchoArgs;
        const NAME: &'static str = "test.echo";
        const DESCRIPTION: &'static str = "Echo text back";
        const SIDE_EFFECT: SideEffect = SideEffect::ReadOnly;

        async fn run(&self, args: EchoArgs, _key: Option<&str>) -> Result<Value, CapabilityError> {
            Ok(serde_json::json!({ "text": args.text }))
        }
    }

    #[tokio::test]
    async fn test_typed_capability_validates_before_running() {
        let mut registry = CapabilityRegistry::new();
        registry.register_typed(Echo);
        let cap = registry.get("test.echo").unwrap();

        let ok = cap.invoke(serde_json::json!({"text": "hi"}), None).await.unwrap();
        assert_eq!(ok["text"], "hi");

        let err = cap.invoke(serde_json::json!({"txt": "hi"}), None).await.unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidArguments(_)));
    }

    #[test]
    fn test_schema_json_contains_parameters() {
        let mut registry = CapabilityRegistry::new();
        registry.register_typed(Echo);
        let json = registry.to_schema_json();
        assert!(json.contains("test.echo"));
        assert!(json.contains("read_only"));
        assert!(json.contains("\"text\""));
        assert_eq!(registry.names(), vec!["test.echo".to_string()]);
    }
}
