//! 引擎构建器：统一的组装逻辑（配置 → 工厂数据、oracle、能力网关、检查点存储 → Engine）
//!
//! 控制台与测试共用同一套组装；各组件都可以替换（测试注入 ScriptedOracle、内存存储等）。

use std::path::PathBuf;
use std::sync::Arc;

use crate::agents::AgentSettings;
use crate::capability::plant::standard_registry;
use crate::capability::{CapabilityGateway, KeywordOracle, LlmOracle, LogNotifier, Notifier, ReasoningOracle};
use crate::checkpoint::{create_checkpoint_store, CheckpointStore};
use crate::config::AppConfig;
use crate::core::engine::Engine;
use crate::core::error::OrchestratorError;
use crate::plant::PlantStore;

/// 引擎构建器
pub struct EngineBuilder {
    config: AppConfig,
    store: Option<Arc<dyn CheckpointStore>>,
    oracle: Option<Arc<dyn ReasoningOracle>>,
    notifier: Option<Arc<dyn Notifier>>,
    plant: Option<Arc<PlantStore>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            oracle: None,
            notifier: None,
            plant: None,
        }
    }

    /// 替换检查点存储（默认按 [checkpoint] 配置创建）
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 替换 oracle（默认按 [llm] 配置选择）
    pub fn with_oracle(mut self, oracle: Arc<dyn ReasoningOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_plant(mut self, plant: Arc<PlantStore>) -> Self {
        self.plant = Some(plant);
        self
    }

    /// 工厂数据：seed_path 存在则加载，否则用内置演示数据
    pub fn build_plant(&self) -> Result<Arc<PlantStore>, OrchestratorError> {
        if let Some(plant) = &self.plant {
            return Ok(plant.clone());
        }
        let store = match self.config.plant.seed_path.as_deref().filter(|p| p.exists()) {
            Some(path) => {
                tracing::info!("Loading plant seed from {:?}", path);
                PlantStore::load(path)
            }
            None => {
                tracing::info!("Using built-in demo plant data");
                PlantStore::demo()
            }
        };
        store
            .map(Arc::new)
            .map_err(|e| OrchestratorError::Config(e.to_string()))
    }

    /// oracle：配置了 LLM 则用 LlmOracle，否则 KeywordOracle
    pub fn build_oracle(&self) -> Arc<dyn ReasoningOracle> {
        if let Some(oracle) = &self.oracle {
            return oracle.clone();
        }
        match crate::llm::create_client(&self.config.llm) {
            Some(llm) => Arc::new(LlmOracle::new(llm)),
            None => Arc::new(KeywordOracle::new()),
        }
    }

    pub fn build_gateway(&self, plant: Arc<PlantStore>) -> Arc<CapabilityGateway> {
        let notifier = self
            .notifier
            .clone()
            .unwrap_or_else(|| Arc::new(LogNotifier::new()));
        let registry = standard_registry(plant, notifier);
        tracing::debug!(capabilities = %registry.to_schema_json(), "capability registry");
        Arc::new(CapabilityGateway::from_config(
            registry,
            self.build_oracle(),
            &self.config.gateway,
        ))
    }

    /// 组装完整引擎
    pub async fn build(self) -> Result<EngineComponents, OrchestratorError> {
        let plant = self.build_plant()?;
        let gateway = self.build_gateway(plant.clone());
        let store = match &self.store {
            Some(store) => store.clone(),
            None => create_checkpoint_store(&self.config.checkpoint).await?,
        };
        let engine = Engine::new(store, gateway.clone())
            .with_max_iterations(self.config.engine.max_iterations)
            .with_context_window(self.config.engine.context_window)
            .with_settings(AgentSettings::from_config(&self.config));
        Ok(EngineComponents {
            engine: Arc::new(engine),
            plant,
            gateway,
            config: self.config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

/// 组装好的引擎与共享组件（多会话共享）
pub struct EngineComponents {
    pub engine: Arc<Engine>,
    pub plant: Arc<PlantStore>,
    pub gateway: Arc<CapabilityGateway>,
    pub config: AppConfig,
}

/// 便捷函数：从默认路径加载配置并创建 EngineBuilder
pub fn create_engine_builder(config_path: Option<PathBuf>) -> EngineBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    EngineBuilder::new(config)
}
