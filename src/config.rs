//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MAINT__*` 覆盖（双下划线表示嵌套，如 `MAINT__ENGINE__MAX_ITERATIONS=20`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub engine: EngineSection,
    pub gateway: GatewaySection,
    pub checkpoint: CheckpointSection,
    pub llm: LlmSection,
    pub plant: PlantSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 维护报告邮件的默认收件人
    #[serde(default = "default_report_recipient")]
    pub report_recipient: String,
}

fn default_report_recipient() -> String {
    "maintenance-manager@plant.local".to_string()
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            report_recipient: default_report_recipient(),
        }
    }
}

/// [engine] 段：路由上限、上下文窗口、人工中断超时
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Agent 可见的最近消息条数
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// 技术员决策超时（秒）；0 表示无限等待
    #[serde(default)]
    pub interrupt_timeout_secs: u64,
    /// 超时后自动采用的决定
    #[serde(default = "default_interrupt_default_choice")]
    pub interrupt_default_choice: String,
}

fn default_max_iterations() -> u32 {
    15
}

fn default_context_window() -> usize {
    20
}

fn default_interrupt_default_choice() -> String {
    "reschedule".to_string()
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            context_window: default_context_window(),
            interrupt_timeout_secs: 0,
            interrupt_default_choice: default_interrupt_default_choice(),
        }
    }
}

impl EngineSection {
    pub fn interrupt_timeout(&self) -> Option<Duration> {
        (self.interrupt_timeout_secs > 0).then(|| Duration::from_secs(self.interrupt_timeout_secs))
    }
}

/// [gateway] 段：单次调用超时与瞬时错误重试
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// 检查点后端
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    Memory,
    #[default]
    File,
    Sqlite,
}

/// [checkpoint] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CheckpointSection {
    #[serde(default)]
    pub backend: CheckpointBackend,
    /// file 后端为目录，sqlite 后端为数据库文件
    pub path: Option<PathBuf>,
}

/// [llm] 段：oracle 后端选择
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// keyword（离线规则）/ openai（OpenAI 兼容端点）
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读 OPENAI_API_KEY
    pub api_key: Option<String>,
}

fn default_provider() -> String {
    "keyword".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
        }
    }
}

/// [plant] 段：工厂数据种子
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PlantSection {
    /// TOML 种子文件；未设置或不存在时使用内置演示数据
    pub seed_path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 MAINT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MAINT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MAINT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
