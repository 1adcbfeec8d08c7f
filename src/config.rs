//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ORCH__*` 覆盖（双下划线表示嵌套，如 `ORCH__TOOLS__SERVER_URL=http://tools:3001`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::cache::{default_cache_configs, ToolCacheConfig};
use crate::intent::classifier::{default_brands, default_taxonomy};
use crate::intent::{BrandInfo, CategoryTaxonomy};
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerOverride};
use crate::tools::ProviderEntry;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub circuit_breaker: CircuitBreakerSection,
    /// 工具名 → 缓存策略，合并在内置默认之上
    pub cache: HashMap<String, ToolCacheConfig>,
    pub context: ContextSection,
    pub intent: IntentSection,
}

impl AppConfig {
    /// 缓存覆盖项；工具名与内置默认大小写不一致时归一到内置名
    pub fn cache_overrides(&self) -> HashMap<String, ToolCacheConfig> {
        let known: Vec<String> = default_cache_configs().into_keys().collect();
        self.cache
            .iter()
            .map(|(tool, cfg)| {
                let name = known
                    .iter()
                    .find(|k| k.eq_ignore_ascii_case(tool))
                    .cloned()
                    .unwrap_or_else(|| tool.clone());
                (name, cfg.clone())
            })
            .collect()
    }
}

/// [app] 段：应用名、调试模式、对话轮数上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 为 true 时错误块附带原始错误详情
    pub debug_mode: bool,
    /// 对话历史保留轮数
    pub max_context_turns: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            debug_mode: false,
            max_context_turns: default_max_context_turns(),
        }
    }
}

fn default_app_name() -> String {
    "commerce-orchestrator".to_string()
}

fn default_max_context_turns() -> usize {
    20
}

/// [llm] 段：主备提供方、超时、是否启用 LLM 路由 / 抽取
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub primary: String,
    pub fallback: String,
    pub timeout_secs: u64,
    pub use_llm_routing: bool,
    pub use_llm_extraction: bool,
    pub openai: LlmOpenAiSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            fallback: default_fallback(),
            timeout_secs: default_llm_timeout_secs(),
            use_llm_routing: true,
            use_llm_extraction: true,
            openai: LlmOpenAiSection::default(),
        }
    }
}

fn default_primary() -> String {
    "openai".to_string()
}

fn default_fallback() -> String {
    "claude".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    60
}

/// [llm.openai] 段；api_key_env 指向存放 Key 的环境变量名
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmOpenAiSection {
    pub base_url: Option<String>,
    pub model: String,
    pub api_key_env: String,
}

impl Default for LlmOpenAiSection {
    fn default() -> Self {
        Self {
            base_url: None,
            model: default_openai_model(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

/// [tools] 段：工具服务地址、超时与重试、provider 列表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub server_url: String,
    /// 单次工具调用超时（秒）
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// 熔断器中工具服务的名字
    pub service_name: String,
    pub providers: Vec<ProviderEntry>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            service_name: default_service_name(),
            providers: default_providers(),
        }
    }
}

fn default_server_url() -> String {
    "http://localhost:3001".to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_service_name() -> String {
    "mcp-tool-server".to_string()
}

fn default_providers() -> Vec<ProviderEntry> {
    vec![ProviderEntry::new("mock", "Mock Provider", &["SEARCH", "COMPARE", "CART"])]
}

/// [circuit_breaker] 段：全局阈值 + 按服务覆盖
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_requests: u32,
    pub services: HashMap<String, CircuitBreakerOverride>,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        let base = CircuitBreakerConfig::default();
        Self {
            failure_threshold: base.failure_threshold,
            reset_timeout_ms: base.reset_timeout_ms,
            half_open_requests: base.half_open_requests,
            services: HashMap::new(),
        }
    }
}

impl CircuitBreakerSection {
    pub fn defaults(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout_ms: self.reset_timeout_ms,
            half_open_requests: self.half_open_requests,
        }
        .normalized()
    }
}

/// [context] 段：共享上下文与锁的 TTL
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub context_ttl_secs: u64,
    pub lock_ttl_secs: u64,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            context_ttl_secs: crate::agents::shared_context::DEFAULT_CONTEXT_TTL_SECS,
            lock_ttl_secs: crate::agents::shared_context::DEFAULT_LOCK_TTL_SECS,
        }
    }
}

/// [intent] 段：类目词表与品牌列表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntentSection {
    pub taxonomy: Vec<CategoryTaxonomy>,
    pub brands: Vec<BrandInfo>,
}

impl Default for IntentSection {
    fn default() -> Self {
        Self {
            taxonomy: default_taxonomy(),
            brands: default_brands(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 ORCH__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ORCH__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("ORCH")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置；调用方决定是否用新配置重建组件
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_cover_every_section() {
        let cfg = AppConfig::default();
        assert!(!cfg.app.debug_mode);
        assert_eq!(cfg.app.max_context_turns, 20);
        assert_eq!(cfg.llm.primary, "openai");
        assert_eq!(cfg.llm.fallback, "claude");
        assert!(cfg.llm.use_llm_routing);
        assert_eq!(cfg.tools.server_url, "http://localhost:3001");
        assert_eq!(cfg.tools.request_timeout_secs, 15);
        assert_eq!(cfg.tools.service_name, "mcp-tool-server");
        assert_eq!(cfg.circuit_breaker.defaults(), CircuitBreakerConfig::default());
        assert_eq!(cfg.context.context_ttl_secs, 7200);
        assert_eq!(cfg.context.lock_ttl_secs, 10);
        assert!(cfg.intent.taxonomy.iter().any(|c| c.id == "mobiles"));
        assert!(cfg.cache.is_empty());
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[app]
debug_mode = true

[tools]
server_url = "http://tools.internal:9000"
max_retries = 5

[[tools.providers]]
id = "alpha"
name = "Alpha Store"
capabilities = ["SEARCH"]

[circuit_breaker]
failure_threshold = 2

[circuit_breaker.services.payments]
reset_timeout_ms = 1000

[cache."commerce.searchProducts"]
enabled = true
ttl_seconds = 60
cache_key_prefix = "tool:search"
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert!(cfg.app.debug_mode);
        assert_eq!(cfg.tools.server_url, "http://tools.internal:9000");
        assert_eq!(cfg.tools.max_retries, 5);
        assert_eq!(cfg.tools.retry_delay_ms, 1000);
        assert_eq!(cfg.tools.providers.len(), 1);
        assert!(cfg.tools.providers[0].enabled);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 2);
        assert_eq!(cfg.circuit_breaker.half_open_requests, 3);
        assert_eq!(
            cfg.circuit_breaker.services["payments"].reset_timeout_ms,
            Some(1000)
        );

        let overrides = cfg.cache_overrides();
        assert_eq!(overrides["commerce.searchProducts"].ttl_seconds, 60);
    }

    #[test]
    fn missing_explicit_file_falls_back_to_defaults() {
        let cfg = load_config(Some(PathBuf::from("/definitely/not/here.toml"))).unwrap();
        assert_eq!(cfg.llm.timeout_secs, 60);
    }
}
