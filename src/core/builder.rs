//! 服务装配：按配置一次性创建并连接所有组件
//!
//! KV → 熔断器 / 工具缓存 / 共享上下文 → 工具网关 → LLM 路由与抽取 → 三个 Agent → 注册表 → 编排入口。

use std::sync::Arc;

use crate::agents::{
    AgentRegistry, LeaderAgent, ProductBrowsingAgent, SharedContextStore, ShoppingAgent,
};
use crate::cache::{ToolCache, ToolCacheConfigPatch};
use crate::config::AppConfig;
use crate::core::{Coordinator, OrchestratorError, RecoveryEngine};
use crate::intent::IntentClassifier;
use crate::kv::{InMemoryKvStore, KvStore};
use crate::llm::{LlmExtraction, LlmRouter, OpenAiProvider};
use crate::memory::{ConversationStore, InMemoryConversationStore};
use crate::resilience::CircuitBreaker;
use crate::tools::{
    HttpToolClient, ProviderDirectory, RetryingToolClient, StaticProviderDirectory, ToolBoundary,
    ToolGateway,
};

/// 装配完成的服务集合
pub struct Services {
    pub config: AppConfig,
    pub kv: Arc<dyn KvStore>,
    pub breaker: Arc<CircuitBreaker>,
    pub cache: Arc<ToolCache>,
    pub gateway: Arc<ToolGateway>,
    pub llm: Arc<LlmRouter>,
    pub classifier: Arc<IntentClassifier>,
    pub shared_context: Arc<SharedContextStore>,
    pub coordinator: Coordinator,
}

impl Services {
    /// HTTP 工具客户端 + 按环境变量决定是否启用 OpenAI 兼容提供方
    pub fn from_config(config: &AppConfig) -> Result<Self, OrchestratorError> {
        let http = HttpToolClient::new(&config.tools.server_url, config.tools.request_timeout_secs)?;
        let llm = llm_from_config(config);
        Self::assemble(config, Arc::new(http), llm)
    }

    /// 使用给定的工具边界与 LLM 路由装配（测试中传入脚本化实现）
    pub fn assemble(
        config: &AppConfig,
        boundary: Arc<dyn ToolBoundary>,
        llm: LlmRouter,
    ) -> Result<Self, OrchestratorError> {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());

        let breaker = Arc::new(
            CircuitBreaker::new(config.circuit_breaker.defaults())
                .with_overrides(&config.circuit_breaker.services)
                .with_kv(kv.clone()),
        );
        let cache = Arc::new(ToolCache::new(kv.clone(), config.cache_overrides()));

        let recovery = RecoveryEngine::new(config.tools.max_retries, config.tools.retry_delay_ms);
        let retrying: Arc<dyn ToolBoundary> = Arc::new(RetryingToolClient::new(boundary, recovery));
        let gateway = Arc::new(ToolGateway::new(
            retrying,
            cache.clone(),
            breaker.clone(),
            &config.tools.service_name,
        ));

        let shared_context = Arc::new(
            SharedContextStore::new(kv.clone())
                .with_ttls(config.context.context_ttl_secs, config.context.lock_ttl_secs),
        );
        let classifier = Arc::new(IntentClassifier::new(
            config.intent.taxonomy.clone(),
            config.intent.brands.clone(),
        ));
        let providers: Arc<dyn ProviderDirectory> =
            Arc::new(StaticProviderDirectory::new(config.tools.providers.clone()));

        let llm = Arc::new(llm);
        let llm_ready = llm.has_available_provider();
        if !llm_ready {
            tracing::warn!("No LLM provider available, routing and extraction use rules only");
        }
        let extraction = Arc::new(LlmExtraction::new(llm.clone()));

        let leader = LeaderAgent::new(classifier.clone())
            .with_llm_routing(extraction.clone(), config.llm.use_llm_routing && llm_ready)
            .with_shared_context(shared_context.clone());
        let mut browsing = ProductBrowsingAgent::new(gateway.clone(), providers)
            .with_shared_context(shared_context.clone());
        if config.llm.use_llm_extraction && llm_ready {
            browsing = browsing.with_llm_extraction(extraction);
        }
        let shopping = ShoppingAgent::new(gateway.clone()).with_shared_context(shared_context.clone());

        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(leader))?;
        registry.register(Arc::new(browsing))?;
        registry.register(Arc::new(shopping))?;
        let stats = registry.stats();
        tracing::info!(agents = stats.total_agents, "agent registry ready");

        let conversations: Arc<dyn ConversationStore> =
            Arc::new(InMemoryConversationStore::new(config.app.max_context_turns));
        let coordinator = Coordinator::new(
            Arc::new(registry),
            classifier.clone(),
            shared_context.clone(),
            conversations,
        )
        .with_debug_mode(config.app.debug_mode);

        Ok(Self {
            config: config.clone(),
            kv,
            breaker,
            cache,
            gateway,
            llm,
            classifier,
            shared_context,
            coordinator,
        })
    }
}

impl Services {
    /// 热更新：缓存 TTL 与按服务熔断参数；其余配置需重建服务
    pub async fn apply_reloaded(&self, config: &AppConfig) {
        for (tool, cfg) in config.cache_overrides() {
            let patch = ToolCacheConfigPatch {
                enabled: Some(cfg.enabled),
                ttl_seconds: Some(cfg.ttl_seconds),
                cache_key_prefix: Some(cfg.cache_key_prefix),
            };
            if !self.cache.update_cache_config(&tool, patch).await {
                tracing::warn!(tool = %tool, "ignoring cache config for unknown tool");
            }
        }
        for (service, overrides) in &config.circuit_breaker.services {
            self.breaker.configure(service, *overrides).await;
        }
        tracing::info!("configuration reloaded");
    }
}

/// 读取 api_key_env 指向的环境变量；未设置时路由器为空（规则兜底）
fn llm_from_config(config: &AppConfig) -> LlmRouter {
    let openai = &config.llm.openai;
    let router = LlmRouter::new(
        &config.llm.primary,
        &config.llm.fallback,
        config.llm.timeout_secs,
    );
    match std::env::var(&openai.api_key_env) {
        Ok(key) if !key.trim().is_empty() => {
            tracing::info!("Using OpenAI-compatible LLM ({})", openai.model);
            router.with_provider(Arc::new(OpenAiProvider::new(
                openai.base_url.as_deref(),
                &openai.model,
                Some(key),
            )))
        }
        _ => {
            tracing::warn!("{} not set, LLM features disabled", openai.api_key_env);
            router
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ToolCacheConfig;
    use crate::llm::MockLlmProvider;
    use crate::resilience::CircuitBreakerOverride;
    use crate::tools::{ToolError, ToolResponse};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Unused;

    #[async_trait]
    impl ToolBoundary for Unused {
        async fn execute(&self, _: &str, _: Value, _: &str) -> Result<ToolResponse, ToolError> {
            Ok(ToolResponse::success(json!({})))
        }
    }

    #[test]
    fn test_assemble_registers_three_agents() {
        let services = Services::assemble(
            &AppConfig::default(),
            Arc::new(Unused),
            LlmRouter::new("mock", "mock", 5),
        )
        .unwrap();
        let mut names = services.coordinator.registry().agent_names();
        names.sort();
        assert_eq!(
            names,
            vec!["LeaderAgent", "ProductBrowsingAgent", "ShoppingAgent"]
        );
        assert!(!services.llm.has_available_provider());
    }

    #[test]
    fn test_mock_provider_counts_as_available() {
        let llm = LlmRouter::new("mock", "mock", 5).with_provider(Arc::new(MockLlmProvider::new("mock")));
        let services = Services::assemble(&AppConfig::default(), Arc::new(Unused), llm).unwrap();
        assert!(services.llm.has_available_provider());
    }

    #[test]
    fn test_from_config_builds_http_client() {
        let services = Services::from_config(&AppConfig::default()).unwrap();
        assert_eq!(services.gateway.service_name(), "mcp-tool-server");
    }

    #[tokio::test]
    async fn test_circuit_overrides_from_config_are_applied() {
        let mut cfg = AppConfig::default();
        cfg.circuit_breaker.services.insert(
            "mcp-tool-server".to_string(),
            CircuitBreakerOverride {
                failure_threshold: Some(1),
                ..Default::default()
            },
        );
        let services =
            Services::assemble(&cfg, Arc::new(Unused), LlmRouter::new("mock", "mock", 5)).unwrap();
        assert_eq!(
            services.breaker.config_for("mcp-tool-server").await.failure_threshold,
            1
        );
        assert_eq!(services.breaker.config_for("other").await.failure_threshold, 5);
    }

    #[tokio::test]
    async fn test_apply_reloaded_updates_cache_and_breaker() {
        let services = Services::assemble(
            &AppConfig::default(),
            Arc::new(Unused),
            LlmRouter::new("mock", "mock", 5),
        )
        .unwrap();

        let mut reloaded = AppConfig::default();
        reloaded.cache.insert(
            "commerce.searchproducts".to_string(),
            ToolCacheConfig::new(42, "tool:search"),
        );
        reloaded.circuit_breaker.services.insert(
            "mcp-tool-server".to_string(),
            CircuitBreakerOverride {
                reset_timeout_ms: Some(1_000),
                ..Default::default()
            },
        );
        services.apply_reloaded(&reloaded).await;

        assert_eq!(
            services.cache.cache_config("commerce.searchProducts").await.ttl_seconds,
            42
        );
        assert_eq!(
            services.breaker.config_for("mcp-tool-server").await.reset_timeout_ms,
            1_000
        );
    }
}
