//! 编排端到端测试：内存 KV + 脚本化工具服务 + 无 LLM（规则路由）

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use commerce_orchestrator::agents::{
    Agent, AgentTask, CartAction, ResponseStatus, StreamChunk, TaskContext, LEADER_AGENT,
    PRODUCT_BROWSING_AGENT, SHOPPING_AGENT,
};
use commerce_orchestrator::config::AppConfig;
use commerce_orchestrator::intent::Intent;
use commerce_orchestrator::llm::LlmRouter;
use commerce_orchestrator::memory::{ConversationStore, Role};
use commerce_orchestrator::resilience::CircuitState;
use commerce_orchestrator::tools::{commerce, ProviderEntry, ToolBoundary, ToolError, ToolResponse};
use commerce_orchestrator::{OrchestratorError, Services, UserRequest};
use futures_util::StreamExt;
use serde_json::{json, Value};

/// 模拟工具服务：两个 provider 返回有重叠的商品，购物车固定一件
#[derive(Default)]
struct ScriptedToolServer {
    calls: Mutex<Vec<(String, Value)>>,
    down: bool,
}

impl ScriptedToolServer {
    fn calls_to(&self, tool: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == tool)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl ToolBoundary for ScriptedToolServer {
    async fn execute(&self, tool: &str, request: Value, _: &str) -> Result<ToolResponse, ToolError> {
        self.calls.lock().unwrap().push((tool.to_string(), request.clone()));
        if self.down {
            return Err(ToolError::Status {
                tool: tool.to_string(),
                status: 503,
            });
        }
        let data = match tool {
            commerce::SEARCH_PRODUCTS => match request["provider"].as_str() {
                Some("alpha") => json!({"products": [
                    {"id": "a1", "provider": "alpha", "name": "Galaxy M14", "brand": "Samsung",
                     "price": {"amount": 15999.0}, "availability": {"inStock": true}, "rating": 4.2}
                ]}),
                Some("beta") => json!({"products": [
                    {"id": "b1", "provider": "beta", "name": "Samsung Galaxy M14", "brand": "Samsung",
                     "price": {"amount": 15499.0}, "availability": {"inStock": true}, "rating": 4.5},
                    {"id": "b2", "provider": "beta", "name": "Redmi 12", "brand": "Xiaomi",
                     "price": {"amount": 11999.0}, "availability": {"inStock": true}, "rating": 3.9}
                ]}),
                _ => json!({"products": []}),
            },
            commerce::CART_ADD_ITEM | commerce::CART_GET => {
                json!({"items": [{"productId": "b1", "quantity": 1}], "itemCount": 1})
            }
            _ => json!({}),
        };
        Ok(ToolResponse::success(data))
    }
}

fn config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.tools.providers = vec![
        ProviderEntry::new("alpha", "Alpha Store", &["SEARCH"]),
        ProviderEntry::new("beta", "Beta Mart", &["SEARCH"]),
    ];
    cfg.tools.retry_delay_ms = 1;
    cfg
}

fn services(server: Arc<ScriptedToolServer>, cfg: &AppConfig) -> Services {
    Services::assemble(cfg, server, LlmRouter::new("openai", "claude", 5)).unwrap()
}

async fn run(services: &Services, request: UserRequest) -> Vec<StreamChunk> {
    services.coordinator.process_request(request).collect().await
}

#[tokio::test]
async fn search_merges_providers_and_dedups() {
    let server = Arc::new(ScriptedToolServer::default());
    let services = services(server.clone(), &config());

    let chunks = run(
        &services,
        UserRequest::new("s1", "u1", "show me samsung phones under 20k").with_trace_id("trace-search"),
    )
    .await;

    match &chunks[0] {
        StreamChunk::Token { content } => assert!(content.starts_with("I found 2 products")),
        other => panic!("expected token, got {other:?}"),
    }
    let cards = chunks
        .iter()
        .find_map(|c| match c {
            StreamChunk::Cards { products } => Some(products.clone()),
            _ => None,
        })
        .expect("cards chunk");
    let ids: Vec<&str> = cards.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids[0], "b1");
    assert!(!ids.contains(&"a1"));

    let n = chunks.len();
    match &chunks[n - 2] {
        StreamChunk::Followups { suggestions } => {
            assert!(suggestions.iter().any(|s| s == "Compare these products"))
        }
        other => panic!("expected followups, got {other:?}"),
    }
    assert_eq!(chunks[n - 1], StreamChunk::Done);

    let searches = server.calls_to(commerce::SEARCH_PRODUCTS);
    assert_eq!(searches.len(), 2);
    assert!(searches.iter().all(|r| r["filters"]["priceMax"] == json!(20000.0)));

    let history = services.coordinator.conversations().history("s1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert!(history[1].content.starts_with("I found 2 products"));

    let leader = services
        .shared_context
        .get_agent_state("s1", LEADER_AGENT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leader.working_memory["intent"], json!("PRODUCT_SEARCH"));
}

#[tokio::test]
async fn repeated_search_is_served_from_cache() {
    let server = Arc::new(ScriptedToolServer::default());
    let services = services(server.clone(), &config());

    run(&services, UserRequest::new("s1", "u1", "show me samsung phones under 20k")).await;
    run(&services, UserRequest::new("s2", "u2", "show me samsung phones under 20k")).await;

    assert_eq!(server.calls_to(commerce::SEARCH_PRODUCTS).len(), 2);
}

#[tokio::test]
async fn add_to_cart_then_view_cart() {
    let server = Arc::new(ScriptedToolServer::default());
    let services = services(server.clone(), &config());

    let added = run(
        &services,
        UserRequest::new("s1", "u1", "add to cart").with_param("productId", json!("b1")),
    )
    .await;
    match &added[0] {
        StreamChunk::CartUpdated { action, message, .. } => {
            assert_eq!(*action, CartAction::Added);
            assert_eq!(message, "Added 1 item(s) to cart");
        }
        other => panic!("expected cart update, got {other:?}"),
    }
    match &added[1] {
        StreamChunk::Followups { suggestions } => assert_eq!(suggestions[0], "View cart"),
        other => panic!("expected followups, got {other:?}"),
    }
    assert_eq!(added[2], StreamChunk::Done);

    let adds = server.calls_to(commerce::CART_ADD_ITEM);
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0]["userId"], "u1");
    assert_eq!(adds[0]["quantity"], 1);

    let viewed = run(&services, UserRequest::new("s1", "u1", "view cart")).await;
    match &viewed[0] {
        StreamChunk::CartUpdated { action, message, .. } => {
            assert_eq!(*action, CartAction::Viewed);
            assert_eq!(message, "Your cart has 1 item(s)");
        }
        other => panic!("expected cart view, got {other:?}"),
    }
    assert_eq!(viewed.last(), Some(&StreamChunk::Done));
}

#[tokio::test]
async fn vague_request_gets_clarification_without_tool_calls() {
    let server = Arc::new(ScriptedToolServer::default());
    let services = services(server.clone(), &config());

    let chunks = run(&services, UserRequest::new("s1", "u1", "add to cart")).await;
    assert_eq!(chunks.len(), 2);
    assert!(matches!(
        chunks[0],
        StreamChunk::Clarification {
            intent: Intent::AddToCart,
            ..
        }
    ));
    assert_eq!(chunks[1], StreamChunk::Done);
    assert!(server.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn delegation_guard_blocks_cycles_and_depth() {
    let services = services(Arc::new(ScriptedToolServer::default()), &config());
    let registry = services.coordinator.registry();
    let leader = registry.agent_ref(LEADER_AGENT).unwrap();
    let browsing = registry.agent_ref(PRODUCT_BROWSING_AGENT).unwrap();

    let task = AgentTask::new("PRODUCT_SEARCH", Intent::ProductSearch, TaskContext::new("s", "u"));
    let delegated = leader.prepare_delegation(PRODUCT_BROWSING_AGENT, &task).unwrap();
    assert_eq!(delegated.metadata.call_chain, vec![LEADER_AGENT.to_string()]);
    assert_eq!(delegated.metadata.depth, 1);
    assert_eq!(delegated.parent_task_id.as_deref(), Some(task.id.as_str()));

    let not_allowed = browsing.prepare_delegation(SHOPPING_AGENT, &delegated).unwrap_err();
    assert_eq!(not_allowed.code(), "DELEGATION_NOT_ALLOWED");

    let mut cyclic = task.clone();
    cyclic.metadata.call_chain = vec![PRODUCT_BROWSING_AGENT.to_string()];
    let err = leader.prepare_delegation(PRODUCT_BROWSING_AGENT, &cyclic).unwrap_err();
    assert!(matches!(err, OrchestratorError::CircularDelegation { .. }));

    let mut deep = task;
    deep.metadata.depth = 5;
    let err = leader.prepare_delegation(SHOPPING_AGENT, &deep).unwrap_err();
    assert_eq!(err.code(), "MAX_DEPTH_EXCEEDED");
}

#[tokio::test]
async fn delegating_to_unknown_agent_fails_softly() {
    let services = services(Arc::new(ScriptedToolServer::default()), &config());
    let task = AgentTask::new("PRODUCT_SEARCH", Intent::ProductSearch, TaskContext::new("s", "u"));

    let response = services
        .coordinator
        .registry()
        .delegate_task(task, Some("WarehouseAgent"))
        .await;
    assert_eq!(response.status, ResponseStatus::Failure);
    assert_eq!(response.metadata.confidence, 0.0);
    assert_eq!(response.error.unwrap().code, "INTERNAL_ERROR");
}

#[tokio::test]
async fn tool_outage_opens_circuit_and_serves_fallback() {
    let server = Arc::new(ScriptedToolServer {
        down: true,
        ..Default::default()
    });
    let mut cfg = config();
    cfg.tools.max_retries = 1;
    cfg.circuit_breaker.failure_threshold = 1;
    let services = services(server.clone(), &cfg);

    let first = services
        .gateway
        .execute(commerce::CART_GET, json!({"userId": "u1"}), "t1")
        .await;
    assert!(first.is_err());
    assert_eq!(
        services.breaker.state("mcp-tool-server").await,
        CircuitState::Open
    );

    let second = services
        .gateway
        .execute(commerce::CART_GET, json!({"userId": "u1"}), "t2")
        .await
        .unwrap();
    assert!(!second.ok);
    assert_eq!(second.error.unwrap().code, "SERVICE_UNAVAILABLE");
    assert_eq!(server.calls_to(commerce::CART_GET).len(), 1);
}
