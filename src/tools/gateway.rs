//! 工具网关：缓存 → 熔断 → 带重试的工具边界
//!
//! 熔断打开时返回 SERVICE_UNAVAILABLE 降级响应；下游失败（重试耗尽）以 Err 返回给调用方。
//! 每次调用输出一行结构化审计日志（JSON）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::cache::ToolCache;
use crate::core::OrchestratorError;
use crate::observability::tool_audit;
use crate::resilience::CircuitBreaker;
use crate::tools::{ToolBoundary, ToolResponse};

pub struct ToolGateway {
    boundary: Arc<dyn ToolBoundary>,
    cache: Arc<ToolCache>,
    breaker: Arc<CircuitBreaker>,
    service_name: String,
}

impl ToolGateway {
    pub fn new(
        boundary: Arc<dyn ToolBoundary>,
        cache: Arc<ToolCache>,
        breaker: Arc<CircuitBreaker>,
        service_name: &str,
    ) -> Self {
        Self {
            boundary,
            cache,
            breaker,
            service_name: service_name.to_string(),
        }
    }

    pub fn cache(&self) -> &Arc<ToolCache> {
        &self.cache
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub async fn execute(
        &self,
        tool_name: &str,
        request: Value,
        trace_id: &str,
    ) -> Result<ToolResponse, OrchestratorError> {
        self.execute_with_headers(tool_name, request, trace_id, &HashMap::new())
            .await
    }

    pub async fn execute_with_headers(
        &self,
        tool_name: &str,
        request: Value,
        trace_id: &str,
        headers: &HashMap<String, String>,
    ) -> Result<ToolResponse, OrchestratorError> {
        let start = Instant::now();

        let use_cache = self.cache.should_use_cache(tool_name, headers).await;
        if use_cache {
            if let Some(hit) = self.cache.get_cached_result(tool_name, &request).await {
                tool_audit(trace_id, tool_name, true, "cache_hit", start, &request);
                return Ok(hit);
            }
        }

        let boundary = self.boundary.clone();
        let call_request = request.clone();
        let result = self
            .breaker
            .execute(&self.service_name, || async move {
                boundary.execute(tool_name, call_request, trace_id).await
            })
            .await;

        match result {
            Ok(response) => {
                let outcome = if response.ok { "ok" } else { "error" };
                tool_audit(trace_id, tool_name, response.ok, outcome, start, &request);
                if use_cache {
                    self.cache.cache_result(tool_name, &request, &response).await;
                }
                Ok(response)
            }
            Err(OrchestratorError::ServiceUnavailable(service)) => {
                tracing::warn!(trace_id, tool = tool_name, service = %service, "serving fallback response");
                tool_audit(trace_id, tool_name, false, "circuit_open", start, &request);
                Ok(ToolResponse::service_unavailable())
            }
            Err(e) => {
                tool_audit(trace_id, tool_name, false, "error", start, &request);
                Err(e)
            }
        }
    }
}
