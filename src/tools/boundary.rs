//! 工具执行边界
//!
//! 下游工具服务被视为黑盒：execute(tool_name, request, trace_id) → {ok, data?, error?}。
//! 重试、熔断、缓存都包在这层调用之外。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::{OrchestratorError, RecoveryAction, RecoveryEngine};

/// 调用工具服务时的传输 / 状态错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Tool {tool} timed out")]
    Timeout { tool: String },

    #[error("Tool {tool} returned HTTP {status}")]
    Status { tool: String, status: u16 },

    #[error("Tool {tool} transport error: {message}")]
    Transport { tool: String, message: String },

    #[error("Tool {tool} returned an invalid body: {message}")]
    InvalidResponse { tool: String, message: String },

    /// 工具服务返回 ok=false
    #[error("{message}")]
    Rejected { tool: String, code: String, message: String },
}

impl ToolError {
    /// 仅超时与 5xx 可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            ToolError::Timeout { .. } => true,
            ToolError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolErrorBody {
    pub code: String,
    pub message: String,
}

/// 工具服务响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorBody>,
    #[serde(rename = "_cached", default, skip_serializing_if = "is_false")]
    pub cached: bool,
    #[serde(rename = "_cachedAt", default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ToolResponse {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            cached: false,
            cached_at: None,
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ToolErrorBody {
                code: code.into(),
                message: message.into(),
            }),
            cached: false,
            cached_at: None,
        }
    }

    /// 熔断打开时的降级响应
    pub fn service_unavailable() -> Self {
        Self::failure(
            "SERVICE_UNAVAILABLE",
            "Service is temporarily unavailable. Please try again in a moment.",
        )
    }

    /// ok 且带 data 时返回 data
    pub fn ok_data(&self) -> Option<&Value> {
        if self.ok {
            self.data.as_ref()
        } else {
            None
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }

    /// ok 时取 data（缺省为 null），否则转为 Rejected
    pub fn into_data(self, tool: &str, fallback_message: &str) -> Result<Value, ToolError> {
        if self.ok {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        let (code, message) = match self.error {
            Some(e) => (e.code, e.message),
            None => ("UNKNOWN".to_string(), fallback_message.to_string()),
        };
        Err(ToolError::Rejected {
            tool: tool.to_string(),
            code,
            message,
        })
    }
}

/// 工具执行边界 trait
#[async_trait]
pub trait ToolBoundary: Send + Sync {
    async fn execute(
        &self,
        tool_name: &str,
        request: Value,
        trace_id: &str,
    ) -> Result<ToolResponse, ToolError>;
}

/// 对可重试错误做有限次数的线性退避重试
pub struct RetryingToolClient {
    inner: Arc<dyn ToolBoundary>,
    recovery: RecoveryEngine,
}

impl RetryingToolClient {
    pub fn new(inner: Arc<dyn ToolBoundary>, recovery: RecoveryEngine) -> Self {
        Self { inner, recovery }
    }
}

#[async_trait]
impl ToolBoundary for RetryingToolClient {
    async fn execute(
        &self,
        tool_name: &str,
        request: Value,
        trace_id: &str,
    ) -> Result<ToolResponse, ToolError> {
        let mut attempt: u32 = 1;
        loop {
            match self.inner.execute(tool_name, request.clone(), trace_id).await {
                Ok(response) => {
                    tracing::debug!(trace_id, tool = tool_name, attempt, "tool call succeeded");
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!(
                        trace_id,
                        tool = tool_name,
                        attempt,
                        max_attempts = self.recovery.max_attempts(),
                        error = %e,
                        "tool call failed"
                    );
                    let classified = OrchestratorError::from(e.clone());
                    match self.recovery.handle(&classified, attempt) {
                        RecoveryAction::RetryWithBackoff { delay_ms } => {
                            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                            attempt += 1;
                        }
                        _ => return Err(e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 前 fail_times 次返回给定错误，之后成功
    struct Flaky {
        calls: AtomicU32,
        fail_times: u32,
        error: ToolError,
    }

    #[async_trait]
    impl ToolBoundary for Flaky {
        async fn execute(&self, _: &str, _: Value, _: &str) -> Result<ToolResponse, ToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(self.error.clone())
            } else {
                Ok(ToolResponse::success(serde_json::json!({"n": n})))
            }
        }
    }

    #[tokio::test]
    async fn test_retries_retryable_errors() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_times: 2,
            error: ToolError::Timeout { tool: "t".into() },
        });
        let client = RetryingToolClient::new(flaky.clone(), RecoveryEngine::new(3, 1));
        let resp = client.execute("t", Value::Null, "trace").await.unwrap();
        assert!(resp.ok);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_times: 10,
            error: ToolError::Status {
                tool: "t".into(),
                status: 502,
            },
        });
        let client = RetryingToolClient::new(flaky.clone(), RecoveryEngine::new(3, 1));
        assert!(client.execute("t", Value::Null, "trace").await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_client_errors() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_times: 10,
            error: ToolError::Status {
                tool: "t".into(),
                status: 404,
            },
        });
        let client = RetryingToolClient::new(flaky.clone(), RecoveryEngine::new(3, 1));
        assert!(client.execute("t", Value::Null, "trace").await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tool_response_cache_markers_roundtrip() {
        let resp = ToolResponse::success(serde_json::json!({"x": 1}));
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("_cached").is_none());

        let parsed: ToolResponse = serde_json::from_value(serde_json::json!({
            "ok": true, "data": {"x": 1}, "_cached": true, "_cachedAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(parsed.cached);
        assert!(parsed.cached_at.is_some());
    }
}
