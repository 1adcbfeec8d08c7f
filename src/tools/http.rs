//! 工具服务 HTTP 客户端
//!
//! POST `{server_url}/api/v1/tools/execute/{tool}`，请求头带 `X-Trace-Id`；超时与 5xx 标记为可重试。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{ToolBoundary, ToolError, ToolResponse};

pub struct HttpToolClient {
    client: reqwest::Client,
    server_url: String,
}

impl HttpToolClient {
    pub fn new(server_url: &str, timeout_secs: u64) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ToolError::Transport {
                tool: "*".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, tool_name: &str) -> String {
        format!("{}/api/v1/tools/execute/{}", self.server_url, tool_name)
    }
}

fn classify(tool: &str, err: reqwest::Error) -> ToolError {
    if err.is_timeout() {
        ToolError::Timeout {
            tool: tool.to_string(),
        }
    } else if let Some(status) = err.status() {
        ToolError::Status {
            tool: tool.to_string(),
            status: status.as_u16(),
        }
    } else {
        ToolError::Transport {
            tool: tool.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl ToolBoundary for HttpToolClient {
    async fn execute(
        &self,
        tool_name: &str,
        request: Value,
        trace_id: &str,
    ) -> Result<ToolResponse, ToolError> {
        tracing::debug!(trace_id, tool = tool_name, "executing remote tool");

        let response = self
            .client
            .post(self.endpoint(tool_name))
            .header("X-Trace-Id", trace_id)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify(tool_name, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Status {
                tool: tool_name.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .json::<ToolResponse>()
            .await
            .map_err(|e| ToolError::InvalidResponse {
                tool: tool_name.to_string(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_layout() {
        let client = HttpToolClient::new("http://localhost:3001/", 15).unwrap();
        assert_eq!(
            client.endpoint("commerce.searchProducts"),
            "http://localhost:3001/api/v1/tools/execute/commerce.searchProducts"
        );
    }
}
