//! LLM 提供方抽象
//!
//! 各后端只需实现一个流式契约：generate(messages, tools) → 块流（token / tool_call / done / error）。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agents::ChunkStream;
use crate::memory::Message;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request timed out after {0}s")]
    Timeout(u64),

    #[error("LLM API error: {0}")]
    Api(String),

    #[error("No LLM providers available")]
    Unavailable,

    #[error("Failed to parse LLM response: {0}")]
    Parse(String),
}

/// 暴露给模型的工具描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// 路由时使用的名字（如 "openai"）
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    /// 建立响应流；连接 / 鉴权失败以 Err 返回，路由器据此切换到下一个提供方
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ChunkStream<'static>, LlmError>;
}
