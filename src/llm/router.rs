//! 多提供方路由：主 → 备 → 任意可用
//!
//! 每次尝试都受 timeout_secs 约束；全部失败时只产出一个 error 块。

use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use tokio::sync::RwLock;

use super::{LlmError, LlmProvider, ToolSpec};
use crate::agents::{ChunkStream, StreamChunk};
use crate::memory::Message;

pub struct LlmRouter {
    providers: Vec<Arc<dyn LlmProvider>>,
    primary: RwLock<String>,
    fallback: String,
    timeout: Duration,
}

impl LlmRouter {
    pub fn new(primary: &str, fallback: &str, timeout_secs: u64) -> Self {
        Self {
            providers: Vec::new(),
            primary: RwLock::new(primary.to_string()),
            fallback: fallback.to_string(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn has_available_provider(&self) -> bool {
        self.providers.iter().any(|p| p.is_available())
    }

    /// 切换主提供方；名字未注册时返回 false
    pub async fn set_primary(&self, name: &str) -> bool {
        if self.providers.iter().any(|p| p.name() == name) {
            *self.primary.write().await = name.to_string();
            true
        } else {
            false
        }
    }

    pub async fn primary(&self) -> String {
        self.primary.read().await.clone()
    }

    async fn candidates(&self) -> Vec<Arc<dyn LlmProvider>> {
        let primary = self.primary.read().await.clone();
        let mut ordered: Vec<Arc<dyn LlmProvider>> = Vec::new();
        for name in [primary.as_str(), self.fallback.as_str()] {
            if let Some(p) = self.providers.iter().find(|p| p.name() == name) {
                if !ordered.iter().any(|o| o.name() == p.name()) {
                    ordered.push(p.clone());
                }
            }
        }
        for p in &self.providers {
            if !ordered.iter().any(|o| o.name() == p.name()) {
                ordered.push(p.clone());
            }
        }
        ordered.retain(|p| p.is_available());
        ordered
    }

    async fn open_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ChunkStream<'static>, LlmError> {
        for provider in self.candidates().await {
            match tokio::time::timeout(self.timeout, provider.generate(messages, tools)).await {
                Ok(Ok(stream)) => {
                    tracing::debug!(provider = provider.name(), "llm provider selected");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    tracing::warn!(provider = provider.name(), error = %e, "llm provider failed");
                }
                Err(_) => {
                    let e = LlmError::Timeout(self.timeout.as_secs());
                    tracing::warn!(provider = provider.name(), error = %e, "llm provider failed");
                }
            }
        }
        Err(LlmError::Unavailable)
    }

    /// 流式生成；没有提供方成功时产出单个 error 块
    pub fn generate_response<'a>(
        &'a self,
        messages: Vec<Message>,
        tools: Vec<ToolSpec>,
    ) -> ChunkStream<'a> {
        let opened = async move {
            match self.open_stream(&messages, &tools).await {
                Ok(stream) => stream,
                Err(e) => {
                    Box::pin(stream::iter(vec![StreamChunk::error(e.to_string())])) as ChunkStream<'static>
                }
            }
        };
        Box::pin(stream::once(opened).flatten())
    }

    /// 收集完整文本；error 块转为 Err，整体受超时约束
    pub async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let mut stream = self.open_stream(messages, &[]).await?;
        let collect = async move {
            let mut out = String::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    StreamChunk::Token { content } => out.push_str(&content),
                    StreamChunk::Error { error } => return Err(LlmError::Api(error)),
                    StreamChunk::Done => break,
                    _ => {}
                }
            }
            Ok(out.trim().to_string())
        };
        tokio::time::timeout(self.timeout, collect)
            .await
            .map_err(|_| LlmError::Timeout(self.timeout.as_secs()))?
    }
}
