//! Mock LLM 提供方（用于测试，无需 API）
//!
//! 按顺序回放预设回复；回复用完后回显最后一条 User 消息。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::Value;

use super::{LlmError, LlmProvider, ToolSpec};
use crate::agents::{ChunkStream, StreamChunk};
use crate::memory::{Message, Role};

#[derive(Debug, Clone)]
enum MockReply {
    Text(String),
    ToolCall { name: String, arguments: Value },
    Failure(String),
    Hang,
}

#[derive(Debug)]
pub struct MockLlmProvider {
    name: String,
    available: bool,
    replies: Mutex<VecDeque<MockReply>>,
    calls: AtomicUsize,
}

impl MockLlmProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            available: true,
            replies: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_reply(self, text: impl Into<String>) -> Self {
        self.push(MockReply::Text(text.into()))
    }

    pub fn with_tool_call(self, name: &str, arguments: Value) -> Self {
        self.push(MockReply::ToolCall {
            name: name.to_string(),
            arguments,
        })
    }

    pub fn with_failure(self, message: &str) -> Self {
        self.push(MockReply::Failure(message.to_string()))
    }

    /// 下一次调用永不返回（用于超时测试）
    pub fn with_hang(self) -> Self {
        self.push(MockReply::Hang)
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(self, reply: MockReply) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
        self
    }

    fn next_reply(&self) -> Option<MockReply> {
        self.replies.lock().ok().and_then(|mut r| r.pop_front())
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new("mock")
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn generate(
        &self,
        messages: &[Message],
        _tools: &[ToolSpec],
    ) -> Result<ChunkStream<'static>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let chunks = match self.next_reply() {
            Some(MockReply::Text(text)) => vec![StreamChunk::token(text), StreamChunk::Done],
            Some(MockReply::ToolCall { name, arguments }) => {
                vec![StreamChunk::ToolCall { name, arguments }, StreamChunk::Done]
            }
            Some(MockReply::Failure(message)) => return Err(LlmError::Api(message)),
            Some(MockReply::Hang) => std::future::pending().await,
            None => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                vec![
                    StreamChunk::token(format!("Echo from Mock: {last_user}")),
                    StreamChunk::Done,
                ]
            }
        };
        Ok(Box::pin(stream::iter(chunks)))
    }
}
