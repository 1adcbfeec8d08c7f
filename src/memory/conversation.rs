//! 对话历史
//!
//! 每个会话保留最近 N 轮对话（user/assistant 对），超出时自动剪枝；协调器用它持久化每轮输入输出。

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::OrchestratorError;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 最近 N 轮对话（每轮含 user + assistant，故实际保留约 max_turns*2 条消息）
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.prune();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    fn prune(&mut self) {
        let keep = self.max_turns * 2;
        if self.messages.len() > keep {
            self.messages.drain(..self.messages.len() - keep);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// 会话轮次存储
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn save_message(&self, session_id: &str, message: Message)
        -> Result<(), OrchestratorError>;

    async fn history(&self, session_id: &str) -> Result<Vec<Message>, OrchestratorError>;
}

pub struct InMemoryConversationStore {
    sessions: RwLock<HashMap<String, ConversationMemory>>,
    max_turns: usize,
}

impl InMemoryConversationStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_turns,
        }
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new(20)
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn save_message(
        &self,
        session_id: &str,
        message: Message,
    ) -> Result<(), OrchestratorError> {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| ConversationMemory::new(self.max_turns))
            .push(message);
        Ok(())
    }

    async fn history(&self, session_id: &str) -> Result<Vec<Message>, OrchestratorError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|m| m.messages().to_vec())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_prunes_oldest() {
        let mut memory = ConversationMemory::new(1);
        memory.push(Message::user("a"));
        memory.push(Message::assistant("b"));
        memory.push(Message::user("c"));
        assert_eq!(memory.len(), 2);
        assert_eq!(memory.messages()[0].content, "b");
    }

    #[tokio::test]
    async fn test_store_keeps_sessions_apart() {
        let store = InMemoryConversationStore::new(5);
        store.save_message("s1", Message::user("hi")).await.unwrap();
        store.save_message("s2", Message::user("yo")).await.unwrap();
        store
            .save_message("s1", Message::assistant("hello"))
            .await
            .unwrap();

        let h1 = store.history("s1").await.unwrap();
        assert_eq!(h1, vec![Message::user("hi"), Message::assistant("hello")]);
        assert_eq!(store.history("s2").await.unwrap().len(), 1);
        assert!(store.history("nope").await.unwrap().is_empty());
    }

    #[test]
    fn test_role_wire_name() {
        assert_eq!(
            serde_json::to_value(Message::system("x")).unwrap()["role"],
            "system"
        );
    }
}
