//! 记忆层：对话消息与按会话的轮次存储

pub mod conversation;

pub use conversation::{
    ConversationMemory, ConversationStore, InMemoryConversationStore, Message, Role,
};
