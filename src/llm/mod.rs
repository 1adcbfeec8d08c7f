//! LLM 层：提供方抽象、主备路由、Mock / OpenAI 兼容实现、结构化抽取

pub mod extraction;
pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use extraction::{
    AgentRoutingResult, Budget, CartActionKind, ExtractedCartAction, ExtractedSearchFilters,
    LlmExtraction,
};
pub use mock::MockLlmProvider;
pub use openai::{OpenAiProvider, TokenUsage};
pub use router::LlmRouter;
pub use traits::{LlmError, LlmProvider, ToolSpec};
