//! 多 Agent 编排
//!
//! - **types**：任务、流式块、聚合响应、Agent 状态
//! - **base**：Agent 契约与委托守卫
//! - **registry**：注册、按能力索引、选择、执行与委托
//! - **shared_context**：会话级共享状态（乐观锁）
//! - **task_queue**：任务依赖解析
//! - **leader / product_browsing / shopping**：具体 Agent

pub mod base;
pub mod leader;
pub mod product_browsing;
pub mod registry;
pub mod shared_context;
pub mod shopping;
pub mod task_queue;
pub mod types;

pub use base::{delegate_to_agent, Agent, DEFAULT_MAX_DELEGATIONS, DEFAULT_MAX_TASK_DEPTH};
pub use leader::{target_for_intent, LeaderAgent, LEADER_AGENT};
pub use product_browsing::{ProductBrowsingAgent, PRODUCT_BROWSING_AGENT};
pub use registry::{AgentRegistry, RegistryStats};
pub use shared_context::{AgentStatePatch, ContextPatch, SharedContext, SharedContextStore};
pub use shopping::{ShoppingAgent, SHOPPING_AGENT, VIEW_CART};
pub use task_queue::{ExecutionPlan, TaskStats};
pub use types::{
    AgentResponse, AgentState, AgentStatus, AgentTask, CartAction, Capability, ChunkStream,
    ResponseError, ResponseMetadata, ResponseStatus, StreamChunk, TaskContext, TaskMetadata,
};
