//! Commerce Orchestrator - 多智能体电商编排核心
//!
//! 模块划分：
//! - **agents**: Agent 契约、注册表、委派守卫、共享上下文、任务依赖、Leader / 浏览 / 购物 Agent
//! - **cache**: 工具响应缓存（按工具的 TTL 与可缓存字段）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复策略、编排入口、服务装配
//! - **intent**: 规则意图分类器
//! - **kv**: 键值存储边界与内存实现
//! - **llm**: LLM 提供方抽象、主备路由、Mock / OpenAI 兼容实现、结构化抽取
//! - **memory**: 对话消息与会话轮次存储
//! - **observability**: 日志初始化与工具审计
//! - **resilience**: 熔断器
//! - **tools**: 工具服务边界、HTTP 客户端、provider 目录、网关

pub mod agents;
pub mod cache;
pub mod config;
pub mod core;
pub mod intent;
pub mod kv;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod resilience;
pub mod tools;

pub use crate::core::{Coordinator, OrchestratorError, Services, UserRequest};
