//! 编排错误类型
//!
//! 注册表 / 委派 / 任务图 / 共享上下文 / 熔断 / 工具 / LLM 的统一错误分类。
//! 每个变体都有稳定的机器码（`code()`），用于 `AgentResponse.error.code` 与日志。

use thiserror::Error;

use crate::kv::KvError;
use crate::llm::LlmError;
use crate::tools::ToolError;

/// 编排核心可能出现的错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent {0} is already registered")]
    DuplicateAgent(String),

    #[error("Agent {from} is not allowed to delegate to {to}")]
    DelegationNotAllowed { from: String, to: String },

    #[error("Agent {agent} exceeded max delegations ({max})")]
    DelegationLimitExceeded { agent: String, max: usize },

    #[error("Circular delegation detected: {chain} → {target}")]
    CircularDelegation { chain: String, target: String },

    #[error("Max task depth ({max}) exceeded. Call chain: {chain}")]
    MaxDepthExceeded { max: usize, chain: String },

    #[error("Circular dependency detected: {path}")]
    CircularDependency { path: String },

    #[error("Task {task} depends on non-existent task {dependency}")]
    MissingDependency { task: String, dependency: String },

    #[error("Failed to acquire lock for context update: {0}")]
    LockContention(String),

    #[error("Context not found for session {0}")]
    ContextNotFound(String),

    #[error("Service {0} is temporarily unavailable (circuit open)")]
    ServiceUnavailable(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(#[from] ToolError),

    #[error("LLM request timed out after {0}s")]
    LlmTimeout(u64),

    #[error("LLM error: {0}")]
    Llm(LlmError),

    /// 流式 tool_call 的参数 JSON 无法解析
    #[error("Invalid tool arguments for {tool}: {message}")]
    InvalidToolArguments { tool: String, message: String },

    #[error("Unsupported intent: {0}")]
    UnsupportedIntent(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Kv(#[from] KvError),
}

impl From<LlmError> for OrchestratorError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout(secs) => OrchestratorError::LlmTimeout(secs),
            other => OrchestratorError::Llm(other),
        }
    }
}

impl OrchestratorError {
    /// 稳定的错误码
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::AgentNotFound(_) => "AGENT_NOT_FOUND",
            OrchestratorError::DuplicateAgent(_) => "DUPLICATE_AGENT",
            OrchestratorError::DelegationNotAllowed { .. } => "DELEGATION_NOT_ALLOWED",
            OrchestratorError::DelegationLimitExceeded { .. } => "DELEGATION_LIMIT_EXCEEDED",
            OrchestratorError::CircularDelegation { .. } => "CIRCULAR_DELEGATION",
            OrchestratorError::MaxDepthExceeded { .. } => "MAX_DEPTH_EXCEEDED",
            OrchestratorError::CircularDependency { .. } => "CIRCULAR_DEPENDENCY",
            OrchestratorError::MissingDependency { .. } => "MISSING_DEPENDENCY",
            OrchestratorError::LockContention(_) => "LOCK_CONTENTION",
            OrchestratorError::ContextNotFound(_) => "CONTEXT_NOT_FOUND",
            OrchestratorError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            OrchestratorError::ToolExecutionFailed(_) => "TOOL_EXECUTION_FAILED",
            OrchestratorError::LlmTimeout(_) => "LLM_TIMEOUT",
            OrchestratorError::Llm(_) => "LLM_ERROR",
            OrchestratorError::InvalidToolArguments { .. } => "INVALID_TOOL_ARGUMENTS",
            OrchestratorError::UnsupportedIntent(_) => "UNSUPPORTED_INTENT",
            OrchestratorError::InvalidParameters(_) => "INVALID_PARAMETERS",
            OrchestratorError::Config(_) => "CONFIG_ERROR",
            OrchestratorError::Kv(_) => "KV_ERROR",
        }
    }

    /// 是否允许自动恢复（重试或降级）；其余错误对当前任务是终态
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::ServiceUnavailable(_) | OrchestratorError::LlmTimeout(_) => true,
            OrchestratorError::ToolExecutionFailed(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// 转成可以直接展示给用户的错误文本；仅在 debug 模式下附带内部细节
pub fn sanitize_error(err: &dyn std::fmt::Display, debug: bool, trace_id: &str) -> String {
    let base = format!(
        "Something went wrong while processing your request (trace: {})",
        trace_id
    );
    if debug {
        format!("{base}: {err}")
    } else {
        base
    }
}
