//! Agent 数据模型：能力、任务、流式块、聚合响应

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::OrchestratorError;
use crate::intent::Intent;
use crate::tools::ProductSummary;

/// Agent 能力域（按能力建索引与路由）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    Search,
    Compare,
    Cart,
    Checkout,
    Support,
    Reasoning,
    Analytics,
    GeneralChat,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Search,
        Capability::Compare,
        Capability::Cart,
        Capability::Checkout,
        Capability::Support,
        Capability::Reasoning,
        Capability::Analytics,
        Capability::GeneralChat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Search => "SEARCH",
            Capability::Compare => "COMPARE",
            Capability::Cart => "CART",
            Capability::Checkout => "CHECKOUT",
            Capability::Support => "SUPPORT",
            Capability::Reasoning => "REASONING",
            Capability::Analytics => "ANALYTICS",
            Capability::GeneralChat => "GENERAL_CHAT",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CartAction {
    Added,
    QuantityUpdated,
    Removed,
    Viewed,
}

/// 流式响应块；`done` 与 `error` 为终止块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Token {
        content: String,
    },
    ToolCall {
        name: String,
        arguments: Value,
    },
    Cards {
        products: Vec<ProductSummary>,
    },
    Comparison {
        data: Value,
    },
    CartUpdated {
        action: CartAction,
        cart: Value,
        message: String,
    },
    OrderCreated {
        order: Value,
    },
    Followups {
        suggestions: Vec<String>,
    },
    Clarification {
        question: String,
        options: Vec<String>,
        intent: Intent,
    },
    Error {
        error: String,
    },
    Done,
}

impl StreamChunk {
    pub fn token(content: impl Into<String>) -> Self {
        StreamChunk::Token {
            content: content.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        StreamChunk::Error {
            error: error.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Done | StreamChunk::Error { .. })
    }
}

/// 惰性块流：消费者停止拉取即放弃后续工作
pub type ChunkStream<'a> = Pin<Box<dyn Stream<Item = StreamChunk> + Send + 'a>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub session_id: String,
    pub user_id: String,
}

impl TaskContext {
    pub fn new(session_id: &str, user_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    #[serde(default)]
    pub call_chain: Vec<String>,
    #[serde(default)]
    pub depth: usize,
    #[serde(default)]
    pub trace_id: String,
}

/// 分派给 Agent 的任务；委托时只更新 metadata（callChain / depth）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub intent: Intent,
    pub context: TaskContext,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

impl AgentTask {
    pub fn new(task_type: &str, intent: Intent, context: TaskContext) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: task_type.to_string(),
            intent,
            context,
            parameters: Map::new(),
            priority: 1,
            parent_task_id: None,
            dependencies: Vec::new(),
            metadata: TaskMetadata::default(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_trace_id(mut self, trace_id: &str) -> Self {
        self.metadata.trace_id = trace_id.to_string();
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// 用户原话：依次取 message / query / userMessage
    pub fn user_message(&self) -> Option<&str> {
        ["message", "query", "userMessage"]
            .iter()
            .find_map(|k| self.param_str(k))
            .filter(|s| !s.trim().is_empty())
    }

    pub fn trace_id(&self) -> &str {
        &self.metadata.trace_id
    }

    /// 缺少必填参数时报 InvalidParameters
    pub fn validate_parameters(&self, required: &[&str]) -> Result<(), OrchestratorError> {
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|p| !self.parameters.contains_key(*p))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidParameters(format!(
                "Missing required parameters for {}: {}",
                self.task_type,
                missing.join(", ")
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Failure,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub duration_ms: u64,
    pub tools_called: Vec<String>,
    pub confidence: f64,
}

/// 委托任务的聚合结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub task_id: String,
    pub agent_name: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    pub metadata: ResponseMetadata,
}

impl AgentResponse {
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// Agent 在共享上下文中的状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Working,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    pub status: AgentStatus,
    #[serde(default)]
    pub working_memory: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl AgentState {
    pub fn new(agent_name: &str) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            current_task: None,
            status: AgentStatus::Idle,
            working_memory: HashMap::new(),
            started_at: None,
            completed_at: None,
        }
    }
}
