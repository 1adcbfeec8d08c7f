//! Agent 注册表：注册、按能力索引、选择、执行与委托
//!
//! 选择规则：所有 can_handle 为真的 Agent 按优先级降序稳定排序，同优先级保持注册顺序。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use futures_util::{stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};

use super::base::{error_response, Agent};
use super::types::{
    AgentResponse, AgentTask, Capability, ChunkStream, ResponseError, ResponseMetadata,
    ResponseStatus, StreamChunk,
};
use crate::core::OrchestratorError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_agents: usize,
    pub agents_by_capability: BTreeMap<Capability, Vec<String>>,
}

#[derive(Default)]
pub struct AgentRegistry {
    /// 注册顺序
    agents: Vec<Arc<dyn Agent>>,
    by_name: HashMap<String, usize>,
    by_capability: BTreeMap<Capability, Vec<usize>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Result<(), OrchestratorError> {
        let name = agent.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(OrchestratorError::DuplicateAgent(name));
        }
        let index = self.agents.len();
        for capability in agent.capabilities() {
            self.by_capability.entry(*capability).or_default().push(index);
        }
        tracing::info!(
            agent = %name,
            priority = agent.priority(),
            capabilities = ?agent.capabilities(),
            "agent registered"
        );
        self.by_name.insert(name, index);
        self.agents.push(agent);
        Ok(())
    }

    pub fn get_agent(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agent_ref(name).cloned()
    }

    /// 借用注册表内的 Agent，返回的流可与注册表同寿命
    pub fn agent_ref(&self, name: &str) -> Option<&Arc<dyn Agent>> {
        self.by_name.get(name).map(|&i| &self.agents[i])
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name().to_string()).collect()
    }

    /// 具备该能力的 Agent，按优先级降序
    pub fn agents_for_capability(&self, capability: Capability) -> Vec<Arc<dyn Agent>> {
        let mut found: Vec<Arc<dyn Agent>> = self
            .by_capability
            .get(&capability)
            .map(|ids| ids.iter().map(|&i| self.agents[i].clone()).collect())
            .unwrap_or_default();
        found.sort_by_key(|a| std::cmp::Reverse(a.priority()));
        found
    }

    pub fn find_agent(&self, task: &AgentTask) -> Option<Arc<dyn Agent>> {
        self.select(task).cloned()
    }

    fn select(&self, task: &AgentTask) -> Option<&Arc<dyn Agent>> {
        let mut candidates: Vec<&Arc<dyn Agent>> =
            self.agents.iter().filter(|a| a.can_handle(task)).collect();
        candidates.sort_by_key(|a| std::cmp::Reverse(a.priority()));
        match candidates.first() {
            Some(agent) => {
                tracing::debug!(
                    task_id = %task.id,
                    agent = agent.name(),
                    candidates = candidates.len(),
                    "agent selected"
                );
                Some(*agent)
            }
            None => {
                tracing::warn!(task_id = %task.id, task_type = %task.task_type, "no agent found for task");
                None
            }
        }
    }

    /// 端到端执行；找不到 Agent 或 Agent 流未以终止块结束时补一个 error 块
    pub fn execute_task<'a>(&'a self, task: AgentTask) -> ChunkStream<'a> {
        let Some(agent) = self.select(&task) else {
            return error_response(format!(
                "No agent available to handle task type: {}",
                task.task_type
            ));
        };

        tracing::info!(task_id = %task.id, agent = agent.name(), intent = %task.intent, "executing task");
        let guard = TerminalGuard {
            agent: agent.name().to_string(),
            task_id: task.id.clone(),
            start: Instant::now(),
        };
        guard.wrap(agent.execute(task, self))
    }

    /// 委托执行：完整消费目标 Agent 的流并聚合；任何失败都以 failure 状态返回
    pub async fn delegate_task(&self, task: AgentTask, target: Option<&str>) -> AgentResponse {
        let start = Instant::now();
        let resolved = match target {
            Some(name) => match self.get_agent(name) {
                None => Err(OrchestratorError::AgentNotFound(name.to_string())),
                Some(agent) if !agent.can_handle(&task) => {
                    Err(OrchestratorError::UnsupportedIntent(task.task_type.clone()))
                }
                Some(agent) => Ok(agent),
            },
            None => self
                .find_agent(&task)
                .ok_or_else(|| OrchestratorError::AgentNotFound(task.task_type.clone())),
        };

        let agent = match resolved {
            Ok(agent) => agent,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "delegation failed");
                return failure(&task.id, target.unwrap_or("unknown"), &e.to_string(), start);
            }
        };

        let chunks: Vec<StreamChunk> = agent.execute(task.clone(), self).collect().await;
        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(task_id = %task.id, agent = agent.name(), duration_ms, "delegation completed");

        if let Some(StreamChunk::Error { error }) = chunks.iter().find(|c| matches!(c, StreamChunk::Error { .. })) {
            let mut response = failure(&task.id, agent.name(), error, start);
            response.data = aggregate_chunks(&chunks);
            return response;
        }

        AgentResponse {
            task_id: task.id,
            agent_name: agent.name().to_string(),
            status: ResponseStatus::Success,
            data: aggregate_chunks(&chunks),
            error: None,
            metadata: ResponseMetadata {
                duration_ms,
                tools_called: tools_called(&chunks),
                confidence: 1.0,
            },
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_agents: self.agents.len(),
            agents_by_capability: self
                .by_capability
                .iter()
                .map(|(cap, ids)| {
                    (
                        *cap,
                        ids.iter().map(|&i| self.agents[i].name().to_string()).collect(),
                    )
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

fn failure(task_id: &str, agent: &str, message: &str, start: Instant) -> AgentResponse {
    AgentResponse {
        task_id: task_id.to_string(),
        agent_name: agent.to_string(),
        status: ResponseStatus::Failure,
        data: None,
        error: Some(ResponseError {
            code: "INTERNAL_ERROR".to_string(),
            message: message.to_string(),
        }),
        metadata: ResponseMetadata {
            duration_ms: start.elapsed().as_millis() as u64,
            tools_called: Vec::new(),
            confidence: 0.0,
        },
    }
}

/// 拼接 token；有 tool_call 时返回 {content, toolCalls}；只有结构化块时返回这些块
fn aggregate_chunks(chunks: &[StreamChunk]) -> Option<Value> {
    let content: String = chunks
        .iter()
        .filter_map(|c| match c {
            StreamChunk::Token { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    let tool_calls: Vec<Value> = chunks
        .iter()
        .filter_map(|c| match c {
            StreamChunk::ToolCall { name, arguments } => {
                Some(json!({"name": name, "arguments": arguments}))
            }
            _ => None,
        })
        .collect();

    if !tool_calls.is_empty() {
        return Some(json!({"content": content, "toolCalls": tool_calls}));
    }
    if !content.is_empty() {
        return Some(Value::String(content));
    }
    let structured: Vec<Value> = chunks
        .iter()
        .filter(|c| !c.is_terminal())
        .filter_map(|c| serde_json::to_value(c).ok())
        .collect();
    (!structured.is_empty()).then_some(Value::Array(structured))
}

fn tools_called(chunks: &[StreamChunk]) -> Vec<String> {
    chunks
        .iter()
        .filter_map(|c| match c {
            StreamChunk::ToolCall { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

/// 终止块守卫：转发到第一个终止块为止，流提前结束时补 error 块，并记录耗时
struct TerminalGuard {
    agent: String,
    task_id: String,
    start: Instant,
}

impl TerminalGuard {
    fn wrap<'a>(self, inner: ChunkStream<'a>) -> ChunkStream<'a> {
        Box::pin(stream::unfold(Some((inner, self)), |state| async move {
            let (mut inner, guard) = state?;
            match inner.next().await {
                Some(chunk) if chunk.is_terminal() => {
                    let duration_ms = guard.start.elapsed().as_millis() as u64;
                    if matches!(chunk, StreamChunk::Done) {
                        tracing::info!(task_id = %guard.task_id, agent = %guard.agent, duration_ms, "task completed");
                    } else {
                        tracing::error!(task_id = %guard.task_id, agent = %guard.agent, duration_ms, "task failed");
                    }
                    Some((chunk, None))
                }
                Some(chunk) => Some((chunk, Some((inner, guard)))),
                None => {
                    tracing::warn!(task_id = %guard.task_id, agent = %guard.agent, "agent stream ended without terminal chunk");
                    Some((
                        StreamChunk::error(format!(
                            "Agent {} ended without completing the task",
                            guard.agent
                        )),
                        None,
                    ))
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::base::text_response;
    use crate::agents::TaskContext;
    use crate::intent::Intent;

    struct Scripted {
        name: &'static str,
        priority: i32,
        capabilities: &'static [Capability],
        chunks: Vec<StreamChunk>,
    }

    impl Scripted {
        fn new(name: &'static str, priority: i32, chunks: Vec<StreamChunk>) -> Arc<Self> {
            Arc::new(Self {
                name,
                priority,
                capabilities: &[Capability::Search, Capability::Compare],
                chunks,
            })
        }
    }

    impl Agent for Scripted {
        fn name(&self) -> &str {
            self.name
        }
        fn capabilities(&self) -> &[Capability] {
            self.capabilities
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn can_handle(&self, task: &AgentTask) -> bool {
            task.task_type != "NOBODY"
        }
        fn execute<'a>(&'a self, _: AgentTask, _: &'a AgentRegistry) -> ChunkStream<'a> {
            if self.chunks.is_empty() {
                return text_response(self.name);
            }
            Box::pin(stream::iter(self.chunks.clone()))
        }
    }

    fn task(task_type: &str) -> AgentTask {
        AgentTask::new(task_type, Intent::ProductSearch, TaskContext::new("s", "u")).with_id("t1")
    }

    #[test]
    fn test_highest_priority_wins_and_ties_keep_registration_order() {
        let mut registry = AgentRegistry::new();
        registry.register(Scripted::new("Low", 10, vec![])).unwrap();
        registry.register(Scripted::new("HighA", 50, vec![])).unwrap();
        registry.register(Scripted::new("HighB", 50, vec![])).unwrap();

        let selected = registry.find_agent(&task("ANY")).unwrap();
        assert_eq!(selected.name(), "HighA");

        let by_cap: Vec<String> = registry
            .agents_for_capability(Capability::Search)
            .iter()
            .map(|a| a.name().to_string())
            .collect();
        assert_eq!(by_cap, vec!["HighA", "HighB", "Low"]);
        assert!(registry.find_agent(&task("NOBODY")).is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = AgentRegistry::new();
        registry.register(Scripted::new("A", 1, vec![])).unwrap();
        let err = registry.register(Scripted::new("A", 2, vec![])).unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateAgent(name) if name == "A"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_without_candidate_yields_error() {
        let registry = AgentRegistry::new();
        let chunks: Vec<StreamChunk> = registry.execute_task(task("NOBODY")).collect().await;
        assert_eq!(
            chunks,
            vec![StreamChunk::error("No agent available to handle task type: NOBODY")]
        );
    }

    #[tokio::test]
    async fn test_execute_stops_at_first_terminal_chunk() {
        let mut registry = AgentRegistry::new();
        registry
            .register(Scripted::new(
                "A",
                1,
                vec![StreamChunk::token("hi"), StreamChunk::Done, StreamChunk::token("late")],
            ))
            .unwrap();
        let chunks: Vec<StreamChunk> = registry.execute_task(task("ANY")).collect().await;
        assert_eq!(chunks, vec![StreamChunk::token("hi"), StreamChunk::Done]);
    }

    #[tokio::test]
    async fn test_execute_appends_error_when_stream_ends_early() {
        let mut registry = AgentRegistry::new();
        registry
            .register(Scripted::new("Quiet", 1, vec![StreamChunk::token("partial")]))
            .unwrap();
        let chunks: Vec<StreamChunk> = registry.execute_task(task("ANY")).collect().await;
        assert_eq!(
            chunks.last(),
            Some(&StreamChunk::error("Agent Quiet ended without completing the task"))
        );
    }

    #[tokio::test]
    async fn test_delegate_to_unknown_agent_fails() {
        let registry = AgentRegistry::new();
        let response = registry.delegate_task(task("ANY"), Some("Ghost")).await;
        assert_eq!(response.status, ResponseStatus::Failure);
        assert_eq!(response.agent_name, "Ghost");
        assert_eq!(response.metadata.confidence, 0.0);
        let error = response.error.unwrap();
        assert_eq!(error.code, "INTERNAL_ERROR");
        assert!(error.message.contains("Ghost"));
    }

    #[tokio::test]
    async fn test_delegate_aggregates_tokens_and_tool_calls() {
        let mut registry = AgentRegistry::new();
        registry
            .register(Scripted::new(
                "Tooling",
                1,
                vec![
                    StreamChunk::token("Found "),
                    StreamChunk::ToolCall {
                        name: "search_products".into(),
                        arguments: json!({"query": "tv"}),
                    },
                    StreamChunk::token("3"),
                    StreamChunk::Done,
                ],
            ))
            .unwrap();

        let response = registry.delegate_task(task("ANY"), None).await;
        assert!(response.is_success());
        assert_eq!(response.metadata.tools_called, vec!["search_products"]);
        assert_eq!(response.data.unwrap()["content"], "Found 3");
    }

    #[tokio::test]
    async fn test_delegate_maps_error_chunk_to_failure() {
        let mut registry = AgentRegistry::new();
        registry
            .register(Scripted::new("Broken", 1, vec![StreamChunk::error("boom")]))
            .unwrap();
        let response = registry.delegate_task(task("ANY"), Some("Broken")).await;
        assert_eq!(response.status, ResponseStatus::Failure);
        assert_eq!(response.error.unwrap().message, "boom");
    }

    #[test]
    fn test_stats_group_by_capability() {
        let mut registry = AgentRegistry::new();
        registry.register(Scripted::new("A", 1, vec![])).unwrap();
        registry.register(Scripted::new("B", 2, vec![])).unwrap();
        let stats = registry.stats();
        assert_eq!(stats.total_agents, 2);
        assert_eq!(stats.agents_by_capability[&Capability::Search], vec!["A", "B"]);
        assert!(!stats.agents_by_capability.contains_key(&Capability::Cart));
    }
}
