//! Agent 基础契约
//!
//! 每个 Agent 声明名字、能力集、优先级与允许委托的目标（封闭列表），并实现 can_handle / execute。
//! execute 返回惰性块流，必须以 done 或 error 结束。
//!
//! 委托守卫按顺序拒绝：目标不在允许列表 → 自身在调用链中出现次数达到上限 → 目标已在调用链中（环）
//! → 深度超限；通过后克隆任务，调用链追加自身、深度 +1。

use std::sync::Arc;

use futures_util::stream;

use super::registry::AgentRegistry;
use super::shared_context::{AgentStatePatch, SharedContextStore};
use super::types::{AgentResponse, AgentTask, Capability, ChunkStream, StreamChunk};
use crate::core::OrchestratorError;

pub const DEFAULT_MAX_DELEGATIONS: usize = 3;
pub const DEFAULT_MAX_TASK_DEPTH: usize = 5;

pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    /// 路由优先级，越大越优先
    fn priority(&self) -> i32;

    fn allowed_delegations(&self) -> &[&'static str] {
        &[]
    }

    fn max_delegations(&self) -> usize {
        DEFAULT_MAX_DELEGATIONS
    }

    fn max_task_depth(&self) -> usize {
        DEFAULT_MAX_TASK_DEPTH
    }

    fn can_handle(&self, task: &AgentTask) -> bool;

    fn execute<'a>(&'a self, task: AgentTask, registry: &'a AgentRegistry) -> ChunkStream<'a>;

    /// 委托守卫；通过时返回更新了调用链与深度的任务副本
    fn prepare_delegation(
        &self,
        target: &str,
        task: &AgentTask,
    ) -> Result<AgentTask, OrchestratorError> {
        if !self.allowed_delegations().iter().any(|a| *a == target) {
            return Err(OrchestratorError::DelegationNotAllowed {
                from: self.name().to_string(),
                to: target.to_string(),
            });
        }

        let chain = &task.metadata.call_chain;
        let own = chain.iter().filter(|a| a.as_str() == self.name()).count();
        if own >= self.max_delegations() {
            return Err(OrchestratorError::DelegationLimitExceeded {
                agent: self.name().to_string(),
                max: self.max_delegations(),
            });
        }

        if chain.iter().any(|a| a == target) {
            return Err(OrchestratorError::CircularDelegation {
                chain: chain.join(" → "),
                target: target.to_string(),
            });
        }

        let depth = task.metadata.depth + 1;
        if depth > self.max_task_depth() {
            return Err(OrchestratorError::MaxDepthExceeded {
                max: self.max_task_depth(),
                chain: chain.join(" → "),
            });
        }

        let mut delegated = task.clone();
        delegated.parent_task_id = Some(task.id.clone());
        delegated.metadata.call_chain.push(self.name().to_string());
        delegated.metadata.depth = depth;
        Ok(delegated)
    }
}

/// 经守卫后通过注册表委托，返回聚合结果
pub async fn delegate_to_agent(
    from: &dyn Agent,
    target: &str,
    task: &AgentTask,
    registry: &AgentRegistry,
) -> Result<AgentResponse, OrchestratorError> {
    let delegated = from.prepare_delegation(target, task)?;
    tracing::debug!(
        from = from.name(),
        to = target,
        task_id = %delegated.id,
        depth = delegated.metadata.depth,
        "delegating task"
    );
    Ok(registry.delegate_task(delegated, Some(target)).await)
}

/// 文本回复 + done
pub fn text_response<'a>(text: impl Into<String>) -> ChunkStream<'a> {
    Box::pin(stream::iter(vec![StreamChunk::token(text), StreamChunk::Done]))
}

/// 单个 error 块
pub fn error_response<'a>(error: impl Into<String>) -> ChunkStream<'a> {
    Box::pin(stream::iter(vec![StreamChunk::error(error)]))
}

/// 尽力记录 Agent 状态；失败（含锁竞争）只记日志
pub async fn record_agent_state(
    context: &Option<Arc<SharedContextStore>>,
    task: &AgentTask,
    agent: &str,
    patch: AgentStatePatch,
) {
    let Some(store) = context else { return };
    if let Err(e) = store
        .update_agent_state(&task.context.session_id, agent, patch)
        .await
    {
        tracing::warn!(agent, task_id = %task.id, error = %e, "failed to record agent state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::TaskContext;
    use crate::intent::Intent;

    struct Named {
        name: &'static str,
        allowed: &'static [&'static str],
    }

    impl Agent for Named {
        fn name(&self) -> &str {
            self.name
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::Reasoning]
        }
        fn priority(&self) -> i32 {
            10
        }
        fn allowed_delegations(&self) -> &[&'static str] {
            self.allowed
        }
        fn can_handle(&self, _: &AgentTask) -> bool {
            true
        }
        fn execute<'a>(&'a self, _: AgentTask, _: &'a AgentRegistry) -> ChunkStream<'a> {
            text_response(self.name)
        }
    }

    fn task_with_chain(chain: &[&str]) -> AgentTask {
        let mut task = AgentTask::new("T", Intent::GeneralChat, TaskContext::default()).with_id("t");
        task.metadata.call_chain = chain.iter().map(|s| s.to_string()).collect();
        task.metadata.depth = chain.len();
        task
    }

    const A: Named = Named {
        name: "A",
        allowed: &["B", "C"],
    };

    #[test]
    fn test_not_allowed_target() {
        let err = A.prepare_delegation("Z", &task_with_chain(&[])).unwrap_err();
        assert!(matches!(err, OrchestratorError::DelegationNotAllowed { .. }));
    }

    #[test]
    fn test_cycle_through_chain() {
        let err = A
            .prepare_delegation("B", &task_with_chain(&["B", "C"]))
            .unwrap_err();
        match err {
            OrchestratorError::CircularDelegation { chain, target } => {
                assert_eq!(chain, "B → C");
                assert_eq!(target, "B");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_delegation_limit_checked_before_cycle() {
        let err = A
            .prepare_delegation("B", &task_with_chain(&["A", "B", "A", "A"]))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DelegationLimitExceeded { max: 3, .. }));
    }

    #[test]
    fn test_returning_to_agent_already_in_chain() {
        let b = Named {
            name: "B",
            allowed: &["A"],
        };
        let err = b
            .prepare_delegation("A", &task_with_chain(&["A", "B", "A"]))
            .unwrap_err();
        match err {
            OrchestratorError::CircularDelegation { chain, target } => {
                assert_eq!(chain, "A → B → A");
                assert_eq!(target, "A");
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut deep = task_with_chain(&["A", "B", "A"]);
        deep.metadata.depth = 5;
        let err = b.prepare_delegation("A", &deep).unwrap_err();
        assert!(matches!(err, OrchestratorError::CircularDelegation { .. }));
    }

    #[test]
    fn test_depth_limit() {
        let mut task = task_with_chain(&["X"]);
        task.metadata.depth = 5;
        let err = A.prepare_delegation("B", &task).unwrap_err();
        assert!(matches!(err, OrchestratorError::MaxDepthExceeded { max: 5, .. }));
    }

    #[test]
    fn test_successful_delegation_updates_metadata() {
        let task = task_with_chain(&["Leader"]);
        let delegated = A.prepare_delegation("C", &task).unwrap();
        assert_eq!(delegated.metadata.call_chain, vec!["Leader", "A"]);
        assert_eq!(delegated.metadata.depth, 2);
        assert_eq!(delegated.parent_task_id.as_deref(), Some("t"));
        assert_eq!(delegated.id, task.id);
    }
}
