//! 会话级共享上下文
//!
//! 存于 KV `agent:shared:context:{session}`（TTL 2h，每次写入刷新）。所有写操作都在会话锁内完成
//! 读-改-写：锁为 `{key}:lock`，SETNX + TTL（默认 10s）；拿不到锁时按线性退避重试
//! LOCK_RETRY_ATTEMPTS 次，仍失败则返回 LockContention。无论修改成功与否都会释放锁。
//!
//! taskGraph / agentStates 以 `[[key, value], ...]` 有序键值对列表持久化。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::{AgentState, AgentStatus, AgentTask};
use crate::core::OrchestratorError;
use crate::kv::KvStore;
use crate::memory::Message;

pub const DEFAULT_CONTEXT_TTL_SECS: u64 = 7200;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 10;
pub const LOCK_RETRY_ATTEMPTS: u32 = 3;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(25);

mod pairs {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, V>(map: &BTreeMap<String, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<BTreeMap<String, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de>,
    {
        let pairs: Vec<(String, V)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedContext {
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub conversation_history: Vec<Message>,
    #[serde(default)]
    pub user_context: Value,
    #[serde(default, with = "pairs")]
    pub task_graph: BTreeMap<String, AgentTask>,
    #[serde(default, with = "pairs")]
    pub agent_states: BTreeMap<String, AgentState>,
    #[serde(default)]
    pub shared_memory: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SharedContext {
    fn new(session_id: &str, user_id: &str, user_context: Value) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            conversation_history: Vec::new(),
            user_context,
            task_graph: BTreeMap::new(),
            agent_states: BTreeMap::new(),
            shared_memory: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// update_context 的部分更新；None 字段保持不变
#[derive(Debug, Clone, Default)]
pub struct ContextPatch {
    pub conversation_history: Option<Vec<Message>>,
    pub user_context: Option<Value>,
    pub task_graph: Option<BTreeMap<String, AgentTask>>,
    pub agent_states: Option<BTreeMap<String, AgentState>>,
    pub shared_memory: Option<Map<String, Value>>,
}

impl ContextPatch {
    fn apply(self, ctx: &mut SharedContext) {
        if let Some(history) = self.conversation_history {
            ctx.conversation_history = history;
        }
        if let Some(user_context) = self.user_context {
            ctx.user_context = user_context;
        }
        if let Some(graph) = self.task_graph {
            ctx.task_graph = graph;
        }
        if let Some(states) = self.agent_states {
            ctx.agent_states = states;
        }
        if let Some(memory) = self.shared_memory {
            ctx.shared_memory = memory;
        }
    }
}

/// Agent 状态的部分更新；working_memory 与现有内容合并
#[derive(Debug, Clone, Default)]
pub struct AgentStatePatch {
    pub current_task: Option<String>,
    pub status: Option<AgentStatus>,
    pub working_memory: HashMap<String, Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentStatePatch {
    pub fn working(task_id: &str) -> Self {
        Self {
            current_task: Some(task_id.to_string()),
            status: Some(AgentStatus::Working),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn finished(status: AgentStatus) -> Self {
        Self {
            status: Some(status),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn with_memory(mut self, key: &str, value: Value) -> Self {
        self.working_memory.insert(key.to_string(), value);
        self
    }

    fn apply(self, state: &mut AgentState) {
        if let Some(task) = self.current_task {
            state.current_task = Some(task);
        }
        if let Some(status) = self.status {
            state.status = status;
        }
        state.working_memory.extend(self.working_memory);
        if self.started_at.is_some() {
            state.started_at = self.started_at;
        }
        if self.completed_at.is_some() {
            state.completed_at = self.completed_at;
        }
    }
}

pub struct SharedContextStore {
    kv: Arc<dyn KvStore>,
    context_ttl: Duration,
    lock_ttl: Duration,
}

fn context_key(session_id: &str) -> String {
    format!("agent:shared:context:{session_id}")
}

impl SharedContextStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            context_ttl: Duration::from_secs(DEFAULT_CONTEXT_TTL_SECS),
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
        }
    }

    pub fn with_ttls(mut self, context_ttl_secs: u64, lock_ttl_secs: u64) -> Self {
        self.context_ttl = Duration::from_secs(context_ttl_secs);
        self.lock_ttl = Duration::from_secs(lock_ttl_secs);
        self
    }

    pub async fn get_or_create_context(
        &self,
        session_id: &str,
        user_id: &str,
        user_context: Value,
    ) -> Result<SharedContext, OrchestratorError> {
        if let Some(existing) = self.get_context(session_id).await? {
            return Ok(existing);
        }
        let ctx = SharedContext::new(session_id, user_id, user_context);
        self.save(&ctx).await?;
        tracing::debug!(session_id, "shared context created");
        Ok(ctx)
    }

    pub async fn get_context(
        &self,
        session_id: &str,
    ) -> Result<Option<SharedContext>, OrchestratorError> {
        match self.kv.get(&context_key(session_id)).await? {
            Some(raw) => {
                let ctx = serde_json::from_str(&raw).map_err(crate::kv::KvError::from)?;
                Ok(Some(ctx))
            }
            None => Ok(None),
        }
    }

    pub async fn update_context(
        &self,
        session_id: &str,
        patch: ContextPatch,
    ) -> Result<SharedContext, OrchestratorError> {
        self.mutate(session_id, |ctx| {
            patch.apply(ctx);
            ctx.clone()
        })
        .await
    }

    pub async fn update_agent_state(
        &self,
        session_id: &str,
        agent_name: &str,
        patch: AgentStatePatch,
    ) -> Result<(), OrchestratorError> {
        self.mutate(session_id, |ctx| {
            let state = ctx
                .agent_states
                .entry(agent_name.to_string())
                .or_insert_with(|| AgentState::new(agent_name));
            patch.apply(state);
        })
        .await
    }

    pub async fn get_agent_state(
        &self,
        session_id: &str,
        agent_name: &str,
    ) -> Result<Option<AgentState>, OrchestratorError> {
        Ok(self
            .get_context(session_id)
            .await?
            .and_then(|mut ctx| ctx.agent_states.remove(agent_name)))
    }

    pub async fn add_task(&self, session_id: &str, task: AgentTask) -> Result<(), OrchestratorError> {
        self.mutate(session_id, |ctx| {
            ctx.task_graph.insert(task.id.clone(), task);
        })
        .await
    }

    pub async fn get_task_graph(
        &self,
        session_id: &str,
    ) -> Result<BTreeMap<String, AgentTask>, OrchestratorError> {
        Ok(self
            .get_context(session_id)
            .await?
            .map(|ctx| ctx.task_graph)
            .unwrap_or_default())
    }

    /// 依赖 task_id 的任务
    pub async fn get_dependent_tasks(
        &self,
        session_id: &str,
        task_id: &str,
    ) -> Result<Vec<AgentTask>, OrchestratorError> {
        Ok(self
            .get_task_graph(session_id)
            .await?
            .into_values()
            .filter(|t| t.dependencies.iter().any(|d| d == task_id))
            .collect())
    }

    pub async fn add_message(
        &self,
        session_id: &str,
        message: Message,
    ) -> Result<(), OrchestratorError> {
        self.mutate(session_id, |ctx| ctx.conversation_history.push(message))
            .await
    }

    pub async fn get_shared_memory(
        &self,
        session_id: &str,
        key: &str,
    ) -> Result<Option<Value>, OrchestratorError> {
        Ok(self
            .get_context(session_id)
            .await?
            .and_then(|mut ctx| ctx.shared_memory.remove(key)))
    }

    pub async fn set_shared_memory(
        &self,
        session_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), OrchestratorError> {
        self.mutate(session_id, |ctx| {
            ctx.shared_memory.insert(key.to_string(), value);
        })
        .await
    }

    pub async fn clear_context(&self, session_id: &str) -> Result<(), OrchestratorError> {
        self.kv.delete(&context_key(session_id)).await?;
        Ok(())
    }

    /// 加锁读-改-写；闭包返回值透传给调用方
    async fn mutate<F, R>(&self, session_id: &str, f: F) -> Result<R, OrchestratorError>
    where
        F: FnOnce(&mut SharedContext) -> R + Send,
        R: Send,
    {
        let lock_key = format!("{}:lock", context_key(session_id));
        self.acquire_lock(session_id, &lock_key).await?;

        let result = self.load_modify_store(session_id, f).await;

        if let Err(e) = self.kv.delete(&lock_key).await {
            tracing::warn!(session_id, error = %e, "failed to release context lock");
        }
        result
    }

    async fn acquire_lock(&self, session_id: &str, lock_key: &str) -> Result<(), OrchestratorError> {
        for attempt in 0..=LOCK_RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(LOCK_RETRY_DELAY * attempt).await;
            }
            let acquired = self
                .kv
                .set_if_absent(lock_key, Utc::now().to_rfc3339(), Some(self.lock_ttl))
                .await?;
            if acquired {
                return Ok(());
            }
            tracing::debug!(session_id, attempt, "context lock busy");
        }
        Err(OrchestratorError::LockContention(session_id.to_string()))
    }

    async fn load_modify_store<F, R>(&self, session_id: &str, f: F) -> Result<R, OrchestratorError>
    where
        F: FnOnce(&mut SharedContext) -> R + Send,
        R: Send,
    {
        let mut ctx = self
            .get_context(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::ContextNotFound(session_id.to_string()))?;
        let out = f(&mut ctx);
        ctx.updated_at = Utc::now();
        self.save(&ctx).await?;
        Ok(out)
    }

    async fn save(&self, ctx: &SharedContext) -> Result<(), OrchestratorError> {
        let raw = serde_json::to_string(ctx).map_err(crate::kv::KvError::from)?;
        self.kv
            .set(&context_key(&ctx.session_id), raw, Some(self.context_ttl))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Intent;
    use crate::agents::TaskContext;
    use crate::kv::InMemoryKvStore;
    use serde_json::json;

    fn store() -> (Arc<InMemoryKvStore>, SharedContextStore) {
        let kv = Arc::new(InMemoryKvStore::new());
        (kv.clone(), SharedContextStore::new(kv))
    }

    fn task(id: &str, deps: &[&str]) -> AgentTask {
        AgentTask::new("T", Intent::GeneralChat, TaskContext::new("s1", "u1"))
            .with_id(id)
            .with_dependencies(deps)
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (_, store) = store();
        let first = store.get_or_create_context("s1", "u1", json!({})).await.unwrap();
        store.add_message("s1", Message::user("hi")).await.unwrap();
        let second = store.get_or_create_context("s1", "other", json!({})).await.unwrap();
        assert_eq!(second.user_id, "u1");
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.conversation_history.len(), 1);
    }

    #[tokio::test]
    async fn test_maps_persist_as_pairs() {
        let (kv, store) = store();
        store.get_or_create_context("s1", "u1", json!({})).await.unwrap();
        store.add_task("s1", task("t1", &[])).await.unwrap();
        store
            .update_agent_state("s1", "LeaderAgent", AgentStatePatch::working("t1"))
            .await
            .unwrap();

        let raw: Value =
            serde_json::from_str(&kv.get("agent:shared:context:s1").await.unwrap().unwrap())
                .unwrap();
        assert_eq!(raw["taskGraph"][0][0], "t1");
        assert_eq!(raw["agentStates"][0][0], "LeaderAgent");
        assert_eq!(raw["agentStates"][0][1]["status"], "working");
    }

    #[tokio::test]
    async fn test_held_lock_rejects_update_and_release_allows() {
        let (kv, store) = store();
        store.get_or_create_context("s1", "u1", json!({})).await.unwrap();
        let lock = "agent:shared:context:s1:lock";
        kv.set(lock, "other".into(), None).await.unwrap();

        let err = store
            .set_shared_memory("s1", "k", json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::LockContention(_)));

        kv.delete(lock).await.unwrap();
        store.set_shared_memory("s1", "k", json!(1)).await.unwrap();
        assert_eq!(store.get_shared_memory("s1", "k").await.unwrap(), Some(json!(1)));
        assert!(!kv.exists(lock).await.unwrap());
    }

    #[tokio::test]
    async fn test_writer_retries_until_lock_frees() {
        let (kv, store) = store();
        store.get_or_create_context("s1", "u1", json!({})).await.unwrap();
        let lock = "agent:shared:context:s1:lock";
        kv.set(lock, "other".into(), None).await.unwrap();

        let releaser = {
            let kv = kv.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                kv.delete(lock).await.unwrap();
            })
        };
        store.set_shared_memory("s1", "k", json!(2)).await.unwrap();
        releaser.await.unwrap();
        assert_eq!(store.get_shared_memory("s1", "k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_lock_released_when_context_missing() {
        let (kv, store) = store();
        let err = store
            .add_message("ghost", Message::user("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ContextNotFound(_)));
        assert!(!kv.exists("agent:shared:context:ghost:lock").await.unwrap());
    }

    #[tokio::test]
    async fn test_agent_state_patch_merges_memory() {
        let (_, store) = store();
        store.get_or_create_context("s1", "u1", json!({})).await.unwrap();
        store
            .update_agent_state(
                "s1",
                "LeaderAgent",
                AgentStatePatch::working("t1").with_memory("intent", json!("PRODUCT_SEARCH")),
            )
            .await
            .unwrap();
        store
            .update_agent_state("s1", "LeaderAgent", AgentStatePatch::finished(AgentStatus::Completed))
            .await
            .unwrap();

        let state = store.get_agent_state("s1", "LeaderAgent").await.unwrap().unwrap();
        assert_eq!(state.status, AgentStatus::Completed);
        assert_eq!(state.current_task.as_deref(), Some("t1"));
        assert_eq!(state.working_memory["intent"], json!("PRODUCT_SEARCH"));
        assert!(state.started_at.is_some() && state.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_dependent_tasks() {
        let (_, store) = store();
        store.get_or_create_context("s1", "u1", json!({})).await.unwrap();
        store.add_task("s1", task("a", &[])).await.unwrap();
        store.add_task("s1", task("b", &["a"])).await.unwrap();
        store.add_task("s1", task("c", &["a", "b"])).await.unwrap();

        let ids: Vec<String> = store
            .get_dependent_tasks("s1", "a")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_update_context_and_clear() {
        let (_, store) = store();
        store.get_or_create_context("s1", "u1", json!({})).await.unwrap();
        let updated = store
            .update_context(
                "s1",
                ContextPatch {
                    user_context: Some(json!({"locale": "en-IN"})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.user_context["locale"], "en-IN");
        assert!(updated.updated_at >= updated.created_at);

        store.clear_context("s1").await.unwrap();
        assert!(store.get_context("s1").await.unwrap().is_none());
    }
}
