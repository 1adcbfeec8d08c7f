//! 熔断器
//!
//! 每个下游依赖一条独立状态机：closed → open（连续失败达到阈值）→ half_open（打开后超过 reset_timeout
//! 的首次查询时惰性切换，不依赖定时器）→ closed（累计 half_open_requests 次成功）。
//! 半开期间任意一次失败立即回到 open 并重置 opened_at。
//!
//! 进程内状态为准，同时镜像到 KV `circuit:{name}`（TTL 300s）供其他实例观测。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::core::OrchestratorError;
use crate::kv::KvStore;

const STATE_TTL: Duration = Duration::from_secs(300);

/// 熔断参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_requests: u32,
}

impl CircuitBreakerConfig {
    /// 半开试探名额至少为 1，否则熔断永远无法恢复
    pub fn normalized(mut self) -> Self {
        self.half_open_requests = self.half_open_requests.max(1);
        self
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_requests: 3,
        }
    }
}

/// 按服务覆盖的部分参数（未设置的字段沿用默认值）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct CircuitBreakerOverride {
    pub failure_threshold: Option<u32>,
    pub reset_timeout_ms: Option<u64>,
    pub half_open_requests: Option<u32>,
}

impl CircuitBreakerOverride {
    fn apply(&self, base: CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            reset_timeout_ms: self.reset_timeout_ms.unwrap_or(base.reset_timeout_ms),
            half_open_requests: self.half_open_requests.unwrap_or(base.half_open_requests),
        }
        .normalized()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// 单个依赖的熔断状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// 半开期间已放行的试探请求数
    pub half_open_attempts: u32,
    /// 半开期间已成功的试探请求数
    pub half_open_successes: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
            half_open_attempts: 0,
            half_open_successes: 0,
            last_failure: None,
            last_success: None,
        }
    }
}

/// 熔断器：按服务名分区，互不影响
pub struct CircuitBreaker {
    defaults: CircuitBreakerConfig,
    configs: RwLock<HashMap<String, CircuitBreakerConfig>>,
    states: Mutex<HashMap<String, CircuitBreakerState>>,
    kv: Option<Arc<dyn KvStore>>,
}

impl CircuitBreaker {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults: defaults.normalized(),
            configs: RwLock::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            kv: None,
        }
    }

    /// 将状态镜像写入 KV
    pub fn with_kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// 装配期一次性写入按服务覆盖
    pub fn with_overrides(mut self, overrides: &HashMap<String, CircuitBreakerOverride>) -> Self {
        let defaults = self.defaults;
        let configs = self.configs.get_mut();
        for (service, o) in overrides {
            configs.insert(service.clone(), o.apply(defaults));
        }
        self
    }

    pub async fn configure(&self, service: &str, overrides: CircuitBreakerOverride) {
        let config = overrides.apply(self.defaults);
        self.configs
            .write()
            .await
            .insert(service.to_string(), config);
    }

    pub async fn config_for(&self, service: &str) -> CircuitBreakerConfig {
        self.configs
            .read()
            .await
            .get(service)
            .copied()
            .unwrap_or(self.defaults)
    }

    /// 熔断是否打开；超过 reset_timeout 后的首次查询会把 open 切为 half_open 并返回 false
    pub async fn is_open(&self, service: &str) -> bool {
        let config = self.config_for(service).await;
        let mut states = self.states.lock().await;
        let state = states.entry(service.to_string()).or_default();
        let open = match state.state {
            CircuitState::Open => !Self::try_half_open(service, state, &config),
            _ => false,
        };
        let snapshot = state.clone();
        drop(states);
        if !open && snapshot.state == CircuitState::HalfOpen {
            self.persist(service, &snapshot).await;
        }
        open
    }

    /// 是否放行本次请求；半开状态下放行会占用一个试探名额
    pub async fn should_allow_request(&self, service: &str) -> bool {
        let config = self.config_for(service).await;
        let mut states = self.states.lock().await;
        let state = states.entry(service.to_string()).or_default();

        if state.state == CircuitState::Open && !Self::try_half_open(service, state, &config) {
            return false;
        }

        let allowed = match state.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen if state.half_open_attempts < config.half_open_requests => {
                state.half_open_attempts += 1;
                true
            }
            _ => false,
        };
        let snapshot = state.clone();
        drop(states);
        if snapshot.state == CircuitState::HalfOpen {
            self.persist(service, &snapshot).await;
        }
        allowed
    }

    pub async fn record_success(&self, service: &str) {
        let config = self.config_for(service).await;
        let mut states = self.states.lock().await;
        let state = states.entry(service.to_string()).or_default();

        if state.state == CircuitState::HalfOpen {
            state.half_open_successes += 1;
            if state.half_open_successes >= config.half_open_requests {
                state.state = CircuitState::Closed;
                state.failures = 0;
                state.opened_at = None;
                state.half_open_attempts = 0;
                state.half_open_successes = 0;
                tracing::info!(service, "circuit closed after recovery");
            }
        } else {
            state.failures = 0;
        }
        state.last_success = Some(Utc::now());

        let snapshot = state.clone();
        drop(states);
        self.persist(service, &snapshot).await;
    }

    pub async fn record_failure(&self, service: &str) {
        let config = self.config_for(service).await;
        let mut states = self.states.lock().await;
        let state = states.entry(service.to_string()).or_default();
        let now = Utc::now();

        state.failures += 1;
        state.last_failure = Some(now);

        match state.state {
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                state.half_open_attempts = 0;
                state.half_open_successes = 0;
                tracing::warn!(service, "circuit re-opened after half-open failure");
            }
            CircuitState::Closed if state.failures >= config.failure_threshold => {
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                tracing::warn!(service, failures = state.failures, "circuit opened");
            }
            _ => {}
        }

        let snapshot = state.clone();
        drop(states);
        self.persist(service, &snapshot).await;
    }

    pub async fn state(&self, service: &str) -> CircuitState {
        self.states
            .lock()
            .await
            .get(service)
            .map(|s| s.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// 手动复位为 closed
    pub async fn reset(&self, service: &str) {
        let fresh = CircuitBreakerState::default();
        self.states
            .lock()
            .await
            .insert(service.to_string(), fresh.clone());
        self.persist(service, &fresh).await;
        tracing::info!(service, "circuit manually reset");
    }

    /// 所有已知依赖的状态快照
    pub async fn health_status(&self) -> HashMap<String, CircuitBreakerState> {
        self.states.lock().await.clone()
    }

    /// 受熔断保护地执行 f；被拦截时返回 ServiceUnavailable，失败时记录后原样返回错误
    pub async fn execute<T, E, F, Fut>(&self, service: &str, f: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<OrchestratorError>,
    {
        if !self.should_allow_request(service).await {
            tracing::warn!(service, "circuit is open, request blocked");
            return Err(OrchestratorError::ServiceUnavailable(service.to_string()));
        }

        match f().await {
            Ok(value) => {
                self.record_success(service).await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure(service).await;
                Err(e.into())
            }
        }
    }

    /// 与 execute 相同，但被拦截或失败时改用 fallback 的结果
    pub async fn execute_with_fallback<T, E, F, Fut, FB, FutB>(
        &self,
        service: &str,
        f: F,
        fallback: FB,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<OrchestratorError>,
        FB: FnOnce(OrchestratorError) -> FutB,
        FutB: Future<Output = T>,
    {
        match self.execute(service, f).await {
            Ok(value) => value,
            Err(e) => fallback(e).await,
        }
    }

    fn try_half_open(
        service: &str,
        state: &mut CircuitBreakerState,
        config: &CircuitBreakerConfig,
    ) -> bool {
        let elapsed_ms = state
            .opened_at
            .map(|at| (Utc::now() - at).num_milliseconds())
            .unwrap_or(i64::MAX);
        if elapsed_ms >= config.reset_timeout_ms as i64 {
            state.state = CircuitState::HalfOpen;
            state.half_open_attempts = 0;
            state.half_open_successes = 0;
            tracing::info!(service, "circuit transitioned to half-open");
            true
        } else {
            false
        }
    }

    async fn persist(&self, service: &str, state: &CircuitBreakerState) {
        let Some(kv) = &self.kv else {
            return;
        };
        let key = format!("circuit:{service}");
        let result = match serde_json::to_string(state) {
            Ok(json) => kv.set(&key, json, Some(STATE_TTL)).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!(service, error = %e, "failed to persist circuit state");
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use crate::tools::ToolError;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout_ms: 50,
            half_open_requests: 2,
        })
    }

    fn boom() -> Result<(), ToolError> {
        Err(ToolError::Status {
            tool: "commerce.searchProducts".into(),
            status: 500,
        })
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let cb = fast_breaker();
        for _ in 0..2 {
            cb.record_failure("svc").await;
            assert_eq!(cb.state("svc").await, CircuitState::Closed);
        }
        cb.record_failure("svc").await;
        assert_eq!(cb.state("svc").await, CircuitState::Open);
        assert!(cb.is_open("svc").await);
        assert!(!cb.should_allow_request("svc").await);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_when_closed() {
        let cb = fast_breaker();
        cb.record_failure("svc").await;
        cb.record_failure("svc").await;
        cb.record_success("svc").await;
        cb.record_failure("svc").await;
        assert_eq!(cb.state("svc").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_allows_limited_trials() {
        let cb = fast_breaker();
        for _ in 0..3 {
            cb.record_failure("svc").await;
        }
        assert!(!cb.should_allow_request("svc").await);

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(!cb.is_open("svc").await);
        assert_eq!(cb.state("svc").await, CircuitState::HalfOpen);

        assert!(cb.should_allow_request("svc").await);
        assert!(cb.should_allow_request("svc").await);
        assert!(!cb.should_allow_request("svc").await);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = fast_breaker();
        for _ in 0..3 {
            cb.record_failure("svc").await;
        }
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(cb.should_allow_request("svc").await);
        cb.record_failure("svc").await;
        assert_eq!(cb.state("svc").await, CircuitState::Open);
        assert!(cb.is_open("svc").await);
    }

    #[tokio::test]
    async fn test_half_open_successes_close_circuit() {
        let cb = fast_breaker();
        for _ in 0..3 {
            cb.record_failure("svc").await;
        }
        tokio::time::sleep(Duration::from_millis(70)).await;
        for _ in 0..2 {
            let r: Result<u32, OrchestratorError> =
                cb.execute("svc", || async { Ok::<_, ToolError>(1) }).await;
            assert_eq!(r.unwrap(), 1);
        }
        assert_eq!(cb.state("svc").await, CircuitState::Closed);
        let status = cb.health_status().await;
        assert_eq!(status["svc"].failures, 0);
    }

    #[tokio::test]
    async fn test_execute_blocked_and_rethrow() {
        let cb = fast_breaker();
        for _ in 0..3 {
            let err = cb.execute("svc", || async { boom() }).await.unwrap_err();
            assert!(matches!(err, OrchestratorError::ToolExecutionFailed(_)));
        }
        let err = cb.execute("svc", || async { boom() }).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_execute_with_fallback() {
        let cb = fast_breaker();
        let value = cb
            .execute_with_fallback("svc", || async { boom().map(|_| "live") }, |_| async {
                "fallback"
            })
            .await;
        assert_eq!(value, "fallback");
        assert_eq!(cb.health_status().await["svc"].failures, 1);
    }

    #[tokio::test]
    async fn test_per_service_configuration_and_isolation() {
        let cb = CircuitBreaker::default();
        cb.configure(
            "flaky",
            CircuitBreakerOverride {
                failure_threshold: Some(1),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(cb.config_for("flaky").await.reset_timeout_ms, 30_000);

        cb.record_failure("flaky").await;
        cb.record_failure("steady").await;
        assert_eq!(cb.state("flaky").await, CircuitState::Open);
        assert_eq!(cb.state("steady").await, CircuitState::Closed);

        cb.reset("flaky").await;
        assert_eq!(cb.state("flaky").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_state_mirrored_to_kv() {
        let kv = Arc::new(InMemoryKvStore::new());
        let cb = fast_breaker().with_kv(kv.clone());
        for _ in 0..3 {
            cb.record_failure("svc").await;
        }
        let raw = kv.get("circuit:svc").await.unwrap().unwrap();
        let state: CircuitBreakerState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.failures, 3);
    }

    #[tokio::test]
    async fn test_zero_half_open_requests_still_recovers() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 10,
            half_open_requests: 0,
        });
        cb.record_failure("svc").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cb.should_allow_request("svc").await);
        cb.record_success("svc").await;
        assert_eq!(cb.state("svc").await, CircuitState::Closed);

        cb.configure(
            "other",
            CircuitBreakerOverride {
                half_open_requests: Some(0),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(cb.config_for("other").await.half_open_requests, 1);
    }

    #[tokio::test]
    async fn test_with_overrides_applies_at_construction() {
        let overrides = HashMap::from([(
            "flaky".to_string(),
            CircuitBreakerOverride {
                failure_threshold: Some(1),
                ..Default::default()
            },
        )]);
        let cb = CircuitBreaker::default().with_overrides(&overrides);
        assert_eq!(cb.config_for("flaky").await.failure_threshold, 1);
        assert_eq!(cb.config_for("steady").await.failure_threshold, 5);
    }
}
