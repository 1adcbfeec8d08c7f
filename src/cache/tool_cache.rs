//! 工具响应缓存
//!
//! 键为 `prefix:hash(可缓存请求子集)`：按工具名挑出影响结果的字段，剔除 userId / idempotencyKey /
//! traceId，递归排序对象键后做 SHA-256 并截取前 16 位十六进制。只缓存 ok 响应；未配置的工具视为禁用。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::kv::KvStore;
use crate::tools::commerce;
use crate::tools::ToolResponse;

/// 单个工具的缓存策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ToolCacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub cache_key_prefix: String,
}

impl ToolCacheConfig {
    pub fn new(ttl_seconds: u64, cache_key_prefix: &str) -> Self {
        Self {
            enabled: true,
            ttl_seconds,
            cache_key_prefix: cache_key_prefix.to_string(),
        }
    }

    fn disabled() -> Self {
        Self {
            enabled: false,
            ttl_seconds: 0,
            cache_key_prefix: String::new(),
        }
    }
}

/// 部分更新
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCacheConfigPatch {
    pub enabled: Option<bool>,
    pub ttl_seconds: Option<u64>,
    pub cache_key_prefix: Option<String>,
}

/// 内置默认策略（配置文件中的同名条目会覆盖）
pub fn default_cache_configs() -> HashMap<String, ToolCacheConfig> {
    HashMap::from([
        (
            commerce::SEARCH_PRODUCTS.to_string(),
            ToolCacheConfig::new(300, "tool:search"),
        ),
        (
            commerce::GET_PRODUCT_BY_ID.to_string(),
            ToolCacheConfig::new(600, "tool:product"),
        ),
        (
            commerce::COMPARE_PRODUCTS.to_string(),
            ToolCacheConfig::new(600, "tool:compare"),
        ),
        (
            commerce::GET_CATALOG.to_string(),
            ToolCacheConfig::new(3600, "tool:catalog"),
        ),
        (
            commerce::LIST_PROVIDERS.to_string(),
            ToolCacheConfig::new(3600, "tool:providers"),
        ),
    ])
}

pub struct ToolCache {
    kv: Arc<dyn KvStore>,
    configs: RwLock<HashMap<String, ToolCacheConfig>>,
}

impl ToolCache {
    /// overrides 合并在默认策略之上
    pub fn new(kv: Arc<dyn KvStore>, overrides: HashMap<String, ToolCacheConfig>) -> Self {
        let mut configs = default_cache_configs();
        configs.extend(overrides);
        Self {
            kv,
            configs: RwLock::new(configs),
        }
    }

    pub async fn cache_config(&self, tool_name: &str) -> ToolCacheConfig {
        self.configs
            .read()
            .await
            .get(tool_name)
            .cloned()
            .unwrap_or_else(ToolCacheConfig::disabled)
    }

    pub async fn get_cached_result(&self, tool_name: &str, request: &Value) -> Option<ToolResponse> {
        let config = self.cache_config(tool_name).await;
        if !config.enabled {
            return None;
        }

        let key = cache_key(&config.cache_key_prefix, tool_name, request);
        let raw = match self.kv.get(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(tool = tool_name, error = %e, "cache read failed");
                return None;
            }
        };

        match raw.map(|r| serde_json::from_str::<ToolResponse>(&r)) {
            Some(Ok(mut response)) => {
                tracing::debug!(tool = tool_name, "cache hit");
                response.cached = true;
                Some(response)
            }
            Some(Err(e)) => {
                tracing::warn!(tool = tool_name, error = %e, "discarding malformed cache entry");
                None
            }
            None => {
                tracing::debug!(tool = tool_name, "cache miss");
                None
            }
        }
    }

    /// 仅缓存启用工具的 ok 响应
    pub async fn cache_result(&self, tool_name: &str, request: &Value, response: &ToolResponse) {
        let config = self.cache_config(tool_name).await;
        if !config.enabled || !response.ok {
            return;
        }

        let key = cache_key(&config.cache_key_prefix, tool_name, request);
        let mut entry = response.clone();
        entry.cached = false;
        entry.cached_at = Some(Utc::now());

        let result = match serde_json::to_string(&entry) {
            Ok(json) => {
                self.kv
                    .set(&key, json, Some(Duration::from_secs(config.ttl_seconds)))
                    .await
            }
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => tracing::debug!(tool = tool_name, ttl = config.ttl_seconds, "cached tool result"),
            Err(e) => tracing::warn!(tool = tool_name, error = %e, "cache write failed"),
        }
    }

    pub async fn invalidate_cache(&self, tool_name: &str, request: &Value) {
        let config = self.cache_config(tool_name).await;
        if !config.enabled {
            return;
        }
        let key = cache_key(&config.cache_key_prefix, tool_name, request);
        if let Err(e) = self.kv.delete(&key).await {
            tracing::warn!(tool = tool_name, error = %e, "cache invalidation failed");
        }
    }

    /// 清理用户购物车缓存
    pub async fn invalidate_user_cache(&self, user_id: &str) {
        let key = format!("tool:cart:{user_id}");
        if let Err(e) = self.kv.delete(&key).await {
            tracing::warn!(user_id, error = %e, "user cache invalidation failed");
        }
    }

    /// 只更新已知工具；返回是否生效
    pub async fn update_cache_config(&self, tool_name: &str, patch: ToolCacheConfigPatch) -> bool {
        let mut configs = self.configs.write().await;
        let Some(config) = configs.get_mut(tool_name) else {
            return false;
        };
        if let Some(enabled) = patch.enabled {
            config.enabled = enabled;
        }
        if let Some(ttl) = patch.ttl_seconds {
            config.ttl_seconds = ttl;
        }
        if let Some(prefix) = patch.cache_key_prefix {
            config.cache_key_prefix = prefix;
        }
        true
    }

    /// 请求头 `x-cache-control: no-cache` 时跳过缓存
    pub async fn should_use_cache(&self, tool_name: &str, headers: &HashMap<String, String>) -> bool {
        if !self.cache_config(tool_name).await.enabled {
            return false;
        }
        !headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("x-cache-control") && v.trim() == "no-cache")
    }
}

pub fn cache_key(prefix: &str, tool_name: &str, request: &Value) -> String {
    let subset = cacheable_subset(tool_name, request);
    format!("{}:{}", prefix, hash_value(&subset))
}

/// 按工具挑选影响结果的字段
pub fn cacheable_subset(tool_name: &str, request: &Value) -> Value {
    let mut fields: Map<String, Value> = request.as_object().cloned().unwrap_or_default();
    for volatile in ["userId", "idempotencyKey", "traceId"] {
        fields.remove(volatile);
    }

    let pick = |names: &[&str]| -> Value {
        let mut picked = Map::new();
        for name in names {
            if let Some(v) = fields.get(*name) {
                picked.insert(name.to_string(), v.clone());
            }
        }
        Value::Object(picked)
    };

    if tool_name.contains("search") {
        pick(&["query", "filters", "sortBy", "pagination", "provider"])
    } else if tool_name.contains("getProductById") {
        pick(&["productId", "provider", "includeVariants", "includeReviews"])
    } else if tool_name.contains("compare") {
        let mut ids: Vec<String> = fields
            .get("productIds")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        serde_json::json!({ "productIds": ids })
    } else if tool_name.contains("Catalog") || tool_name.contains("Providers") {
        pick(&["category", "depth", "capabilities"])
    } else {
        Value::Object(fields)
    }
}

/// 规范化（递归排序对象键）后的 SHA-256 前 16 位
pub fn hash_value(value: &Value) -> String {
    let normalized = canonicalize(value).to_string();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
