//! 键值存储边界
//!
//! 共享上下文、工具缓存、熔断器都只依赖 get / set(带 TTL) / delete；键按子系统命名空间区分
//! （`agent:shared:context:*`、`tool:*`、`circuit:*`）。

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::InMemoryKvStore;

#[derive(Error, Debug, Clone)]
pub enum KvError {
    #[error("Key-value backend error: {0}")]
    Backend(String),

    #[error("Key-value serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for KvError {
    fn from(err: serde_json::Error) -> Self {
        KvError::Serialization(err.to_string())
    }
}

/// 键值存储 trait；值统一为字符串（JSON 文本）
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// ttl 为 None 时永不过期
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.get(key).await?.is_some())
    }

    /// 键不存在时写入并返回 true；默认实现是 exists + set，后端支持原子 SETNX 时应覆盖
    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        if self.exists(key).await? {
            return Ok(false);
        }
        self.set(key, value, ttl).await?;
        Ok(true)
    }
}
