//! 商品提供方目录：按能力列出已启用的 provider

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::OrchestratorError;

/// [[tools.providers]] 条目
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderEntry {
    /// 传给工具服务的 provider 标识（如 "mock"）
    pub id: String,
    /// 展示名（如 "Mock Provider"）
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl ProviderEntry {
    pub fn new(id: &str, name: &str, capabilities: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            enabled: true,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability))
    }
}

#[async_trait]
pub trait ProviderDirectory: Send + Sync {
    /// 启用且具备该能力的 provider，按 name 排序
    async fn enabled_providers(&self, capability: &str)
        -> Result<Vec<ProviderEntry>, OrchestratorError>;
}

/// 配置文件驱动的静态目录
#[derive(Debug, Clone, Default)]
pub struct StaticProviderDirectory {
    providers: Vec<ProviderEntry>,
}

impl StaticProviderDirectory {
    pub fn new(providers: Vec<ProviderEntry>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl ProviderDirectory for StaticProviderDirectory {
    async fn enabled_providers(
        &self,
        capability: &str,
    ) -> Result<Vec<ProviderEntry>, OrchestratorError> {
        let mut found: Vec<ProviderEntry> = self
            .providers
            .iter()
            .filter(|p| p.enabled && p.supports(capability))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filters_disabled_and_capability() {
        let mut disabled = ProviderEntry::new("old", "Old Shop", &["SEARCH"]);
        disabled.enabled = false;
        let directory = StaticProviderDirectory::new(vec![
            ProviderEntry::new("zeta", "Zeta Mart", &["search"]),
            ProviderEntry::new("alpha", "Alpha Store", &["SEARCH", "CART"]),
            ProviderEntry::new("carts", "Cart Only", &["CART"]),
            disabled,
        ]);

        let ids: Vec<String> = directory
            .enabled_providers("SEARCH")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }
}
