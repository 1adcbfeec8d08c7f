//! 工具响应缓存

pub mod tool_cache;

pub use tool_cache::{
    cache_key, cacheable_subset, default_cache_configs, hash_value, ToolCache, ToolCacheConfig,
    ToolCacheConfigPatch,
};
