//! 工具层：下游工具服务边界、HTTP 客户端与重试、provider 目录、缓存 + 熔断网关

pub mod boundary;
pub mod commerce;
pub mod gateway;
pub mod http;
pub mod providers;

pub use boundary::{RetryingToolClient, ToolBoundary, ToolError, ToolErrorBody, ToolResponse};
pub use commerce::{format_inr, Availability, Price, ProductSummary, SearchFilters};
pub use gateway::ToolGateway;
pub use http::HttpToolClient;
pub use providers::{ProviderDirectory, ProviderEntry, StaticProviderDirectory};
