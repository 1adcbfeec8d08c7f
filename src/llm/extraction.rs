//! 基于 LLM 的结构化抽取：Agent 路由、搜索过滤条件、购物车动作
//!
//! 模型回复可能带 Markdown 代码块或多余说明，解析时先去掉围栏再截取首个 `{` 到末个 `}`。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{LlmError, LlmRouter};
use crate::intent::Intent;
use crate::memory::Message;

const ROUTING_PROMPT: &str = r#"You are an AI assistant that analyzes user messages and determines the best specialized agent to handle them.

Available Agents:
1. ProductBrowsingAgent - Handles: product search, product discovery, product comparison, browsing categories, finding items
2. ShoppingAgent - Handles: adding items to cart, updating cart quantities, removing items from cart, viewing cart
3. CheckoutAgent - Handles: checkout process, placing orders, payment, order completion
4. CustomerSupportAgent - Handles: order tracking, order status, returns, refunds, policies, help

Analyze the user's intent and respond with ONLY a valid JSON object (no markdown, no code blocks):
{
  "targetAgent": "AgentName or null for general chat",
  "intent": "PRODUCT_SEARCH|PRODUCT_COMPARE|ADD_TO_CART|UPDATE_CART_QTY|REMOVE_FROM_CART|CHECKOUT|CREATE_ORDER|ORDER_STATUS|POLICY_QA|GENERAL_CHAT",
  "confidence": 0.0 to 1.0,
  "reasoning": "brief explanation of why this agent was chosen"
}"#;

const SEARCH_FILTERS_PROMPT: &str = r#"You are an AI assistant that extracts structured search parameters from shopping queries.

Analyze the user's message and extract:
- query: The main product/item they're searching for
- category: Product category (electronics, mobile, laptop, fashion, clothing, shoes, home, kitchen, beauty, sports, books, toys, etc.)
- budget: Price range in INR (Indian Rupees). Parse "under 10k" as max:10000, "above 5000" as min:5000, "between 5k-10k" as min:5000,max:10000
- brands: Any brand names mentioned (Samsung, Apple, Nike, Sony, etc.)
- attributes: Specific features like color, size, storage, RAM, etc.
- sortBy: Sorting preference (price_low, price_high, rating, newest, popularity)
- inStock: Whether they specifically want in-stock items

Respond with ONLY a valid JSON object (no markdown, no code blocks):
{
  "query": "main search term",
  "category": "category or null",
  "budget": {"min": number or null, "max": number or null},
  "brands": ["brand1", "brand2"] or [],
  "attributes": {"color": "value", "size": "value"} or {},
  "sortBy": "sort option or null",
  "inStock": true/false or null
}"#;

const CART_ACTION_PROMPT: &str = r#"You are an AI assistant that extracts cart-related actions from user messages.

Analyze the user's message and extract:
- action: What they want to do (add, update, remove, view)
- productReference: Product name, ID, or description they're referring to
- quantity: Number of items (default 1 for add)

Respond with ONLY a valid JSON object (no markdown, no code blocks):
{
  "action": "add|update|remove|view",
  "productReference": "product name or null",
  "quantity": number or null
}"#;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRoutingResult {
    pub target_agent: String,
    pub intent: Intent,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedSearchFilters {
    pub query: String,
    pub category: Option<String>,
    pub budget: Option<Budget>,
    pub brands: Vec<String>,
    pub attributes: BTreeMap<String, String>,
    pub sort_by: Option<String>,
    pub in_stock: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CartActionKind {
    Add,
    Update,
    Remove,
    View,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedCartAction {
    pub action: CartActionKind,
    pub product_reference: Option<String>,
    pub quantity: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRouting {
    target_agent: Option<String>,
    intent: Option<String>,
    confidence: Option<f64>,
    reasoning: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSearchFilters {
    query: Option<String>,
    category: Option<String>,
    budget: Option<Budget>,
    brands: Option<Vec<String>>,
    attributes: Option<BTreeMap<String, Value>>,
    sort_by: Option<String>,
    in_stock: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCartAction {
    action: Option<CartActionKind>,
    product_reference: Option<String>,
    quantity: Option<u32>,
}

pub struct LlmExtraction {
    router: Arc<LlmRouter>,
}

impl LlmExtraction {
    pub fn new(router: Arc<LlmRouter>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<LlmRouter> {
        &self.router
    }

    async fn ask(&self, system: &str, user_message: &str) -> Result<String, LlmError> {
        let messages = [Message::system(system), Message::user(user_message)];
        self.router.complete(&messages).await
    }

    /// 判断应由哪个 Agent 处理
    pub async fn detect_agent_routing(
        &self,
        user_message: &str,
    ) -> Result<AgentRoutingResult, LlmError> {
        let reply = self.ask(ROUTING_PROMPT, user_message).await?;
        let raw: RawRouting = parse_json(&reply)?;
        let result = AgentRoutingResult {
            target_agent: raw
                .target_agent
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| "LeaderAgent".to_string()),
            intent: raw
                .intent
                .as_deref()
                .map(Intent::normalize)
                .unwrap_or_default(),
            confidence: raw.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            reasoning: raw
                .reasoning
                .unwrap_or_else(|| "No reasoning provided".to_string()),
        };
        tracing::debug!(
            target_agent = %result.target_agent,
            intent = %result.intent,
            confidence = result.confidence,
            "llm routing result"
        );
        Ok(result)
    }

    pub async fn extract_search_filters(
        &self,
        user_message: &str,
    ) -> Result<ExtractedSearchFilters, LlmError> {
        let reply = self.ask(SEARCH_FILTERS_PROMPT, user_message).await?;
        let raw: RawSearchFilters = parse_json(&reply)?;
        Ok(ExtractedSearchFilters {
            query: raw
                .query
                .filter(|q| !q.trim().is_empty())
                .unwrap_or_else(|| user_message.to_string()),
            category: raw.category.filter(|c| !c.is_empty()),
            budget: raw.budget.filter(|b| b.min.is_some() || b.max.is_some()),
            brands: raw.brands.unwrap_or_default(),
            attributes: raw
                .attributes
                .unwrap_or_default()
                .into_iter()
                .filter_map(|(k, v)| match v {
                    Value::Null => None,
                    Value::String(s) => Some((k, s)),
                    other => Some((k, other.to_string())),
                })
                .collect(),
            sort_by: raw.sort_by.filter(|s| !s.is_empty()),
            in_stock: raw.in_stock,
        })
    }

    pub async fn extract_cart_action(
        &self,
        user_message: &str,
    ) -> Result<ExtractedCartAction, LlmError> {
        let reply = self.ask(CART_ACTION_PROMPT, user_message).await?;
        let raw: RawCartAction = parse_json(&reply)?;
        Ok(ExtractedCartAction {
            action: raw.action.unwrap_or(CartActionKind::View),
            product_reference: raw.product_reference.filter(|p| !p.is_empty()),
            quantity: raw.quantity.filter(|q| *q > 0).unwrap_or(1),
        })
    }
}

/// 去掉 ``` 围栏，截取 JSON 对象后解析
pub fn parse_json<T: serde::de::DeserializeOwned>(reply: &str) -> Result<T, LlmError> {
    let cleaned = reply
        .replace("```json", "")
        .replace("```JSON", "")
        .replace("```", "");
    let cleaned = cleaned.trim();
    let candidate = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if end > start => &cleaned[start..=end],
        _ => cleaned,
    };
    serde_json::from_str(candidate).map_err(|e| LlmError::Parse(e.to_string()))
}
