//! 商品浏览 Agent：多 provider 并发搜索、去重、相关性排序与商品对比
//!
//! 搜索流程：
//! 1. （可选）LLM 抽取过滤条件，失败时沿用原参数
//! 2. 取启用了 SEARCH 能力的 provider
//! 3. 每个 provider 一个搜索调用，全部并发、互不影响（单个失败只记日志）
//! 4. 合并结果，按 `品牌:规范化名称` 去重（保留评分高者，同分取低价）
//! 5. 相关性打分后稳定降序
//! 6. 输出摘要文本 → 前 5 个商品卡片 → done

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};

use super::base::{record_agent_state, Agent};
use super::registry::AgentRegistry;
use super::shared_context::{AgentStatePatch, SharedContextStore};
use super::types::{AgentStatus, AgentTask, Capability, ChunkStream, StreamChunk};
use crate::intent::Intent;
use crate::llm::{ExtractedSearchFilters, LlmExtraction};
use crate::tools::{commerce, format_inr, ProductSummary, ProviderDirectory, SearchFilters, ToolGateway};

pub const PRODUCT_BROWSING_AGENT: &str = "ProductBrowsingAgent";

/// 卡片块最多展示的商品数
const MAX_CARDS: usize = 5;

const FILLER_WORDS: [&str; 5] = ["the", "and", "or", "with", "for"];

/// 一次搜索的入参
#[derive(Debug, Clone, PartialEq)]
struct SearchRequest {
    query: String,
    filters: SearchFilters,
    sort_by: String,
    pagination: Value,
}

pub struct ProductBrowsingAgent {
    gateway: Arc<ToolGateway>,
    providers: Arc<dyn ProviderDirectory>,
    extraction: Option<Arc<LlmExtraction>>,
    context: Option<Arc<SharedContextStore>>,
}

impl ProductBrowsingAgent {
    pub fn new(gateway: Arc<ToolGateway>, providers: Arc<dyn ProviderDirectory>) -> Self {
        Self {
            gateway,
            providers,
            extraction: None,
            context: None,
        }
    }

    pub fn with_llm_extraction(mut self, extraction: Arc<LlmExtraction>) -> Self {
        self.extraction = Some(extraction);
        self
    }

    pub fn with_shared_context(mut self, context: Arc<SharedContextStore>) -> Self {
        self.context = Some(context);
        self
    }

    async fn run(&self, task: AgentTask) -> Vec<StreamChunk> {
        record_agent_state(&self.context, &task, self.name(), AgentStatePatch::working(&task.id)).await;

        let chunks = if task.intent == Intent::ProductSearch || task.task_type == "PRODUCT_SEARCH" {
            self.search(&task).await
        } else if task.intent == Intent::ProductCompare || task.task_type == "PRODUCT_COMPARE" {
            self.compare(&task).await
        } else {
            vec![StreamChunk::error(format!("Unsupported intent: {}", task.intent))]
        };

        let status = match chunks.last() {
            Some(StreamChunk::Error { .. }) => AgentStatus::Failed,
            _ => AgentStatus::Completed,
        };
        record_agent_state(&self.context, &task, self.name(), AgentStatePatch::finished(status)).await;
        chunks
    }

    fn search_request(task: &AgentTask) -> SearchRequest {
        let filters = task
            .parameters
            .get("filters")
            .cloned()
            .and_then(|f| serde_json::from_value(f).ok())
            .unwrap_or_default();
        SearchRequest {
            query: task
                .param_str("query")
                .or_else(|| task.user_message())
                .unwrap_or_default()
                .to_string(),
            filters,
            sort_by: task.param_str("sortBy").unwrap_or("relevance").to_string(),
            pagination: task
                .parameters
                .get("pagination")
                .cloned()
                .unwrap_or_else(|| json!({"page": 1, "limit": 20})),
        }
    }

    async fn refine(&self, task: &AgentTask, mut request: SearchRequest) -> SearchRequest {
        let (Some(extraction), Some(message)) = (&self.extraction, task.param_str("message")) else {
            return request;
        };
        match extraction.extract_search_filters(message).await {
            Ok(extracted) => {
                tracing::info!(task_id = %task.id, query = %extracted.query, "llm extracted search filters");
                apply_extracted(&mut request, extracted);
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "llm filter extraction failed");
            }
        }
        request
    }

    async fn search(&self, task: &AgentTask) -> Vec<StreamChunk> {
        let request = self.refine(task, Self::search_request(task)).await;

        let providers = match self.providers.enabled_providers("SEARCH").await {
            Ok(providers) => providers,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "failed to list providers");
                Vec::new()
            }
        };
        if providers.is_empty() {
            return vec![StreamChunk::token("No providers available for search"), StreamChunk::Done];
        }

        tracing::info!(
            task_id = %task.id,
            query = %request.query,
            providers = providers.len(),
            "searching providers in parallel"
        );
        let calls = providers.iter().map(|provider| {
            let body = json!({
                "query": request.query,
                "filters": request.filters,
                "sortBy": request.sort_by,
                "pagination": request.pagination,
                "provider": provider.id,
            });
            async move {
                let result = self
                    .gateway
                    .execute(commerce::SEARCH_PRODUCTS, body, task.trace_id())
                    .await;
                (provider.id.as_str(), result)
            }
        });

        let mut products = Vec::new();
        for (provider, result) in join_all(calls).await {
            match result {
                Ok(response) => match response.ok_data() {
                    Some(data) => products.extend(parse_products(data)),
                    None => tracing::warn!(
                        provider,
                        error = response.error_message().unwrap_or("unknown"),
                        "provider search returned an error"
                    ),
                },
                Err(e) => tracing::warn!(provider, error = %e, "provider search failed"),
            }
        }

        let total = products.len();
        let ranked = rank_by_relevance(deduplicate_products(products), &request.query);
        tracing::info!(task_id = %task.id, total, after_dedup = ranked.len(), "search results processed");

        let mut chunks = vec![StreamChunk::token(search_summary(&ranked, &request))];
        if !ranked.is_empty() {
            chunks.push(StreamChunk::Cards {
                products: ranked.into_iter().take(MAX_CARDS).collect(),
            });
        }
        chunks.push(StreamChunk::Done);
        chunks
    }

    async fn compare(&self, task: &AgentTask) -> Vec<StreamChunk> {
        let product_ids: Vec<String> = task
            .parameters
            .get("productIds")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        if product_ids.len() < 2 {
            return vec![StreamChunk::error("At least 2 products are required for comparison")];
        }

        tracing::info!(task_id = %task.id, products = ?product_ids, "comparing products");
        let result = self
            .gateway
            .execute(commerce::COMPARE_PRODUCTS, json!({"productIds": product_ids}), task.trace_id())
            .await;
        match result {
            Ok(response) => match response.ok_data() {
                Some(data) => vec![StreamChunk::Comparison { data: data.clone() }, StreamChunk::Done],
                None => vec![StreamChunk::error(
                    response.error_message().unwrap_or("Comparison failed"),
                )],
            },
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "comparison failed");
                vec![StreamChunk::error(e.to_string())]
            }
        }
    }
}

impl Agent for ProductBrowsingAgent {
    fn name(&self) -> &str {
        PRODUCT_BROWSING_AGENT
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Search, Capability::Compare]
    }

    fn priority(&self) -> i32 {
        80
    }

    fn allowed_delegations(&self) -> &[&'static str] {
        &["ReasoningAgent"]
    }

    fn can_handle(&self, task: &AgentTask) -> bool {
        matches!(task.intent, Intent::ProductSearch | Intent::ProductCompare)
            || task.task_type == "PRODUCT_SEARCH"
            || task.task_type == "PRODUCT_COMPARE"
    }

    fn execute<'a>(&'a self, task: AgentTask, _registry: &'a AgentRegistry) -> ChunkStream<'a> {
        tracing::info!(task_id = %task.id, task_type = %task.task_type, "product browsing executing");
        Box::pin(stream::once(self.run(task)).flat_map(stream::iter))
    }
}

/// LLM 抽取结果覆盖到请求上；未抽到的字段保持原值
fn apply_extracted(request: &mut SearchRequest, extracted: ExtractedSearchFilters) {
    request.query = extracted.query;
    if let Some(budget) = extracted.budget {
        request.filters.price_min = budget.min.or(request.filters.price_min);
        request.filters.price_max = budget.max.or(request.filters.price_max);
    }
    if !extracted.brands.is_empty() {
        request.filters.brands = extracted.brands;
    }
    if extracted.in_stock.is_some() {
        request.filters.in_stock = extracted.in_stock;
    }
    if !extracted.attributes.is_empty() {
        request.filters.attributes = extracted.attributes;
    }
    if let Some(category) = extracted.category {
        if !request.query.to_lowercase().contains(&category.to_lowercase()) {
            request.query = format!("{category} {}", request.query);
        }
    }
    if let Some(sort_by) = extracted.sort_by {
        request.sort_by = sort_by;
    }
}

/// data.products 中能解析的商品；格式不对的条目跳过
fn parse_products(data: &Value) -> Vec<ProductSummary> {
    data.get("products")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|p| serde_json::from_value(p.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// 去重键：小写品牌 + ":" + 去掉虚词与开头品牌词后的小写名称
pub fn dedup_key(product: &ProductSummary) -> String {
    let brand = product.brand.as_deref().unwrap_or_default().trim().to_lowercase();
    let name = product.name.trim().to_lowercase();
    let mut words: Vec<&str> = name
        .split_whitespace()
        .filter(|w| !FILLER_WORDS.contains(w))
        .collect();
    if !brand.is_empty() && words.len() > 1 && words.first() == Some(&brand.as_str()) {
        words.remove(0);
    }
    format!("{brand}:{}", words.join(" "))
}

/// 按首次出现顺序去重；冲突时保留评分更高者，评分相同取价格更低者
pub fn deduplicate_products(products: Vec<ProductSummary>) -> Vec<ProductSummary> {
    let mut kept: Vec<ProductSummary> = Vec::with_capacity(products.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for product in products {
        let key = dedup_key(&product);
        match index.get(&key) {
            None => {
                index.insert(key, kept.len());
                kept.push(product);
            }
            Some(&i) => {
                let existing = &kept[i];
                let better_rating = product.rating.unwrap_or(0.0) > existing.rating.unwrap_or(0.0);
                let cheaper_tie = product.rating == existing.rating
                    && product.price.amount < existing.price.amount;
                if better_rating || cheaper_tie {
                    kept[i] = product;
                }
            }
        }
    }
    kept
}

/// 相关性得分
pub fn relevance_score(product: &ProductSummary, query: &str) -> f64 {
    let query = query.to_lowercase();
    let name = product.name.to_lowercase();
    let mut score = 0.0;

    if name.contains(&query) {
        score += 10.0;
    }
    score += 3.0 * query.split_whitespace().filter(|t| name.contains(t)).count() as f64;
    if let Some(brand) = &product.brand {
        if !brand.is_empty() && query.contains(&brand.to_lowercase()) {
            score += 5.0;
        }
    }
    score += product.rating.unwrap_or(0.0);
    if product.availability.in_stock {
        score += 2.0;
    }
    score
}

/// 按得分稳定降序
pub fn rank_by_relevance(products: Vec<ProductSummary>, query: &str) -> Vec<ProductSummary> {
    let mut scored: Vec<(f64, ProductSummary)> = products
        .into_iter()
        .map(|p| (relevance_score(&p, query), p))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().map(|(_, p)| p).collect()
}

fn search_summary(products: &[ProductSummary], request: &SearchRequest) -> String {
    if products.is_empty() {
        return format!(
            "I couldn't find any products matching \"{}\". Try adjusting your search criteria or browse our categories.",
            request.query
        );
    }

    let plural = if products.len() > 1 { "s" } else { "" };
    let mut message = format!(
        "I found {} product{plural} matching \"{}\"",
        products.len(),
        request.query
    );
    if let Some(max) = request.filters.price_max {
        message.push_str(&format!(" under ₹{}", format_inr(max)));
    }
    if let Some(min) = request.filters.price_min {
        message.push_str(&format!(" above ₹{}", format_inr(min)));
    }
    if !request.filters.brands.is_empty() {
        message.push_str(&format!(" from {}", request.filters.brands.join(", ")));
    }
    message.push_str(". Here are the top results:");
    message
}
