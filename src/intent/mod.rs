//! 意图识别
//!
//! 规则分类器（关键词 / 正则）：LLM 路由不可用或置信度低时的确定性兜底，
//! 同时产出搜索过滤条件与是否需要澄清的标记。

pub mod classifier;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tools::SearchFilters;

pub use classifier::{BrandInfo, CategoryTaxonomy, IntentClassifier};

/// 用户意图
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    ProductSearch,
    ProductCompare,
    AddToCart,
    UpdateCartQty,
    RemoveFromCart,
    Checkout,
    CreateOrder,
    OrderStatus,
    PolicyQa,
    #[default]
    GeneralChat,
}

impl Intent {
    pub const ALL: [Intent; 10] = [
        Intent::ProductSearch,
        Intent::ProductCompare,
        Intent::AddToCart,
        Intent::UpdateCartQty,
        Intent::RemoveFromCart,
        Intent::Checkout,
        Intent::CreateOrder,
        Intent::OrderStatus,
        Intent::PolicyQa,
        Intent::GeneralChat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::ProductSearch => "PRODUCT_SEARCH",
            Intent::ProductCompare => "PRODUCT_COMPARE",
            Intent::AddToCart => "ADD_TO_CART",
            Intent::UpdateCartQty => "UPDATE_CART_QTY",
            Intent::RemoveFromCart => "REMOVE_FROM_CART",
            Intent::Checkout => "CHECKOUT",
            Intent::CreateOrder => "CREATE_ORDER",
            Intent::OrderStatus => "ORDER_STATUS",
            Intent::PolicyQa => "POLICY_QA",
            Intent::GeneralChat => "GENERAL_CHAT",
        }
    }

    /// 宽松解析（大小写不敏感）；无法识别时为 GENERAL_CHAT
    pub fn normalize(raw: &str) -> Intent {
        let upper = raw.trim().to_ascii_uppercase();
        Intent::ALL
            .into_iter()
            .find(|i| i.as_str() == upper)
            .unwrap_or(Intent::GeneralChat)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 从文本中抽取的实体
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentEntities {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub brands: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub product_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pincode: Option<String>,
    #[serde(default)]
    pub check_availability: bool,
    #[serde(default)]
    pub show_cart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation_type: Option<String>,
}

/// 分类结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentFrame {
    pub intent: Intent,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_category_id: Option<String>,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub entities: IntentEntities,
    pub need_clarification: bool,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_question: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_options: Vec<String>,
}

impl IntentFrame {
    pub fn new(intent: Intent, query: &str, confidence: f64) -> Self {
        Self {
            intent,
            query: query.to_string(),
            canonical_category_id: None,
            filters: SearchFilters::default(),
            entities: IntentEntities::default(),
            need_clarification: false,
            confidence,
            clarification_question: None,
            suggested_options: Vec::new(),
        }
    }
}

/// 澄清提问模板
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationPrompt {
    pub question: String,
    pub options: Vec<String>,
    /// 匹配上下文关键词；"default" 总是匹配
    pub context: String,
}
