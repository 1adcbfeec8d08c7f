//! 规则意图分类器
//!
//! 按固定顺序匹配：搜索 → 对比 → 加购 → 结算 → 订单状态 → 库存查询 → 购物车 → 推荐 → 闲聊。
//! 搜索意图会解析类目（关键词词表）、品牌（名称 + 别名）、价格区间、颜色 / 尺码，并计算置信度：
//! 基础 0.5，命中类目 +0.25，命中品牌 +0.15，文本长于 10 +0.1，有价格条件 +0.2，上限 0.95。

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{ClarificationPrompt, Intent, IntentFrame};
use crate::tools::SearchFilters;

/// 类目词表条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTaxonomy {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub keywords: Vec<String>,
}

/// 品牌及其别名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandInfo {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

const SEARCH_PATTERNS: &[&str] = &[
    "show me", "search", "find", "looking for", "want", "need", "browse", "explore", "display",
    "list", "get me", "i need", "show", "any", "recommend", "suggest", "what about",
];
const COMPARE_PATTERNS: &[&str] = &[
    "compare", "difference between", "vs", "versus", "which is better", "better option",
    "comparison", "side by side",
];
const ADD_TO_CART_PATTERNS: &[&str] = &[
    "add to cart", "add to bag", "add item", "buy this", "i want this", "add it", "get this",
    "purchase",
];
const CHECKOUT_PATTERNS: &[&str] = &[
    "checkout", "check out", "place order", "order now", "complete order", "buy now",
    "proceed to payment", "pay now",
];
const ORDER_STATUS_PATTERNS: &[&str] = &[
    "order status", "track order", "where is my order", "delivery status", "when will it arrive",
    "shipping status", "track my",
];
const AVAILABILITY_PATTERNS: &[&str] = &[
    "is it available", "in stock", "availability", "can i get", "when available", "delivery to",
    "deliver to",
];
const CART_PATTERNS: &[&str] = &[
    "my cart", "view cart", "show cart", "cart items", "what's in my cart", "update cart",
    "remove from cart",
];
const RECOMMENDATION_PATTERNS: &[&str] = &[
    "recommend", "suggestion", "what should i", "best selling", "popular", "trending",
    "top rated", "similar to",
];
/// 即使没有类目词表命中，也暗示搜索的常见商品词
const PRODUCT_WORDS: &[&str] = &[
    "mobile", "phone", "laptop", "tv", "television", "camera", "headphone", "earphone", "speaker",
    "watch", "tablet", "computer", "ac", "fridge", "refrigerator", "washing machine", "microwave",
    "oven", "fan", "cooler", "shoe", "shirt", "jeans", "dress", "bag", "wallet", "perfume",
];
const COLORS: &[&str] = &[
    "black", "white", "red", "blue", "green", "silver", "gold", "pink", "grey", "gray",
];
const SIZES: &[&str] = &["small", "medium", "large", "xl", "xxl", "s", "m", "l"];

static PRICE_FILTER_RE: OnceLock<Regex> = OnceLock::new();
static PRICE_MAX_RE: OnceLock<Regex> = OnceLock::new();
static PRICE_MIN_RE: OnceLock<Regex> = OnceLock::new();
static PRICE_RANGE_RE: OnceLock<Regex> = OnceLock::new();
static QUANTITY_RE: OnceLock<Regex> = OnceLock::new();
static ORDER_ID_RE: OnceLock<Regex> = OnceLock::new();
static PINCODE_RE: OnceLock<Regex> = OnceLock::new();

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static intent pattern must compile"))
}

fn price_filter_re() -> &'static Regex {
    regex(
        &PRICE_FILTER_RE,
        r"(?i)(?:under|below|above|less than|more than|upto|up to|between|starting|from|max|min)\s*(?:rs\.?|inr|₹)?\s*\d+",
    )
}

fn matches_any(text: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| text.contains(p))
}

/// "20k" → 20000；k 只作用于紧跟的数字
fn scaled(digits: &str, has_k: bool) -> Option<f64> {
    let value: f64 = digits.parse().ok()?;
    Some(if has_k { value * 1000.0 } else { value })
}

pub struct IntentClassifier {
    taxonomy: Vec<CategoryTaxonomy>,
    brands: Vec<BrandInfo>,
    clarification_prompts: HashMap<Intent, Vec<ClarificationPrompt>>,
}

impl IntentClassifier {
    pub fn new(taxonomy: Vec<CategoryTaxonomy>, brands: Vec<BrandInfo>) -> Self {
        Self {
            taxonomy,
            brands,
            clarification_prompts: default_clarification_prompts(),
        }
    }

    pub fn with_clarification_prompts(
        mut self,
        prompts: HashMap<Intent, Vec<ClarificationPrompt>>,
    ) -> Self {
        self.clarification_prompts = prompts;
        self
    }

    /// 分类用户消息
    pub fn classify(&self, text: &str) -> IntentFrame {
        let lower = text.trim().to_lowercase();

        if self.is_search(&lower) {
            return self.build_search(&lower, text);
        }
        if matches_any(&lower, COMPARE_PATTERNS) {
            return self.build_compare(text);
        }
        if matches_any(&lower, ADD_TO_CART_PATTERNS) {
            let mut frame = IntentFrame::new(Intent::AddToCart, text, 0.6);
            frame.entities.quantity = Some(extract_quantity(&lower).unwrap_or(1));
            frame.need_clarification = true;
            frame.clarification_question =
                Some("Which product would you like to add to your cart?".to_string());
            return frame;
        }
        if matches_any(&lower, CHECKOUT_PATTERNS) {
            return IntentFrame::new(Intent::Checkout, text, 0.95);
        }
        if matches_any(&lower, ORDER_STATUS_PATTERNS) {
            let order_id = extract_order_id(text);
            let mut frame =
                IntentFrame::new(Intent::OrderStatus, text, if order_id.is_some() { 0.95 } else { 0.7 });
            if order_id.is_none() {
                frame.need_clarification = true;
                frame.clarification_question = Some(
                    "Which order would you like to track? Please provide your order ID."
                        .to_string(),
                );
            }
            frame.entities.order_id = order_id;
            return frame;
        }
        if matches_any(&lower, AVAILABILITY_PATTERNS) {
            let mut frame = IntentFrame::new(Intent::ProductSearch, text, 0.6);
            frame.entities.check_availability = true;
            frame.entities.pincode = extract_pincode(&lower);
            frame.need_clarification = true;
            frame.clarification_question =
                Some("Which product's availability would you like to check?".to_string());
            return frame;
        }
        if matches_any(&lower, CART_PATTERNS) {
            return build_cart(&lower, text);
        }
        if matches_any(&lower, RECOMMENDATION_PATTERNS) {
            let mut frame = IntentFrame::new(Intent::ProductSearch, text, 0.85);
            frame.canonical_category_id = self.resolve_category(&lower);
            frame.entities.recommendation_type = Some(recommendation_type(&lower).to_string());
            return frame;
        }

        IntentFrame::new(Intent::GeneralChat, text, 0.5)
    }

    /// 标记为需要澄清，或置信度低于 0.7
    pub fn needs_clarification(&self, frame: &IntentFrame) -> bool {
        frame.need_clarification || frame.confidence < 0.7
    }

    /// 选择与上下文最相关的澄清模板；"default" 模板总是命中
    pub fn clarification_prompt(&self, intent: Intent, context: &str) -> Option<ClarificationPrompt> {
        let prompts = self.clarification_prompts.get(&intent)?;
        prompts
            .iter()
            .find(|p| p.context == "default" || context.contains(&p.context))
            .or_else(|| prompts.first())
            .cloned()
    }

    /// 根据意图与是否有结果给出后续建议
    pub fn suggested_followups(&self, intent: Intent, has_results: bool) -> Vec<String> {
        let suggestions: &[&str] = match intent {
            Intent::ProductSearch if has_results => {
                &["Compare these products", "Filter by brand", "Sort by price", "Add to cart"]
            }
            Intent::ProductSearch => &[
                "Try different keywords",
                "Browse categories",
                "Show trending products",
            ],
            Intent::ProductCompare => &[
                "Add to cart",
                "Check availability",
                "View reviews",
                "See more options",
            ],
            Intent::AddToCart => &["View cart", "Continue shopping", "Proceed to checkout"],
            Intent::Checkout => &["Track order", "Continue shopping", "View order details"],
            Intent::OrderStatus => &["Contact support", "View order details", "Return item"],
            Intent::GeneralChat => &["Search for products", "View my cart", "Track an order"],
            Intent::UpdateCartQty => &["View cart", "Checkout"],
            Intent::RemoveFromCart => &["View cart", "Continue shopping"],
            Intent::CreateOrder => &["Track order"],
            Intent::PolicyQa => &["Search products", "Contact support"],
        };
        suggestions.iter().map(|s| s.to_string()).collect()
    }

    /// 仅抽取搜索过滤条件（价格 / 品牌 / 属性 / 库存偏好）
    pub fn extract_filters(&self, text: &str) -> SearchFilters {
        let lower = text.to_lowercase();
        let (price_min, price_max) = extract_price_range(&lower);
        SearchFilters {
            price_min,
            price_max,
            brands: self.extract_brands(&lower),
            in_stock: (lower.contains("in stock") || lower.contains("available")).then_some(true),
            categories: Vec::new(),
            attributes: extract_attributes(&lower),
        }
    }

    fn is_search(&self, text: &str) -> bool {
        if matches_any(text, SEARCH_PATTERNS) {
            return true;
        }
        if !price_filter_re().is_match(text) {
            return false;
        }
        self.resolve_category(text).is_some()
            || matches_any(text, PRODUCT_WORDS)
            || !self.extract_brands(text).is_empty()
    }

    fn build_search(&self, lower: &str, original: &str) -> IntentFrame {
        let category = self.resolve_category(lower);
        let filters = self.extract_filters(lower);
        let brands = filters.brands.clone();
        let attributes = filters.attributes.clone();

        let need_clarification = category.is_none() && brands.is_empty() && is_vague(lower);
        let confidence = search_confidence(category.is_some(), !brands.is_empty(), lower);

        let mut frame = IntentFrame::new(Intent::ProductSearch, original, confidence);
        frame.canonical_category_id = category;
        frame.filters = filters;
        frame.entities.brands = brands;
        frame.entities.attributes = attributes;
        frame.need_clarification = need_clarification;
        if need_clarification {
            if let Some(prompt) = self.clarification_prompt(Intent::ProductSearch, lower) {
                frame.clarification_question = Some(prompt.question);
                frame.suggested_options = prompt.options;
            }
        }
        frame
    }

    fn build_compare(&self, original: &str) -> IntentFrame {
        let mut frame = IntentFrame::new(Intent::ProductCompare, original, 0.6);
        frame.need_clarification = true;
        frame.clarification_question = Some("Which products would you like to compare?".to_string());
        frame
    }

    fn resolve_category(&self, text: &str) -> Option<String> {
        self.taxonomy
            .iter()
            .find(|c| c.keywords.iter().any(|k| text.contains(&k.to_lowercase())))
            .map(|c| c.id.clone())
    }

    fn extract_brands(&self, text: &str) -> Vec<String> {
        self.brands
            .iter()
            .filter(|b| {
                std::iter::once(&b.name)
                    .chain(b.aliases.iter())
                    .any(|n| text.contains(&n.to_lowercase()))
            })
            .map(|b| b.name.clone())
            .collect()
    }
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new(default_taxonomy(), default_brands())
    }
}

fn build_cart(lower: &str, original: &str) -> IntentFrame {
    if lower.contains("remove") {
        return IntentFrame::new(Intent::RemoveFromCart, original, 0.9);
    }
    if lower.contains("update") || lower.contains("change quantity") {
        return IntentFrame::new(Intent::UpdateCartQty, original, 0.85);
    }
    let mut frame = IntentFrame::new(Intent::GeneralChat, original, 0.85);
    frame.entities.show_cart = true;
    frame
}

/// 返回 (min, max)
fn extract_price_range(text: &str) -> (Option<f64>, Option<f64>) {
    let max_re = regex(
        &PRICE_MAX_RE,
        r"(?i)(?:under|below|less than|max|upto|up to)\s*(?:rs\.?|inr|₹)?\s*(\d+)(k)?",
    );
    let min_re = regex(
        &PRICE_MIN_RE,
        r"(?i)(?:above|over|more than|min|starting|from)\s*(?:rs\.?|inr|₹)?\s*(\d+)(k)?",
    );
    let range_re = regex(
        &PRICE_RANGE_RE,
        r"(?i)between\s*(?:rs\.?|inr|₹)?\s*(\d+)(k)?\s*(?:and|to|-)\s*(?:rs\.?|inr|₹)?\s*(\d+)(k)?",
    );

    let mut max = max_re
        .captures(text)
        .and_then(|c| scaled(&c[1], c.get(2).is_some()));
    let mut min = min_re
        .captures(text)
        .and_then(|c| scaled(&c[1], c.get(2).is_some()));

    if let Some(c) = range_re.captures(text) {
        let low_k = c.get(2).is_some();
        let high_k = c.get(4).is_some();
        let high = scaled(&c[3], high_k);
        // "10-20k"：k 只写在上限时，若下限数值更小则一并按千计
        let low_digits: f64 = c[1].parse().unwrap_or(0.0);
        let high_digits: f64 = c[3].parse().unwrap_or(0.0);
        let low = scaled(&c[1], low_k || (high_k && low_digits < high_digits));
        if low.is_some() && high.is_some() {
            min = low;
            max = high;
        }
    }

    (min, max)
}

fn extract_attributes(text: &str) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    if let Some(color) = COLORS.iter().find(|c| text.contains(*c)) {
        attributes.insert("color".to_string(), color.to_string());
    }
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    if let Some(size) = SIZES.iter().find(|s| words.contains(*s)) {
        attributes.insert("size".to_string(), size.to_uppercase());
    }
    attributes
}

/// 有效词（长度 > 2）少于 2 个且没有价格条件
fn is_vague(text: &str) -> bool {
    if price_filter_re().is_match(text) {
        return false;
    }
    text.split_whitespace()
        .filter(|w| w.chars().count() > 2)
        .count()
        < 2
}

fn search_confidence(has_category: bool, has_brand: bool, text: &str) -> f64 {
    let mut confidence = 0.5;
    if has_category {
        confidence += 0.25;
    }
    if has_brand {
        confidence += 0.15;
    }
    if text.chars().count() > 10 {
        confidence += 0.1;
    }
    if price_filter_re().is_match(text) {
        confidence += 0.2;
    }
    f64::min(confidence, 0.95)
}

fn extract_quantity(text: &str) -> Option<u32> {
    regex(&QUANTITY_RE, r"(\d+)\s*(?:units?|items?|pieces?)?")
        .captures(text)
        .and_then(|c| c[1].parse().ok())
}

/// 订单号需要包含数字，避免把 "order status" 里的单词当成单号
fn extract_order_id(text: &str) -> Option<String> {
    regex(&ORDER_ID_RE, r"(?i)order\s*(?:id|#|number)?:?\s*([A-Z0-9-]+)")
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .find(|id| id.chars().any(|ch| ch.is_ascii_digit()))
}

fn extract_pincode(text: &str) -> Option<String> {
    regex(&PINCODE_RE, r"\b(\d{6})\b")
        .captures(text)
        .map(|c| c[1].to_string())
}

fn recommendation_type(text: &str) -> &'static str {
    if text.contains("similar") {
        "similar"
    } else if text.contains("trending") || text.contains("popular") {
        "trending"
    } else if text.contains("best selling") || text.contains("top") {
        "bestseller"
    } else if text.contains("deal") || text.contains("discount") {
        "deals"
    } else {
        "personalized"
    }
}

fn prompt(question: &str, options: &[&str], context: &str) -> ClarificationPrompt {
    ClarificationPrompt {
        question: question.to_string(),
        options: options.iter().map(|o| o.to_string()).collect(),
        context: context.to_string(),
    }
}

pub fn default_clarification_prompts() -> HashMap<Intent, Vec<ClarificationPrompt>> {
    HashMap::from([
        (
            Intent::ProductSearch,
            vec![
                prompt(
                    "What type of product are you looking for?",
                    &["Electronics", "Fashion", "Home & Kitchen", "Beauty", "Sports"],
                    "default",
                ),
                prompt(
                    "Could you tell me more about what you're looking for?",
                    &["Show popular items", "Browse categories", "Show deals"],
                    "vague",
                ),
            ],
        ),
        (
            Intent::ProductCompare,
            vec![prompt("Which products would you like to compare?", &[], "default")],
        ),
        (
            Intent::AddToCart,
            vec![prompt(
                "Which product would you like to add to your cart?",
                &[],
                "default",
            )],
        ),
    ])
}

fn category(id: &str, name: &str, keywords: &[&str]) -> CategoryTaxonomy {
    CategoryTaxonomy {
        id: id.to_string(),
        name: name.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
    }
}

fn brand(name: &str, aliases: &[&str]) -> BrandInfo {
    BrandInfo {
        name: name.to_string(),
        aliases: aliases.iter().map(|a| a.to_string()).collect(),
        categories: Vec::new(),
    }
}

pub fn default_taxonomy() -> Vec<CategoryTaxonomy> {
    vec![
        category("mobiles", "Mobiles", &["mobile", "phone", "smartphone"]),
        category("laptops", "Laptops", &["laptop", "notebook", "macbook"]),
        category("televisions", "Televisions", &["television", "smart tv", "led tv"]),
        category("audio", "Audio", &["headphone", "earphone", "earbuds", "speaker"]),
        category("footwear", "Footwear", &["shoe", "sneaker", "sandal"]),
        category("apparel", "Apparel", &["shirt", "jeans", "dress", "jacket"]),
    ]
}

pub fn default_brands() -> Vec<BrandInfo> {
    vec![
        brand("Samsung", &["galaxy"]),
        brand("Apple", &["iphone", "macbook"]),
        brand("Xiaomi", &["redmi"]),
        brand("OnePlus", &["one plus"]),
        brand("Sony", &[]),
        brand("Lenovo", &[]),
        brand("Nike", &[]),
        brand("Adidas", &[]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_category_and_price_imply_search() {
        let c = IntentClassifier::default();
        let frame = c.classify("phone under 20k");
        assert_eq!(frame.intent, Intent::ProductSearch);
        assert_eq!(frame.canonical_category_id.as_deref(), Some("mobiles"));
        assert_eq!(frame.filters.price_max, Some(20000.0));
        assert!(!frame.need_clarification);
        assert!(approx(frame.confidence, 0.95));
    }

    #[test]
    fn test_price_ranges() {
        assert_eq!(extract_price_range("laptop below 50000"), (None, Some(50000.0)));
        assert_eq!(extract_price_range("shoes above 2k"), (Some(2000.0), None));
        assert_eq!(
            extract_price_range("tv between 10 and 20k"),
            (Some(10000.0), Some(20000.0))
        );
        assert_eq!(
            extract_price_range("between 500 and 2k"),
            (Some(500.0), Some(2000.0))
        );
        assert_eq!(
            extract_price_range("keyboard under rs 800"),
            (None, Some(800.0))
        );
    }

    #[test]
    fn test_confidence_components() {
        let c = IntentClassifier::default();
        // 品牌 + 长文本，无类目无价格
        let frame = c.classify("show me something from nike");
        assert_eq!(frame.intent, Intent::ProductSearch);
        assert_eq!(frame.entities.brands, vec!["Nike".to_string()]);
        assert!(approx(frame.confidence, 0.75));
    }

    #[test]
    fn test_vague_search_needs_clarification() {
        let c = IntentClassifier::default();
        let frame = c.classify("show me");
        assert_eq!(frame.intent, Intent::ProductSearch);
        assert!(frame.need_clarification);
        assert_eq!(
            frame.clarification_question.as_deref(),
            Some("What type of product are you looking for?")
        );
        assert_eq!(frame.suggested_options.len(), 5);
        assert!(c.needs_clarification(&frame));
    }

    #[test]
    fn test_attributes_color_and_size() {
        let attrs = extract_attributes("find black shoes size m");
        assert_eq!(attrs.get("color").map(String::as_str), Some("black"));
        assert_eq!(attrs.get("size").map(String::as_str), Some("M"));
        // m14 不是尺码
        assert!(extract_attributes("galaxy m14").get("size").is_none());
    }

    #[test]
    fn test_intent_order() {
        let c = IntentClassifier::default();
        assert_eq!(c.classify("iphone versus pixel").intent, Intent::ProductCompare);
        assert_eq!(c.classify("add to cart please").intent, Intent::AddToCart);
        assert_eq!(c.classify("proceed to payment").intent, Intent::Checkout);
        assert_eq!(c.classify("remove from cart").intent, Intent::RemoveFromCart);
        assert_eq!(c.classify("hello there").intent, Intent::GeneralChat);

        let cart = c.classify("view cart");
        assert_eq!(cart.intent, Intent::GeneralChat);
        assert!(cart.entities.show_cart);
    }

    #[test]
    fn test_order_status_entities() {
        let c = IntentClassifier::default();
        let frame = c.classify("track order ORD-12345");
        assert_eq!(frame.intent, Intent::OrderStatus);
        assert_eq!(frame.entities.order_id.as_deref(), Some("ORD-12345"));
        assert!(!frame.need_clarification);

        let frame = c.classify("what is my order status");
        assert!(frame.entities.order_id.is_none());
        assert!(frame.need_clarification);
    }

    #[test]
    fn test_add_to_cart_quantity() {
        let c = IntentClassifier::default();
        let frame = c.classify("add to cart 3 units");
        assert_eq!(frame.entities.quantity, Some(3));
    }

    #[test]
    fn test_followups_depend_on_results() {
        let c = IntentClassifier::default();
        assert!(c
            .suggested_followups(Intent::ProductSearch, true)
            .contains(&"Compare these products".to_string()));
        assert!(c
            .suggested_followups(Intent::ProductSearch, false)
            .contains(&"Try different keywords".to_string()));
    }
}
