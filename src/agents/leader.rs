//! Leader Agent：意图识别与路由
//!
//! 意图来源优先级：任务上已有的非 GENERAL_CHAT 意图 → LLM 路由 → 规则分类器。
//! 找到目标 Agent 后直接转发其块流（保留 cards / comparison 等结构化块），
//! 吞掉内层 done，由 Leader 自己发出终止块；内层 error 直接结束 Leader 的流。
//! 委托守卫拒绝或目标未注册时退回通用聊天。

use std::sync::Arc;

use futures_util::{stream, StreamExt};
use serde_json::json;

use super::base::{record_agent_state, text_response, Agent};
use super::product_browsing::PRODUCT_BROWSING_AGENT;
use super::registry::AgentRegistry;
use super::shared_context::{AgentStatePatch, SharedContextStore};
use super::shopping::{SHOPPING_AGENT, VIEW_CART};
use super::types::{AgentStatus, AgentTask, Capability, ChunkStream, StreamChunk};
use crate::intent::{Intent, IntentClassifier, IntentFrame};
use crate::llm::LlmExtraction;

pub const LEADER_AGENT: &str = "LeaderAgent";
pub const CHECKOUT_AGENT: &str = "CheckoutAgent";
pub const CUSTOMER_SUPPORT_AGENT: &str = "CustomerSupportAgent";

/// LLM 给出的目标 Agent 超过该置信度才采用
const LLM_TARGET_CONFIDENCE: f64 = 0.7;

const GREETINGS: [&str; 4] = ["hi", "hello", "hey", "greetings"];

const GREETING_REPLY: &str = "Hello! I'm your commerce assistant. I can help you search for products, compare items, manage your cart, and complete purchases. How can I assist you today?";
const DEFAULT_REPLY: &str = "I'm here to help with your shopping needs. You can ask me to search for products, compare items, add to cart, or check out. What would you like to do?";

/// 意图 → 目标 Agent；GENERAL_CHAT 由 Leader 自己处理
pub fn target_for_intent(intent: Intent) -> Option<&'static str> {
    match intent {
        Intent::ProductSearch | Intent::ProductCompare => Some(PRODUCT_BROWSING_AGENT),
        Intent::AddToCart | Intent::UpdateCartQty | Intent::RemoveFromCart => Some(SHOPPING_AGENT),
        Intent::Checkout | Intent::CreateOrder => Some(CHECKOUT_AGENT),
        Intent::OrderStatus | Intent::PolicyQa => Some(CUSTOMER_SUPPORT_AGENT),
        Intent::GeneralChat => None,
    }
}

/// 路由结论
#[derive(Debug, Clone, PartialEq)]
struct Routing {
    intent: Intent,
    target: Option<String>,
    /// 规则分类结果（有用户原话时总会计算，用于补全参数）
    frame: Option<IntentFrame>,
}

pub struct LeaderAgent {
    classifier: Arc<IntentClassifier>,
    extraction: Option<Arc<LlmExtraction>>,
    use_llm_routing: bool,
    context: Option<Arc<SharedContextStore>>,
}

impl LeaderAgent {
    pub fn new(classifier: Arc<IntentClassifier>) -> Self {
        Self {
            classifier,
            extraction: None,
            use_llm_routing: false,
            context: None,
        }
    }

    pub fn with_llm_routing(mut self, extraction: Arc<LlmExtraction>, enabled: bool) -> Self {
        self.extraction = Some(extraction);
        self.use_llm_routing = enabled;
        self
    }

    pub fn with_shared_context(mut self, context: Arc<SharedContextStore>) -> Self {
        self.context = Some(context);
        self
    }

    async fn resolve(&self, task: &AgentTask) -> Routing {
        let frame = task.user_message().map(|m| self.classifier.classify(m));

        if task.intent != Intent::GeneralChat {
            return Routing {
                intent: task.intent,
                target: target_for_intent(task.intent).map(str::to_string),
                frame,
            };
        }

        let Some(message) = task.user_message() else {
            return Routing {
                intent: Intent::GeneralChat,
                target: None,
                frame,
            };
        };

        if let Some(extraction) = self.extraction.as_ref().filter(|_| self.use_llm_routing) {
            match extraction.detect_agent_routing(message).await {
                Ok(result) => {
                    tracing::info!(
                        task_id = %task.id,
                        intent = %result.intent,
                        target_agent = %result.target_agent,
                        confidence = result.confidence,
                        "llm routing"
                    );
                    let llm_target = (result.confidence > LLM_TARGET_CONFIDENCE
                        && self
                            .allowed_delegations()
                            .iter()
                            .any(|a| *a == result.target_agent))
                    .then(|| result.target_agent.clone());
                    return Routing {
                        intent: result.intent,
                        target: llm_target
                            .or_else(|| target_for_intent(result.intent).map(str::to_string)),
                        frame,
                    };
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "llm routing failed, using rules");
                }
            }
        }

        let (intent, target) = match &frame {
            Some(f) if f.entities.show_cart => (f.intent, Some(SHOPPING_AGENT.to_string())),
            Some(f) => (f.intent, target_for_intent(f.intent).map(str::to_string)),
            None => (Intent::GeneralChat, None),
        };
        tracing::debug!(task_id = %task.id, intent = %intent, "rule-based routing");
        Routing {
            intent,
            target,
            frame,
        }
    }

    /// 目标任务：类型改为意图名（购物车查看为 VIEW_CART），补上规则抽取的过滤条件与数量
    fn routed_task(&self, task: &AgentTask, routing: &Routing, target: &str) -> AgentTask {
        let mut routed = task.clone();
        routed.intent = routing.intent;
        routed.task_type = if target == SHOPPING_AGENT && !is_cart_intent(routing.intent) {
            VIEW_CART.to_string()
        } else {
            routing.intent.as_str().to_string()
        };

        if let Some(frame) = &routing.frame {
            if !frame.filters.is_empty() && !routed.parameters.contains_key("filters") {
                if let Ok(filters) = serde_json::to_value(&frame.filters) {
                    routed.parameters.insert("filters".into(), filters);
                }
            }
            if let Some(quantity) = frame.entities.quantity {
                routed
                    .parameters
                    .entry("quantity")
                    .or_insert_with(|| json!(quantity));
            }
            if let Some(order_id) = &frame.entities.order_id {
                routed
                    .parameters
                    .entry("orderId")
                    .or_insert_with(|| json!(order_id));
            }
        }
        routed
    }

    fn general_chat<'a>(&'a self, task: &AgentTask) -> ChunkStream<'a> {
        let message = task.user_message().unwrap_or_default().to_lowercase();
        let reply = if GREETINGS.iter().any(|g| message.contains(g)) {
            GREETING_REPLY
        } else {
            DEFAULT_REPLY
        };
        text_response(reply)
    }

    /// Leader 自行作答：先记下完成状态再回复
    async fn finish_with_chat<'a>(&'a self, task: &AgentTask) -> ChunkStream<'a> {
        record_agent_state(
            &self.context,
            task,
            self.name(),
            AgentStatePatch::finished(AgentStatus::Completed),
        )
        .await;
        self.general_chat(task)
    }

    async fn run<'a>(&'a self, task: AgentTask, registry: &'a AgentRegistry) -> ChunkStream<'a> {
        let routing = self.resolve(&task).await;
        record_agent_state(
            &self.context,
            &task,
            self.name(),
            AgentStatePatch::working(&task.id).with_memory("intent", json!(routing.intent)),
        )
        .await;

        let Some(target) = routing.target.as_deref() else {
            return self.finish_with_chat(&task).await;
        };

        let routed = self.routed_task(&task, &routing, target);
        let delegated = match self.prepare_delegation(target, &routed) {
            Ok(delegated) => delegated,
            Err(e) => {
                tracing::warn!(task_id = %task.id, target, error = %e, "delegation rejected, falling back to chat");
                return self.finish_with_chat(&task).await;
            }
        };
        let Some(agent) = registry.agent_ref(target).filter(|a| a.can_handle(&delegated)) else {
            tracing::warn!(task_id = %task.id, target, "target agent unavailable, falling back to chat");
            return self.finish_with_chat(&task).await;
        };

        tracing::info!(task_id = %task.id, target, intent = %routing.intent, "routing to specialised agent");
        self.relay(agent.execute(delegated, registry), task)
    }

    /// 转发子 Agent 的块流：吞掉 done，遇 error 即结束，正常结束后发出自己的 done
    fn relay<'a>(&'a self, inner: ChunkStream<'a>, task: AgentTask) -> ChunkStream<'a> {
        Box::pin(stream::unfold(Some((inner, task)), move |state| async move {
            let (mut inner, task) = state?;
            loop {
                match inner.next().await {
                    Some(StreamChunk::Done) => continue,
                    Some(chunk @ StreamChunk::Error { .. }) => {
                        record_agent_state(&self.context, &task, self.name(), AgentStatePatch::finished(AgentStatus::Failed)).await;
                        return Some((chunk, None));
                    }
                    Some(chunk) => return Some((chunk, Some((inner, task)))),
                    None => {
                        record_agent_state(&self.context, &task, self.name(), AgentStatePatch::finished(AgentStatus::Completed)).await;
                        return Some((StreamChunk::Done, None));
                    }
                }
            }
        }))
    }
}

fn is_cart_intent(intent: Intent) -> bool {
    matches!(
        intent,
        Intent::AddToCart | Intent::UpdateCartQty | Intent::RemoveFromCart
    )
}

impl Agent for LeaderAgent {
    fn name(&self) -> &str {
        LEADER_AGENT
    }

    fn capabilities(&self) -> &[Capability] {
        &Capability::ALL
    }

    fn priority(&self) -> i32 {
        100
    }

    fn allowed_delegations(&self) -> &[&'static str] {
        &[
            PRODUCT_BROWSING_AGENT,
            SHOPPING_AGENT,
            CHECKOUT_AGENT,
            "ReasoningAgent",
            CUSTOMER_SUPPORT_AGENT,
            "AnalyticsAgent",
        ]
    }

    /// 兜底 Agent
    fn can_handle(&self, _task: &AgentTask) -> bool {
        true
    }

    fn execute<'a>(&'a self, task: AgentTask, registry: &'a AgentRegistry) -> ChunkStream<'a> {
        tracing::info!(task_id = %task.id, task_type = %task.task_type, intent = %task.intent, "leader executing");
        Box::pin(stream::once(self.run(task, registry)).flatten())
    }
}
