//! 购物车 Agent：加购 / 改数量 / 删除 / 查看
//!
//! 每个写操作先校验参数，再带幂等键（`{taskId}-add|update|remove`）调用工具服务，
//! 成功后输出 cart_updated 块并清除该用户的购物车缓存；任何失败都转为 error 块。

use std::sync::Arc;

use futures_util::{stream, StreamExt};
use serde_json::{json, Value};

use super::base::{record_agent_state, Agent};
use super::registry::AgentRegistry;
use super::shared_context::{AgentStatePatch, SharedContextStore};
use super::types::{AgentStatus, AgentTask, CartAction, Capability, ChunkStream, StreamChunk};
use crate::core::OrchestratorError;
use crate::intent::Intent;
use crate::tools::{commerce, ToolGateway};

pub const SHOPPING_AGENT: &str = "ShoppingAgent";

/// 查看购物车的任务类型（无对应 Intent）
pub const VIEW_CART: &str = "VIEW_CART";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CartOperation {
    Add,
    Update,
    Remove,
    View,
}

impl CartOperation {
    fn of(task: &AgentTask) -> Option<Self> {
        match (task.intent, task.task_type.as_str()) {
            (Intent::AddToCart, _) | (_, "ADD_TO_CART") => Some(CartOperation::Add),
            (Intent::UpdateCartQty, _) | (_, "UPDATE_CART_QTY") => Some(CartOperation::Update),
            (Intent::RemoveFromCart, _) | (_, "REMOVE_FROM_CART") => Some(CartOperation::Remove),
            (_, VIEW_CART) => Some(CartOperation::View),
            _ => None,
        }
    }

    fn tool(self) -> &'static str {
        match self {
            CartOperation::Add => commerce::CART_ADD_ITEM,
            CartOperation::Update => commerce::CART_UPDATE_ITEM_QTY,
            CartOperation::Remove => commerce::CART_REMOVE_ITEM,
            CartOperation::View => commerce::CART_GET,
        }
    }

    fn required_parameters(self) -> &'static [&'static str] {
        match self {
            CartOperation::Add | CartOperation::Update => &["productId", "quantity"],
            CartOperation::Remove => &["productId"],
            CartOperation::View => &[],
        }
    }

    fn failure_message(self) -> &'static str {
        match self {
            CartOperation::Add => "Failed to add item to cart",
            CartOperation::Update => "Failed to update cart quantity",
            CartOperation::Remove => "Failed to remove item from cart",
            CartOperation::View => "Failed to retrieve cart",
        }
    }
}

pub struct ShoppingAgent {
    gateway: Arc<ToolGateway>,
    context: Option<Arc<SharedContextStore>>,
}

impl ShoppingAgent {
    pub fn new(gateway: Arc<ToolGateway>) -> Self {
        Self {
            gateway,
            context: None,
        }
    }

    pub fn with_shared_context(mut self, context: Arc<SharedContextStore>) -> Self {
        self.context = Some(context);
        self
    }

    async fn run(&self, task: AgentTask) -> Vec<StreamChunk> {
        record_agent_state(&self.context, &task, self.name(), AgentStatePatch::working(&task.id)).await;

        let result = match CartOperation::of(&task) {
            Some(operation) => self.perform(operation, &task).await,
            None => Err(OrchestratorError::UnsupportedIntent(task.intent.to_string())),
        };

        let (status, chunks) = match result {
            Ok(chunk) => (AgentStatus::Completed, vec![chunk, StreamChunk::Done]),
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "cart operation failed");
                (AgentStatus::Failed, vec![StreamChunk::error(e.to_string())])
            }
        };
        record_agent_state(&self.context, &task, self.name(), AgentStatePatch::finished(status)).await;
        chunks
    }

    async fn perform(
        &self,
        operation: CartOperation,
        task: &AgentTask,
    ) -> Result<StreamChunk, OrchestratorError> {
        task.validate_parameters(operation.required_parameters())?;
        let user_id = task.context.user_id.as_str();
        let request = cart_request(operation, task)?;

        tracing::info!(task_id = %task.id, user_id, operation = ?operation, "cart operation");
        let cart = self
            .gateway
            .execute(operation.tool(), request, task.trace_id())
            .await?
            .into_data(operation.tool(), operation.failure_message())?;

        if operation != CartOperation::View {
            self.gateway.cache().invalidate_user_cache(user_id).await;
        }

        let (action, message) = match operation {
            CartOperation::Add => (
                CartAction::Added,
                format!("Added {} item(s) to cart", quantity(task).unwrap_or(1)),
            ),
            CartOperation::Update => (
                CartAction::QuantityUpdated,
                format!("Updated quantity to {}", quantity(task).unwrap_or(1)),
            ),
            CartOperation::Remove => (CartAction::Removed, "Item removed from cart".to_string()),
            CartOperation::View => (
                CartAction::Viewed,
                format!(
                    "Your cart has {} item(s)",
                    cart.get("itemCount").and_then(Value::as_u64).unwrap_or(0)
                ),
            ),
        };
        Ok(StreamChunk::CartUpdated {
            action,
            cart,
            message,
        })
    }
}

impl Agent for ShoppingAgent {
    fn name(&self) -> &str {
        SHOPPING_AGENT
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Cart]
    }

    fn priority(&self) -> i32 {
        70
    }

    fn can_handle(&self, task: &AgentTask) -> bool {
        CartOperation::of(task).is_some()
    }

    fn execute<'a>(&'a self, task: AgentTask, _registry: &'a AgentRegistry) -> ChunkStream<'a> {
        tracing::info!(task_id = %task.id, task_type = %task.task_type, "shopping executing");
        Box::pin(stream::once(self.run(task)).flat_map(stream::iter))
    }
}

/// 数量参数：正整数或数字字符串
fn quantity(task: &AgentTask) -> Option<u64> {
    match task.parameters.get("quantity")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|q| *q > 0)
}

fn cart_request(operation: CartOperation, task: &AgentTask) -> Result<Value, OrchestratorError> {
    let user_id = &task.context.user_id;
    let product_id = task.parameters.get("productId").cloned().unwrap_or(Value::Null);
    let positive_quantity = || {
        quantity(task).ok_or_else(|| {
            OrchestratorError::InvalidParameters("quantity must be a positive integer".to_string())
        })
    };

    Ok(match operation {
        CartOperation::Add => json!({
            "userId": user_id,
            "productId": product_id,
            "provider": task.param_str("provider").unwrap_or("default"),
            "quantity": positive_quantity()?,
            "idempotencyKey": format!("{}-add", task.id),
        }),
        CartOperation::Update => json!({
            "userId": user_id,
            "productId": product_id,
            "quantity": positive_quantity()?,
            "idempotencyKey": format!("{}-update", task.id),
        }),
        CartOperation::Remove => json!({
            "userId": user_id,
            "productId": product_id,
            "idempotencyKey": format!("{}-remove", task.id),
        }),
        CartOperation::View => json!({ "userId": user_id }),
    })
}
