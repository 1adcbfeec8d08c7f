//! 编排入口：一条用户消息 → 一条块流
//!
//! 负责：确保共享上下文存在、保存对话轮次、规则分类（必要时直接澄清）、
//! 构造 USER_MESSAGE 任务交给注册表执行，并在 done 之前补发后续建议。

use std::sync::Arc;
use std::time::Instant;

use futures_util::{stream, StreamExt};
use serde_json::{json, Map, Value};

use crate::agents::{
    AgentRegistry, AgentTask, ChunkStream, SharedContextStore, StreamChunk, TaskContext,
    LEADER_AGENT,
};
use crate::core::{sanitize_error, OrchestratorError};
use crate::intent::{Intent, IntentClassifier, IntentFrame};
use crate::memory::{ConversationStore, Message};

pub const USER_MESSAGE: &str = "USER_MESSAGE";

const FALLBACK_CLARIFICATION: &str = "Could you tell me a bit more about what you're looking for?";

/// 一次用户请求
#[derive(Debug, Clone, Default)]
pub struct UserRequest {
    pub session_id: String,
    pub user_id: String,
    pub message: String,
    pub trace_id: Option<String>,
    /// 宿主附带的结构化参数（如 productId），并入任务参数
    pub parameters: Map<String, Value>,
}

impl UserRequest {
    pub fn new(session_id: &str, user_id: &str, message: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            message: message.to_string(),
            ..Default::default()
        }
    }

    pub fn with_trace_id(mut self, trace_id: &str) -> Self {
        self.trace_id = Some(trace_id.to_string());
        self
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }
}

pub struct Coordinator {
    registry: Arc<AgentRegistry>,
    classifier: Arc<IntentClassifier>,
    context: Arc<SharedContextStore>,
    conversations: Arc<dyn ConversationStore>,
    debug_mode: bool,
}

/// 流状态机
enum Phase<'a> {
    Start(UserRequest),
    Relay(ChunkStream<'a>, Box<Turn>),
    Emit(Vec<StreamChunk>),
    Finished,
}

/// 正在转发的一轮回复
struct Turn {
    session_id: String,
    trace_id: String,
    intent: Intent,
    reply: String,
    has_cards: bool,
    started: Instant,
}

impl Coordinator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        classifier: Arc<IntentClassifier>,
        context: Arc<SharedContextStore>,
        conversations: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            registry,
            classifier,
            context,
            conversations,
            debug_mode: false,
        }
    }

    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn shared_context(&self) -> &Arc<SharedContextStore> {
        &self.context
    }

    pub fn conversations(&self) -> &Arc<dyn ConversationStore> {
        &self.conversations
    }

    pub fn process_message(
        &self,
        session_id: &str,
        user_id: &str,
        message: &str,
        trace_id: Option<&str>,
    ) -> ChunkStream<'_> {
        let mut request = UserRequest::new(session_id, user_id, message);
        request.trace_id = trace_id.map(str::to_string);
        self.process_request(request)
    }

    pub fn process_request(&self, request: UserRequest) -> ChunkStream<'_> {
        Box::pin(stream::unfold(Phase::Start(request), move |phase| async move {
            let mut phase = phase;
            loop {
                match phase {
                    Phase::Start(request) => phase = self.start(request).await,
                    Phase::Relay(mut inner, mut turn) => {
                        return match inner.next().await {
                            Some(StreamChunk::Done) => {
                                let chunks = self.finish(&turn).await;
                                let mut chunks = chunks.into_iter();
                                let first = chunks.next()?;
                                Some((first, Phase::Emit(chunks.collect())))
                            }
                            Some(chunk @ StreamChunk::Error { .. }) => {
                                self.save_assistant_turn(&turn.session_id, &turn.reply).await;
                                tracing::warn!(
                                    trace_id = %turn.trace_id,
                                    duration_ms = turn.started.elapsed().as_millis() as u64,
                                    "request ended with error"
                                );
                                Some((chunk, Phase::Finished))
                            }
                            Some(chunk) => {
                                match &chunk {
                                    StreamChunk::Token { content } => turn.reply.push_str(content),
                                    StreamChunk::Cards { products } if !products.is_empty() => {
                                        turn.has_cards = true
                                    }
                                    _ => {}
                                }
                                Some((chunk, Phase::Relay(inner, turn)))
                            }
                            None => None,
                        };
                    }
                    Phase::Emit(mut pending) => {
                        if pending.is_empty() {
                            return None;
                        }
                        let chunk = pending.remove(0);
                        return Some((chunk, Phase::Emit(pending)));
                    }
                    Phase::Finished => return None,
                }
            }
        }))
    }

    /// 初始化；返回下一阶段
    async fn start<'a>(&'a self, request: UserRequest) -> Phase<'a> {
        let trace_id = request
            .trace_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        tracing::info!(
            trace_id = %trace_id,
            session_id = %request.session_id,
            "processing message"
        );

        if let Err(e) = self.save_user_turn(&request).await {
            tracing::error!(trace_id = %trace_id, error = %e, "request setup failed");
            return Phase::Emit(vec![StreamChunk::error(sanitize_error(
                &e,
                self.debug_mode,
                &trace_id,
            ))]);
        }

        let frame = self.classifier.classify(&request.message);
        if frame.need_clarification && !clarification_satisfied(&frame, &request.parameters) {
            let chunk = self.clarification(&frame, &request.message);
            if let StreamChunk::Clarification { question, .. } = &chunk {
                self.save_assistant_turn(&request.session_id, question).await;
            }
            tracing::info!(trace_id = %trace_id, intent = %frame.intent, "asking for clarification");
            return Phase::Emit(vec![chunk, StreamChunk::Done]);
        }

        let task = build_task(&request, &trace_id);
        if let Err(e) = self.context.add_task(&request.session_id, task.clone()).await {
            tracing::warn!(trace_id = %trace_id, error = %e, "failed to record task");
        }

        let turn = Turn {
            session_id: request.session_id,
            trace_id,
            intent: frame.intent,
            reply: String::new(),
            has_cards: false,
            started: Instant::now(),
        };
        Phase::Relay(self.registry.execute_task(task), Box::new(turn))
    }

    async fn save_user_turn(&self, request: &UserRequest) -> Result<(), OrchestratorError> {
        self.context
            .get_or_create_context(&request.session_id, &request.user_id, json!({}))
            .await?;
        let message = Message::user(request.message.clone());
        self.conversations
            .save_message(&request.session_id, message.clone())
            .await?;
        if let Err(e) = self.context.add_message(&request.session_id, message).await {
            tracing::warn!(session_id = %request.session_id, error = %e, "failed to save user turn to context");
        }
        Ok(())
    }

    async fn save_assistant_turn(&self, session_id: &str, reply: &str) {
        if reply.is_empty() {
            return;
        }
        let message = Message::assistant(reply);
        if let Err(e) = self.conversations.save_message(session_id, message.clone()).await {
            tracing::warn!(session_id, error = %e, "failed to save assistant turn");
        }
        if let Err(e) = self.context.add_message(session_id, message).await {
            tracing::warn!(session_id, error = %e, "failed to save assistant turn to context");
        }
    }

    /// followups + done
    async fn finish(&self, turn: &Turn) -> Vec<StreamChunk> {
        self.save_assistant_turn(&turn.session_id, &turn.reply).await;
        let intent = self
            .routed_intent(&turn.session_id)
            .await
            .unwrap_or(turn.intent);
        tracing::info!(
            trace_id = %turn.trace_id,
            intent = %intent,
            duration_ms = turn.started.elapsed().as_millis() as u64,
            "request completed"
        );
        vec![
            StreamChunk::Followups {
                suggestions: self.classifier.suggested_followups(intent, turn.has_cards),
            },
            StreamChunk::Done,
        ]
    }

    /// Leader 记录在 workingMemory.intent 中的路由意图
    async fn routed_intent(&self, session_id: &str) -> Option<Intent> {
        let state = self
            .context
            .get_agent_state(session_id, LEADER_AGENT)
            .await
            .ok()??;
        state
            .working_memory
            .get("intent")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn clarification(&self, frame: &IntentFrame, message: &str) -> StreamChunk {
        let prompt = self
            .classifier
            .clarification_prompt(frame.intent, &message.to_lowercase());
        let question = frame
            .clarification_question
            .clone()
            .or_else(|| prompt.as_ref().map(|p| p.question.clone()))
            .unwrap_or_else(|| FALLBACK_CLARIFICATION.to_string());
        let options = if frame.suggested_options.is_empty() {
            prompt.map(|p| p.options).unwrap_or_default()
        } else {
            frame.suggested_options.clone()
        };
        StreamChunk::Clarification {
            question,
            options,
            intent: frame.intent,
        }
    }
}

/// 宿主参数已提供澄清所需信息时直接执行
fn clarification_satisfied(frame: &IntentFrame, params: &Map<String, Value>) -> bool {
    match frame.intent {
        Intent::AddToCart | Intent::ProductSearch => params.contains_key("productId"),
        Intent::ProductCompare => params
            .get("productIds")
            .and_then(Value::as_array)
            .is_some_and(|ids| ids.len() >= 2),
        Intent::OrderStatus => params.contains_key("orderId"),
        _ => false,
    }
}

fn build_task(request: &UserRequest, trace_id: &str) -> AgentTask {
    let mut task = AgentTask::new(
        USER_MESSAGE,
        Intent::GeneralChat,
        TaskContext::new(&request.session_id, &request.user_id),
    )
    .with_priority(1)
    .with_trace_id(trace_id);
    task.parameters = request.parameters.clone();
    for key in ["message", "query", "userMessage"] {
        task.parameters
            .insert(key.to_string(), Value::String(request.message.clone()));
    }
    task
}
