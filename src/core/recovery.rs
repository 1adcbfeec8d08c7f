//! 错误恢复引擎
//!
//! 根据 OrchestratorError 返回 RecoveryAction：仅熔断打开与可重试的工具 / LLM 失败会触发自动恢复，
//! 其余错误对当前任务直接终止。

use crate::core::OrchestratorError;

/// 恢复引擎给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待 delay_ms 后重试（线性退避）
    RetryWithBackoff { delay_ms: u64 },
    /// 使用降级响应
    Fallback,
    /// 终止当前任务
    Abort,
}

/// 语义化错误恢复：错误 + 当前尝试次数 → 动作
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_attempts: u32,
    base_delay_ms: u64,
}

impl RecoveryEngine {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// attempt 从 1 开始；最后一次尝试之后不再重试
    pub fn handle(&self, err: &OrchestratorError, attempt: u32) -> RecoveryAction {
        match err {
            OrchestratorError::ServiceUnavailable(_) => RecoveryAction::Fallback,
            e if e.is_retryable() && attempt < self.max_attempts => {
                RecoveryAction::RetryWithBackoff {
                    delay_ms: self.base_delay_ms * attempt as u64,
                }
            }
            _ => RecoveryAction::Abort,
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(3, 1000)
    }
}
