//! 可观测性：日志初始化与工具审计行

use std::time::Instant;

use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 审计日志中参数预览的最大字符数
pub const ARGS_PREVIEW_CHARS: usize = 200;

/// 安装全局 subscriber：默认 info，可通过 RUST_LOG 覆盖；重复调用无副作用
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// 每次工具调用一行 JSON 审计
pub fn tool_audit(trace_id: &str, tool: &str, ok: bool, outcome: &str, start: Instant, args: &Value) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "trace_id": trace_id,
        "tool": tool,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": start.elapsed().as_millis() as u64,
        "args_preview": args_preview(args),
    });
    tracing::info!(audit = %audit, "tool");
}

pub fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}
