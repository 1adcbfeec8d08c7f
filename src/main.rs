//! Commerce Orchestrator - 行式演示驱动
//!
//! 从 stdin 逐行读取用户消息，每个输出块打印为一行 JSON。
//! 会话 id 由 `--session <id>` 指定，缺省时生成新的 uuid。
//! 输入 `/reload` 时重新读取配置并热更新缓存 TTL 与熔断参数。

use anyhow::Context;
use commerce_orchestrator::config::{load_config, reload_config};
use commerce_orchestrator::{observability, Services};
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};

const DEMO_USER: &str = "demo-user";
const RELOAD_COMMAND: &str = "/reload";

fn session_from_args() -> anyhow::Result<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--session" {
            return args.next().context("--session requires a value");
        }
    }
    Ok(uuid::Uuid::new_v4().to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let session_id = session_from_args()?;
    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });
    let services = Services::from_config(&cfg).context("Failed to wire services")?;
    tracing::info!(session_id = %session_id, "ready, reading messages from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message == RELOAD_COMMAND {
            match reload_config() {
                Ok(cfg) => services.apply_reloaded(&cfg).await,
                Err(e) => tracing::warn!("Config reload failed ({}), keeping current settings", e),
            }
            continue;
        }
        let mut chunks = services
            .coordinator
            .process_message(&session_id, DEMO_USER, message, None);
        while let Some(chunk) = chunks.next().await {
            println!("{}", serde_json::to_string(&chunk)?);
        }
    }

    Ok(())
}
