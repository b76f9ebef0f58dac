//! glterm 入口点
//!
//! 启动 HTTP / WebSocket 服务，为每个浏览器连接提供伪终端会话。

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use glterm::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // 日志输出到 stderr；过滤级别依次取 RUST_LOG、LOG_LEVEL，默认 info
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    tracing::info!("glterm {} 启动", env!("CARGO_PKG_VERSION"));

    glterm::gateway::server::run(config).await
}
