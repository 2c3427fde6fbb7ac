use tokio_util::sync::CancellationToken;
use xiaolan_chat_lib::proxy::{AxumServer, ProxyConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    xiaolan_chat_lib::init_logging();
    let config = ProxyConfig::from_env().map_err(|e| {
        tracing::error!("加载配置失败: {}", e);
        e
    })?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("监听退出信号失败: {}", e);
            return;
        }
        tracing::info!("收到退出信号，正在关闭服务...");
        signal.cancel();
    });

    AxumServer::start(config, shutdown).await
}
