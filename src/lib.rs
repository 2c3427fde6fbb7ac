pub mod proxy;

use tracing_subscriber::EnvFilter;

/// 初始化日志，优先读取 RUST_LOG
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"));

    if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        eprintln!("日志初始化失败: {}", e);
    }
}
