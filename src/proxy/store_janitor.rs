use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::proxy::message_store::MessageStore;

/// 消息清理器
/// 定期清理消息存储中的过期对话
pub struct StoreJanitor {
    /// 清理间隔（毫秒）- 默认 10 分钟
    interval_ms: u64,
    /// 取消信号
    cancel_token: CancellationToken,
}

impl StoreJanitor {
    /// 创建新的清理器
    ///
    /// # 参数
    /// - `interval_ms`: 清理间隔（毫秒），默认 600000 (10分钟)
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(10 * 60 * 1000)
    }

    /// 绑定外部取消信号，外部取消时一并停止
    ///
    /// # 参数
    /// - `interval_ms`: 清理间隔（毫秒）
    /// - `parent`: 服务的关闭信号，清理器使用它的子令牌
    pub fn with_parent(interval_ms: u64, parent: &CancellationToken) -> Self {
        Self {
            interval_ms,
            cancel_token: parent.child_token(),
        }
    }

    /// 启动后台清理任务
    ///
    /// # 参数
    /// - `store`: MessageStore 的 Arc 引用
    ///
    /// # 返回
    /// 后台任务句柄，取消后任务自行退出
    pub fn start(&self, store: Arc<MessageStore>) -> tokio::task::JoinHandle<()> {
        let cancel_token = self.cancel_token.clone();
        let interval_ms = self.interval_ms;

        tokio::spawn(async move {
            tracing::info!("消息清理任务已启动 (间隔: {}ms)", interval_ms);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::info!("消息清理任务已停止");
                        break;
                    }
                    _ = tokio::time::sleep(tokio::time::Duration::from_millis(interval_ms)) => {
                        store.cleanup_expired();
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        tracing::info!("正在停止消息清理任务...");
        self.cancel_token.cancel();
    }
}

impl Default for StoreJanitor {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::converter::{ChatMessage, Role};

    #[tokio::test]
    async fn test_janitor_removes_expired_messages() {
        // 过期时间为 0，任何超过 1 秒的消息都视为过期
        let store = Arc::new(MessageStore::new(0));
        store.upsert(ChatMessage::new("m1", Role::User, "hello"));

        let janitor = StoreJanitor::new(50);
        let handle = janitor.start(store.clone());

        tokio::time::sleep(tokio::time::Duration::from_millis(1300)).await;
        assert!(store.is_empty());

        janitor.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_janitor() {
        let parent = CancellationToken::new();
        let janitor = StoreJanitor::with_parent(60_000, &parent);
        let handle = janitor.start(Arc::new(MessageStore::with_defaults()));

        parent.cancel();
        tokio::time::timeout(tokio::time::Duration::from_secs(1), handle)
            .await
            .expect("janitor should stop")
            .unwrap();
    }
}
