use dashmap::DashMap;
use std::sync::Arc;

use crate::proxy::converter::ChatMessage;

/// 默认消息过期时间: 30 天
pub const DEFAULT_EXPIRY_SECS: u64 = 30 * 24 * 60 * 60;

/// 粗略估算 token 数
///
/// 非 ASCII 字符各算 1 个 token，连续 ASCII 字符每 4 个算 1 个（向上取整）
pub fn estimate_tokens(text: &str) -> u32 {
    let mut tokens = 0u32;
    let mut ascii_run = 0u32;

    for ch in text.chars() {
        if ch.is_ascii() {
            ascii_run += 1;
        } else {
            tokens += ascii_run.div_ceil(4);
            ascii_run = 0;
            tokens += 1;
        }
    }

    tokens + ascii_run.div_ceil(4)
}

/// 消息条目
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub message: ChatMessage,
    /// 写入时间戳（Unix 秒）
    pub created_at: i64,
}

impl StoredMessage {
    pub fn new(message: ChatMessage) -> Self {
        Self {
            message,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// 检查消息是否过期
    ///
    /// # 参数
    /// - `expiry_secs`: 过期时间（秒）
    ///
    /// # 返回
    /// - `true`: 已过期
    /// - `false`: 未过期
    pub fn is_expired(&self, expiry_secs: u64) -> bool {
        let now = chrono::Utc::now().timestamp();
        (now - self.created_at).max(0) as u64 > expiry_secs
    }
}

/// 对话消息存储
///
/// 按消息 id 保存每一轮的用户消息和回复，
/// 通过 parentMessageId 串起历史记录
pub struct MessageStore {
    /// message.id -> StoredMessage
    messages: Arc<DashMap<String, StoredMessage>>,
    expiry_secs: u64,
}

impl MessageStore {
    pub fn new(expiry_secs: u64) -> Self {
        Self {
            messages: Arc::new(DashMap::new()),
            expiry_secs,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_EXPIRY_SECS)
    }

    pub fn upsert(&self, message: ChatMessage) {
        let id = message.id.clone();
        self.messages.insert(id.clone(), StoredMessage::new(message));
        tracing::debug!("已存储消息: {} (当前缓存数: {})", id, self.messages.len());
    }

    /// 获取未过期的消息
    pub fn get(&self, id: &str) -> Option<ChatMessage> {
        let entry = self.messages.get(id)?;
        if entry.is_expired(self.expiry_secs) {
            return None;
        }
        Some(entry.message.clone())
    }

    /// 从 parent_id 开始向前回溯历史，直到超出 token 预算
    ///
    /// # 参数
    /// - `parent_id`: 最近一条消息的 id，None 时没有历史
    /// - `budget`: 可用的 token 数
    ///
    /// # 返回
    /// 按时间从旧到新排列的消息
    pub fn history(&self, parent_id: Option<&str>, budget: u32) -> Vec<ChatMessage> {
        let mut history = Vec::new();
        let mut remaining = budget;
        let mut next_id = parent_id.map(|s| s.to_string());

        while let Some(id) = next_id {
            let Some(message) = self.get(&id) else {
                break;
            };

            let tokens = estimate_tokens(&message.text);
            if tokens > remaining {
                break;
            }
            remaining -= tokens;

            // 防止环形引用导致死循环
            if history.iter().any(|m: &ChatMessage| m.id == message.id) {
                tracing::warn!("消息链存在循环引用: {}", message.id);
                break;
            }

            next_id = message.parent_message_id.clone();
            history.push(message);
        }

        history.reverse();
        history
    }

    /// 清理过期消息，返回清理数量
    pub fn cleanup_expired(&self) -> usize {
        let before = self.messages.len();
        let expiry_secs = self.expiry_secs;
        self.messages.retain(|_, entry| !entry.is_expired(expiry_secs));
        let removed = before.saturating_sub(self.messages.len());

        if removed > 0 {
            tracing::info!(
                "已清理 {} 条过期消息 (剩余: {})",
                removed,
                self.messages.len()
            );
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[cfg(test)]
    fn insert_with_timestamp(&self, message: ChatMessage, created_at: i64) {
        self.messages
            .insert(message.id.clone(), StoredMessage { message, created_at });
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}
