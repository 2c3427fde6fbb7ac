use std::sync::Arc;

use tokio::sync::mpsc;

use crate::proxy::client::{ChatApi, CompletionParams, SendMessageOptions};
use crate::proxy::config::{ApiModel, ModelConfig, ProxyConfig};
use crate::proxy::converter::{ApiResponse, ChatContext, ChatMessage};
use crate::proxy::error::ChatError;
use crate::proxy::error_mapper::user_facing_message;
use crate::proxy::message_store::MessageStore;

/// 一次对话请求
#[derive(Debug, Default)]
pub struct RequestOptions {
    pub message: String,
    pub last_context: Option<ChatContext>,
    pub system_message: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    /// 流式进度回调
    pub progress: Option<mpsc::UnboundedSender<ChatMessage>>,
}

/// 对话服务，持有配置和上游客户端
pub struct ChatService {
    config: ProxyConfig,
    api: ChatApi,
    store: Arc<MessageStore>,
}

impl ChatService {
    pub fn new(config: ProxyConfig) -> Result<Self, ChatError> {
        let store = Arc::new(MessageStore::with_defaults());
        let api = ChatApi::from_config(&config, store.clone())?;

        tracing::info!(
            "上游模式: {:?}, 模型: {}, 超时: {}ms",
            api.api_model(),
            config.model,
            config.timeout_ms
        );

        Ok(Self { config, api, store })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<MessageStore> {
        self.store.clone()
    }

    /// 组装上游参数
    ///
    /// 官方 API 带上 system message 与采样参数，只续接 parentMessageId；
    /// 反代模式沿用完整上下文
    fn build_options(&self, options: RequestOptions) -> (String, SendMessageOptions) {
        let RequestOptions {
            message,
            last_context,
            system_message,
            temperature,
            top_p,
            progress,
        } = options;

        let mut send_options = SendMessageOptions {
            timeout: self.config.timeout(),
            progress,
            ..Default::default()
        };

        match self.api.api_model() {
            ApiModel::ChatGptApi => {
                send_options.system_message = system_message.filter(|s| !s.trim().is_empty());
                send_options.completion_params = Some(CompletionParams {
                    model: self.config.model.clone(),
                    temperature,
                    top_p,
                });
                if let Some(context) = last_context {
                    send_options.parent_message_id = context.parent_message_id;
                }
            }
            ApiModel::ChatGptUnofficialProxyApi => {
                if let Some(context) = last_context {
                    send_options.parent_message_id = context.parent_message_id;
                    send_options.conversation_id = context.conversation_id;
                }
            }
        }

        (message, send_options)
    }

    /// 发送消息并返回统一响应
    pub async fn chat_reply_process(&self, options: RequestOptions) -> ApiResponse<ChatMessage> {
        let (message, send_options) = self.build_options(options);

        match self.api.send_message(&message, send_options).await {
            Ok(response) => ApiResponse::success(response),
            Err(e) => {
                tracing::error!("对话请求失败: {}", e);
                ApiResponse::fail(user_facing_message(&e))
            }
        }
    }

    pub fn chat_config(&self) -> ApiResponse<ModelConfig> {
        ApiResponse::success(self.config.model_config())
    }

    pub fn current_model(&self) -> ApiModel {
        self.api.api_model()
    }
}
