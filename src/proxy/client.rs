// 上游客户端 - 官方 API (API Key) 与非官方反代 (Access Token) 两种模式

use std::sync::Arc;
use std::time::Duration;

use eventsource_stream::{EventStreamError, Eventsource};
use futures::StreamExt;
use reqwest::{header, Client, Response};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::proxy::config::{ApiModel, ProxyConfig};
use crate::proxy::converter::{
    ChatMessage, ConversationRequest, ConversationResponseEvent, OpenAIChatRequest,
    OpenAIChatResponse, OpenAIMessage, OpenAIStreamChunk, Role,
};
use crate::proxy::error::ChatError;
use crate::proxy::message_store::{estimate_tokens, MessageStore};
use crate::proxy::model_limits::{token_limits, TokenLimits};
use crate::proxy::transport::{build_http_client, ProxyAgent};

/// 补全参数
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionParams {
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

/// 单次发送的参数
#[derive(Debug, Clone, Default)]
pub struct SendMessageOptions {
    pub parent_message_id: Option<String>,
    pub conversation_id: Option<String>,
    /// 仅官方 API 生效
    pub system_message: Option<String>,
    /// 仅官方 API 生效
    pub completion_params: Option<CompletionParams>,
    pub timeout: Option<Duration>,
    /// 设置后以流式请求上游，每次更新推送一份消息快照
    pub progress: Option<mpsc::UnboundedSender<ChatMessage>>,
}

fn default_system_message() -> String {
    let today = chrono::Local::now().format("%Y-%m-%d");
    format!(
        "You are ChatGPT, a large language model trained by OpenAI. Answer as concisely as possible.\nKnowledge cutoff: 2021-09-01\nCurrent date: {}",
        today
    )
}

fn transport_error(e: reqwest::Error) -> ChatError {
    if e.is_timeout() {
        ChatError::Timeout
    } else {
        ChatError::Transport(e)
    }
}

fn sse_error(e: EventStreamError<reqwest::Error>) -> ChatError {
    match e {
        EventStreamError::Transport(e) => transport_error(e),
        other => ChatError::Stream(format!("SSE stream error: {}", other)),
    }
}

/// 非 2xx 响应转换为上游错误
async fn ensure_success(response: Response, label: &str) -> Result<Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ChatError::Upstream {
        status: status.as_u16(),
        message: format!("{} error {}: {}", label, status.as_u16(), body),
    })
}

/// 提取 SSE 数据中的 error 信息
fn extract_stream_error(event_json: &Value) -> Option<String> {
    let error = event_json.get("error")?;
    if error.is_null() {
        return None;
    }
    if let Some(message) = error.get("message").and_then(|v| v.as_str()) {
        return Some(message.to_string());
    }
    if let Some(message) = error.as_str() {
        return Some(message.to_string());
    }
    Some("An error occurred during streaming".to_string())
}

// ===== 官方 API =====

/// 官方 OpenAI 兼容接口客户端
pub struct OfficialClient {
    http: Client,
    api_key: String,
    api_base_url: String,
    model: String,
    limits: TokenLimits,
    store: Arc<MessageStore>,
    debug: bool,
}

impl OfficialClient {
    pub fn new(
        http: Client,
        api_key: String,
        api_base_url: String,
        model: String,
        store: Arc<MessageStore>,
        debug: bool,
    ) -> Self {
        let limits = token_limits(&model);
        Self {
            http,
            api_key,
            api_base_url,
            model,
            limits,
            store,
            debug,
        }
    }

    pub fn limits(&self) -> TokenLimits {
        self.limits
    }

    /// 组装 system + 历史 + 当前消息，返回消息列表和估算 token 数
    fn build_messages(
        &self,
        text: &str,
        options: &SendMessageOptions,
    ) -> (Vec<OpenAIMessage>, u32) {
        let system_message = options
            .system_message
            .clone()
            .unwrap_or_else(default_system_message);

        let fixed_tokens = estimate_tokens(&system_message) + estimate_tokens(text);
        let budget = self.limits.prompt_budget().saturating_sub(fixed_tokens);
        let history = self
            .store
            .history(options.parent_message_id.as_deref(), budget);

        let mut num_tokens = fixed_tokens;
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(OpenAIMessage {
            role: Role::System,
            content: system_message,
            name: None,
        });
        for message in history {
            num_tokens += estimate_tokens(&message.text);
            messages.push(OpenAIMessage {
                role: message.role,
                content: message.text,
                name: message.name,
            });
        }
        messages.push(OpenAIMessage {
            role: Role::User,
            content: text.to_string(),
            name: None,
        });

        (messages, num_tokens)
    }

    pub async fn send_message(
        &self,
        text: &str,
        options: SendMessageOptions,
    ) -> Result<ChatMessage, ChatError> {
        let mut user_message = ChatMessage::new(Uuid::new_v4().to_string(), Role::User, text);
        user_message.parent_message_id = options.parent_message_id.clone();
        user_message.conversation_id = options.conversation_id.clone();

        let (messages, num_tokens) = self.build_messages(text, &options);
        let max_tokens = self
            .limits
            .max_model_tokens
            .saturating_sub(num_tokens)
            .min(self.limits.max_response_tokens)
            .max(1);

        let params = options.completion_params.clone().unwrap_or(CompletionParams {
            model: self.model.clone(),
            temperature: None,
            top_p: None,
        });
        let stream = options.progress.is_some();

        let body = OpenAIChatRequest {
            model: params.model,
            messages,
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: Some(max_tokens),
            stream,
        };

        let url = format!("{}/chat/completions", self.api_base_url);
        if self.debug {
            tracing::debug!(
                "sendMessage ({} tokens, max_tokens {}) -> {}: {}",
                num_tokens,
                max_tokens,
                url,
                serde_json::to_string(&body).unwrap_or_default()
            );
        }

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = ensure_success(response, "OpenAI").await?;

        let mut result = ChatMessage::new(Uuid::new_v4().to_string(), Role::Assistant, "");
        result.parent_message_id = Some(user_message.id.clone());
        result.conversation_id = options.conversation_id.clone();

        if stream {
            self.read_stream(response, &mut result, options.progress.as_ref())
                .await?;
        } else {
            let completion: OpenAIChatResponse =
                response.json().await.map_err(transport_error)?;
            if self.debug {
                tracing::debug!("completion: {:?}", completion);
            }
            let choice = completion
                .choices
                .first()
                .ok_or_else(|| ChatError::Stream("OpenAI error: no choices in response".to_string()))?;
            result.id = completion.id.clone();
            result.role = choice.message.role;
            result.text = choice.message.content.clone();
            result.detail = serde_json::to_value(&completion).ok();
        }

        result.text = result.text.trim().to_string();

        self.store.upsert(user_message);
        self.store.upsert(result.clone());

        Ok(result)
    }

    async fn read_stream(
        &self,
        response: Response,
        result: &mut ChatMessage,
        progress: Option<&mpsc::UnboundedSender<ChatMessage>>,
    ) -> Result<(), ChatError> {
        let mut events = response.bytes_stream().eventsource();

        while let Some(event) = events.next().await {
            let event = event.map_err(sse_error)?;
            let raw = event.data;
            if self.debug {
                tracing::debug!("OpenAI SSE: {}", raw);
            }
            if raw == "[DONE]" {
                break;
            }

            let event_json: Value = serde_json::from_str(&raw)
                .map_err(|e| ChatError::Stream(format!("SSE parsing error: {}, data: {}", e, raw)))?;
            if let Some(message) = extract_stream_error(&event_json) {
                return Err(ChatError::Stream(message));
            }

            let chunk: OpenAIStreamChunk = match serde_json::from_value(event_json) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!("跳过无法识别的 SSE 数据: {}, data: {}", e, raw);
                    continue;
                }
            };

            result.id = chunk.id.clone();
            let Some(choice) = chunk.choices.first() else {
                continue;
            };
            if let Some(role) = choice.delta.role {
                result.role = role;
            }
            let Some(content) = choice.delta.content.as_deref().filter(|c| !c.is_empty()) else {
                continue;
            };

            result.text.push_str(content);
            result.delta = Some(content.to_string());
            result.detail = serde_json::to_value(&chunk).ok();

            if let Some(tx) = progress {
                // 接收方断开时继续读完，保证消息入库
                let _ = tx.send(result.clone());
            }
        }

        Ok(())
    }
}

// ===== 非官方反代 =====

/// 基于 Access Token 的反代客户端
pub struct UnofficialClient {
    http: Client,
    access_token: String,
    reverse_proxy_url: String,
    model: String,
    debug: bool,
}

impl UnofficialClient {
    pub fn new(
        http: Client,
        access_token: String,
        reverse_proxy_url: String,
        model: String,
        debug: bool,
    ) -> Self {
        Self {
            http,
            access_token,
            reverse_proxy_url,
            model,
            debug,
        }
    }

    pub async fn send_message(
        &self,
        text: &str,
        options: SendMessageOptions,
    ) -> Result<ChatMessage, ChatError> {
        let message_id = Uuid::new_v4().to_string();
        let parent_message_id = options
            .parent_message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let body = ConversationRequest::next(
            &message_id,
            text,
            &self.model,
            parent_message_id,
            options.conversation_id.clone(),
        );

        if self.debug {
            tracing::debug!(
                "POST {}: {}",
                self.reverse_proxy_url,
                serde_json::to_string(&body).unwrap_or_default()
            );
        }

        let response = self
            .http
            .post(&self.reverse_proxy_url)
            .bearer_auth(&self.access_token)
            .header(header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = ensure_success(response, "ChatGPT").await?;

        let mut result = ChatMessage::new(String::new(), Role::Assistant, "");
        result.parent_message_id = Some(message_id);
        result.conversation_id = options.conversation_id.clone();

        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(sse_error)?;
            let raw = event.data;
            if self.debug {
                tracing::debug!("ChatGPT SSE: {}", raw);
            }
            if raw == "[DONE]" {
                break;
            }

            let event_json: Value = match serde_json::from_str(&raw) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!("chatgpt unexpected JSON error: {}", e);
                    continue;
                }
            };
            if let Some(message) = extract_stream_error(&event_json) {
                return Err(ChatError::Stream(message));
            }

            let data: ConversationResponseEvent = match serde_json::from_value(event_json) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("chatgpt unexpected event: {}", e);
                    continue;
                }
            };

            if let Some(conversation_id) = data.conversation_id.clone() {
                result.conversation_id = Some(conversation_id);
            }

            let (Some(message), Some(text)) = (data.message.as_ref(), data.text()) else {
                continue;
            };
            result.id = message.id.clone();

            if text != result.text {
                // parts 为累计全文，增量为新增的后缀
                result.delta = Some(
                    text.strip_prefix(result.text.as_str())
                        .unwrap_or(text)
                        .to_string(),
                );
                result.text = text.to_string();

                if let Some(tx) = &options.progress {
                    let _ = tx.send(result.clone());
                }
            }
        }

        if result.id.is_empty() {
            return Err(ChatError::Stream("ChatGPT error: empty response".to_string()));
        }

        Ok(result)
    }
}

// ===== 统一入口 =====

pub enum ChatApi {
    Official(OfficialClient),
    Unofficial(UnofficialClient),
}

impl ChatApi {
    /// 根据配置选择上游模式并构建 HTTP 客户端
    pub fn from_config(config: &ProxyConfig, store: Arc<MessageStore>) -> Result<Self, ChatError> {
        let agent = ProxyAgent::select(config);
        let http = build_http_client(&agent, config.timeout())?;
        let debug = !config.disable_debug;

        if let Some(api_key) = &config.api_key {
            return Ok(ChatApi::Official(OfficialClient::new(
                http,
                api_key.clone(),
                config.api_base_url(),
                config.model.clone(),
                store,
                debug,
            )));
        }

        let access_token = config
            .access_token
            .clone()
            .ok_or(ChatError::MissingCredentials)?;
        Ok(ChatApi::Unofficial(UnofficialClient::new(
            http,
            access_token,
            config.reverse_proxy_url().to_string(),
            config.model.clone(),
            debug,
        )))
    }

    pub fn api_model(&self) -> ApiModel {
        match self {
            ChatApi::Official(_) => ApiModel::ChatGptApi,
            ChatApi::Unofficial(_) => ApiModel::ChatGptUnofficialProxyApi,
        }
    }

    /// 发送消息，整体受 timeout 约束
    pub async fn send_message(
        &self,
        text: &str,
        options: SendMessageOptions,
    ) -> Result<ChatMessage, ChatError> {
        let timeout = options.timeout;
        let send = async move {
            match self {
                ChatApi::Official(client) => client.send_message(text, options).await,
                ChatApi::Unofficial(client) => client.send_message(text, options).await,
            }
        };

        match timeout {
            Some(duration) => tokio::time::timeout(duration, send)
                .await
                .map_err(|_| ChatError::Timeout)?,
            None => send.await,
        }
    }
}
