// 前端调用封装 - 与网页端 api 模块一一对应

use futures::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::proxy::config::ModelConfig;
use crate::proxy::converter::{ApiResponse, ChatContext, ChatMessage, ResponseStatus};
use crate::proxy::error::ChatError;
use crate::proxy::server::SessionData;

pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are ChatGPT, a large language model trained by OpenAI. Follow the user's instructions carefully. Respond using markdown.";

/// 界面上的对话设置
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSettings {
    pub system_message: String,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
            temperature: 0.8,
            top_p: 1.0,
        }
    }
}

pub struct ChatWebClient {
    base_url: String,
    auth_token: Option<String>,
    settings: ChatSettings,
    http: Client,
}

/// 解析一行进度数据
///
/// 正常为 ChatMessage，失败时为 { status, message, data } 响应
fn parse_progress_line(line: &str) -> Option<Result<ChatMessage, ChatError>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            return Some(Err(ChatError::Stream(format!(
                "无法解析进度数据: {}, data: {}",
                e, line
            ))))
        }
    };

    if value.get("status").is_some() && value.get("text").is_none() {
        let message = value
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        return Some(Err(ChatError::Stream(message)));
    }

    Some(serde_json::from_value(value).map_err(|e| ChatError::Stream(e.to_string())))
}

fn decode_progress_line(line: &[u8]) -> Option<Result<ChatMessage, ChatError>> {
    match std::str::from_utf8(line) {
        Ok(line) => parse_progress_line(line),
        Err(e) => Some(Err(ChatError::Stream(format!("进度数据不是有效的 UTF-8: {}", e)))),
    }
}

impl ChatWebClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            settings: ChatSettings::default(),
            http: Client::new(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_settings(mut self, settings: ChatSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let url = format!("{}/api{}", self.base_url.trim_end_matches('/'), path);
        let builder = self.http.post(url);
        match self.auth_token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
    ) -> Result<ApiResponse<T>, ChatError> {
        let response = self.post(path).json(&body).send().await?;
        let response = response.error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn fetch_chat_api(
        &self,
        prompt: &str,
        options: Option<ChatContext>,
    ) -> Result<ApiResponse<ChatMessage>, ChatError> {
        self.post_json("/chat", json!({ "prompt": prompt, "options": options }))
            .await
    }

    pub async fn fetch_chat_config(&self) -> Result<ApiResponse<ModelConfig>, ChatError> {
        self.post_json("/config", json!({})).await
    }

    pub async fn fetch_session(&self) -> Result<ApiResponse<SessionData>, ChatError> {
        self.post_json("/session", json!({})).await
    }

    pub async fn fetch_verify(&self, token: &str) -> Result<ApiResponse<()>, ChatError> {
        self.post_json("/verify", json!({ "token": token })).await
    }

    /// 流式对话
    ///
    /// 官方 API 模式下附带 system message、temperature 与 top_p
    pub async fn fetch_chat_api_process(
        &self,
        prompt: &str,
        options: Option<ChatContext>,
        is_chatgpt_api: bool,
    ) -> Result<impl Stream<Item = Result<ChatMessage, ChatError>>, ChatError> {
        let mut data = json!({ "prompt": prompt, "options": options });
        if is_chatgpt_api {
            data["systemMessage"] = json!(self.settings.system_message);
            data["temperature"] = json!(self.settings.temperature);
            data["top_p"] = json!(self.settings.top_p);
        }

        let response = self.post("/chat-process").json(&data).send().await?;
        let response = response.error_for_status()?;
        let mut bytes = response.bytes_stream();

        Ok(async_stream::stream! {
            // 按字节缓冲，多字节字符可能被拆到两个分块里
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(ChatError::Transport(e));
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if let Some(item) = decode_progress_line(&line) {
                        yield item;
                    }
                }
            }

            if let Some(item) = decode_progress_line(&buffer) {
                yield item;
            }
        })
    }
}

/// 判断响应是否为未授权
pub fn is_unauthorized<T>(response: &ApiResponse<T>) -> bool {
    response.status == ResponseStatus::Unauthorized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::chat_service::ChatService;
    use crate::proxy::client::tests::{spawn_openai, spawn_upstream};
    use crate::proxy::config::{config_from_pairs, ApiModel};
    use crate::proxy::server::{AppState, AxumServer};
    use axum::routing::post;
    use axum::Router;
    use futures::pin_mut;

    async fn spawn_service(extra: &[(&str, &str)]) -> (String, crate::proxy::client::tests::Captured) {
        let (upstream_url, captured) = spawn_openai().await;
        let mut pairs = vec![("OPENAI_API_KEY", "sk-test"), ("OPENAI_API_BASE_URL", upstream_url.as_str())];
        pairs.extend_from_slice(extra);
        let config = config_from_pairs(&pairs).unwrap();
        let router = AxumServer::build_router(AppState::new(ChatService::new(config).unwrap()));
        (spawn_upstream(router).await, captured)
    }

    #[test]
    fn test_parse_progress_line() {
        assert!(parse_progress_line("  ").is_none());

        let message = parse_progress_line(r#"{"id":"a","text":"hi","role":"assistant"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(message.text, "hi");

        let err = parse_progress_line(r#"{"status":"Fail","message":"boom","data":null}"#)
            .unwrap()
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");

        assert!(parse_progress_line("{oops").unwrap().is_err());
    }

    #[test]
    fn test_decode_progress_line() {
        assert!(decode_progress_line(b"\n").is_none());
        let message = decode_progress_line("{\"id\":\"a\",\"text\":\"你好\",\"role\":\"assistant\"}\n".as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(message.text, "你好");
        assert!(decode_progress_line(&[b'{', 0xE4, b'}']).unwrap().is_err());
    }

    #[tokio::test]
    async fn test_process_keeps_split_characters() {
        let router = Router::new().route(
            "/api/chat-process",
            post(|| async {
                let line = "{\"id\":\"a\",\"text\":\"你好\",\"role\":\"assistant\"}\n{\"id\":\"a\",\"text\":\"你好呀\",\"role\":\"assistant\"}";
                let bytes = line.as_bytes().to_vec();
                // 在“你”的第一个字节后切开
                let split = bytes.iter().position(|b| *b == 0xE4).unwrap() + 1;
                let (head, tail) = (bytes[..split].to_vec(), bytes[split..].to_vec());
                let stream = async_stream::stream! {
                    yield Ok::<_, std::convert::Infallible>(head);
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    yield Ok(tail);
                };
                axum::body::Body::from_stream(stream)
            }),
        );
        let base_url = spawn_upstream(router).await;
        let client = ChatWebClient::new(base_url);

        let stream = client
            .fetch_chat_api_process("hi", None, false)
            .await
            .unwrap();
        pin_mut!(stream);

        let mut texts = Vec::new();
        while let Some(item) = stream.next().await {
            texts.push(item.unwrap().text);
        }
        assert_eq!(texts, vec!["你好".to_string(), "你好呀".to_string()]);
    }

    #[tokio::test]
    async fn test_session_and_verify() {
        let (base_url, _) = spawn_service(&[("AUTH_SECRET_KEY", "secret")]).await;
        let client = ChatWebClient::new(base_url);

        let session = client.fetch_session().await.unwrap();
        let data = session.data.unwrap();
        assert!(data.auth);
        assert_eq!(data.model, ApiModel::ChatGptApi);

        let verify = client.fetch_verify("secret").await.unwrap();
        assert!(verify.is_success());
        let verify = client.fetch_verify("nope").await.unwrap();
        assert!(!verify.is_success());

        let config = client.fetch_chat_config().await.unwrap();
        assert!(is_unauthorized(&config));
    }

    #[tokio::test]
    async fn test_config_with_token() {
        let (base_url, _) = spawn_service(&[("AUTH_SECRET_KEY", "secret")]).await;
        let client = ChatWebClient::new(format!("{}/", base_url)).with_auth_token("secret");

        let config = client.fetch_chat_config().await.unwrap();
        assert!(config.is_success());
        assert_eq!(config.data.unwrap().api_model, ApiModel::ChatGptApi);
    }

    #[tokio::test]
    async fn test_fetch_chat_api() {
        let (base_url, _) = spawn_service(&[]).await;
        let client = ChatWebClient::new(base_url);

        let response = client.fetch_chat_api("hi", None).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.data.unwrap().text, "plain answer");
    }

    #[tokio::test]
    async fn test_process_attaches_settings() {
        let (base_url, captured) = spawn_service(&[]).await;
        let client = ChatWebClient::new(base_url).with_settings(ChatSettings {
            system_message: "be brief".to_string(),
            temperature: 0.5,
            top_p: 0.25,
        });

        let stream = client
            .fetch_chat_api_process("hi", Some(ChatContext::default()), true)
            .await
            .unwrap();
        pin_mut!(stream);

        let mut messages = Vec::new();
        while let Some(item) = stream.next().await {
            messages.push(item.unwrap());
        }
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text, "Hello world");

        let body = captured.last_body();
        assert_eq!(body["messages"][0]["content"], "be brief");
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["top_p"], 0.25);
    }

    #[tokio::test]
    async fn test_process_without_settings() {
        let (base_url, captured) = spawn_service(&[]).await;
        let client = ChatWebClient::new(base_url);

        let stream = client
            .fetch_chat_api_process("hi", None, false)
            .await
            .unwrap();
        pin_mut!(stream);
        while let Some(item) = stream.next().await {
            item.unwrap();
        }

        let body = captured.last_body();
        assert!(body.get("temperature").is_none());
        assert!(body["messages"][0]["content"]
            .as_str()
            .unwrap()
            .starts_with("You are ChatGPT, a large language model trained by OpenAI. Answer"));
    }
}
