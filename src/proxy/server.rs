use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::proxy::chat_service::{ChatService, RequestOptions};
use crate::proxy::config::{ApiModel, ModelConfig, ProxyConfig};
use crate::proxy::converter::{ApiResponse, ChatContext, ChatMessage};
use crate::proxy::middleware::{auth, rate_limit, RateLimiter};
use crate::proxy::store_janitor::StoreJanitor;

/// 所有路由共享的状态
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ChatService>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(service: ChatService) -> Self {
        let limiter = RateLimiter::per_hour(service.config().max_request_per_hour);
        Self {
            service: Arc::new(service),
            limiter: Arc::new(limiter),
        }
    }
}

// ===== 请求体 =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatProcessRequest {
    pub prompt: String,
    #[serde(default)]
    pub options: Option<ChatContext>,
    #[serde(default)]
    pub system_message: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default, rename = "top_p")]
    pub top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
    #[serde(default)]
    pub options: Option<ChatContext>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub auth: bool,
    pub model: ApiModel,
}

// ===== 处理器 =====

/// 流式对话，逐条写出 ChatMessage JSON，以换行分隔
async fn chat_process(
    State(state): State<AppState>,
    Json(request): Json<ChatProcessRequest>,
) -> Response {
    let (tx, mut rx) = mpsc::unbounded_channel::<ChatMessage>();
    let service = state.service.clone();

    let options = RequestOptions {
        message: request.prompt,
        last_context: request.options,
        system_message: request.system_message,
        temperature: request.temperature,
        top_p: request.top_p,
        progress: Some(tx),
    };
    let task = tokio::spawn(async move { service.chat_reply_process(options).await });

    let body = async_stream::stream! {
        let mut first_chunk = true;

        // 发送端随请求结束被释放，循环随之退出
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    let chunk = if first_chunk { json } else { format!("\n{}", json) };
                    first_chunk = false;
                    yield Ok::<Bytes, Infallible>(Bytes::from(chunk));
                }
                Err(e) => tracing::warn!("序列化进度消息失败: {}", e),
            }
        }

        let response = match task.await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("对话任务异常退出: {}", e);
                ApiResponse::fail(e.to_string())
            }
        };

        if !response.is_success() {
            let envelope = ApiResponse::<()>::fail(response.message);
            if let Ok(json) = serde_json::to_string(&envelope) {
                let chunk = if first_chunk { json } else { format!("\n{}", json) };
                yield Ok::<Bytes, Infallible>(Bytes::from(chunk));
            }
        }
    };

    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(body),
    )
        .into_response()
}

/// 非流式对话
async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Json<ApiResponse<ChatMessage>> {
    let response = state
        .service
        .chat_reply_process(RequestOptions {
            message: request.prompt,
            last_context: request.options,
            ..Default::default()
        })
        .await;
    Json(response)
}

async fn chat_config(State(state): State<AppState>) -> Json<ApiResponse<ModelConfig>> {
    Json(state.service.chat_config())
}

async fn session(State(state): State<AppState>) -> Json<ApiResponse<SessionData>> {
    let data = SessionData {
        auth: state.service.config().has_auth(),
        model: state.service.current_model(),
    };
    Json(ApiResponse::success_with_message("", Some(data)))
}

async fn verify(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> Json<ApiResponse<()>> {
    let token = request.token.unwrap_or_default();
    if token.is_empty() {
        return Json(ApiResponse::fail("Secret key is empty"));
    }

    if state.service.config().auth_secret_key.as_deref() != Some(token.as_str()) {
        return Json(ApiResponse::fail("密钥无效 | Secret key is invalid"));
    }

    Json(ApiResponse::success_with_message("Verify successfully", None))
}

// ===== 服务器 =====

pub struct AxumServer;

impl AxumServer {
    /// 构建路由，同一组路由同时挂载在 / 与 /api 下
    pub fn build_router(state: AppState) -> Router {
        let guarded = Router::new()
            .route("/chat-process", post(chat_process))
            .route("/chat", post(chat))
            .route_layer(from_fn_with_state(state.clone(), rate_limit))
            .route_layer(from_fn_with_state(state.clone(), auth));

        let config = Router::new()
            .route("/config", post(chat_config))
            .route_layer(from_fn_with_state(state.clone(), auth));

        let open = Router::new()
            .route("/session", post(session))
            .route("/verify", post(verify));

        let api = guarded.merge(config).merge(open);

        let mut router = Router::new().nest("/api", api.clone()).merge(api);

        let static_dir = &state.service.config().static_dir;
        if static_dir.is_dir() {
            tracing::info!("静态文件目录: {:?}", static_dir);
            router = router.fallback_service(ServeDir::new(static_dir));
        }

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
            .allow_methods(Any);

        router
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// 启动服务，收到 shutdown 信号后优雅退出
    pub async fn start(config: ProxyConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
        let port = config.port;
        let service = ChatService::new(config)?;
        let state = AppState::new(service);

        let janitor = StoreJanitor::with_parent(10 * 60 * 1000, &shutdown);
        janitor.start(state.service.store());
        Self::start_limiter_cleanup(state.limiter.clone(), shutdown.clone());

        let app = Self::build_router(state);
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
        tracing::info!("服务已启动: http://{}", listener.local_addr()?);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

        tracing::info!("服务已停止");
        Ok(())
    }

    fn start_limiter_cleanup(limiter: Arc<RateLimiter>, shutdown: CancellationToken) {
        if !limiter.is_enabled() {
            return;
        }
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(10 * 60)) => limiter.cleanup(),
                }
            }
        });
    }
}
