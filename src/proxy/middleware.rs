// Axum 中间件 - 访问密钥校验与按 IP 限流

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;

use crate::proxy::converter::ApiResponse;
use crate::proxy::server::AppState;

pub const NO_ACCESS_MESSAGE: &str = "Error: 无访问权限 | No access rights";
pub const TOO_MANY_REQUESTS_MESSAGE: &str = "Too many request from this IP in 1 hour";

/// 固定窗口限流器
pub struct RateLimiter {
    /// 每个窗口允许的请求数，0 表示不限
    max_requests: u32,
    window: Duration,
    /// ip -> (窗口开始时间, 已用次数)
    hits: DashMap<String, (Instant, u32)>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: DashMap::new(),
        }
    }

    pub fn per_hour(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60 * 60))
    }

    pub fn is_enabled(&self) -> bool {
        self.max_requests > 0
    }

    /// 记录一次请求，返回是否放行
    pub fn check(&self, key: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }

        let now = Instant::now();
        let mut entry = self.hits.entry(key.to_string()).or_insert((now, 0));
        let (window_start, count) = entry.value_mut();

        if now.duration_since(*window_start) >= self.window {
            *window_start = now;
            *count = 0;
        }

        if *count >= self.max_requests {
            return false;
        }
        *count += 1;
        true
    }

    /// 清理已过窗口的记录
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = self.window;
        self.hits
            .retain(|_, (start, _)| now.duration_since(*start) < window);
    }
}

/// 获取客户端 IP
///
/// X-Forwarded-For 第一项 > X-Real-IP > 连接地址
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// 校验 Authorization: Bearer <AUTH_SECRET_KEY>
///
/// 未配置密钥时直接放行
pub async fn auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(secret) = state.service.config().auth_secret_key.as_deref() else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.replacen("Bearer ", "", 1).trim().to_string());

    match provided {
        Some(token) if token == secret.trim() => next.run(request).await,
        _ => {
            tracing::warn!("拒绝未授权请求: {}", request.uri().path());
            Json(ApiResponse::<()>::unauthorized(NO_ACCESS_MESSAGE)).into_response()
        }
    }
}

/// 按 IP 限流，超限时仍返回 200 与 Fail 响应
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.limiter.is_enabled() {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(request.headers(), peer);

    if state.limiter.check(&ip) {
        next.run(request).await
    } else {
        tracing::warn!("IP {} 超出每小时请求上限", ip);
        Json(ApiResponse::<()>::fail(TOO_MANY_REQUESTS_MESSAGE)).into_response()
    }
}
