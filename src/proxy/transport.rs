// 出站代理选择 - SOCKS > HTTPS_PROXY/ALL_PROXY > 直连

use std::time::Duration;

use reqwest::Client;

use crate::proxy::config::ProxyConfig;

/// 出站代理
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyAgent {
    Socks {
        host: String,
        port: String,
        username: Option<String>,
        password: Option<String>,
    },
    /// HTTP(S) 代理地址
    Https(String),
    Direct,
}

impl ProxyAgent {
    /// 按优先级选择代理
    ///
    /// 1. SOCKS_PROXY_HOST 与 SOCKS_PROXY_PORT 同时存在
    /// 2. HTTPS_PROXY，其次 ALL_PROXY
    /// 3. 直连
    pub fn select(config: &ProxyConfig) -> Self {
        if let (Some(host), Some(port)) = (&config.socks_proxy_host, &config.socks_proxy_port) {
            return ProxyAgent::Socks {
                host: host.clone(),
                port: port.clone(),
                username: config.socks_proxy_username.clone(),
                password: config.socks_proxy_password.clone(),
            };
        }

        if let Some(url) = config.https_proxy_url() {
            return ProxyAgent::Https(url.to_string());
        }

        ProxyAgent::Direct
    }

    /// 生成 socks5h:// 地址，用户名密码会被转义
    pub fn socks_url(&self) -> Option<String> {
        let ProxyAgent::Socks {
            host,
            port,
            username,
            password,
        } = self
        else {
            return None;
        };

        let mut url = url::Url::parse(&format!("socks5h://{}:{}", host, port)).ok()?;
        if let Some(user) = username {
            url.set_username(user).ok()?;
            if let Some(pass) = password {
                url.set_password(Some(pass)).ok()?;
            }
        }
        Some(url.to_string().trim_end_matches('/').to_string())
    }

    pub fn describe(&self) -> String {
        match self {
            ProxyAgent::Socks { host, port, .. } => format!("socks5h://{}:{}", host, port),
            ProxyAgent::Https(url) => url.clone(),
            ProxyAgent::Direct => "direct".to_string(),
        }
    }
}

/// 根据代理构建 HTTP 客户端
///
/// 代理地址无效时记录警告并退回直连
///
/// # 参数
/// - `agent`: 上游代理
/// - `connect_timeout`: 建立连接的超时，None 表示不限时；
///   整体请求时长由调用方控制，流式响应不受此限制
pub fn build_http_client(
    agent: &ProxyAgent,
    connect_timeout: Option<Duration>,
) -> Result<Client, reqwest::Error> {
    let mut builder =
        Client::builder().user_agent(concat!("xiaolan-chat/", env!("CARGO_PKG_VERSION")));
    if let Some(timeout) = connect_timeout {
        builder = builder.connect_timeout(timeout);
    }

    let proxy_url = match agent {
        ProxyAgent::Socks { .. } => agent.socks_url(),
        ProxyAgent::Https(url) => Some(url.clone()),
        ProxyAgent::Direct => None,
    };

    match proxy_url {
        Some(url) => match reqwest::Proxy::all(&url) {
            Ok(proxy) => {
                tracing::info!("上游请求使用代理: {}", agent.describe());
                builder = builder.proxy(proxy);
            }
            Err(e) => {
                tracing::warn!("代理地址无效，改为直连 {}: {}", agent.describe(), e);
                builder = builder.no_proxy();
            }
        },
        None => {
            if matches!(agent, ProxyAgent::Socks { .. }) {
                tracing::warn!("SOCKS 代理地址无效，改为直连: {}", agent.describe());
            }
            builder = builder.no_proxy();
        }
    }

    builder.build()
}
