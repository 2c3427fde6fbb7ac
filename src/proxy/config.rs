use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::proxy::error::ChatError;

/// 默认模型
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
/// 官方 API 默认地址
pub const DEFAULT_API_BASE_URL: &str = "https://api.openai.com";
/// 非官方反代默认地址
pub const DEFAULT_REVERSE_PROXY: &str = "https://ai.fakeopen.com/api/conversation";
/// 默认超时 100 秒
pub const DEFAULT_TIMEOUT_MS: u64 = 100 * 1000;
pub const DEFAULT_PORT: u16 = 3002;

/// 当前使用的上游 API 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiModel {
    #[serde(rename = "ChatGPTAPI")]
    ChatGptApi,
    #[serde(rename = "ChatGPTUnofficialProxyAPI")]
    ChatGptUnofficialProxyApi,
}

/// 模型配置（/config 接口原样返回）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub api_model: ApiModel,
    pub reverse_proxy: String,
    pub timeout_ms: u64,
    pub socks_proxy: String,
    pub https_proxy: String,
}

/// 反代服务配置，启动时从环境变量读取一次
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub model: String,
    pub api_base_url: Option<String>,
    pub reverse_proxy: Option<String>,
    pub disable_debug: bool,
    pub timeout_ms: u64,
    pub socks_proxy_host: Option<String>,
    pub socks_proxy_port: Option<String>,
    pub socks_proxy_username: Option<String>,
    pub socks_proxy_password: Option<String>,
    pub https_proxy: Option<String>,
    pub all_proxy: Option<String>,
    pub auth_secret_key: Option<String>,
    /// 0 表示不限流
    pub max_request_per_hour: u32,
    pub port: u16,
    pub static_dir: PathBuf,
}

/// 非空字符串才视为已设置
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl ProxyConfig {
    /// 从进程环境变量读取配置（先加载 .env）
    pub fn from_env() -> Result<Self, ChatError> {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("未加载 .env 文件: {}", e);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 通过任意 key -> value 查找函数构造配置
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ChatError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key));

        let api_key = get("OPENAI_API_KEY");
        let access_token = get("OPENAI_ACCESS_TOKEN");
        if api_key.is_none() && access_token.is_none() {
            return Err(ChatError::MissingCredentials);
        }

        let api_base_url = get("OPENAI_API_BASE_URL");
        if let Some(ref base) = api_base_url {
            url::Url::parse(base)
                .map_err(|e| ChatError::InvalidConfig(format!("OPENAI_API_BASE_URL 无效: {}", e)))?;
        }
        // 原始值保留给 /config，解析仅做校验
        let reverse_proxy = get("API_REVERSE_PROXY");
        if let Some(ref proxy) = reverse_proxy {
            url::Url::parse(proxy)
                .map_err(|e| ChatError::InvalidConfig(format!("API_REVERSE_PROXY 无效: {}", e)))?;
        }

        let timeout_ms = lookup("TIMEOUT_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        let max_request_per_hour = get("MAX_REQUEST_PER_HOUR")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(0);

        let port = get("SERVICE_PORT")
            .and_then(|v| v.trim().parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        Ok(Self {
            api_key,
            access_token,
            model: get("OPENAI_API_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_base_url,
            reverse_proxy,
            disable_debug: lookup("OPENAI_API_DISABLE_DEBUG").as_deref() == Some("true"),
            timeout_ms,
            socks_proxy_host: get("SOCKS_PROXY_HOST"),
            socks_proxy_port: get("SOCKS_PROXY_PORT"),
            socks_proxy_username: get("SOCKS_PROXY_USERNAME"),
            socks_proxy_password: get("SOCKS_PROXY_PASSWORD"),
            https_proxy: get("HTTPS_PROXY"),
            all_proxy: get("ALL_PROXY"),
            auth_secret_key: get("AUTH_SECRET_KEY"),
            max_request_per_hour,
            port,
            static_dir: PathBuf::from(get("STATIC_DIR").unwrap_or_else(|| "public".to_string())),
        })
    }

    /// 有 API Key 时使用官方 API，否则走 Access Token 反代
    pub fn api_model(&self) -> ApiModel {
        if self.api_key.is_some() {
            ApiModel::ChatGptApi
        } else {
            ApiModel::ChatGptUnofficialProxyApi
        }
    }

    /// 官方 API 地址，未包含 /v1 时自动补上
    pub fn api_base_url(&self) -> String {
        let base = self
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL);
        if base.contains("/v1") {
            base.to_string()
        } else {
            format!("{}/v1", base.trim_end_matches('/'))
        }
    }

    pub fn reverse_proxy_url(&self) -> &str {
        self.reverse_proxy.as_deref().unwrap_or(DEFAULT_REVERSE_PROXY)
    }

    /// 上游请求超时
    ///
    /// # 返回
    /// `TIMEOUT_MS` 为 0 时返回 None，表示不限时
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// HTTPS_PROXY 优先于 ALL_PROXY
    pub fn https_proxy_url(&self) -> Option<&str> {
        self.https_proxy.as_deref().or(self.all_proxy.as_deref())
    }

    pub fn has_auth(&self) -> bool {
        self.auth_secret_key.is_some()
    }

    /// 生成 /config 返回的模型配置
    pub fn model_config(&self) -> ModelConfig {
        let socks_proxy = match (&self.socks_proxy_host, &self.socks_proxy_port) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            _ => "-".to_string(),
        };

        ModelConfig {
            api_model: self.api_model(),
            reverse_proxy: self.reverse_proxy.clone().unwrap_or_else(|| "-".to_string()),
            timeout_ms: self.timeout_ms,
            socks_proxy,
            https_proxy: self.https_proxy_url().unwrap_or("-").to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<ProxyConfig, ChatError> {
    let map: std::collections::HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    ProxyConfig::from_lookup(|key| map.get(key).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credentials() {
        let err = config_from_pairs(&[]).unwrap_err();
        assert!(matches!(err, ChatError::MissingCredentials));

        // 空白字符串视为未设置
        let err = config_from_pairs(&[("OPENAI_API_KEY", "  "), ("OPENAI_ACCESS_TOKEN", "")])
            .unwrap_err();
        assert!(matches!(err, ChatError::MissingCredentials));
    }

    #[test]
    fn test_api_model_selection() {
        let config = config_from_pairs(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_ACCESS_TOKEN", "token"),
        ])
        .unwrap();
        assert_eq!(config.api_model(), ApiModel::ChatGptApi);

        let config = config_from_pairs(&[("OPENAI_ACCESS_TOKEN", "token")]).unwrap();
        assert_eq!(config.api_model(), ApiModel::ChatGptUnofficialProxyApi);
        assert_eq!(config.reverse_proxy_url(), DEFAULT_REVERSE_PROXY);
    }

    #[test]
    fn test_defaults() {
        let config = config_from_pairs(&[("OPENAI_API_KEY", "sk-test")]).unwrap();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_request_per_hour, 0);
        assert!(!config.disable_debug);
        assert!(!config.has_auth());
        assert_eq!(config.api_base_url(), "https://api.openai.com/v1");
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let config = config_from_pairs(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("TIMEOUT_MS", "abc"),
            ("MAX_REQUEST_PER_HOUR", "many"),
        ])
        .unwrap();
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.max_request_per_hour, 0);
    }

    #[test]
    fn test_zero_timeout_disables_limit() {
        let config = config_from_pairs(&[("OPENAI_API_KEY", "sk-test"), ("TIMEOUT_MS", "0")])
            .unwrap();
        assert_eq!(config.timeout_ms, 0);
        assert_eq!(config.timeout(), None);

        let config = config_from_pairs(&[("OPENAI_API_KEY", "sk-test"), ("TIMEOUT_MS", "1500")])
            .unwrap();
        assert_eq!(config.timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_api_base_url_normalization() {
        let config = config_from_pairs(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_API_BASE_URL", "https://example.com/"),
        ])
        .unwrap();
        assert_eq!(config.api_base_url(), "https://example.com/v1");

        let config = config_from_pairs(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_API_BASE_URL", "https://example.com/openai/v1"),
        ])
        .unwrap();
        assert_eq!(config.api_base_url(), "https://example.com/openai/v1");
    }

    #[test]
    fn test_invalid_base_url() {
        let err = config_from_pairs(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_API_BASE_URL", "not a url"),
        ])
        .unwrap_err();
        assert!(matches!(err, ChatError::InvalidConfig(_)));
    }

    #[test]
    fn test_model_config_defaults() {
        let config = config_from_pairs(&[("OPENAI_API_KEY", "sk-test")]).unwrap();
        let model_config = config.model_config();
        assert_eq!(model_config.api_model, ApiModel::ChatGptApi);
        assert_eq!(model_config.reverse_proxy, "-");
        assert_eq!(model_config.socks_proxy, "-");
        assert_eq!(model_config.https_proxy, "-");
        assert_eq!(model_config.timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn test_model_config_proxies() {
        let config = config_from_pairs(&[
            ("OPENAI_ACCESS_TOKEN", "token"),
            ("API_REVERSE_PROXY", "https://proxy.example.com/api/conversation"),
            ("SOCKS_PROXY_HOST", "127.0.0.1"),
            ("SOCKS_PROXY_PORT", "1080"),
            ("ALL_PROXY", "http://all.example.com:8080"),
            ("TIMEOUT_MS", "5000"),
        ])
        .unwrap();
        let model_config = config.model_config();
        assert_eq!(model_config.api_model, ApiModel::ChatGptUnofficialProxyApi);
        assert_eq!(model_config.reverse_proxy, "https://proxy.example.com/api/conversation");
        assert_eq!(model_config.socks_proxy, "127.0.0.1:1080");
        assert_eq!(model_config.https_proxy, "http://all.example.com:8080");
        assert_eq!(model_config.timeout_ms, 5000);

        // 只配置 host 不算 SOCKS 代理
        let config = config_from_pairs(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("SOCKS_PROXY_HOST", "127.0.0.1"),
            ("HTTPS_PROXY", "http://https.example.com:8080"),
            ("ALL_PROXY", "http://all.example.com:8080"),
        ])
        .unwrap();
        let model_config = config.model_config();
        assert_eq!(model_config.socks_proxy, "-");
        assert_eq!(model_config.https_proxy, "http://https.example.com:8080");
    }

    #[test]
    fn test_model_config_serialization() {
        let config = config_from_pairs(&[("OPENAI_API_KEY", "sk-test")]).unwrap();
        let json = serde_json::to_value(config.model_config()).unwrap();
        assert_eq!(json["apiModel"], "ChatGPTAPI");
        assert_eq!(json["timeoutMs"], 100000);
        assert_eq!(json["reverseProxy"], "-");
    }
}
