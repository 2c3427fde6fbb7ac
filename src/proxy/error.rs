use thiserror::Error;

/// 反代服务统一错误类型
#[derive(Debug, Error)]
pub enum ChatError {
    /// 未配置 API Key 与 Access Token
    #[error("Missing OPENAI_API_KEY or OPENAI_ACCESS_TOKEN environment variable")]
    MissingCredentials,

    #[error("配置无效: {0}")]
    InvalidConfig(String),

    /// 上游返回非 2xx 状态码
    #[error("{message}")]
    Upstream { status: u16, message: String },

    #[error("请求超时 | Request timed out")]
    Timeout,

    #[error("网络请求失败: {0}")]
    Transport(#[from] reqwest::Error),

    /// SSE 数据无法解析
    #[error("{0}")]
    Stream(String),
}

impl ChatError {
    /// 获取错误对应的 HTTP 状态码（仅上游错误和带状态的网络错误）
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ChatError::Upstream { status, .. } => Some(*status),
            ChatError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code() {
        let err = ChatError::Upstream {
            status: 401,
            message: "OpenAI error 401: bad key".to_string(),
        };
        assert_eq!(err.status_code(), Some(401));
        assert_eq!(err.to_string(), "OpenAI error 401: bad key");

        assert_eq!(ChatError::Timeout.status_code(), None);
        assert_eq!(ChatError::Stream("x".into()).status_code(), None);
    }
}
