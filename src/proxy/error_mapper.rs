// 错误映射模块 - 将上游 HTTP 状态码转换为面向用户的提示

use crate::proxy::error::ChatError;

/// 无法给出具体信息时的兜底提示
pub const FALLBACK_MESSAGE: &str = "Please check the back-end console";

/// 状态码 -> 提示文案
const ERROR_CODE_MESSAGES: &[(u16, &str)] = &[
    (401, "[小兰] 提供错误的API密钥 | Incorrect API key provided"),
    (403, "[小兰] 服务器拒绝访问，请稍后再试 | Server refused to access, please try again later"),
    (500, "[小兰] 服务器繁忙，请稍后再试 | Internal Server Error"),
    (502, "[小兰] 错误的网关 |  Bad Gateway"),
    (503, "[小兰] 服务器繁忙，请稍后再试 | Server is busy, please try again later"),
    (504, "[小兰] 网关超时 | Gateway Time-out"),
];

/// 查找状态码对应的提示
pub fn error_code_message(status: u16) -> Option<&'static str> {
    ERROR_CODE_MESSAGES
        .iter()
        .find(|(code, _)| *code == status)
        .map(|(_, message)| *message)
}

/// 生成返回给前端的错误信息
///
/// 已知状态码使用固定文案，其余透传错误本身的信息
pub fn user_facing_message(error: &ChatError) -> String {
    if let Some(message) = error.status_code().and_then(error_code_message) {
        return message.to_string();
    }

    let message = error.to_string();
    if message.trim().is_empty() {
        FALLBACK_MESSAGE.to_string()
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn upstream(status: u16, message: &str) -> ChatError {
        ChatError::Upstream {
            status,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_mapped_codes() {
        assert_eq!(
            error_code_message(401),
            Some("[小兰] 提供错误的API密钥 | Incorrect API key provided")
        );
        assert_eq!(
            error_code_message(403),
            Some("[小兰] 服务器拒绝访问，请稍后再试 | Server refused to access, please try again later")
        );
        assert_eq!(error_code_message(502), Some("[小兰] 错误的网关 |  Bad Gateway"));
        assert_eq!(
            error_code_message(503),
            Some("[小兰] 服务器繁忙，请稍后再试 | Server is busy, please try again later")
        );
        assert_eq!(error_code_message(504), Some("[小兰] 网关超时 | Gateway Time-out"));
        assert_eq!(
            error_code_message(500),
            Some("[小兰] 服务器繁忙，请稍后再试 | Internal Server Error")
        );
    }

    #[test]
    fn test_unmapped_codes() {
        assert_eq!(error_code_message(200), None);
        assert_eq!(error_code_message(404), None);
        assert_eq!(error_code_message(429), None);
    }

    #[test]
    fn test_user_facing_message() {
        assert_eq!(
            user_facing_message(&upstream(401, "OpenAI error 401: invalid key")),
            "[小兰] 提供错误的API密钥 | Incorrect API key provided"
        );
        // 未映射的状态码透传原始信息
        assert_eq!(
            user_facing_message(&upstream(429, "OpenAI error 429: rate limited")),
            "OpenAI error 429: rate limited"
        );
        assert_eq!(
            user_facing_message(&ChatError::Timeout),
            "请求超时 | Request timed out"
        );
        assert_eq!(
            user_facing_message(&ChatError::Stream(String::new())),
            FALLBACK_MESSAGE
        );
    }

    proptest! {
        #[test]
        fn prop_unmapped_status_passes_message_through(
            status in 100u16..600,
            message in "[a-zA-Z0-9 ]{1,40}[a-zA-Z0-9]",
        ) {
            prop_assume!(error_code_message(status).is_none());
            prop_assert_eq!(user_facing_message(&upstream(status, &message)), message);
        }

        #[test]
        fn prop_mapped_status_ignores_message(idx in 0usize..6, message in ".*") {
            let (status, expected) = ERROR_CODE_MESSAGES[idx];
            prop_assert_eq!(user_facing_message(&upstream(status, &message)), expected);
        }
    }
}
