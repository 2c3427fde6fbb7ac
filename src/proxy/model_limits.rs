use regex::Regex;

/// 模型 token 上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLimits {
    /// 上下文总上限（prompt + 回复）
    pub max_model_tokens: u32,
    /// 单次回复上限
    pub max_response_tokens: u32,
}

impl TokenLimits {
    pub const fn new(max_model_tokens: u32, max_response_tokens: u32) -> Self {
        Self {
            max_model_tokens,
            max_response_tokens,
        }
    }

    /// 留给 prompt 的 token 预算
    pub fn prompt_budget(&self) -> u32 {
        self.max_model_tokens.saturating_sub(self.max_response_tokens)
    }
}

/// 未命中任何规则时的默认上限
pub const DEFAULT_LIMITS: TokenLimits = TokenLimits::new(4000, 1000);

fn is_match(pattern: &str, text: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(text),
        Err(e) => {
            tracing::warn!("模型匹配正则无效 {}: {}", pattern, e);
            false
        }
    }
}

/// 根据模型名选择 token 上限
///
/// 匹配规则（按顺序）:
/// - gpt-4 32k: 32768 / 8192
/// - gpt-4o-mini: 128000 / 16384
/// - gpt-4 preview / turbo / o 系列: 128000 / 4096
/// - 其他 gpt-4: 8192 / 2048
/// - gpt-3.5 16k / 1106 / 0125: 16384 / 4096
/// - 其他: 4000 / 1000
pub fn token_limits(model: &str) -> TokenLimits {
    let lower_name = model.to_lowercase();

    if lower_name.contains("gpt-4") {
        if lower_name.contains("32k") {
            return TokenLimits::new(32768, 8192);
        }
        if is_match(r"-4o-mini", &lower_name) {
            return TokenLimits::new(128000, 16384);
        }
        // 注意这里的 "o" 会命中任何包含字母 o 的名字
        if is_match(r"-preview|-turbo|o", &lower_name) {
            return TokenLimits::new(128000, 4096);
        }
        return TokenLimits::new(8192, 2048);
    }

    if lower_name.contains("gpt-3.5") && is_match(r"16k|1106|0125", &lower_name) {
        return TokenLimits::new(16384, 4096);
    }

    DEFAULT_LIMITS
}
