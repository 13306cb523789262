//! 非流式后端的回复文本提取。
//!
//! 各个 webhook 返回的 JSON 形状并不统一，这里用一组按优先级排列的
//! JSON pointer 规则逐条尝试，第一条命中字符串的规则胜出。

use serde_json::Value;

/// 所有规则都落空、且响应本身不是对象或数组时显示的文本。
pub const NO_REPLY_TEXT: &str = "Sorry, I couldn't retrieve a valid response.";

/// 默认规则链：`[0].output` → `reply` → `text` → `output` → 响应本身是字符串。
pub const DEFAULT_RULES: [&str; 5] = ["/0/output", "/reply", "/text", "/output", ""];

/// Responses API 的输出文本位置，排在默认链前面。
pub const RESPONSES_RULES: [&str; 2] = ["/output_text", "/output/0/content/0/text"];

#[derive(Debug, Clone, PartialEq)]
pub struct ReplyExtractor {
    rules: Vec<String>,
}

impl Default for ReplyExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_RULES)
    }
}

impl ReplyExtractor {
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rules: rules.into_iter().map(Into::into).collect(),
        }
    }

    /// 使用配置里的规则；配置为空时退回默认链。
    pub fn from_config(rules: &[String]) -> Self {
        if rules.is_empty() {
            Self::default()
        } else {
            Self::new(rules.iter().cloned())
        }
    }

    pub fn responses() -> Self {
        Self::new(RESPONSES_RULES.into_iter().chain(DEFAULT_RULES))
    }

    pub fn rules(&self) -> &[String] {
        &self.rules
    }

    /// 永不失败：总能得到一段可显示的文本。
    pub fn extract(&self, body: &Value) -> String {
        for rule in &self.rules {
            if let Some(text) = body.pointer(rule).and_then(Value::as_str) {
                return text.to_string();
            }
        }

        match body {
            Value::Object(_) | Value::Array(_) => {
                serde_json::to_string_pretty(body).unwrap_or_else(|_| body.to_string())
            }
            _ => NO_REPLY_TEXT.to_string(),
        }
    }
}

/// 响应里的 `id`（字符串或数字）作为助手消息 ID。
pub fn reply_id(body: &Value) -> Option<String> {
    match body.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
