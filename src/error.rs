//! # 错误类型
//!
//! 整个 crate 共用一个错误枚举。传输、存储、配置等失败都会归到这里，
//! 最终只以一条 `last_error` 文本呈现给界面层。

/// 库内所有可失败函数的返回类型。
pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// 网络层失败（连接、读取响应流）。
    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    /// 后端返回了非 2xx 状态码。`message` 已经是给用户看的文本。
    #[error("{message}")]
    Status { status: u16, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Assistant \"{0}\" not found")]
    UnknownAssistant(String),

    #[error("Nothing to send: message and image are both empty")]
    EmptyInput,

    #[error("Unsupported attachment: {0}")]
    Attachment(String),

    /// 请求被取消令牌打断。属于预期行为，不向用户展示。
    #[error("Request cancelled")]
    Cancelled,
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        ChatError::Storage(e.to_string())
    }
}

impl ChatError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }
}
