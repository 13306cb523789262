//! # 数据模型模块
//!
//! 定义对话记录、助手注册表以及应用配置的数据结构。
//! 字段命名沿用前端本地存储里的 JSON 形状（`imageBase64`、`isStreaming` 等），
//! 这样旧数据可以直接反序列化。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息发送者的角色。
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// 对话记录中的一条消息。
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    /// 消息 ID。流式占位消息在完成后会换成后端分配的 ID。
    pub id: String,
    pub role: Role,
    /// 消息正文。助手消息在流式输出期间只追加、不截断。
    pub content: String,
    /// 用户附带的图片（data URL）。
    #[serde(rename = "imageBase64", default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    /// 创建时间，以 RFC 3339 字符串存储。
    pub timestamp: DateTime<Utc>,
    /// 后端尚未发出完成信号时为 true。
    #[serde(rename = "isStreaming", default)]
    pub streaming: bool,
}

impl Message {
    pub fn user(content: impl Into<String>, attachment: Option<String>) -> Self {
        Self {
            id: format!("user-{}", uuid::Uuid::new_v4()),
            role: Role::User,
            content: content.into(),
            attachment,
            timestamp: Utc::now(),
            streaming: false,
        }
    }

    /// 本轮开始时同步创建的助手占位消息。
    pub fn placeholder() -> Self {
        Self {
            id: format!("assistant-stream-{}", uuid::Uuid::new_v4()),
            role: Role::Assistant,
            content: String::new(),
            attachment: None,
            timestamp: Utc::now(),
            streaming: true,
        }
    }

    pub fn assistant(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            content: content.into(),
            attachment: None,
            timestamp: Utc::now(),
            streaming: false,
        }
    }
}

/// 持久化的会话状态：线程 ID 加完整对话记录。
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct StoredConversation {
    #[serde(rename = "threadId")]
    pub thread_id: Option<String>,
    pub transcript: Vec<Message>,
}

/// 助手背后的后端类型。
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BackendKind {
    /// OpenAI Assistants 代理，返回 SSE 流。`url` 为空时使用全局 `apiUrl`。
    AssistantStream {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// 自动化 webhook（n8n、MCP 桥接等），返回单个 JSON。
    Webhook {
        url: String,
        /// 请求体里放用户文本的字段名，如 `chatInput` 或 `message`。
        #[serde(rename = "inputField")]
        input_field: String,
        /// 提取回复文本的 JSON pointer 规则，按顺序尝试。为空时用默认链。
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        extract: Vec<String>,
        /// 工具列表端点（MCP 桥接），返回工具数组，用于显示可用工具数。
        #[serde(rename = "toolsUrl", default, skip_serializing_if = "Option::is_none")]
        tools_url: Option<String>,
    },
    /// OpenAI Responses 代理，靠 `previousResponseId` 维持上下文。
    Responses {
        url: String,
    },
}

/// 一个 AI 助手预设。
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Assistant {
    /// 本地 ID，也是持久化的键。
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 远端 OpenAI 助手 ID（仅供展示，代理自行解析）。
    #[serde(rename = "openaiAssistantId", default, skip_serializing_if = "Option::is_none")]
    pub openai_assistant_id: Option<String>,
    pub backend: BackendKind,
}

/// 应用程序的全局配置文件结构。
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AppConfig {
    /// 流式代理地址。
    #[serde(rename = "apiUrl")]
    pub api_url: String,
    #[serde(rename = "requestTimeoutSecs", default = "default_timeout")]
    pub request_timeout_secs: u64,
    /// 欢迎语模板，`{name}` 会替换为助手名称。
    #[serde(rename = "welcomeTemplate", default = "default_welcome")]
    pub welcome_template: String,
    #[serde(default)]
    pub assistants: Vec<Assistant>,
}

fn default_timeout() -> u64 {
    120
}

fn default_welcome() -> String {
    "Hello! I'm {name}. How can I help you today?".into()
}

impl AppConfig {
    pub fn find_assistant(&self, id: &str) -> Option<&Assistant> {
        self.assistants.iter().find(|a| a.id == id)
    }

    pub fn welcome_for(&self, assistant: &Assistant) -> String {
        self.welcome_template.replace("{name}", &assistant.name)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let stream = |id: &str, name: &str, description: &str, remote: &str| Assistant {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            openai_assistant_id: Some(remote.into()),
            backend: BackendKind::AssistantStream { url: None },
        };

        Self {
            api_url: "http://localhost:5173/api/chat".into(),
            request_timeout_secs: default_timeout(),
            welcome_template: default_welcome(),
            assistants: vec![
                stream(
                    "general-assistant",
                    "General Assistant",
                    "Answers questions, summarizes, translates.",
                    "asst_XYZ987UVW654RST123",
                ),
                stream(
                    "dall-e-images",
                    "Image Generator",
                    "Creates images from text prompts.",
                    "asst_ABC123DEF456GHI789",
                ),
                stream(
                    "asistente-senalizacion",
                    "Traffic Signage Assistant",
                    "Identifies and explains traffic signs from photos or descriptions.",
                    "asst_MXuUc0TcV7aPYkLGbN5glitq",
                ),
                Assistant {
                    id: "responses".into(),
                    name: "GPT Responses".into(),
                    description: "Single-shot replies through the Responses API proxy.".into(),
                    openai_assistant_id: None,
                    backend: BackendKind::Responses {
                        url: "http://localhost:8787/api/chat".into(),
                    },
                },
                Assistant {
                    id: "n8n".into(),
                    name: "n8n Agent".into(),
                    description: "Automation workflow behind an n8n webhook.".into(),
                    openai_assistant_id: None,
                    backend: BackendKind::Webhook {
                        url: "http://localhost:5678/webhook/chat-agent".into(),
                        input_field: "chatInput".into(),
                        extract: vec![],
                        tools_url: None,
                    },
                },
                Assistant {
                    id: "chat-webhook".into(),
                    name: "Webhook Chat".into(),
                    description: "Plain webhook answering with {reply} or {text}.".into(),
                    openai_assistant_id: None,
                    backend: BackendKind::Webhook {
                        url: "http://localhost:5678/webhook/chat".into(),
                        input_field: "message".into(),
                        extract: vec!["/reply".into(), "/text".into(), "".into()],
                        tools_url: None,
                    },
                },
                Assistant {
                    id: "mcp".into(),
                    name: "MCP Assistant".into(),
                    description: "Local tools exposed through the MCP bridge.".into(),
                    openai_assistant_id: None,
                    backend: BackendKind::Webhook {
                        url: "http://localhost:7000/mcp".into(),
                        input_field: "chatInput".into(),
                        extract: vec![],
                        tools_url: Some("http://localhost:5678/webhook/mcp/tools".into()),
                    },
                },
            ],
        }
    }
}
