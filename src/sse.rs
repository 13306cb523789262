//! SSE 帧解码。
//!
//! 字节流先增量解码为 UTF-8 文本追加到缓冲区，再按空行切分为帧。
//! 只有完整落在空行之前的帧才会被解析，末尾未闭合的半帧一直留在缓冲区里。

use encoding_rs::{CoderResult, Decoder, UTF_8};
use serde_json::Value;
use tracing::{debug, warn};

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// 把原始字节块切成 JSON 帧。
pub struct FrameDecoder {
    utf8: Decoder,
    buffer: String,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            utf8: UTF_8.new_decoder_without_bom_handling(),
            buffer: String::new(),
        }
    }

    /// 追加一块字节，返回本次新凑齐的所有帧（按到达顺序）。
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.decode_into_buffer(chunk);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..pos + 2).collect();
            if let Some(value) = parse_frame(&frame[..pos]) {
                frames.push(value);
            }
        }
        frames
    }

    /// 流结束。未闭合的尾帧留在缓冲区里，永远不会输出。
    pub fn finish(&mut self) {
        let tail = self.buffer.trim();
        if !tail.is_empty() {
            debug!(target: "aio_chat::sse", "stream closed with unterminated frame ({} bytes)", tail.len());
        }
    }

    /// 当前缓冲区里尚未闭合的内容。
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn decode_into_buffer(&mut self, mut src: &[u8]) {
        loop {
            let needed = self
                .utf8
                .max_utf8_buffer_length(src.len())
                .unwrap_or(src.len().saturating_mul(3) + 16);
            self.buffer.reserve(needed);
            let (result, read, _) = self.utf8.decode_to_string(src, &mut self.buffer, false);
            src = &src[read..];
            if let CoderResult::InputEmpty = result {
                break;
            }
        }
    }
}

/// 解析单个帧：收集 `data:` 行，去掉前缀后按 JSON 解析。
fn parse_frame(frame: &str) -> Option<Value> {
    let data: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix(DATA_PREFIX))
        .map(str::trim)
        .collect();

    if data.is_empty() {
        debug!(target: "aio_chat::sse", "frame without data line skipped");
        return None;
    }

    let payload = data.join("\n");
    if payload.is_empty() || payload == DONE_SENTINEL {
        return None;
    }

    match serde_json::from_str(&payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(target: "aio_chat::sse", "malformed frame skipped: {} ({})", e, payload);
            None
        }
    }
}

/// 解码后的后端事件。
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    ThreadCreated,
    ThreadInfo,
    /// 链式后端每轮返回新的响应 ID，替换旧的线程 ID。
    ThreadUpdated,
    MessageDelta { fragments: Vec<String> },
    MessageCompleted { id: Option<String> },
    RunCompleted,
    /// `run.failed` / `run.cancelled` / `run.expired`
    RunAborted { kind: String, message: Option<String> },
    Error { message: Option<String> },
    StreamEnded { error: Option<String> },
    /// 未识别的事件，原样保留。
    Other { kind: String, raw: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    pub kind: EventKind,
    /// 代理给每一帧都带上的 `threadId`。
    pub thread_id: Option<String>,
}

impl ServerEvent {
    pub fn from_value(raw: Value) -> Self {
        let thread_id = str_at(&raw, "/threadId");
        let type_name = raw.get("type").and_then(Value::as_str).unwrap_or("").to_string();

        let kind = match normalize_type(&type_name) {
            "thread.created" => EventKind::ThreadCreated,
            "thread.info" => EventKind::ThreadInfo,
            "thread.updated" => EventKind::ThreadUpdated,
            "message.delta" => EventKind::MessageDelta {
                fragments: text_fragments(&raw),
            },
            "message.completed" => EventKind::MessageCompleted {
                id: str_at(&raw, "/data/id").or_else(|| str_at(&raw, "/id")),
            },
            "run.completed" => EventKind::RunCompleted,
            "run.failed" | "run.cancelled" | "run.expired" => EventKind::RunAborted {
                message: str_at(&raw, "/data/last_error/message"),
                kind: type_name,
            },
            "error" => EventKind::Error {
                message: str_at(&raw, "/data/details")
                    .or_else(|| str_at(&raw, "/data/message"))
                    .or_else(|| str_at(&raw, "/message")),
            },
            "stream.ended" => EventKind::StreamEnded {
                error: str_at(&raw, "/error"),
            },
            _ => EventKind::Other {
                kind: type_name,
                raw,
            },
        };

        Self { kind, thread_id }
    }

    fn bare(kind: EventKind) -> Self {
        Self {
            kind,
            thread_id: None,
        }
    }

    pub fn thread_info(thread_id: impl Into<String>) -> Self {
        Self {
            kind: EventKind::ThreadInfo,
            thread_id: Some(thread_id.into()),
        }
    }

    pub fn thread_updated(thread_id: impl Into<String>) -> Self {
        Self {
            kind: EventKind::ThreadUpdated,
            thread_id: Some(thread_id.into()),
        }
    }

    pub fn delta(text: impl Into<String>) -> Self {
        Self::bare(EventKind::MessageDelta {
            fragments: vec![text.into()],
        })
    }

    pub fn completed(id: Option<String>) -> Self {
        Self::bare(EventKind::MessageCompleted { id })
    }

    pub fn run_completed() -> Self {
        Self::bare(EventKind::RunCompleted)
    }

    pub fn stream_ended(error: Option<String>) -> Self {
        Self::bare(EventKind::StreamEnded { error })
    }
}

/// 代理转发的是 `thread.message.delta`、`thread.run.completed` 这类长名字，
/// 统一成短名字再匹配。
fn normalize_type(type_name: &str) -> &str {
    match type_name.strip_prefix("thread.") {
        Some(rest) if rest.starts_with("message.") || rest.starts_with("run.") => rest,
        _ => type_name,
    }
}

fn str_at(value: &Value, pointer: &str) -> Option<String> {
    value.pointer(pointer).and_then(Value::as_str).map(str::to_owned)
}

/// 按顺序取出所有文本片段。
fn text_fragments(raw: &Value) -> Vec<String> {
    let parts = raw
        .pointer("/data/delta/content")
        .or_else(|| raw.pointer("/delta/content"))
        .or_else(|| raw.get("content"))
        .and_then(Value::as_array);

    parts
        .into_iter()
        .flatten()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|part| {
            part.pointer("/text/value")
                .or_else(|| part.get("value"))
                .or_else(|| part.get("text"))
                .and_then(Value::as_str)
        })
        .map(str::to_owned)
        .collect()
}
