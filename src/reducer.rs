//! 会话状态机：把后端事件逐个折叠进对话记录和线程 ID。
//!
//! 每一轮对话的阶段为 `Idle → AwaitingThread → Streaming → Settled`，
//! 失败或终止事件可以在任何阶段直接结束本轮。
//! 同一时刻最多只有一条 `streaming = true` 的消息，即本轮的占位消息。

use crate::models::{Message, Role, StoredConversation};
use crate::sse::{EventKind, ServerEvent};
use crate::utils::strip_citations;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// 合成欢迎语使用的固定 ID。
pub const WELCOME_ID: &str = "welcome";

const MAX_DIAGNOSTICS: usize = 50;
const STREAM_CUT_SHORT: &str = "stream ended without completion";
const CONNECTION_ERROR: &str = "connection error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    AwaitingThread,
    Streaming,
    Settled,
}

/// 未识别事件的记录，供界面或日志查看。
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: String,
    pub raw: Value,
    pub received_at: DateTime<Utc>,
}

/// 折叠一个事件后产生的副作用，由会话层执行（持久化、渲染、解锁输入）。
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// 首次得知线程 ID，需立即持久化。
    ThreadEstablished(String),
    /// 旁路提示，不进入对话记录。
    Notice(String),
    Appended { id: String, text: String },
    MessageSettled { id: String },
    Error(String),
    Diagnostic(Diagnostic),
    /// 本轮结束，可以解锁输入。
    TurnFinished,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    thread_id: Option<String>,
    transcript: Vec<Message>,
    placeholder: Option<String>,
    phase: TurnPhase,
    last_error: Option<String>,
    error_this_turn: bool,
    diagnostics: VecDeque<Diagnostic>,
}

impl Conversation {
    pub fn new(thread_id: Option<String>, transcript: Vec<Message>) -> Self {
        Self {
            thread_id,
            transcript,
            placeholder: None,
            phase: TurnPhase::Idle,
            last_error: None,
            error_this_turn: false,
            diagnostics: VecDeque::new(),
        }
    }

    /// 只有一条欢迎语的新会话。
    pub fn welcome(text: impl Into<String>) -> Self {
        Self::new(None, vec![Message::assistant(WELCOME_ID, text)])
    }

    /// 从存储恢复。恢复出来的消息一律不是流式状态。
    pub fn restore(stored: StoredConversation) -> Self {
        let mut transcript = stored.transcript;
        for msg in &mut transcript {
            msg.streaming = false;
        }
        Self::new(stored.thread_id, transcript)
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn placeholder_id(&self) -> Option<&str> {
        self.placeholder.as_deref()
    }

    pub fn is_streaming(&self) -> bool {
        self.transcript.iter().any(|m| m.streaming)
    }

    pub fn is_turn_active(&self) -> bool {
        matches!(self.phase, TurnPhase::AwaitingThread | TurnPhase::Streaming)
    }

    /// 记录里只有合成的欢迎语，没必要落盘。
    pub fn is_welcome_only(&self) -> bool {
        self.transcript.iter().all(|m| m.id == WELCOME_ID)
    }

    /// 可持久化的快照。仍在流式输出时返回 `None`。
    pub fn snapshot(&self) -> Option<StoredConversation> {
        if self.is_streaming() {
            return None;
        }
        Some(StoredConversation {
            thread_id: self.thread_id.clone(),
            transcript: self.transcript.clone(),
        })
    }

    /// 开始新一轮：追加用户消息，并同步创建助手占位消息。
    ///
    /// 调用方应先取消正在进行的一轮；若仍有占位消息则在此丢弃。
    pub fn begin_turn(&mut self, text: impl Into<String>, attachment: Option<String>) -> &Message {
        if self.placeholder.is_some() {
            warn!(target: "aio_chat::reducer", "begin_turn with a live placeholder, discarding it");
            self.discard_placeholder();
        }

        self.last_error = None;
        self.error_this_turn = false;
        self.transcript.push(Message::user(text, attachment));

        let placeholder = Message::placeholder();
        self.placeholder = Some(placeholder.id.clone());
        self.transcript.push(placeholder);
        self.phase = TurnPhase::AwaitingThread;

        let last = self.transcript.len() - 2;
        &self.transcript[last]
    }

    /// 按到达顺序应用一个事件。
    pub fn apply(&mut self, event: ServerEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        let ServerEvent { kind, thread_id } = event;
        let created = kind == EventKind::ThreadCreated;

        if kind == EventKind::ThreadUpdated {
            if let Some(id) = thread_id.filter(|id| !id.is_empty()) {
                if self.thread_id.as_deref() != Some(id.as_str()) {
                    debug!(target: "aio_chat::reducer", "thread advanced to {}", id);
                    self.thread_id = Some(id.clone());
                    effects.push(Effect::ThreadEstablished(id));
                }
            }
            return effects;
        }

        if let Some(id) = thread_id {
            self.record_thread(id, &mut effects);
        }

        match kind {
            EventKind::ThreadCreated | EventKind::ThreadInfo => {
                if let Some(id) = &self.thread_id {
                    let notice = if created {
                        format!("new conversation thread {}", id)
                    } else {
                        format!("continuing thread {}", id)
                    };
                    effects.push(Effect::Notice(notice));
                }
                if self.phase == TurnPhase::AwaitingThread {
                    self.phase = TurnPhase::Streaming;
                }
            }
            EventKind::ThreadUpdated => {}
            EventKind::MessageDelta { fragments } => self.append(fragments, &mut effects),
            EventKind::MessageCompleted { id } => self.complete_message(id, &mut effects),
            EventKind::RunCompleted => {
                self.settle_streaming(&mut effects);
                self.finish_turn(&mut effects);
            }
            EventKind::RunAborted { kind, message } => {
                let message = message.unwrap_or_else(|| format!("Error: {}", kind));
                self.abort_turn(message, &mut effects);
            }
            EventKind::Error { message } => {
                let message = message.unwrap_or_else(|| CONNECTION_ERROR.to_string());
                self.abort_turn(message, &mut effects);
            }
            EventKind::StreamEnded { error } => {
                self.settle_streaming(&mut effects);
                if let Some(error) = error {
                    if !self.error_this_turn {
                        self.surface_error(error, &mut effects);
                    }
                }
                self.finish_turn(&mut effects);
            }
            EventKind::Other { kind, raw } => {
                debug!(target: "aio_chat::reducer", "unrecognized event: {}", kind);
                let diagnostic = Diagnostic {
                    kind,
                    raw,
                    received_at: Utc::now(),
                };
                if self.diagnostics.len() == MAX_DIAGNOSTICS {
                    self.diagnostics.pop_front();
                }
                self.diagnostics.push_back(diagnostic.clone());
                effects.push(Effect::Diagnostic(diagnostic));
            }
        }

        effects
    }

    /// 传输层失败（网络错误、非 2xx）。线程 ID 与已落定的记录保持不变。
    pub fn fail_turn(&mut self, message: impl Into<String>) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.is_turn_active() || self.placeholder.is_some() {
            self.discard_placeholder();
            self.surface_error(message.into(), &mut effects);
            self.finish_turn(&mut effects);
        }
        effects
    }

    /// 取消本轮：丢弃占位消息，不产生错误。
    pub fn cancel_turn(&mut self) {
        if self.discard_placeholder() {
            info!(target: "aio_chat::reducer", "turn cancelled, placeholder discarded");
        }
        if self.is_turn_active() {
            self.phase = TurnPhase::Idle;
        }
    }

    /// 字节流关闭但没有收到终止事件。
    pub fn close_stream(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.is_turn_active() {
            return effects;
        }

        // 回复已经完成（占位消息已落定），或者占位消息里有内容：照常收尾
        let cut_short = self
            .placeholder_message()
            .map(|m| m.content.is_empty())
            .unwrap_or(false);

        if cut_short {
            self.discard_placeholder();
            if !self.error_this_turn {
                self.surface_error(STREAM_CUT_SHORT.to_string(), &mut effects);
            }
        } else {
            self.settle_streaming(&mut effects);
        }
        self.finish_turn(&mut effects);
        effects
    }

    fn record_thread(&mut self, id: String, effects: &mut Vec<Effect>) {
        if self.thread_id.is_none() && !id.is_empty() {
            info!(target: "aio_chat::reducer", "thread established: {}", id);
            self.thread_id = Some(id.clone());
            effects.push(Effect::ThreadEstablished(id));
        }
    }

    fn placeholder_message(&self) -> Option<&Message> {
        let id = self.placeholder.as_deref()?;
        self.transcript.iter().find(|m| m.id == id)
    }

    fn placeholder_message_mut(&mut self) -> Option<&mut Message> {
        let id = self.placeholder.as_deref()?;
        self.transcript.iter_mut().find(|m| m.id == id)
    }

    fn append(&mut self, fragments: Vec<String>, effects: &mut Vec<Effect>) {
        let Some(msg) = self.placeholder_message_mut() else {
            debug!(target: "aio_chat::reducer", "delta without placeholder ignored");
            return;
        };

        let text = fragments.concat();
        msg.content.push_str(&text);
        let id = msg.id.clone();
        self.phase = TurnPhase::Streaming;
        if !text.is_empty() {
            effects.push(Effect::Appended { id, text });
        }
    }

    fn complete_message(&mut self, final_id: Option<String>, effects: &mut Vec<Effect>) {
        let Some(msg) = self.placeholder_message_mut() else {
            debug!(target: "aio_chat::reducer", "message.completed without placeholder ignored");
            return;
        };

        msg.streaming = false;
        msg.content = strip_citations(&msg.content);
        if let Some(id) = final_id.filter(|id| !id.is_empty()) {
            msg.id = id;
        }
        let id = msg.id.clone();
        self.placeholder = None;
        effects.push(Effect::MessageSettled { id });
    }

    fn settle_streaming(&mut self, effects: &mut Vec<Effect>) {
        for msg in self.transcript.iter_mut().filter(|m| m.streaming) {
            msg.streaming = false;
            if msg.role == Role::Assistant {
                msg.content = strip_citations(&msg.content);
            }
            effects.push(Effect::MessageSettled { id: msg.id.clone() });
        }
        self.placeholder = None;
    }

    fn abort_turn(&mut self, message: String, effects: &mut Vec<Effect>) {
        self.discard_placeholder();
        self.surface_error(message, effects);
        self.finish_turn(effects);
    }

    fn discard_placeholder(&mut self) -> bool {
        match self.placeholder.take() {
            Some(id) => {
                self.transcript.retain(|m| m.id != id);
                true
            }
            None => false,
        }
    }

    fn surface_error(&mut self, message: String, effects: &mut Vec<Effect>) {
        warn!(target: "aio_chat::reducer", "turn error: {}", message);
        self.error_this_turn = true;
        self.last_error = Some(message.clone());
        effects.push(Effect::Error(message));
    }

    fn finish_turn(&mut self, effects: &mut Vec<Effect>) {
        if self.is_turn_active() {
            self.phase = TurnPhase::Settled;
            effects.push(Effect::TurnFinished);
        }
    }
}
