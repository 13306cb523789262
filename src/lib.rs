// src/lib.rs
pub mod commands;
pub mod db;
pub mod error;
pub mod extract;
pub mod logging;
pub mod models;
pub mod reducer;
pub mod sse;
pub mod store;
pub mod utils;

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use commands::chat::ChatSession;
pub use commands::llm::{ChatClient, TurnBackend};
pub use error::{ChatError, Result};
pub use models::{AppConfig, Assistant, BackendKind, Message, Role, StoredConversation};
pub use reducer::{Conversation, Effect, TurnPhase};
pub use store::{ConversationStore, KvStore, MemoryKv};

// --- 正在进行的传输任务 ---
pub struct ActiveStream {
    pub turn: u64,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl ActiveStream {
    fn shutdown(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// 按助手 ID 登记的流式任务。同一个助手同一时刻只有一个。
///
/// 轮次编号由所有共享该管理器的会话共用，不会重复。
#[derive(Clone, Default)]
pub struct StreamManager {
    streams: Arc<DashMap<String, ActiveStream>>,
    turns: Arc<AtomicU64>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分配下一个轮次编号（从 1 开始）。
    pub fn next_turn(&self) -> u64 {
        self.turns.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 登记新任务；若已有旧任务则先取消，返回旧任务的轮次。
    pub fn start(&self, key: &str, stream: ActiveStream) -> Option<u64> {
        let turn = stream.turn;
        let previous = self.streams.insert(key.to_string(), stream).map(|old| {
            let superseded = old.turn;
            old.shutdown();
            superseded
        });
        if let Some(old) = previous {
            debug!(target: "aio_chat::streams", "{}: turn {} superseded by {}", key, old, turn);
        }
        previous
    }

    /// 停止某个助手当前的任务（用户点击停止、重置或离开会话）。
    pub fn stop(&self, key: &str) -> Option<u64> {
        let (_, stream) = self.streams.remove(key)?;
        let turn = stream.turn;
        stream.shutdown();
        debug!(target: "aio_chat::streams", "{}: turn {} stopped", key, turn);
        Some(turn)
    }

    /// 注销某一轮。只移除轮次匹配的条目，已被取代的轮次不会误伤新任务。
    pub fn finish(&self, key: &str, turn: u64) {
        if let Some((_, stream)) = self.streams.remove_if(key, |_, stream| stream.turn == turn) {
            stream.shutdown();
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.streams.contains_key(key)
    }
}
