//! 会话持久化。
//!
//! 核心逻辑只依赖 [`KvStore`] 这个键值接口，具体介质（内存、SQLite）由调用方注入。
//! 每个助手占两条记录：`threadId_<key>` 存线程 ID，`messages_<key>` 存消息数组（JSON）。

use crate::error::Result;
use crate::models::{Message, StoredConversation};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// 文本键值存储端口。
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// 进程内存储，测试和临时会话使用。
#[derive(Default, Clone)]
pub struct MemoryKv(Arc<DashMap<String, String>>);

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.0.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.0.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.0.remove(key);
        Ok(())
    }
}

fn thread_key(assistant: &str) -> String {
    format!("threadId_{}", assistant)
}

fn messages_key(assistant: &str) -> String {
    format!("messages_{}", assistant)
}

/// 按助手读写会话状态的适配器。
///
/// 存储失败只记日志：读取失败当作没有缓存，写入失败直接忽略，
/// 不会阻塞用户正在进行的这一轮对话。
#[derive(Clone)]
pub struct ConversationStore {
    kv: Arc<dyn KvStore>,
}

impl ConversationStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKv::new()))
    }

    /// 读取某个助手的会话。两条记录都不存在时返回 `None`。
    pub fn load(&self, assistant: &str) -> Option<StoredConversation> {
        match self.try_load(assistant) {
            Ok(found) => found,
            Err(e) => {
                warn!(target: "aio_chat::store", "load {} failed, treating as empty: {}", assistant, e);
                None
            }
        }
    }

    fn try_load(&self, assistant: &str) -> Result<Option<StoredConversation>> {
        let thread_id = self.kv.get(&thread_key(assistant))?.filter(|id| !id.is_empty());
        let messages = self.kv.get(&messages_key(assistant))?;

        if thread_id.is_none() && messages.is_none() {
            return Ok(None);
        }

        let mut transcript: Vec<Message> = match messages {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
        for msg in &mut transcript {
            msg.streaming = false;
        }

        debug!(target: "aio_chat::store", "restored {} messages for {}", transcript.len(), assistant);
        Ok(Some(StoredConversation {
            thread_id,
            transcript,
        }))
    }

    /// 保存完整状态。调用方保证此时没有消息处于流式状态。
    pub fn save(&self, assistant: &str, state: &StoredConversation) {
        if let Err(e) = self.try_save(assistant, state) {
            warn!(target: "aio_chat::store", "save {} failed: {}", assistant, e);
        }
    }

    fn try_save(&self, assistant: &str, state: &StoredConversation) -> Result<()> {
        match &state.thread_id {
            Some(id) => self.kv.set(&thread_key(assistant), id)?,
            None => self.kv.remove(&thread_key(assistant))?,
        }
        let json = serde_json::to_string(&state.transcript)?;
        self.kv.set(&messages_key(assistant), &json)
    }

    /// 线程 ID 一到就单独落盘，与记录保存互不依赖。
    pub fn save_thread_id(&self, assistant: &str, thread_id: &str) {
        if let Err(e) = self.kv.set(&thread_key(assistant), thread_id) {
            warn!(target: "aio_chat::store", "save thread id for {} failed: {}", assistant, e);
        }
    }

    pub fn clear(&self, assistant: &str) {
        for key in [thread_key(assistant), messages_key(assistant)] {
            if let Err(e) = self.kv.remove(&key) {
                warn!(target: "aio_chat::store", "remove {} failed: {}", key, e);
            }
        }
    }
}
