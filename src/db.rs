use crate::error::{ChatError, Result};
use crate::store::KvStore;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// 默认数据库位置：系统数据目录下的 `aio-chat/chat_history.db`。
pub fn default_db_path() -> Result<PathBuf> {
    let mut path = dirs::data_dir().ok_or_else(|| ChatError::Config("无法获取数据目录".into()))?;
    path.push("aio-chat");
    path.push("chat_history.db");
    Ok(path)
}

/// 打开（必要时创建）数据库并建表。
pub fn init_db(db_path: &Path) -> Result<Connection> {
    if let Some(dir) = db_path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
        }
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );",
    )?;
    Ok(conn)
}

/// SQLite 实现的键值存储。连接放在互斥锁里，单次读写很短。
pub struct SqliteKv(Mutex<Connection>);

impl SqliteKv {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self(Mutex::new(init_db(db_path)?)))
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );",
        )?;
        Ok(Self(Mutex::new(conn)))
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.0
            .lock()
            .map_err(|_| ChatError::Storage("connection lock poisoned".into()))
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = CURRENT_TIMESTAMP",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", [key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, StoredConversation};
    use crate::store::ConversationStore;
    use std::sync::Arc;

    #[test]
    fn set_get_remove() {
        let kv = SqliteKv::in_memory().unwrap();
        assert_eq!(kv.get("k").unwrap(), None);
        kv.set("k", "v1").unwrap();
        kv.set("k", "v2").unwrap();
        assert_eq!(kv.get("k").unwrap().as_deref(), Some("v2"));
        kv.remove("k").unwrap();
        assert_eq!(kv.get("k").unwrap(), None);
    }

    #[test]
    fn state_survives_reopening_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chat.db");

        {
            let store = ConversationStore::new(Arc::new(SqliteKv::open(&path).unwrap()));
            store.save(
                "general-assistant",
                &StoredConversation {
                    thread_id: Some("thread_9".into()),
                    transcript: vec![Message::assistant("m1", "hola")],
                },
            );
        }

        let store = ConversationStore::new(Arc::new(SqliteKv::open(&path).unwrap()));
        let loaded = store.load("general-assistant").unwrap();
        assert_eq!(loaded.thread_id.as_deref(), Some("thread_9"));
        assert_eq!(loaded.transcript[0].content, "hola");
    }
}
