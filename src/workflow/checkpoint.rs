//! Checkpoint 存储：按 thread_id 保存序列化后的 WorkflowState，写入为比较并交换（CAS）
//!
//! version 从 1 开始；expected_version = 0 表示「该 thread 尚无 checkpoint」。
//! 同一 (thread_id, expected_version) 的并发 put 只有一个成功，其余返回 Conflict。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::workflow::WorkflowState;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckpointError {
    #[error("version conflict on thread {thread_id}: expected {expected}, found {actual}")]
    Conflict {
        thread_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for CheckpointError {
    fn from(err: rusqlite::Error) -> Self {
        CheckpointError::Storage(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointEntry {
    pub thread_id: String,
    pub version: u64,
    pub serialized_state: String,
}

impl CheckpointEntry {
    pub fn state(&self) -> Result<WorkflowState, CheckpointError> {
        serde_json::from_str(&self.serialized_state)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))
    }
}

fn encode(state: &WorkflowState) -> Result<String, CheckpointError> {
    serde_json::to_string(state).map_err(|e| CheckpointError::Serialization(e.to_string()))
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, thread_id: &str) -> Result<Option<CheckpointEntry>, CheckpointError>;

    /// 成功返回新版本号（expected_version + 1）
    async fn put(
        &self,
        thread_id: &str,
        state: &WorkflowState,
        expected_version: u64,
    ) -> Result<u64, CheckpointError>;
}

/// 进程内实现（测试与未配置持久化时使用）
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    entries: Mutex<HashMap<String, (u64, String)>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, thread_id: &str) -> Result<Option<CheckpointEntry>, CheckpointError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(thread_id).map(|(version, state)| CheckpointEntry {
            thread_id: thread_id.to_string(),
            version: *version,
            serialized_state: state.clone(),
        }))
    }

    async fn put(
        &self,
        thread_id: &str,
        state: &WorkflowState,
        expected_version: u64,
    ) -> Result<u64, CheckpointError> {
        let serialized = encode(state)?;
        let mut entries = self.entries.lock().await;
        let actual = entries.get(thread_id).map(|(v, _)| *v).unwrap_or(0);
        if actual != expected_version {
            return Err(CheckpointError::Conflict {
                thread_id: thread_id.to_string(),
                expected: expected_version,
                actual,
            });
        }
        let version = expected_version + 1;
        entries.insert(thread_id.to_string(), (version, serialized));
        Ok(version)
    }
}

/// SQLite 实现：checkpoints(thread_id PK, version, state, updated_at)，条件 INSERT/UPDATE 实现 CAS
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    conn: Arc<StdMutex<Connection>>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS checkpoints (
    thread_id TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

impl SqliteCheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CheckpointError::Storage(e.to_string()))?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CheckpointError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, CheckpointError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| CheckpointError::Storage(format!("join error: {e}")))?
    }
}

fn current_version(conn: &Connection, thread_id: &str) -> Result<u64, CheckpointError> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM checkpoints WHERE thread_id = ?1",
            params![thread_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0).max(0) as u64)
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get(&self, thread_id: &str) -> Result<Option<CheckpointEntry>, CheckpointError> {
        let thread_id = thread_id.to_string();
        self.blocking(move |conn| {
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT version, state FROM checkpoints WHERE thread_id = ?1",
                    params![thread_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(row.map(|(version, serialized_state)| CheckpointEntry {
                thread_id,
                version: version.max(0) as u64,
                serialized_state,
            }))
        })
        .await
    }

    async fn put(
        &self,
        thread_id: &str,
        state: &WorkflowState,
        expected_version: u64,
    ) -> Result<u64, CheckpointError> {
        let serialized = encode(state)?;
        let thread_id = thread_id.to_string();
        self.blocking(move |conn| {
            let now = Utc::now().to_rfc3339();
            let changed = if expected_version == 0 {
                conn.execute(
                    "INSERT INTO checkpoints (thread_id, version, state, updated_at)
                     VALUES (?1, 1, ?2, ?3)
                     ON CONFLICT(thread_id) DO NOTHING",
                    params![thread_id, serialized, now],
                )?
            } else {
                conn.execute(
                    "UPDATE checkpoints SET version = version + 1, state = ?2, updated_at = ?3
                     WHERE thread_id = ?1 AND version = ?4",
                    params![thread_id, serialized, now, expected_version as i64],
                )?
            };
            if changed == 0 {
                let actual = current_version(conn, &thread_id)?;
                return Err(CheckpointError::Conflict {
                    thread_id,
                    expected: expected_version,
                    actual,
                });
            }
            Ok(expected_version + 1)
        })
        .await
    }
}
