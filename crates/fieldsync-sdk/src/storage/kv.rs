//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 存放引擎的小状态：拉取游标、初始化标记等。
//! 与 sqlite 主库分开，避免小状态写入打扰记录事务。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::error::{FieldSyncError, Result};

/// KV 存储组件
#[derive(Debug)]
#[allow(dead_code)]
pub struct KvStore {
    base_path: PathBuf,
    db: Arc<Db>,
    tree: Tree,
}

impl KvStore {
    /// 创建新的 KV 存储实例
    pub async fn new(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| FieldSyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 打开 sled 数据库（进程重启后旧实例可能刚释放锁，重试多次带退避）
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<sled::Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            FieldSyncError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let tree = db
            .open_tree("engine_state")
            .map_err(|e| FieldSyncError::KvStore(format!("打开 Tree 失败: {}", e)))?;

        Ok(Self {
            base_path,
            db: Arc::new(db),
            tree,
        })
    }

    /// 设置键值对
    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| FieldSyncError::Serialization(format!("序列化值失败: {}", e)))?;

        self.tree
            .insert(key, value_bytes)
            .map_err(|e| FieldSyncError::KvStore(format!("设置键值对失败: {}", e)))?;

        Ok(())
    }

    /// 获取键值对
    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let result = self
            .tree
            .get(key)
            .map_err(|e| FieldSyncError::KvStore(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| FieldSyncError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除键值对
    pub async fn delete<K>(&self, key: K) -> Result<()>
    where
        K: AsRef<[u8]>,
    {
        self.tree
            .remove(key)
            .map_err(|e| FieldSyncError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(())
    }

    /// 检查键是否存在
    pub async fn exists<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        self.tree
            .contains_key(key)
            .map_err(|e| FieldSyncError::KvStore(format!("检查键存在失败: {}", e)))
    }

    /// 落盘（关闭前调用）
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| FieldSyncError::KvStore(format!("flush 失败: {}", e)))?;
        Ok(())
    }
}

/// 常用的键前缀常量
pub mod keys {
    /// 拉取游标前缀
    pub const FETCH_CURSOR: &str = "fetch_cursor";
    /// 初始全量拉取完成标记前缀
    pub const INITIAL_FETCH_DONE: &str = "initial_fetch_done";
}
