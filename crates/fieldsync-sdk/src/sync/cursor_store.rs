//! 拉取游标存储
//!
//! 格式：fetch_cursor:{scope}，值为该 scope 下最近一条
//! 非本人创建记录的 last_modified（毫秒）。

use std::sync::Arc;

use crate::error::Result;
use crate::remote::FetchScope;
use crate::storage::kv::{keys, KvStore};

/// 存储各 scope 的拉取高水位
pub struct FetchCursorStore {
    kv: Arc<KvStore>,
}

impl FetchCursorStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    fn key(scope: FetchScope) -> String {
        format!("{}:{}", keys::FETCH_CURSOR, scope.as_str())
    }

    fn initial_done_key(scope: FetchScope) -> String {
        format!("{}:{}", keys::INITIAL_FETCH_DONE, scope.as_str())
    }

    /// 当前高水位；None 表示尚未拉过
    pub async fn get(&self, scope: FetchScope) -> Result<Option<i64>> {
        self.kv.get::<_, i64>(Self::key(scope).as_str()).await
    }

    /// 推进高水位（只前进不后退）
    pub async fn advance(&self, scope: FetchScope, last_modified: i64) -> Result<()> {
        let current = self.get(scope).await?.unwrap_or(i64::MIN);
        if last_modified > current {
            self.kv
                .set(Self::key(scope).as_str(), &last_modified)
                .await?;
        }
        Ok(())
    }

    /// 首次全量拉取是否已完成（通知策略区分 initial / incremental）
    pub async fn initial_fetch_done(&self, scope: FetchScope) -> Result<bool> {
        Ok(self
            .kv
            .get::<_, bool>(Self::initial_done_key(scope).as_str())
            .await?
            .unwrap_or(false))
    }

    pub async fn mark_initial_fetch_done(&self, scope: FetchScope) -> Result<()> {
        self.kv
            .set(Self::initial_done_key(scope).as_str(), &true)
            .await
    }
}
