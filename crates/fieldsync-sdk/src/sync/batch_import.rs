//! 批量导入写入器
//!
//! 拉取回来的服务端负载经 [`PayloadMapper`] 映射为记录实体，按配置的
//! 分片大小分片落库，每片一个有界事务。分片从列表尾部取起——服务端
//! 按时间升序返回，最新的内容最先可见。
//!
//! 游标推进：取本轮新建记录中最大的 last_modified，自己创建的记录
//! 不参与（推送回来的回显不该把游标顶过别人的更新）。
//!
//! 通知策略：首次全量拉取只发一条批量事件；增量拉取恰好新建一条时
//! 发单条事件（UI 可高亮），多条发批量事件，零条不发。

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SharedConfig;
use crate::error::{FieldSyncError, Result};
use crate::events::{EventManager, SyncEvent};
use crate::remote::FetchScope;
use crate::storage::{Observation, StorageManager};
use super::cursor_store::FetchCursorStore;

/// 服务端负载 → 记录实体 的映射接口
///
/// 部署环境的负载字段命名不尽相同，宿主可注入自己的实现。
pub trait PayloadMapper: Send + Sync {
    fn map(&self, scope: FetchScope, payload: &serde_json::Value) -> Result<Observation>;
}

/// 默认 JSON 映射：id / properties / geometry / last_modified / author_id
#[derive(Debug, Default)]
pub struct JsonPayloadMapper;

impl PayloadMapper for JsonPayloadMapper {
    fn map(&self, _scope: FetchScope, payload: &serde_json::Value) -> Result<Observation> {
        let remote_id = match &payload["id"] {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => {
                return Err(FieldSyncError::InvalidData(
                    "负载缺少 id 字段".to_string(),
                ))
            }
        };
        let properties = match payload.get("properties") {
            Some(v) if !v.is_null() => v.to_string(),
            _ => "{}".to_string(),
        };
        let geometry = payload
            .get("geometry")
            .filter(|v| !v.is_null())
            .map(|v| v.to_string());
        let last_modified = payload["last_modified"].as_i64().unwrap_or(0);
        let author_remote_id = payload["author_id"].as_str().map(|s| s.to_string());

        Ok(Observation {
            id: None,
            remote_id: Some(remote_id),
            dirty: false,
            syncing: false,
            last_error: None,
            last_modified,
            properties,
            geometry,
            author_remote_id,
            pending_attachments: Vec::new(),
        })
    }
}

/// 分片导入写入器
pub struct BatchImportWriter {
    storage: Arc<StorageManager>,
    cursor_store: Arc<FetchCursorStore>,
    events: Arc<EventManager>,
    mapper: Arc<dyn PayloadMapper>,
    config: SharedConfig,
}

impl BatchImportWriter {
    pub fn new(
        storage: Arc<StorageManager>,
        cursor_store: Arc<FetchCursorStore>,
        events: Arc<EventManager>,
        mapper: Arc<dyn PayloadMapper>,
        config: SharedConfig,
    ) -> Self {
        Self {
            storage,
            cursor_store,
            events,
            mapper,
            config,
        }
    }

    /// 导入一轮拉取结果，返回新建记录数
    pub async fn import(
        &self,
        scope: FetchScope,
        payloads: Vec<serde_json::Value>,
    ) -> Result<usize> {
        let snapshot = self.config.snapshot();
        let chunk_size = snapshot.import_chunk_size.max(1);
        let self_remote_id = snapshot.self_remote_id;

        // 映射失败的单条跳过，不拖垮整轮
        let mut mapped: Vec<Observation> = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            match self.mapper.map(scope, payload) {
                Ok(obs) => mapped.push(obs),
                Err(e) => warn!("负载映射失败，跳过一条: {}", e),
            }
        }

        let initial = !self.cursor_store.initial_fetch_done(scope).await?;
        let mut total_created = 0usize;
        let mut cursor_high: Option<i64> = None;
        let mut last_created_id: Option<i64> = None;

        // 尾部优先分片
        while !mapped.is_empty() {
            let start = mapped.len().saturating_sub(chunk_size);
            let chunk = mapped.split_off(start);
            let chunk_len = chunk.len();
            let created = self.storage.import_observations_chunk(chunk).await?;
            debug!(
                "导入分片: {}/{} 条新建 (scope={})",
                created.len(),
                chunk_len,
                scope.as_str()
            );
            for row in created {
                total_created += 1;
                last_created_id = Some(row.id);
                let self_authored = match (&row.author_remote_id, &self_remote_id) {
                    (Some(author), Some(me)) => author == me,
                    _ => false,
                };
                if !self_authored {
                    cursor_high = Some(cursor_high.map_or(row.last_modified, |h| {
                        h.max(row.last_modified)
                    }));
                }
            }
        }

        if let Some(high) = cursor_high {
            self.cursor_store.advance(scope, high).await?;
        }

        if initial {
            if total_created > 0 {
                self.events
                    .emit(SyncEvent::BulkObservationsFetched {
                        scope,
                        count: total_created,
                    })
                    .await;
            }
            self.cursor_store.mark_initial_fetch_done(scope).await?;
            info!(
                "📥 首次拉取完成: scope={}, 新建 {} 条",
                scope.as_str(),
                total_created
            );
        } else {
            match (total_created, last_created_id) {
                (1, Some(observation_id)) => {
                    self.events
                        .emit(SyncEvent::ObservationFetched { observation_id })
                        .await;
                }
                (n, _) if n > 1 => {
                    self.events
                        .emit(SyncEvent::BulkObservationsFetched { scope, count: n })
                        .await;
                }
                _ => {}
            }
        }

        Ok(total_created)
    }
}
