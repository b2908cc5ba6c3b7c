//! 存储模块 - 同步引擎的数据持久化层
//!
//! 采用分层架构设计：
//! - StorageManager: 统一的存储管理器，单一逻辑写者，串行化所有库访问
//! - Entities: 数据实体定义，类型安全的数据传输
//! - ChangeFeed: 提交后广播脏数据变更，驱动推送协调器
//! - KvStore: sled 小状态存储（游标等）
//!
//! 引擎自身的簿记写入（syncing 标志、last_error、transfer_task_id）
//! 不产生变更事件，否则失败落盘会立刻再触发推送形成热循环；
//! 重试只依赖编辑层保存与固定间隔定时器。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use rusqlite::{params, Connection, Row};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::error::{FieldSyncError, Result};
use crate::remote::{AttachmentDescriptor, ObservationResponse};

pub mod change_feed;
pub mod entities;
pub mod kv;
pub mod media_cache;

pub use change_feed::{ChangeEntity, ChangeEvent, ChangeKind};
pub use entities::{now_millis, Attachment, Observation, PendingAttachmentMeta, SyncErrorInfo};
pub use kv::KvStore;
pub use media_cache::MediaCache;

/// 推送成功回写的结果
///
/// 行删除在事务内完成；字节文件删除由调用方在提交后执行，
/// 避免事务持锁期间做文件 IO。
#[derive(Debug, Default)]
pub struct PushReconcileOutcome {
    /// 被服务端权威列表淘汰的附件的本地字节路径
    pub deleted_paths: Vec<String>,
    /// 本次物化出的新附件（脏，待上传）
    pub materialized_ids: Vec<i64>,
}

/// 批量导入单行结果（游标推进用）
#[derive(Debug, Clone)]
pub struct ImportedObservation {
    pub id: i64,
    pub last_modified: i64,
    pub author_remote_id: Option<String>,
}

/// 存储管理器
pub struct StorageManager {
    /// 单一 sqlite 连接；tokio Mutex 串行化同步/异步两侧的访问
    conn: Mutex<Connection>,
    change_tx: broadcast::Sender<ChangeEvent>,
    data_dir: PathBuf,
}

impl StorageManager {
    /// 打开（或创建）数据目录下的主库
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| FieldSyncError::IO(format!("创建数据目录失败: {}", e)))?;

        let db_path = data_dir.join("fieldsync.db");
        let conn = Connection::open(&db_path)?;
        Self::create_tables(&conn)?;

        let (change_tx, _) = broadcast::channel(1024);

        info!("存储已打开: {}", db_path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            change_tx,
            data_dir: data_dir.to_path_buf(),
        })
    }

    /// 内存库（测试用）
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::create_tables(&conn)?;
        let (change_tx, _) = broadcast::channel(1024);
        Ok(Self {
            conn: Mutex::new(conn),
            change_tx,
            data_dir: PathBuf::from("."),
        })
    }

    fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS observation (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                remote_id TEXT,
                dirty INTEGER NOT NULL DEFAULT 1,
                syncing INTEGER NOT NULL DEFAULT 0,
                error_status INTEGER,
                error_description TEXT,
                error_message TEXT,
                last_modified INTEGER NOT NULL,
                properties TEXT NOT NULL,
                geometry TEXT,
                author_remote_id TEXT,
                pending_attachments TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_observation_dirty ON observation(dirty);
            CREATE INDEX IF NOT EXISTS idx_observation_remote ON observation(remote_id);

            CREATE TABLE IF NOT EXISTS attachment (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                remote_id TEXT,
                observation_id INTEGER NOT NULL REFERENCES observation(id),
                dirty INTEGER NOT NULL DEFAULT 1,
                marked_for_deletion INTEGER NOT NULL DEFAULT 0,
                local_path TEXT,
                url TEXT,
                content_type TEXT,
                name TEXT,
                field_name TEXT,
                last_modified INTEGER NOT NULL,
                transfer_task_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_attachment_parent ON attachment(observation_id);
            CREATE INDEX IF NOT EXISTS idx_attachment_dirty ON attachment(dirty, marked_for_deletion);
            "#,
        )?;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// 订阅变更通知
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.change_tx.subscribe()
    }

    fn emit(&self, event: ChangeEvent) {
        // 无订阅者时 send 失败属正常场景（引擎未 start），仅打 debug
        if self.change_tx.send(event).is_err() {
            debug!("变更事件无接收者: {:?}", event);
        }
    }

    // ---------- 行映射 ----------

    fn observation_from_row(row: &Row<'_>) -> rusqlite::Result<Observation> {
        let error_status: Option<u16> = row.get(4)?;
        let error_description: Option<String> = row.get(5)?;
        let error_message: Option<String> = row.get(6)?;
        let last_error = if error_status.is_some()
            || error_description.is_some()
            || error_message.is_some()
        {
            Some(SyncErrorInfo {
                status_code: error_status,
                description: error_description,
                server_message: error_message,
            })
        } else {
            None
        };
        let pending_json: String = row.get(11)?;
        let pending_attachments =
            serde_json::from_str(&pending_json).unwrap_or_default();
        Ok(Observation {
            id: Some(row.get(0)?),
            remote_id: row.get(1)?,
            dirty: row.get::<_, i64>(2)? != 0,
            syncing: row.get::<_, i64>(3)? != 0,
            last_error,
            last_modified: row.get(7)?,
            properties: row.get(8)?,
            geometry: row.get(9)?,
            author_remote_id: row.get(10)?,
            pending_attachments,
        })
    }

    fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<Attachment> {
        Ok(Attachment {
            id: Some(row.get(0)?),
            remote_id: row.get(1)?,
            observation_id: row.get(2)?,
            dirty: row.get::<_, i64>(3)? != 0,
            marked_for_deletion: row.get::<_, i64>(4)? != 0,
            local_path: row.get(5)?,
            url: row.get(6)?,
            content_type: row.get(7)?,
            name: row.get(8)?,
            field_name: row.get(9)?,
            last_modified: row.get(10)?,
            transfer_task_id: row.get(11)?,
        })
    }

    const OBSERVATION_COLS: &'static str = "id, remote_id, dirty, syncing, error_status, \
         error_description, error_message, last_modified, properties, geometry, \
         author_remote_id, pending_attachments";

    const ATTACHMENT_COLS: &'static str = "id, remote_id, observation_id, dirty, \
         marked_for_deletion, local_path, url, content_type, name, field_name, \
         last_modified, transfer_task_id";

    // ---------- 记录 CRUD（编辑层入口，命中谓词时广播） ----------

    /// 插入一条记录；dirty 时广播 Inserted
    pub async fn insert_observation(&self, obs: &Observation) -> Result<i64> {
        let id = {
            let conn = self.conn.lock().await;
            let (status, description, message) = error_cols(&obs.last_error);
            conn.execute(
                "INSERT INTO observation (remote_id, dirty, syncing, error_status, \
                 error_description, error_message, last_modified, properties, geometry, \
                 author_remote_id, pending_attachments) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    obs.remote_id,
                    obs.dirty as i64,
                    obs.syncing as i64,
                    status,
                    description,
                    message,
                    obs.last_modified,
                    obs.properties,
                    obs.geometry,
                    obs.author_remote_id,
                    serde_json::to_string(&obs.pending_attachments)?,
                ],
            )?;
            conn.last_insert_rowid()
        };
        if obs.dirty {
            self.emit(ChangeEvent::inserted(ChangeEntity::Observation(id)));
        }
        Ok(id)
    }

    /// 整行更新一条记录；dirty 时广播 Updated
    pub async fn update_observation(&self, obs: &Observation) -> Result<()> {
        let id = obs
            .id
            .ok_or_else(|| FieldSyncError::InvalidArgument("observation 缺少本地 ID".into()))?;
        {
            let conn = self.conn.lock().await;
            let (status, description, message) = error_cols(&obs.last_error);
            conn.execute(
                "UPDATE observation SET remote_id = ?1, dirty = ?2, syncing = ?3, \
                 error_status = ?4, error_description = ?5, error_message = ?6, \
                 last_modified = ?7, properties = ?8, geometry = ?9, \
                 author_remote_id = ?10, pending_attachments = ?11 WHERE id = ?12",
                params![
                    obs.remote_id,
                    obs.dirty as i64,
                    obs.syncing as i64,
                    status,
                    description,
                    message,
                    obs.last_modified,
                    obs.properties,
                    obs.geometry,
                    obs.author_remote_id,
                    serde_json::to_string(&obs.pending_attachments)?,
                    id,
                ],
            )?;
        }
        if obs.dirty {
            self.emit(ChangeEvent::updated(ChangeEntity::Observation(id)));
        }
        Ok(())
    }

    pub async fn get_observation(&self, id: i64) -> Result<Option<Observation>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM observation WHERE id = ?1",
            Self::OBSERVATION_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], Self::observation_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// 所有待推送记录的本地 ID（定时器兜底扫描用）
    pub async fn list_dirty_observation_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT id FROM observation WHERE dirty = 1")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    pub async fn find_observation_by_remote_id(&self, remote_id: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT id FROM observation WHERE remote_id = ?1")?;
        let mut rows = stmt.query_map(params![remote_id], |row| row.get(0))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // ---------- 附件 CRUD ----------

    /// 插入附件；父关联存在即命中谓词，广播 Inserted
    pub async fn insert_attachment(&self, att: &Attachment) -> Result<i64> {
        let id = {
            let conn = self.conn.lock().await;
            Self::insert_attachment_tx(&conn, att)?
        };
        self.emit(ChangeEvent::inserted(ChangeEntity::Attachment(id)));
        Ok(id)
    }

    fn insert_attachment_tx(conn: &Connection, att: &Attachment) -> Result<i64> {
        conn.execute(
            "INSERT INTO attachment (remote_id, observation_id, dirty, marked_for_deletion, \
             local_path, url, content_type, name, field_name, last_modified, transfer_task_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                att.remote_id,
                att.observation_id,
                att.dirty as i64,
                att.marked_for_deletion as i64,
                att.local_path,
                att.url,
                att.content_type,
                att.name,
                att.field_name,
                att.last_modified,
                att.transfer_task_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 整行更新附件并广播 Updated（编辑层入口，如标记删除）
    pub async fn update_attachment(&self, att: &Attachment) -> Result<()> {
        let id = att
            .id
            .ok_or_else(|| FieldSyncError::InvalidArgument("attachment 缺少本地 ID".into()))?;
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE attachment SET remote_id = ?1, observation_id = ?2, dirty = ?3, \
                 marked_for_deletion = ?4, local_path = ?5, url = ?6, content_type = ?7, \
                 name = ?8, field_name = ?9, last_modified = ?10, transfer_task_id = ?11 \
                 WHERE id = ?12",
                params![
                    att.remote_id,
                    att.observation_id,
                    att.dirty as i64,
                    att.marked_for_deletion as i64,
                    att.local_path,
                    att.url,
                    att.content_type,
                    att.name,
                    att.field_name,
                    att.last_modified,
                    att.transfer_task_id,
                    id,
                ],
            )?;
        }
        self.emit(ChangeEvent::updated(ChangeEntity::Attachment(id)));
        Ok(())
    }

    pub async fn get_attachment(&self, id: i64) -> Result<Option<Attachment>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM attachment WHERE id = ?1",
            Self::ATTACHMENT_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], Self::attachment_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub async fn attachments_for_observation(&self, observation_id: i64) -> Result<Vec<Attachment>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM attachment WHERE observation_id = ?1",
            Self::ATTACHMENT_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let atts = stmt
            .query_map(params![observation_id], Self::attachment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(atts)
    }

    /// 所有待处理附件的本地 ID（待上传或待删除，定时器兜底扫描用）
    pub async fn list_sync_pending_attachment_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT id FROM attachment WHERE dirty = 1 OR marked_for_deletion = 1")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// 删除附件行，返回其字节路径（文件删除由调用方负责）
    pub async fn delete_attachment_entity(&self, id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT local_path FROM attachment WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], |row| row.get::<_, Option<String>>(0))?;
        let path = match rows.next() {
            Some(row) => row?,
            None => return Ok(None),
        };
        drop(rows);
        drop(stmt);
        conn.execute("DELETE FROM attachment WHERE id = ?1", params![id])?;
        Ok(path)
    }

    // ---------- 引擎簿记（不广播，避免失败落盘触发热循环） ----------

    /// 置 syncing 标志（仅供 UI 展示）
    pub async fn mark_observation_syncing(&self, id: i64, syncing: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE observation SET syncing = ?1 WHERE id = ?2",
            params![syncing as i64, id],
        )?;
        Ok(())
    }

    /// 整体覆盖 last_error 并清 syncing；记录保持 dirty 等待下次触发
    pub async fn record_observation_failure(&self, id: i64, error: SyncErrorInfo) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE observation SET syncing = 0, error_status = ?1, \
             error_description = ?2, error_message = ?3 WHERE id = ?4",
            params![error.status_code, error.description, error.server_message, id],
        )?;
        Ok(())
    }

    /// 写入/清除附件的传输关联 ID
    pub async fn set_attachment_transfer_id(&self, id: i64, transfer_id: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE attachment SET transfer_task_id = ?1 WHERE id = ?2",
            params![transfer_id, id],
        )?;
        Ok(())
    }

    /// 附件上传成功回写：远端身份 + URL，清 dirty 与传输 ID
    pub async fn apply_attachment_upload_success(
        &self,
        id: i64,
        remote_id: &str,
        name: Option<&str>,
        url: &str,
        last_modified: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE attachment SET remote_id = ?1, name = COALESCE(?2, name), url = ?3, \
             last_modified = COALESCE(?4, last_modified), dirty = 0, transfer_task_id = NULL \
             WHERE id = ?5",
            params![remote_id, name, url, last_modified, id],
        )?;
        Ok(())
    }

    /// 记录推送成功的事务性回写
    ///
    /// 单个事务内完成：
    /// 1. 服务端负载覆盖本地 properties/geometry，写 remote_id，清 dirty/syncing/last_error
    /// 2. 响应里缺 URL 的附件描述，按 (field_name, name) 精确匹配 pending 元数据物化为脏附件实体
    /// 3. 本地已有远端身份、但不在服务端权威列表里的附件，删除其行（字节路径返回给调用方）
    pub async fn apply_push_success(
        &self,
        id: i64,
        response: &ObservationResponse,
    ) -> Result<PushReconcileOutcome> {
        let mut outcome = PushReconcileOutcome::default();
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;

            let (mut pending, obs_found): (Vec<PendingAttachmentMeta>, bool) = {
                let mut stmt =
                    tx.prepare("SELECT pending_attachments FROM observation WHERE id = ?1")?;
                let mut rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
                match rows.next() {
                    Some(row) => (serde_json::from_str(&row?).unwrap_or_default(), true),
                    None => (Vec::new(), false),
                }
            };
            if !obs_found {
                return Err(FieldSyncError::NotFound(format!("observation {}", id)));
            }

            // 1. 服务端版本覆盖本地
            let consumed_start = pending.len();
            let mut materialized: Vec<Attachment> = Vec::new();
            for descriptor in &response.attachments {
                if descriptor.url.is_some() {
                    continue;
                }
                if let Some(att) = take_pending_match(&mut pending, descriptor, id) {
                    materialized.push(att);
                }
            }
            debug!(
                "push 回写: observation {} 物化 {} 个附件（剩余 pending {}/{}）",
                id,
                materialized.len(),
                pending.len(),
                consumed_start
            );

            tx.execute(
                "UPDATE observation SET remote_id = ?1, dirty = 0, syncing = 0, \
                 error_status = NULL, error_description = NULL, error_message = NULL, \
                 last_modified = ?2, properties = ?3, geometry = ?4, pending_attachments = ?5 \
                 WHERE id = ?6",
                params![
                    response.remote_id,
                    response.last_modified,
                    response.properties,
                    response.geometry,
                    serde_json::to_string(&pending)?,
                    id,
                ],
            )?;

            // 2. 物化缺 URL 的附件描述
            for att in &materialized {
                let new_id = Self::insert_attachment_tx(&tx, att)?;
                outcome.materialized_ids.push(new_id);
            }

            // 3. 服务端权威列表之外的本地附件淘汰
            let confirmed: HashSet<&str> = response
                .attachments
                .iter()
                .map(|d| d.remote_id.as_str())
                .collect();
            {
                let mut stmt = tx.prepare(
                    "SELECT id, remote_id, local_path FROM attachment \
                     WHERE observation_id = ?1 AND remote_id IS NOT NULL",
                )?;
                let rows = stmt.query_map(params![id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })?;
                let mut stale: Vec<(i64, Option<String>)> = Vec::new();
                for row in rows {
                    let (att_id, remote_id, local_path) = row?;
                    if !confirmed.contains(remote_id.as_str()) {
                        stale.push((att_id, local_path));
                    }
                }
                drop(stmt);
                for (att_id, local_path) in stale {
                    tx.execute("DELETE FROM attachment WHERE id = ?1", params![att_id])?;
                    if let Some(path) = local_path {
                        outcome.deleted_paths.push(path);
                    }
                }
            }

            tx.commit()?;
        }

        // 提交成功后再广播（物化出的附件需要上传）
        for att_id in &outcome.materialized_ids {
            self.emit(ChangeEvent::inserted(ChangeEntity::Attachment(*att_id)));
        }
        Ok(outcome)
    }

    // ---------- 批量导入 ----------

    /// 导入一个分片：按 remote_id 去重，一个有界事务一次提交
    ///
    /// 导入的记录不脏（dirty=0），不会进入推送回路。
    pub async fn import_observations_chunk(
        &self,
        observations: Vec<Observation>,
    ) -> Result<Vec<ImportedObservation>> {
        let mut created = Vec::new();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for obs in observations {
            if let Some(ref remote_id) = obs.remote_id {
                let exists: bool = {
                    let mut stmt =
                        tx.prepare("SELECT 1 FROM observation WHERE remote_id = ?1 LIMIT 1")?;
                    stmt.exists(params![remote_id])?
                };
                if exists {
                    continue;
                }
            }
            tx.execute(
                "INSERT INTO observation (remote_id, dirty, syncing, last_modified, \
                 properties, geometry, author_remote_id, pending_attachments) \
                 VALUES (?1, 0, 0, ?2, ?3, ?4, ?5, '[]')",
                params![
                    obs.remote_id,
                    obs.last_modified,
                    obs.properties,
                    obs.geometry,
                    obs.author_remote_id,
                ],
            )?;
            created.push(ImportedObservation {
                id: tx.last_insert_rowid(),
                last_modified: obs.last_modified,
                author_remote_id: obs.author_remote_id,
            });
        }
        tx.commit()?;
        Ok(created)
    }
}

fn error_cols(error: &Option<SyncErrorInfo>) -> (Option<u16>, Option<String>, Option<String>) {
    match error {
        Some(e) => (
            e.status_code,
            e.description.clone(),
            e.server_message.clone(),
        ),
        None => (None, None, None),
    }
}

/// 按 (field_name, name) 精确匹配并取走一条 pending 元数据，构造待上传附件
fn take_pending_match(
    pending: &mut Vec<PendingAttachmentMeta>,
    descriptor: &AttachmentDescriptor,
    observation_id: i64,
) -> Option<Attachment> {
    let field = descriptor.field_name.as_deref()?;
    let name = descriptor.name.as_deref()?;
    let idx = pending
        .iter()
        .position(|p| p.field_name == field && p.name == name)?;
    let meta = pending.remove(idx);
    Some(Attachment {
        id: None,
        remote_id: Some(descriptor.remote_id.clone()),
        observation_id,
        dirty: true,
        marked_for_deletion: false,
        local_path: Some(meta.local_path),
        url: None,
        content_type: meta.content_type.or_else(|| descriptor.content_type.clone()),
        name: Some(meta.name),
        field_name: Some(meta.field_name),
        last_modified: descriptor.last_modified.unwrap_or(0),
        transfer_task_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirty_observation() -> Observation {
        Observation::new_local(r#"{"type":"animal"}"#.into(), None, 1000)
    }

    #[tokio::test]
    async fn test_observation_roundtrip() {
        let storage = StorageManager::open_in_memory().unwrap();
        let id = storage.insert_observation(&dirty_observation()).await.unwrap();

        let loaded = storage.get_observation(id).await.unwrap().unwrap();
        assert!(loaded.dirty);
        assert_eq!(loaded.properties, r#"{"type":"animal"}"#);
        assert!(loaded.remote_id.is_none());

        let dirty_ids = storage.list_dirty_observation_ids().await.unwrap();
        assert_eq!(dirty_ids, vec![id]);
    }

    #[tokio::test]
    async fn test_change_feed_emits_for_dirty_insert() {
        let storage = StorageManager::open_in_memory().unwrap();
        let mut rx = storage.subscribe_changes();

        let id = storage.insert_observation(&dirty_observation()).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Inserted);
        assert_eq!(event.entity, ChangeEntity::Observation(id));
    }

    #[tokio::test]
    async fn test_change_feed_silent_for_clean_insert() {
        let storage = StorageManager::open_in_memory().unwrap();
        let mut rx = storage.subscribe_changes();

        let mut obs = dirty_observation();
        obs.dirty = false;
        storage.insert_observation(&obs).await.unwrap();

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_bookkeeping_writes_do_not_emit() {
        let storage = StorageManager::open_in_memory().unwrap();
        let id = storage.insert_observation(&dirty_observation()).await.unwrap();

        let mut rx = storage.subscribe_changes();
        storage.mark_observation_syncing(id, true).await.unwrap();
        storage
            .record_observation_failure(id, SyncErrorInfo::transport("connection refused"))
            .await
            .unwrap();

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        let loaded = storage.get_observation(id).await.unwrap().unwrap();
        assert!(loaded.dirty);
        assert!(!loaded.syncing);
        assert_eq!(
            loaded.last_error.unwrap().description.as_deref(),
            Some("connection refused")
        );
    }

    #[tokio::test]
    async fn test_import_chunk_dedup_by_remote_id() {
        let storage = StorageManager::open_in_memory().unwrap();

        let mut first = dirty_observation();
        first.dirty = false;
        first.remote_id = Some("r-1".into());
        storage.insert_observation(&first).await.unwrap();

        let mut dup = first.clone();
        dup.id = None;
        let mut fresh = dirty_observation();
        fresh.dirty = false;
        fresh.remote_id = Some("r-2".into());
        fresh.last_modified = 2000;

        let created = storage
            .import_observations_chunk(vec![dup, fresh])
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].last_modified, 2000);
    }

    #[tokio::test]
    async fn test_apply_push_success_reconciles_attachments() {
        let storage = StorageManager::open_in_memory().unwrap();
        let mut obs = dirty_observation();
        obs.pending_attachments = vec![PendingAttachmentMeta {
            field_name: "photos".into(),
            name: "IMG_001.jpg".into(),
            local_path: "/tmp/IMG_001.jpg".into(),
            content_type: Some("image/jpeg".into()),
        }];
        let obs_id = storage.insert_observation(&obs).await.unwrap();

        // 已上传过的附件 A（会被确认）与 B（会被服务端淘汰）
        let base = Attachment {
            id: None,
            remote_id: Some("att-a".into()),
            observation_id: obs_id,
            dirty: false,
            marked_for_deletion: false,
            local_path: Some("/tmp/a.jpg".into()),
            url: Some("https://files/a".into()),
            content_type: Some("image/jpeg".into()),
            name: Some("a.jpg".into()),
            field_name: Some("photos".into()),
            last_modified: 10,
            transfer_task_id: None,
        };
        let a_id = storage.insert_attachment(&base).await.unwrap();
        let mut b = base.clone();
        b.remote_id = Some("att-b".into());
        b.local_path = Some("/tmp/b.jpg".into());
        let b_id = storage.insert_attachment(&b).await.unwrap();

        let response = ObservationResponse {
            remote_id: "42".into(),
            properties: r#"{"type":"animal","reviewed":true}"#.into(),
            geometry: None,
            last_modified: 5000,
            attachments: vec![
                AttachmentDescriptor {
                    remote_id: "att-a".into(),
                    name: Some("a.jpg".into()),
                    field_name: Some("photos".into()),
                    content_type: Some("image/jpeg".into()),
                    url: Some("https://files/a".into()),
                    last_modified: Some(10),
                },
                // 缺 URL，应从 pending 物化
                AttachmentDescriptor {
                    remote_id: "att-new".into(),
                    name: Some("IMG_001.jpg".into()),
                    field_name: Some("photos".into()),
                    content_type: None,
                    url: None,
                    last_modified: Some(5000),
                },
            ],
        };

        let outcome = storage.apply_push_success(obs_id, &response).await.unwrap();

        // B 被淘汰，字节路径返回给调用方
        assert_eq!(outcome.deleted_paths, vec!["/tmp/b.jpg".to_string()]);
        assert!(storage.get_attachment(b_id).await.unwrap().is_none());
        // A 原样保留
        assert!(storage.get_attachment(a_id).await.unwrap().is_some());

        // 物化出的新附件：脏、带远端身份、待上传
        assert_eq!(outcome.materialized_ids.len(), 1);
        let new_att = storage
            .get_attachment(outcome.materialized_ids[0])
            .await
            .unwrap()
            .unwrap();
        assert!(new_att.dirty);
        assert_eq!(new_att.remote_id.as_deref(), Some("att-new"));
        assert_eq!(new_att.local_path.as_deref(), Some("/tmp/IMG_001.jpg"));

        // 记录本身：远端身份 + 服务端负载，干净无错
        let obs = storage.get_observation(obs_id).await.unwrap().unwrap();
        assert!(!obs.dirty);
        assert_eq!(obs.remote_id.as_deref(), Some("42"));
        assert!(obs.last_error.is_none());
        assert!(obs.properties.contains("reviewed"));
        assert!(obs.pending_attachments.is_empty());
    }
}
