//! 附件推送协调器
//!
//! 附件独立于父记录上传：父记录先拿到服务端 ID，附件字节随后
//! multipart 上传；用户删除过的附件走服务端删除分支。
//!
//! 传输去重两层：进程内靠 [`InFlightSet`]，跨进程重启靠落库的
//! transfer_task_id——提交传输前先写库再发起，重启后发现库里有
//! 传输 ID 但集合里没有，判定为上一进程的残留，清掉重来。

use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::{Notify, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SharedConfig;
use crate::error::{FieldSyncError, Result};
use crate::events::{EventManager, SyncEvent};
use crate::policy::ConnectivityPolicy;
use crate::remote::{AttachmentUploadMeta, RemoteApi};
use crate::storage::{Attachment, ChangeEntity, MediaCache, StorageManager};
use super::inflight::{InFlightKey, InFlightSet};

type DrainHandler = Box<dyn FnOnce() + Send>;

/// 附件推送协调器
pub struct AttachmentPushCoordinator {
    storage: Arc<StorageManager>,
    remote: Arc<dyn RemoteApi>,
    policy: Arc<dyn ConnectivityPolicy>,
    in_flight: Arc<InFlightSet>,
    events: Arc<EventManager>,
    media_cache: Arc<MediaCache>,
    config: SharedConfig,
    /// 批次排空时触发一次后即消费
    drain_handler: Mutex<Option<DrainHandler>>,
    shutdown: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
}

impl AttachmentPushCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<StorageManager>,
        remote: Arc<dyn RemoteApi>,
        policy: Arc<dyn ConnectivityPolicy>,
        in_flight: Arc<InFlightSet>,
        events: Arc<EventManager>,
        media_cache: Arc<MediaCache>,
        config: SharedConfig,
    ) -> Self {
        Self {
            storage,
            remote,
            policy,
            in_flight,
            events,
            media_cache,
            config,
            drain_handler: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    /// 注册一次性排空回调：当前批次所有传输落定后触发一次
    pub fn set_drain_handler<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.drain_handler.lock() = Some(Box::new(handler));
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return Err(FieldSyncError::Other(
                    "AttachmentPushCoordinator already running".to_string(),
                ));
            }
            *running = true;
        }
        info!("Starting AttachmentPushCoordinator");

        self.spawn_feed_listener();
        self.spawn_periodic_tick();
        Ok(())
    }

    pub async fn stop(&self) {
        {
            let mut running = self.is_running.write().await;
            *running = false;
        }
        self.shutdown.notify_waiters();
        info!("AttachmentPushCoordinator stopped");
    }

    fn spawn_feed_listener(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let mut rx = self.storage.subscribe_changes();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = coordinator.shutdown.notified() => break,
                    event = rx.recv() => {
                        match event {
                            Ok(change) => {
                                // notify_waiters 只叫醒正停在 notified() 上的任务；
                                // 上传进行中错过的 stop 在这里补判
                                if !*coordinator.is_running.read().await {
                                    break;
                                }
                                if let ChangeEntity::Attachment(id) = change.entity {
                                    if coordinator.policy.should_push_attachments() {
                                        coordinator.push_attachments(vec![id]).await;
                                    }
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!("附件变更事件滞后丢弃 {} 条，等待定时器兜底", n);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            debug!("attachment 变更监听退出");
        });
    }

    fn spawn_periodic_tick(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = coordinator.config.snapshot().push_interval_secs;
                tokio::select! {
                    _ = coordinator.shutdown.notified() => break,
                    _ = sleep(std::time::Duration::from_secs(interval)) => {
                        if !*coordinator.is_running.read().await {
                            break;
                        }
                        if !coordinator.policy.should_push_attachments() {
                            continue;
                        }
                        match coordinator.storage.list_sync_pending_attachment_ids().await {
                            Ok(ids) => {
                                if !ids.is_empty() {
                                    debug!("定时扫描: {} 个待处理附件", ids.len());
                                    coordinator.push_attachments(ids).await;
                                }
                            }
                            Err(e) => error!("扫描待处理附件失败: {}", e),
                        }
                    }
                }
            }
            debug!("attachment 定时器退出");
        });
    }

    /// 处理一批附件（上传或删除）；批次落定后触发排空回调
    pub async fn push_attachments(&self, ids: Vec<i64>) {
        for id in ids {
            let key = InFlightKey::Attachment(id);
            if !self.in_flight.try_insert(key.clone()) {
                debug!("attachment {} 已在飞，跳过", id);
                continue;
            }
            self.push_one(id).await;
            self.in_flight.remove(&key);
        }
        self.fire_drain_handler_if_idle();
    }

    fn fire_drain_handler_if_idle(&self) {
        if self.in_flight.transfer_count() == 0 {
            if let Some(handler) = self.drain_handler.lock().take() {
                debug!("附件批次排空，触发一次性回调");
                handler();
            }
        }
    }

    async fn push_one(&self, id: i64) {
        let attachment = match self.storage.get_attachment(id).await {
            Ok(Some(att)) => att,
            Ok(None) => {
                debug!("attachment {} 不存在，跳过", id);
                return;
            }
            Err(e) => {
                error!("读取 attachment {} 失败: {}", id, e);
                return;
            }
        };

        if attachment.marked_for_deletion {
            if let Err(e) = self.delete_remote_then_local(&attachment).await {
                warn!("attachment {} 删除失败，等待重试: {}", id, e);
            }
            return;
        }

        if !attachment.dirty {
            debug!("attachment {} 已干净，跳过", id);
            return;
        }

        if let Err(e) = self.upload(attachment).await {
            warn!("attachment {} 上传失败，等待重试: {}", id, e);
            self.events
                .emit(SyncEvent::AttachmentPushed {
                    attachment_id: id,
                    url: None,
                })
                .await;
        }
    }

    /// 删除分支：先服务端后本地；从未上传过的直接删本地
    async fn delete_remote_then_local(&self, attachment: &Attachment) -> Result<()> {
        let id = attachment
            .id
            .ok_or_else(|| FieldSyncError::InvalidArgument("attachment 缺少本地 ID".into()))?;

        if let Some(ref attachment_remote_id) = attachment.remote_id {
            let parent = self
                .storage
                .get_observation(attachment.observation_id)
                .await?
                .ok_or_else(|| {
                    FieldSyncError::NotFound(format!("observation {}", attachment.observation_id))
                })?;
            let observation_remote_id = match parent.remote_id {
                Some(rid) => rid,
                // 父记录已有远端附件却没有远端 ID，不应出现；留给下次重试
                None => {
                    return Err(FieldSyncError::InvalidData(
                        "附件有远端身份但父记录没有".into(),
                    ))
                }
            };
            self.remote
                .delete_attachment(&observation_remote_id, attachment_remote_id)
                .await?;
        }

        let local_path = self.storage.delete_attachment_entity(id).await?;
        if let Some(path) = local_path {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("删除附件字节失败 {}: {}", path, e);
            }
        }
        info!("✅ attachment {} 已删除", id);
        Ok(())
    }

    /// 上传分支
    async fn upload(&self, attachment: Attachment) -> Result<()> {
        let id = attachment
            .id
            .ok_or_else(|| FieldSyncError::InvalidArgument("attachment 缺少本地 ID".into()))?;

        // 父记录还没有远端身份：等记录推送成功后物化事件再触发
        let parent = self
            .storage
            .get_observation(attachment.observation_id)
            .await?
            .ok_or_else(|| {
                FieldSyncError::NotFound(format!("observation {}", attachment.observation_id))
            })?;
        let observation_remote_id = match parent.remote_id {
            Some(rid) => rid,
            None => {
                debug!("attachment {} 的父记录未推送，暂缓上传", id);
                return Ok(());
            }
        };

        let local_path = match attachment.local_path {
            Some(ref path) => path.clone(),
            None => {
                debug!("attachment {} 无本地字节，跳过上传", id);
                return Ok(());
            }
        };

        // 跨进程重启的传输去重
        if let Some(ref existing) = attachment.transfer_task_id {
            if self
                .in_flight
                .contains(&InFlightKey::Transfer(existing.clone()))
            {
                debug!("attachment {} 的传输 {} 仍在进行，跳过", id, existing);
                return Ok(());
            }
            debug!("attachment {} 残留传输 ID {}，清除后重新上传", id, existing);
            self.storage.set_attachment_transfer_id(id, None).await?;
        }

        // 字节不可读视为内容已不存在，实体一并清掉
        let data = match tokio::fs::read(&local_path).await {
            Ok(bytes) => bytes::Bytes::from(bytes),
            Err(e) => {
                warn!("attachment {} 字节不可读 ({})，删除实体: {}", id, local_path, e);
                self.storage.delete_attachment_entity(id).await?;
                return Ok(());
            }
        };

        // 先落传输 ID 再发起，保证崩溃后可识别
        let transfer_id = Uuid::new_v4().to_string();
        self.storage
            .set_attachment_transfer_id(id, Some(&transfer_id))
            .await?;
        let transfer_key = InFlightKey::Transfer(transfer_id.clone());
        self.in_flight.try_insert(transfer_key.clone());

        let meta = AttachmentUploadMeta {
            observation_remote_id,
            field_name: attachment.field_name.clone(),
            name: attachment.name.clone(),
            content_type: attachment.content_type.clone(),
        };

        let result = self.remote.upload_attachment(&meta, data.clone()).await;
        self.in_flight.remove(&transfer_key);

        match result {
            Ok(response) => {
                let url = match response.url {
                    Some(ref url) => url.clone(),
                    // 服务端登记了元数据但没给访问地址：保持 dirty 重试
                    None => {
                        warn!("attachment {} 上传响应缺 URL，保持待上传", id);
                        self.storage.set_attachment_transfer_id(id, None).await?;
                        return Err(FieldSyncError::InvalidData("上传响应缺 URL".into()));
                    }
                };
                self.storage
                    .apply_attachment_upload_success(
                        id,
                        &response.remote_id,
                        response.name.as_deref(),
                        &url,
                        response.last_modified,
                    )
                    .await?;
                // 刚上传的图片按 URL 入共享缓存，UI 取图免回源
                if attachment.is_image() {
                    self.media_cache.put(&url, data);
                }
                info!("✅ attachment {} 上传成功: url={}", id, url);
                self.events
                    .emit(SyncEvent::AttachmentPushed {
                        attachment_id: id,
                        url: Some(url),
                    })
                    .await;
                Ok(())
            }
            Err(e) => {
                // 传输已落定，清 ID 放行下次尝试；实体保持 dirty
                if let Err(persist_err) = self.storage.set_attachment_transfer_id(id, None).await {
                    error!("清除传输 ID 失败: {}", persist_err);
                }
                Err(e)
            }
        }
    }
}
