//! 记录推送协调器
//!
//! 消费变更事件与定时器两路触发，把脏记录推到服务端，并把服务端
//! 响应对账回本地：覆盖负载、写远端身份、物化待上传附件、淘汰
//! 服务端已删除的附件。
//!
//! 状态机：clean → dirty → in-flight → {clean (成功) | dirty (失败，清在飞标记)}。
//! 同一记录不会并发两次在飞；失败不退避，等下一次触发。

use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::SharedConfig;
use crate::error::{FieldSyncError, Result};
use crate::events::{EventManager, SyncEvent};
use crate::policy::ConnectivityPolicy;
use crate::remote::RemoteApi;
use crate::storage::{ChangeEntity, StorageManager, SyncErrorInfo};
use super::inflight::{InFlightKey, InFlightSet};

/// 记录推送协调器
pub struct ObservationPushCoordinator {
    storage: Arc<StorageManager>,
    remote: Arc<dyn RemoteApi>,
    policy: Arc<dyn ConnectivityPolicy>,
    in_flight: Arc<InFlightSet>,
    events: Arc<EventManager>,
    config: SharedConfig,
    shutdown: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
}

impl ObservationPushCoordinator {
    pub fn new(
        storage: Arc<StorageManager>,
        remote: Arc<dyn RemoteApi>,
        policy: Arc<dyn ConnectivityPolicy>,
        in_flight: Arc<InFlightSet>,
        events: Arc<EventManager>,
        config: SharedConfig,
    ) -> Self {
        Self {
            storage,
            remote,
            policy,
            in_flight,
            events,
            config,
            shutdown: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    /// 启动：订阅变更事件 + 定时兜底扫描
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return Err(FieldSyncError::Other(
                    "ObservationPushCoordinator already running".to_string(),
                ));
            }
            *running = true;
        }
        info!("Starting ObservationPushCoordinator");

        self.spawn_feed_listener();
        self.spawn_periodic_tick();
        Ok(())
    }

    /// 停止自身定时器与监听；已提交的网络调用照常异步完成
    pub async fn stop(&self) {
        {
            let mut running = self.is_running.write().await;
            *running = false;
        }
        self.shutdown.notify_waiters();
        info!("ObservationPushCoordinator stopped");
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
                                // 推送进行中错过的 stop 在这里补判
                                if !*coordinator.is_running.read().await {
                                    break;
                                }
                                if let ChangeEntity::Observation(id) = change.entity {
                                    if coordinator.policy.should_push_observations() {
                                        coordinator.push_observations(vec![id]).await;
                                    }
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                // 事件是幂等触发器，丢了靠定时器兜底
                                warn!("变更事件滞后丢弃 {} 条，等待定时器兜底", n);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            debug!("observation 变更监听退出");
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
                        if !coordinator.policy.should_push_observations() {
                            continue;
                        }
                        match coordinator.storage.list_dirty_observation_ids().await {
                            Ok(ids) => {
                                if !ids.is_empty() {
                                    debug!("定时扫描: {} 条脏记录", ids.len());
                                    coordinator.push_observations(ids).await;
                                }
                            }
                            Err(e) => error!("扫描脏记录失败: {}", e),
                        }
                    }
                }
            }
            debug!("observation 定时器退出");
        });
    }

    /// 推送一批记录；对每条做原子在飞判定，重复触发坍缩为一次调用
    pub async fn push_observations(&self, ids: Vec<i64>) {
        for id in ids {
            let key = InFlightKey::Observation(id);
            if !self.in_flight.try_insert(key.clone()) {
                debug!("observation {} 已在飞，跳过", id);
                continue;
            }
            self.push_one(id).await;
            self.in_flight.remove(&key);
        }
    }

    /// 单条推送；事件总是重新读库取当前状态，不信任触发时的负载
    async fn push_one(&self, id: i64) {
        let observation = match self.storage.get_observation(id).await {
            Ok(Some(obs)) if obs.dirty => obs,
            Ok(_) => {
                debug!("observation {} 不存在或已干净，跳过", id);
                return;
            }
            Err(e) => {
                error!("读取 observation {} 失败: {}", id, e);
                return;
            }
        };

        if let Err(e) = self.storage.mark_observation_syncing(id, true).await {
            error!("置 syncing 标志失败: {}", e);
            return;
        }

        match self.remote.push_observation(&observation).await {
            Ok(response) => {
                let remote_id = response.remote_id.clone();
                match self.storage.apply_push_success(id, &response).await {
                    Ok(outcome) => {
                        // 提交后再删字节，失败只记日志（行已删，孤儿文件无害）
                        for path in &outcome.deleted_paths {
                            if let Err(e) = tokio::fs::remove_file(path).await {
                                warn!("删除被淘汰附件字节失败 {}: {}", path, e);
                            }
                        }
                        info!(
                            "✅ observation {} 推送成功: remote_id={}, 物化附件 {} 个, 淘汰 {} 个",
                            id,
                            remote_id,
                            outcome.materialized_ids.len(),
                            outcome.deleted_paths.len()
                        );
                        self.events
                            .emit(SyncEvent::ObservationPushed {
                                observation_id: id,
                                success: true,
                                error: None,
                            })
                            .await;
                    }
                    Err(e) => {
                        // 本地提交失败：内存对账不保证落盘，下次触发从已提交状态重推
                        error!("observation {} 推送成功但本地提交失败: {}", id, e);
                        let _ = self.storage.mark_observation_syncing(id, false).await;
                        self.events
                            .emit(SyncEvent::ObservationPushed {
                                observation_id: id,
                                success: false,
                                error: Some(e.to_string()),
                            })
                            .await;
                    }
                }
            }
            Err(FieldSyncError::NoResponse) => {
                // 模糊完成：不写 last_error，不动记录状态，只放行下次尝试
                warn!("observation {} 推送无响应，保持原状等待重试", id);
                let _ = self.storage.mark_observation_syncing(id, false).await;
                self.events
                    .emit(SyncEvent::ObservationPushed {
                        observation_id: id,
                        success: false,
                        error: None,
                    })
                    .await;
            }
            Err(e) => {
                let info = sync_error_info(&e);
                if let Err(persist_err) = self.storage.record_observation_failure(id, info).await {
                    error!("写入 last_error 失败: {}", persist_err);
                }
                warn!("observation {} 推送失败: {}", id, e);
                self.events
                    .emit(SyncEvent::ObservationPushed {
                        observation_id: id,
                        success: false,
                        error: Some(e.to_string()),
                    })
                    .await;
            }
        }
    }
}

/// 引擎错误 → 持久化的失败详情（整体覆盖 last_error）
pub(crate) fn sync_error_info(error: &FieldSyncError) -> SyncErrorInfo {
    match error {
        FieldSyncError::Rejected {
            status,
            message,
            body,
        } => SyncErrorInfo::rejection(*status, message.clone(), body.clone()),
        FieldSyncError::Unauthorized => {
            SyncErrorInfo::rejection(401, "Unauthorized", None)
        }
        other => SyncErrorInfo::transport(other.to_string()),
    }
}
