//! 拉取调度器
//!
//! 每个 scope 一条独立的自重挂循环：拉一轮、导入、睡一个间隔、再拉。
//! 间隔在每次重挂前从配置快照读取，修改下一轮生效。策略不允许时
//! 跳过本轮但照常重挂；认证过期（Unauthorized）则该循环整体停摆，
//! 直到外部重新 start。失败不退避，下一个间隔原样重试。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::SharedConfig;
use crate::error::{FieldSyncError, Result};
use crate::policy::ConnectivityPolicy;
use crate::remote::{FetchScope, RemoteApi};
use super::batch_import::BatchImportWriter;
use super::cursor_store::FetchCursorStore;

/// 周期拉取调度器
pub struct FetchScheduler {
    remote: Arc<dyn RemoteApi>,
    policy: Arc<dyn ConnectivityPolicy>,
    importer: Arc<BatchImportWriter>,
    cursor_store: Arc<FetchCursorStore>,
    config: SharedConfig,
    /// start 重入用：老循环发现代次变了就退出
    epoch: AtomicU64,
    shutdown: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
}

impl FetchScheduler {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        policy: Arc<dyn ConnectivityPolicy>,
        importer: Arc<BatchImportWriter>,
        cursor_store: Arc<FetchCursorStore>,
        config: SharedConfig,
    ) -> Self {
        Self {
            remote,
            policy,
            importer,
            cursor_store,
            config,
            epoch: AtomicU64::new(0),
            shutdown: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    /// 启动两个 scope 的拉取循环；重入时替换掉已有循环
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut running = self.is_running.write().await;
            *running = true;
        }
        // 唤醒睡眠中的老循环，让它们发现代次已变
        self.shutdown.notify_waiters();
        info!("Starting FetchScheduler (epoch {})", epoch);

        for scope in [FetchScope::Observations, FetchScope::Locations] {
            self.spawn_scope_loop(scope, epoch);
        }
        Ok(())
    }

    pub async fn stop(&self) {
        {
            let mut running = self.is_running.write().await;
            *running = false;
        }
        self.shutdown.notify_waiters();
        info!("FetchScheduler stopped");
    }

    fn spawn_scope_loop(self: &Arc<Self>, scope: FetchScope, epoch: u64) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if !*scheduler.is_running.read().await
                    || scheduler.epoch.load(Ordering::SeqCst) != epoch
                {
                    break;
                }
                if scheduler.policy.should_fetch(scope) && scheduler.policy.is_authenticated() {
                    match scheduler.run_once(scope).await {
                        Ok(count) => {
                            if count > 0 {
                                debug!("拉取 {} 新建 {} 条", scope.as_str(), count);
                            }
                        }
                        Err(FieldSyncError::Unauthorized) => {
                            // 凭证失效后继续轮询只会刷 401，停摆等待外部重启
                            error!("拉取 {} 认证过期，调度停摆", scope.as_str());
                            break;
                        }
                        Err(e) => {
                            warn!("拉取 {} 失败，下一间隔重试: {}", scope.as_str(), e);
                        }
                    }
                } else {
                    debug!("策略不允许拉取 {}，本轮跳过", scope.as_str());
                }

                let interval = scheduler.interval_for(scope);
                tokio::select! {
                    _ = scheduler.shutdown.notified() => break,
                    _ = sleep(std::time::Duration::from_secs(interval)) => {}
                }
            }
            debug!("拉取循环退出: {}", scope.as_str());
        });
    }

    fn interval_for(&self, scope: FetchScope) -> u64 {
        let snapshot = self.config.snapshot();
        let secs = match scope {
            FetchScope::Observations => snapshot.observation_fetch_interval_secs,
            FetchScope::Locations => snapshot.location_fetch_interval_secs,
        };
        secs.max(1)
    }

    /// 单轮拉取：游标 → 请求 → 导入
    pub async fn run_once(&self, scope: FetchScope) -> Result<usize> {
        let since = self.cursor_store.get(scope).await?;
        let payloads = self.remote.fetch(scope, since).await?;
        self.importer.import(scope, payloads).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldSyncConfig;
    use crate::events::EventManager;
    use crate::policy::StaticConnectivityPolicy;
    use crate::storage::{KvStore, StorageManager};
    use crate::sync::batch_import::JsonPayloadMapper;
    use crate::sync::testing::MockRemoteApi;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        remote: Arc<MockRemoteApi>,
        policy: Arc<StaticConnectivityPolicy>,
        cursor_store: Arc<FetchCursorStore>,
        scheduler: Arc<FetchScheduler>,
        _temp_dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageManager::open_in_memory().unwrap());
        let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());
        let cursor_store = Arc::new(FetchCursorStore::new(kv));
        let remote = Arc::new(MockRemoteApi::new());
        let policy = Arc::new(StaticConnectivityPolicy::new());
        let config = SharedConfig::new(
            FieldSyncConfig::builder()
                .observation_fetch_interval_secs(1)
                .location_fetch_interval_secs(1)
                .build(),
        );
        let importer = Arc::new(BatchImportWriter::new(
            storage,
            cursor_store.clone(),
            Arc::new(EventManager::new(64)),
            Arc::new(JsonPayloadMapper),
            config.clone(),
        ));
        let scheduler = Arc::new(FetchScheduler::new(
            remote.clone(),
            policy.clone(),
            importer,
            cursor_store.clone(),
            config,
        ));
        Fixture {
            remote,
            policy,
            cursor_store,
            scheduler,
            _temp_dir: temp_dir,
        }
    }

    #[tokio::test]
    async fn test_run_once_passes_cursor_as_since() {
        let f = fixture().await;
        f.cursor_store
            .advance(FetchScope::Observations, 123)
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        f.remote.set_fetch_handler(move |_, since| {
            *seen_clone.lock() = Some(since);
            Ok(vec![])
        });

        f.scheduler.run_once(FetchScope::Observations).await.unwrap();
        assert_eq!(*seen.lock(), Some(Some(123)));

        // 另一个 scope 没拉过，since 为 None
        f.scheduler.run_once(FetchScope::Locations).await.unwrap();
        assert_eq!(*seen.lock(), Some(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_skip_still_rearms() {
        let f = fixture().await;
        f.policy.set_fetch(false);
        f.scheduler.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(f.remote.fetch_calls.load(Ordering::SeqCst), 0);

        // 策略放开后循环仍活着，无需重启即恢复拉取
        f.policy.set_fetch(true);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(f.remote.fetch_calls.load(Ordering::SeqCst) > 0);

        f.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_halts_scheduling() {
        let f = fixture().await;
        f.remote
            .set_fetch_handler(|_, _| Err(FieldSyncError::Unauthorized));
        f.scheduler.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        // 两个 scope 各试了一次即停摆
        assert_eq!(f.remote.fetch_calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.remote.fetch_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries_next_interval() {
        let f = fixture().await;
        f.remote
            .set_fetch_handler(|_, _| Err(FieldSyncError::Transport("timeout".into())));
        f.scheduler.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        // 无退避，每个间隔照常重试
        assert!(f.remote.fetch_calls.load(Ordering::SeqCst) >= 4);

        f.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resumes_after_stop() {
        let f = fixture().await;
        f.scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        f.scheduler.stop().await;
        let frozen = f.remote.fetch_calls.load(Ordering::SeqCst);

        // stop 后可重新 start，老循环不会复活成双份
        f.scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(f.remote.fetch_calls.load(Ordering::SeqCst) > frozen);
        f.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_loops() {
        let f = fixture().await;
        f.scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        f.scheduler.stop().await;

        let frozen = f.remote.fetch_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.remote.fetch_calls.load(Ordering::SeqCst), frozen);
    }
}
