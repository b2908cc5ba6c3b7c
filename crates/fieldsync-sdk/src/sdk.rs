//! FieldSync 引擎入口
//!
//! 组件全部在 [`FieldSyncEngine::initialize`] 中显式构造、显式注入，
//! 引擎不从环境里"发现"任何依赖：配置、Remote API、连通性策略、
//! 负载映射都是构造参数（带默认实现），测试时逐个替换。
//!
//! 生命周期：initialize → start → (宿主应用读写 storage) → shutdown。

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{FieldSyncConfig, SharedConfig};
use crate::error::{FieldSyncError, Result};
use crate::events::EventManager;
use crate::policy::{ConnectivityPolicy, StaticConnectivityPolicy};
use crate::remote::http::HttpClientConfig;
use crate::remote::{FetchScope, HttpRemoteApi, RemoteApi};
use crate::storage::{KvStore, MediaCache, StorageManager};
use crate::sync::{
    AttachmentPushCoordinator, BatchImportWriter, FetchCursorStore, FetchScheduler, InFlightSet,
    JsonPayloadMapper, ObservationPushCoordinator, PayloadMapper,
};
use crate::version;

/// FieldSync 同步引擎
pub struct FieldSyncEngine {
    config: SharedConfig,
    storage: Arc<StorageManager>,
    kv: Arc<KvStore>,
    events: Arc<EventManager>,
    media_cache: Arc<MediaCache>,
    in_flight: Arc<InFlightSet>,
    observation_push: Arc<ObservationPushCoordinator>,
    attachment_push: Arc<AttachmentPushCoordinator>,
    fetch_scheduler: Arc<FetchScheduler>,
    importer: Arc<BatchImportWriter>,
    is_running: RwLock<bool>,
}

impl FieldSyncEngine {
    /// 用默认的 HTTP Remote API / 开关式策略 / JSON 映射初始化
    pub async fn initialize(config: FieldSyncConfig) -> Result<Arc<Self>> {
        let remote = Arc::new(HttpRemoteApi::new(
            &HttpClientConfig::default(),
            config.base_url.clone(),
        )?);
        Self::initialize_with(
            config,
            remote,
            Arc::new(StaticConnectivityPolicy::new()),
            Arc::new(JsonPayloadMapper),
        )
        .await
    }

    /// 显式注入依赖初始化（测试与定制部署入口）
    pub async fn initialize_with(
        config: FieldSyncConfig,
        remote: Arc<dyn RemoteApi>,
        policy: Arc<dyn ConnectivityPolicy>,
        mapper: Arc<dyn PayloadMapper>,
    ) -> Result<Arc<Self>> {
        info!(
            "🚀 初始化 FieldSync 引擎 v{} ({})",
            version::SDK_VERSION,
            version::GIT_SHA
        );

        // 1. 存储层
        let storage = Arc::new(StorageManager::open(&config.data_dir).await?);
        let kv = Arc::new(KvStore::new(&config.data_dir).await?);
        let cursor_store = Arc::new(FetchCursorStore::new(kv.clone()));

        // 2. 共享基础设施
        let shared_config = SharedConfig::new(config);
        let events = Arc::new(EventManager::default());
        let media_cache = Arc::new(MediaCache::default());
        let in_flight = Arc::new(InFlightSet::new());

        // 3. 同步组件
        let observation_push = Arc::new(ObservationPushCoordinator::new(
            storage.clone(),
            remote.clone(),
            policy.clone(),
            in_flight.clone(),
            events.clone(),
            shared_config.clone(),
        ));
        let attachment_push = Arc::new(AttachmentPushCoordinator::new(
            storage.clone(),
            remote.clone(),
            policy.clone(),
            in_flight.clone(),
            events.clone(),
            media_cache.clone(),
            shared_config.clone(),
        ));
        let importer = Arc::new(BatchImportWriter::new(
            storage.clone(),
            cursor_store.clone(),
            events.clone(),
            mapper,
            shared_config.clone(),
        ));
        let fetch_scheduler = Arc::new(FetchScheduler::new(
            remote,
            policy,
            importer.clone(),
            cursor_store,
            shared_config.clone(),
        ));

        info!("✅ FieldSync 引擎初始化完成");
        Ok(Arc::new(Self {
            config: shared_config,
            storage,
            kv,
            events,
            media_cache,
            in_flight,
            observation_push,
            attachment_push,
            fetch_scheduler,
            importer,
            is_running: RwLock::new(false),
        }))
    }

    /// 按配置开关启动各同步组件
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return Err(FieldSyncError::Other("引擎已在运行".to_string()));
            }
            *running = true;
        }
        let snapshot = self.config.snapshot();

        if snapshot.push_observations_enabled {
            self.observation_push.start().await?;
        }
        if snapshot.push_attachments_enabled {
            self.attachment_push.start().await?;
        }
        if snapshot.fetch_enabled {
            self.fetch_scheduler.start().await?;
        }
        info!("✅ FieldSync 引擎已启动");
        Ok(())
    }

    /// 停止所有同步组件；已提交的网络操作照常异步落定
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if !*running {
                return Ok(());
            }
            *running = false;
        }
        self.observation_push.stop().await;
        self.attachment_push.stop().await;
        self.fetch_scheduler.stop().await;
        self.in_flight.clear();
        if let Err(e) = self.kv.flush().await {
            warn!("关闭时 flush KV 失败: {}", e);
        }
        info!("FieldSync 引擎已关闭");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// 手动触发一轮推送（记录 + 附件），不等定时器
    pub async fn push_now(&self) -> Result<()> {
        let observation_ids = self.storage.list_dirty_observation_ids().await?;
        self.observation_push.push_observations(observation_ids).await;
        let attachment_ids = self.storage.list_sync_pending_attachment_ids().await?;
        self.attachment_push.push_attachments(attachment_ids).await;
        Ok(())
    }

    /// 手动触发一轮拉取，返回新建记录数
    pub async fn fetch_now(&self, scope: FetchScope) -> Result<usize> {
        self.fetch_scheduler.run_once(scope).await
    }

    // ---------- 宿主应用访问点 ----------

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn media_cache(&self) -> &Arc<MediaCache> {
        &self.media_cache
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn importer(&self) -> &Arc<BatchImportWriter> {
        &self.importer
    }

    pub fn version(&self) -> &'static str {
        version::SDK_VERSION
    }
}
