//! FieldSync SDK - 野外数据采集的离线优先同步引擎
//!
//! 本 SDK 提供了完整的记录/附件双向同步能力，包括：
//! - 📝 脏标记驱动的记录推送（变更事件 + 定时器双触发）
//! - 📤 附件独立上传与删除（传输 ID 去重，跨进程重启安全）
//! - 📥 多 scope 周期拉取与分片批量导入
//! - ⚙️ 事件系统：统一的事件广播和监听器机制
//! - 🔌 可替换的 Remote API / 连通性策略 / 负载映射
//! - 🧵 并发安全：异步优先设计，同一身份同时最多一次在飞
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use fieldsync_sdk::{FieldSyncEngine, FieldSyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 配置引擎
//!     let config = FieldSyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .base_url("https://field.example.com/api")
//!         .self_remote_id("user-123")
//!         .build();
//!
//!     // 初始化并启动
//!     let engine = FieldSyncEngine::initialize(config).await?;
//!     engine.start().await?;
//!
//!     // 监听同步事件
//!     engine.events()
//!         .add_listener("observation_pushed", |event| {
//!             println!("记录推送完成: {:?}", event);
//!         })
//!         .await;
//!
//!     // 编辑层写入脏记录，引擎自动推送
//!     // ...
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod config;
pub mod error;
pub mod events;
pub mod policy;
pub mod remote;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod version;

// 重新导出核心类型，方便使用
pub use config::{FieldSyncConfig, FieldSyncConfigBuilder, SharedConfig, DEFAULT_IMPORT_CHUNK_SIZE};
pub use error::{FieldSyncError, Result};
pub use events::{EventManager, SyncEvent};
pub use policy::{ConnectivityPolicy, StaticConnectivityPolicy};
pub use remote::{
    AttachmentDescriptor, AttachmentUploadMeta, AttachmentUploadResponse, FetchScope,
    HttpRemoteApi, ObservationResponse, RemoteApi,
};
pub use sdk::FieldSyncEngine;
pub use storage::{
    now_millis, Attachment, ChangeEntity, ChangeEvent, ChangeKind, KvStore, MediaCache,
    Observation, PendingAttachmentMeta, StorageManager, SyncErrorInfo,
};
pub use sync::{
    AttachmentPushCoordinator, BatchImportWriter, FetchCursorStore, FetchScheduler,
    JsonPayloadMapper, ObservationPushCoordinator, PayloadMapper,
};
