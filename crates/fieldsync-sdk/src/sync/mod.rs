//! 同步模块 - 推送协调、拉取调度与批量导入
//!
//! 组件关系：
//! - [`InFlightSet`]: 进程内在飞集合，同一身份同时最多一次网络尝试
//! - [`ObservationPushCoordinator`]: 变更事件 + 定时器驱动的记录推送
//! - [`AttachmentPushCoordinator`]: 附件上传/删除，传输 ID 去重
//! - [`FetchScheduler`]: 各 scope 独立的自重挂拉取调度
//! - [`BatchImportWriter`]: 分片导入 + 游标推进 + 通知策略
//! - [`FetchCursorStore`]: sled 存储的拉取高水位

pub mod attachment_push;
pub mod batch_import;
pub mod cursor_store;
pub mod fetch_scheduler;
pub mod inflight;
pub mod observation_push;

pub use attachment_push::AttachmentPushCoordinator;
pub use batch_import::{BatchImportWriter, JsonPayloadMapper, PayloadMapper};
pub use cursor_store::FetchCursorStore;
pub use fetch_scheduler::FetchScheduler;
pub use inflight::{InFlightKey, InFlightSet};
pub use observation_push::ObservationPushCoordinator;

#[cfg(test)]
pub(crate) mod testing {
    //! 同步组件测试共用的 RemoteApi mock

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    use crate::error::Result;
    use crate::remote::{
        AttachmentUploadMeta, AttachmentUploadResponse, FetchScope, ObservationResponse, RemoteApi,
    };
    use crate::storage::Observation;

    type PushHandler =
        Box<dyn Fn(&Observation) -> Result<ObservationResponse> + Send + Sync>;
    type UploadHandler =
        Box<dyn Fn(&AttachmentUploadMeta) -> Result<AttachmentUploadResponse> + Send + Sync>;
    type DeleteHandler = Box<dyn Fn(&str, &str) -> Result<()> + Send + Sync>;
    type FetchHandler =
        Box<dyn Fn(FetchScope, Option<i64>) -> Result<Vec<serde_json::Value>> + Send + Sync>;

    /// 可编程的 RemoteApi mock：每个操作可注入处理函数与延迟
    pub(crate) struct MockRemoteApi {
        pub push_calls: AtomicUsize,
        pub upload_calls: AtomicUsize,
        pub delete_calls: AtomicUsize,
        pub fetch_calls: AtomicUsize,
        push_delay: Mutex<Option<Duration>>,
        upload_delay: Mutex<Option<Duration>>,
        push_handler: Mutex<PushHandler>,
        upload_handler: Mutex<UploadHandler>,
        delete_handler: Mutex<DeleteHandler>,
        fetch_handler: Mutex<FetchHandler>,
    }

    impl MockRemoteApi {
        pub fn new() -> Self {
            Self {
                push_calls: AtomicUsize::new(0),
                upload_calls: AtomicUsize::new(0),
                delete_calls: AtomicUsize::new(0),
                fetch_calls: AtomicUsize::new(0),
                push_delay: Mutex::new(None),
                upload_delay: Mutex::new(None),
                push_handler: Mutex::new(Box::new(|_| {
                    Ok(ObservationResponse {
                        remote_id: "remote-1".into(),
                        properties: "{}".into(),
                        geometry: None,
                        last_modified: 0,
                        attachments: vec![],
                    })
                })),
                upload_handler: Mutex::new(Box::new(|_| {
                    Ok(AttachmentUploadResponse {
                        remote_id: "att-remote-1".into(),
                        name: None,
                        url: Some("https://files/att-remote-1".into()),
                        content_type: None,
                        last_modified: Some(0),
                    })
                })),
                delete_handler: Mutex::new(Box::new(|_, _| Ok(()))),
                fetch_handler: Mutex::new(Box::new(|_, _| Ok(vec![]))),
            }
        }

        pub fn set_push_handler<F>(&self, f: F)
        where
            F: Fn(&Observation) -> Result<ObservationResponse> + Send + Sync + 'static,
        {
            *self.push_handler.lock() = Box::new(f);
        }

        pub fn set_upload_handler<F>(&self, f: F)
        where
            F: Fn(&AttachmentUploadMeta) -> Result<AttachmentUploadResponse>
                + Send
                + Sync
                + 'static,
        {
            *self.upload_handler.lock() = Box::new(f);
        }

        pub fn set_delete_handler<F>(&self, f: F)
        where
            F: Fn(&str, &str) -> Result<()> + Send + Sync + 'static,
        {
            *self.delete_handler.lock() = Box::new(f);
        }

        pub fn set_fetch_handler<F>(&self, f: F)
        where
            F: Fn(FetchScope, Option<i64>) -> Result<Vec<serde_json::Value>>
                + Send
                + Sync
                + 'static,
        {
            *self.fetch_handler.lock() = Box::new(f);
        }

        pub fn set_push_delay(&self, delay: Duration) {
            *self.push_delay.lock() = Some(delay);
        }

        pub fn set_upload_delay(&self, delay: Duration) {
            *self.upload_delay.lock() = Some(delay);
        }
    }

    #[async_trait]
    impl RemoteApi for MockRemoteApi {
        async fn push_observation(
            &self,
            observation: &Observation,
        ) -> Result<ObservationResponse> {
            self.push_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let delay = *self.push_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            (self.push_handler.lock())(observation)
        }

        async fn upload_attachment(
            &self,
            meta: &AttachmentUploadMeta,
            _data: Bytes,
        ) -> Result<AttachmentUploadResponse> {
            self.upload_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let delay = *self.upload_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            (self.upload_handler.lock())(meta)
        }

        async fn delete_attachment(
            &self,
            observation_remote_id: &str,
            attachment_remote_id: &str,
        ) -> Result<()> {
            self.delete_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            (self.delete_handler.lock())(observation_remote_id, attachment_remote_id)
        }

        async fn fetch(
            &self,
            scope: FetchScope,
            since: Option<i64>,
        ) -> Result<Vec<serde_json::Value>> {
            self.fetch_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            (self.fetch_handler.lock())(scope, since)
        }
    }
}
