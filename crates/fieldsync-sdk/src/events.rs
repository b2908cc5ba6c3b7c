//! 事件系统模块 - 同步引擎对外的唯一信号出口
//!
//! 功能包括：
//! - 记录推送完成回调（成功/失败，携带错误信息）
//! - 附件上传完成事件
//! - 批量拉取计数 / 单条拉取事件
//! - 事件广播和监听器机制
//!
//! 设计上用"显式注册的监听器 + 类型化广播通道"替代全局通知中心：
//! 只有声明依赖某个信号的组件才会收到它，本地事务提交成功后同步触发。

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::remote::FetchScope;

/// 同步引擎事件
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// 记录推送完成（success=false 时 error 携带可读描述）
    ObservationPushed {
        observation_id: i64,
        success: bool,
        error: Option<String>,
    },
    /// 附件上传完成（url 为服务端分配的访问地址）
    AttachmentPushed {
        attachment_id: i64,
        url: Option<String>,
    },
    /// 批量拉取完成，count 为本轮新建记录数
    BulkObservationsFetched {
        scope: FetchScope,
        count: usize,
    },
    /// 增量拉取恰好新建一条记录（UI 可高亮该记录）
    ObservationFetched {
        observation_id: i64,
    },
}

impl SyncEvent {
    /// 事件类型名（用于监听器分发与统计）
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::ObservationPushed { .. } => "observation_pushed",
            SyncEvent::AttachmentPushed { .. } => "attachment_pushed",
            SyncEvent::BulkObservationsFetched { .. } => "bulk_observations_fetched",
            SyncEvent::ObservationFetched { .. } => "observation_fetched",
        }
    }
}

/// 事件监听器类型
pub type EventListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件管理器
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<SyncEvent>,
    /// 事件监听器映射（event_type -> listeners，"*" 为通配）
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        // 广播事件（无订阅者时 send 会失败，属正常场景，仅打 debug）
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        // 调用监听器
        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 添加事件监听器（event_type 传 "*" 监听全部）
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    /// 移除某类事件的全部监听器
    pub async fn remove_listeners(&self, event_type: &str) {
        let mut listeners = self.listeners.write().await;
        listeners.remove(event_type);
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(256)
    }
}
