//! 数据实体定义 - 对应数据库表结构
//!
//! 这里定义了所有数据库表对应的 Rust 结构体，用于：
//! - 类型安全的数据传输
//! - 统一的数据表示
//! - 序列化/反序列化支持

use serde::{Deserialize, Serialize};

/// 当前毫秒时间戳（与服务端 last_modified 同单位）
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 同步失败详情（整体覆盖写入，成功时清空，不做合并）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorInfo {
    /// HTTP 状态码（传输层失败时无值）
    pub status_code: Option<u16>,
    /// 本地可读描述
    pub description: Option<String>,
    /// 服务端响应体中的错误消息
    pub server_message: Option<String>,
}

impl SyncErrorInfo {
    pub fn transport(description: impl Into<String>) -> Self {
        Self {
            status_code: None,
            description: Some(description.into()),
            server_message: None,
        }
    }

    pub fn rejection(status: u16, description: impl Into<String>, body: Option<String>) -> Self {
        Self {
            status_code: Some(status),
            description: Some(description.into()),
            server_message: body,
        }
    }
}

/// 待物化的附件元数据
///
/// 编辑层把新拍的照片等先挂在记录上；记录推送成功后，协调器按
/// (field_name, name) 精确匹配服务端返回的附件描述，把它们物化为
/// 独立的 [`Attachment`] 实体再单独上传。name 由编辑层保证唯一。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAttachmentMeta {
    pub field_name: String,
    pub name: String,
    pub local_path: String,
    pub content_type: Option<String>,
}

/// 记录实体 - 对应 observation 表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: Option<i64>,  // 本地主键（SQLite 自增）
    pub remote_id: Option<String>,  // 服务端 ID（推送成功后赋值）
    /// 存在未同步的本地修改；只有推送拿到服务端 ID 且本地保存成功才清
    pub dirty: bool,
    /// 推送进行中（仅供 UI 展示，非一致性保证）
    pub syncing: bool,
    pub last_error: Option<SyncErrorInfo>,
    pub last_modified: i64,  // 毫秒时间戳（与服务端一致）
    /// 表单数据（JSON，引擎不解释）
    pub properties: String,
    /// 几何（GeoJSON，引擎不解释）
    pub geometry: Option<String>,
    /// 创建者的服务端用户 ID（自己创建的记录不推进拉取游标）
    pub author_remote_id: Option<String>,
    /// 待物化附件元数据，推送成功后消费
    pub pending_attachments: Vec<PendingAttachmentMeta>,
}

impl Observation {
    /// 编辑层新建一条脏记录，时间取当前时刻
    pub fn new_local_now(properties: String, geometry: Option<String>) -> Self {
        Self::new_local(properties, geometry, now_millis())
    }

    /// 编辑层新建一条脏记录
    pub fn new_local(properties: String, geometry: Option<String>, last_modified: i64) -> Self {
        Self {
            id: None,
            remote_id: None,
            dirty: true,
            syncing: false,
            last_error: None,
            last_modified,
            properties,
            geometry,
            author_remote_id: None,
            pending_attachments: Vec::new(),
        }
    }
}

/// 附件实体 - 对应 attachment 表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Option<i64>,
    pub remote_id: Option<String>,
    /// 父记录本地主键
    pub observation_id: i64,
    pub dirty: bool,
    /// 用户已删除，等待服务端确认后删本地实体与字节
    pub marked_for_deletion: bool,
    /// 本地字节文件路径（上传来源）
    pub local_path: Option<String>,
    /// 服务端文件访问地址（上传成功后赋值）
    pub url: Option<String>,
    pub content_type: Option<String>,
    pub name: Option<String>,
    pub field_name: Option<String>,
    pub last_modified: i64,
    /// 进行中传输的关联 ID
    ///
    /// 提交传输前先写库再发起，进程重启后凭它识别后台仍在跑的传输，
    /// 避免重复提交；仅在传输未决期间有值。
    pub transfer_task_id: Option<String>,
}

impl Attachment {
    /// 是否是图片内容（上传成功后写入共享图片缓存）
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|c| c.starts_with("image/"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_local_observation_is_dirty() {
        let obs = Observation::new_local("{}".into(), None, 1000);
        assert!(obs.dirty);
        assert!(!obs.syncing);
        assert!(obs.remote_id.is_none());
        assert!(obs.last_error.is_none());

        let now = Observation::new_local_now("{}".into(), None);
        assert!(now.last_modified >= 1_700_000_000_000);
    }

    #[test]
    fn test_attachment_is_image() {
        let mut att = Attachment {
            id: None,
            remote_id: None,
            observation_id: 1,
            dirty: true,
            marked_for_deletion: false,
            local_path: None,
            url: None,
            content_type: Some("image/jpeg".into()),
            name: None,
            field_name: None,
            last_modified: 0,
            transfer_task_id: None,
        };
        assert!(att.is_image());
        att.content_type = Some("video/mp4".into());
        assert!(!att.is_image());
        att.content_type = None;
        assert!(!att.is_image());
    }
}
