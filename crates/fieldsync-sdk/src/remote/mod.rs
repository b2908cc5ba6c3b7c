//! Remote API 抽象层
//!
//! 同步引擎通过本模块的 trait 与服务端交互，不关心具体传输编码。
//! 内置一个基于 reqwest 的 HTTP 实现（[`http::HttpRemoteApi`]），
//! 测试中用 mock 实现替换。

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::entities::Observation;

pub mod http;

pub use http::HttpRemoteApi;

/// 可轮询的远端资源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchScope {
    /// 记录主体
    Observations,
    /// 辅助位置流
    Locations,
}

impl FetchScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchScope::Observations => "observations",
            FetchScope::Locations => "locations",
        }
    }
}

/// 服务端返回的附件描述
///
/// url 为空表示服务端只登记了元数据、字节还未上传——推送协调器据此
/// 把本地 pending 附件元数据物化为独立的 Attachment 实体。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub remote_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub field_name: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub last_modified: Option<i64>,
}

/// 记录推送成功的响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationResponse {
    /// 服务端分配的记录 ID
    pub remote_id: String,
    /// 服务端权威的表单数据（覆盖本地）
    pub properties: String,
    #[serde(default)]
    pub geometry: Option<String>,
    /// 服务端时间戳（毫秒）
    pub last_modified: i64,
    /// 服务端权威的附件列表
    #[serde(default)]
    pub attachments: Vec<AttachmentDescriptor>,
}

/// 附件上传成功的响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentUploadResponse {
    pub remote_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// 服务端文件访问地址；缺失视为终态失败，保持 dirty 重试
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub last_modified: Option<i64>,
}

/// 附件上传的元数据（multipart 表单字段）
#[derive(Debug, Clone)]
pub struct AttachmentUploadMeta {
    /// 父记录的服务端 ID
    pub observation_remote_id: String,
    pub field_name: Option<String>,
    pub name: Option<String>,
    pub content_type: Option<String>,
}

/// 服务端交互抽象
///
/// 错误语义约定（见 error.rs）：
/// - `Transport`：请求未收到响应，瞬时失败
/// - `NoResponse`：完成回调既无响应也无错误，模糊失败，不改本地状态
/// - `Rejected`：服务端明确拒绝，状态码/响应体写入 last_error
/// - `Unauthorized`：认证过期，拉取调度停摆
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// 推送一条脏记录
    async fn push_observation(&self, observation: &Observation) -> Result<ObservationResponse>;

    /// 上传附件字节（multipart）
    async fn upload_attachment(
        &self,
        meta: &AttachmentUploadMeta,
        data: Bytes,
    ) -> Result<AttachmentUploadResponse>;

    /// 删除服务端附件
    async fn delete_attachment(
        &self,
        observation_remote_id: &str,
        attachment_remote_id: &str,
    ) -> Result<()>;

    /// 增量拉取，since 为高水位时间戳（毫秒），None 表示首次全量
    async fn fetch(&self, scope: FetchScope, since: Option<i64>) -> Result<Vec<serde_json::Value>>;
}
