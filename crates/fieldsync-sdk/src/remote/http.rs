//! HTTP Remote API 实现 - 基于 reqwest
//!
//! 本模块把 [`RemoteApi`](super::RemoteApi) 落到纯 Rust (rustls) 的 HTTP 客户端上：
//! 记录走 JSON，附件走 multipart，拉取走 since 查询参数。
//! 错误按引擎的分类约定映射：连接失败 → Transport，401 → Unauthorized，
//! 其他非 2xx → Rejected（状态码与响应体原样带回，落入 last_error）。

use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{multipart, Client, RequestBuilder, Response, StatusCode};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::error::{FieldSyncError, Result};
use crate::storage::entities::Observation;
use super::{
    AttachmentUploadMeta, AttachmentUploadResponse, FetchScope, ObservationResponse, RemoteApi,
};

/// HTTP 客户端配置
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 整体请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(15),
            request_timeout_secs: Some(120),
        }
    }
}

/// 基于 reqwest 的 Remote API
pub struct HttpRemoteApi {
    client: Client,
    base_url: String,
    /// Bearer token，登录层在会话刷新时更新
    token: RwLock<Option<String>>,
}

impl HttpRemoteApi {
    /// 创建新的 HTTP 客户端
    pub fn new(config: &HttpClientConfig, base_url: impl Into<String>) -> Result<Self> {
        let mut builder = Client::builder();

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| FieldSyncError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url = base_url.into();
        info!("✅ HTTP 客户端已创建 (base_url: {})", base_url);

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    /// 更新鉴权 token
    pub async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    async fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.token.read().await.as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// 非 2xx 响应统一映射为引擎错误
    async fn check_status(response: Response, operation: &str) -> Result<Response> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            error!("❌ {} 失败: 认证过期", operation);
            return Err(FieldSyncError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.ok();
            error!(
                "❌ {} 失败，HTTP 状态码: {} ({})",
                operation,
                status,
                body.as_deref().unwrap_or("无响应体")
            );
            return Err(FieldSyncError::Rejected {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("server rejected")
                    .to_string(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn push_observation(&self, observation: &Observation) -> Result<ObservationResponse> {
        // 已有远端身份走更新，否则走创建
        let request = match observation.remote_id.as_deref() {
            Some(remote_id) => {
                let url = format!("{}/observations/{}", self.base_url, remote_id);
                self.client.put(url)
            }
            None => self.client.post(format!("{}/observations", self.base_url)),
        };

        let body = serde_json::json!({
            "properties": serde_json::from_str::<serde_json::Value>(&observation.properties)
                .unwrap_or(serde_json::Value::Null),
            "geometry": observation.geometry.as_deref()
                .and_then(|g| serde_json::from_str::<serde_json::Value>(g).ok()),
            "last_modified": observation.last_modified,
        });

        let response = self
            .authorize(request)
            .await
            .json(&body)
            .send()
            .await
            .map_err(|e| FieldSyncError::Transport(format!("推送记录失败: {}", e)))?;

        let response = Self::check_status(response, "推送记录").await?;
        let parsed: ObservationResponse = response
            .json()
            .await
            .map_err(|e| FieldSyncError::Serialization(format!("解析推送响应失败: {}", e)))?;

        info!("✅ 记录推送成功: remote_id={}", parsed.remote_id);
        Ok(parsed)
    }

    async fn upload_attachment(
        &self,
        meta: &AttachmentUploadMeta,
        data: Bytes,
    ) -> Result<AttachmentUploadResponse> {
        let size = data.len();

        // 1. 组装 multipart form
        let mut part = multipart::Part::bytes(data.to_vec());
        if let Some(ref name) = meta.name {
            part = part.file_name(name.clone());
        }
        if let Some(ref content_type) = meta.content_type {
            part = part
                .mime_str(content_type)
                .map_err(|e| FieldSyncError::Other(format!("创建 multipart part 失败: {}", e)))?;
        }
        let mut form = multipart::Form::new().part("attachment", part);
        if let Some(ref field) = meta.field_name {
            form = form.text("field_name", field.clone());
        }

        info!(
            "📤 开始上传附件: observation={} ({} bytes)",
            meta.observation_remote_id, size
        );

        // 2. 发送请求
        let url = format!(
            "{}/observations/{}/attachments",
            self.base_url, meta.observation_remote_id
        );
        let response = self
            .authorize(self.client.post(url))
            .await
            .multipart(form)
            .send()
            .await
            .map_err(|e| FieldSyncError::Transport(format!("上传附件失败: {}", e)))?;

        // 3. 检查状态并解析
        let response = Self::check_status(response, "上传附件").await?;
        let parsed: AttachmentUploadResponse = response
            .json()
            .await
            .map_err(|e| FieldSyncError::Serialization(format!("解析上传响应失败: {}", e)))?;

        info!(
            "✅ 附件上传成功: remote_id={}, url={:?}",
            parsed.remote_id, parsed.url
        );
        Ok(parsed)
    }

    async fn delete_attachment(
        &self,
        observation_remote_id: &str,
        attachment_remote_id: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/observations/{}/attachments/{}",
            self.base_url, observation_remote_id, attachment_remote_id
        );
        let response = self
            .authorize(self.client.delete(url))
            .await
            .send()
            .await
            .map_err(|e| FieldSyncError::Transport(format!("删除附件失败: {}", e)))?;

        Self::check_status(response, "删除附件").await?;
        info!(
            "✅ 附件已删除: observation={}, attachment={}",
            observation_remote_id, attachment_remote_id
        );
        Ok(())
    }

    async fn fetch(&self, scope: FetchScope, since: Option<i64>) -> Result<Vec<serde_json::Value>> {
        let mut request = self
            .client
            .get(format!("{}/{}", self.base_url, scope.as_str()));
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }

        let response = self
            .authorize(request)
            .await
            .send()
            .await
            .map_err(|e| FieldSyncError::Transport(format!("拉取 {} 失败: {}", scope.as_str(), e)))?;

        let response = Self::check_status(response, "拉取").await?;
        let payloads: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| FieldSyncError::Serialization(format!("解析拉取响应失败: {}", e)))?;

        info!("📥 拉取 {} 完成: {} 条", scope.as_str(), payloads.len());
        Ok(payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_base_url_trailing_slash_trimmed() {
        let api = HttpRemoteApi::new(&HttpClientConfig::default(), "https://field.example.com/api/")
            .unwrap();
        assert_eq!(api.base_url, "https://field.example.com/api");
    }

    #[tokio::test]
    async fn test_token_replaceable() {
        let api =
            HttpRemoteApi::new(&HttpClientConfig::default(), "https://field.example.com").unwrap();
        api.set_token(Some("abc".into())).await;
        assert_eq!(api.token.read().await.as_deref(), Some("abc"));
        api.set_token(None).await;
        assert!(api.token.read().await.is_none());
    }
}
