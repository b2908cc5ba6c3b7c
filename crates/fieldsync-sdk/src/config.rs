//! SDK 配置模块
//!
//! 配置由宿主应用在进程启动时显式注入，引擎本身不拥有任何配置来源。
//! 运行期可变的配置（如拉取间隔）通过 [`SharedConfig`] 快照读取：
//! 调度器在每次重新挂定时器前取一次快照，修改在下一轮生效，
//! 不依赖属性观察式的隐式触发。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// 分片导入默认大小（生产默认值）
pub const DEFAULT_IMPORT_CHUNK_SIZE: usize = 250;

/// FieldSync 引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSyncConfig {
    /// 数据存储目录（sqlite / sled / 附件文件）
    pub data_dir: PathBuf,
    /// 服务端 API 基础 URL，例如 https://field.example.com/api
    pub base_url: String,
    /// 当前用户的服务端 ID（用于判断自己创建的记录，不推进拉取游标）
    pub self_remote_id: Option<String>,
    /// 记录推送定时器间隔（秒）
    pub push_interval_secs: u64,
    /// 记录拉取间隔（秒）
    pub observation_fetch_interval_secs: u64,
    /// 位置流拉取间隔（秒）
    pub location_fetch_interval_secs: u64,
    /// 批量导入分片大小
    pub import_chunk_size: usize,
    /// 是否允许推送记录
    pub push_observations_enabled: bool,
    /// 是否允许推送附件
    pub push_attachments_enabled: bool,
    /// 是否允许拉取
    pub fetch_enabled: bool,
}

impl Default for FieldSyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./fieldsync_data"),
            base_url: String::new(),
            self_remote_id: None,
            push_interval_secs: 60,
            observation_fetch_interval_secs: 60,
            location_fetch_interval_secs: 30,
            import_chunk_size: DEFAULT_IMPORT_CHUNK_SIZE,
            push_observations_enabled: true,
            push_attachments_enabled: true,
            fetch_enabled: true,
        }
    }
}

impl FieldSyncConfig {
    pub fn builder() -> FieldSyncConfigBuilder {
        FieldSyncConfigBuilder::new()
    }
}

/// 配置构建器
pub struct FieldSyncConfigBuilder {
    config: FieldSyncConfig,
}

impl FieldSyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FieldSyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn self_remote_id<S: Into<String>>(mut self, id: S) -> Self {
        self.config.self_remote_id = Some(id.into());
        self
    }

    pub fn push_interval_secs(mut self, secs: u64) -> Self {
        self.config.push_interval_secs = secs;
        self
    }

    pub fn observation_fetch_interval_secs(mut self, secs: u64) -> Self {
        self.config.observation_fetch_interval_secs = secs;
        self
    }

    pub fn location_fetch_interval_secs(mut self, secs: u64) -> Self {
        self.config.location_fetch_interval_secs = secs;
        self
    }

    pub fn import_chunk_size(mut self, size: usize) -> Self {
        self.config.import_chunk_size = size.max(1);
        self
    }

    pub fn push_observations_enabled(mut self, enabled: bool) -> Self {
        self.config.push_observations_enabled = enabled;
        self
    }

    pub fn push_attachments_enabled(mut self, enabled: bool) -> Self {
        self.config.push_attachments_enabled = enabled;
        self
    }

    pub fn fetch_enabled(mut self, enabled: bool) -> Self {
        self.config.fetch_enabled = enabled;
        self
    }

    pub fn build(self) -> FieldSyncConfig {
        self.config
    }
}

impl Default for FieldSyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 运行期共享配置句柄
///
/// 所有协调器持有同一个句柄；读方取 [`snapshot`](SharedConfig::snapshot)，
/// 写方整体替换。间隔修改在各自定时器的下一次 re-arm 时生效。
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<FieldSyncConfig>>,
}

impl SharedConfig {
    pub fn new(config: FieldSyncConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// 取当前配置快照（clone，一次定时器周期内保持一致）
    pub fn snapshot(&self) -> FieldSyncConfig {
        self.inner.read().clone()
    }

    /// 整体替换配置
    pub fn replace(&self, config: FieldSyncConfig) {
        *self.inner.write() = config;
    }

    /// 原地修改配置
    pub fn update<F: FnOnce(&mut FieldSyncConfig)>(&self, f: F) {
        let mut guard = self.inner.write();
        f(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = FieldSyncConfig::builder()
            .base_url("https://field.example.com/api")
            .build();
        assert_eq!(config.import_chunk_size, DEFAULT_IMPORT_CHUNK_SIZE);
        assert_eq!(config.push_interval_secs, 60);
        assert!(config.fetch_enabled);
    }

    #[test]
    fn test_shared_config_snapshot_isolation() {
        let shared = SharedConfig::new(FieldSyncConfig::default());
        let before = shared.snapshot();
        shared.update(|c| c.observation_fetch_interval_secs = 5);
        // 旧快照不受影响，新快照读到新值
        assert_eq!(before.observation_fetch_interval_secs, 60);
        assert_eq!(shared.snapshot().observation_fetch_interval_secs, 5);
    }

    #[test]
    fn test_chunk_size_floor() {
        let config = FieldSyncConfig::builder().import_chunk_size(0).build();
        assert_eq!(config.import_chunk_size, 1);
    }
}
