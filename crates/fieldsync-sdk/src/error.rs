use std::fmt;
use rusqlite;

#[derive(Debug)]
pub enum FieldSyncError {
    SqliteError(rusqlite::Error),
    JsonError(String),
    KvStore(String),
    Serialization(String),
    IO(String),
    InvalidArgument(String),
    NotFound(String),
    InvalidData(String),
    NotInitialized(String),
    ShuttingDown(String),
    Other(String),
    // 网络传输层错误（连接失败/超时，无响应）
    Transport(String),
    // 服务端明确拒绝（有状态码与响应体）
    Rejected {
        status: u16,
        message: String,
        body: Option<String>,
    },
    // 请求完成但既无响应也无错误详情（模糊完成，不改本地状态）
    NoResponse,
    // 认证过期，拉取调度整体停摆直到外部重置
    Unauthorized,
}

impl fmt::Display for FieldSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldSyncError::SqliteError(e) => write!(f, "SQLite error: {}", e),
            FieldSyncError::JsonError(e) => write!(f, "JSON error: {}", e),
            FieldSyncError::KvStore(e) => write!(f, "KV store error: {}", e),
            FieldSyncError::Serialization(e) => write!(f, "Serialization error: {}", e),
            FieldSyncError::IO(e) => write!(f, "IO error: {}", e),
            FieldSyncError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            FieldSyncError::NotFound(e) => write!(f, "Not found: {}", e),
            FieldSyncError::InvalidData(e) => write!(f, "Invalid data: {}", e),
            FieldSyncError::NotInitialized(e) => write!(f, "Not initialized: {}", e),
            FieldSyncError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
            FieldSyncError::Other(e) => write!(f, "Other error: {}", e),
            FieldSyncError::Transport(e) => write!(f, "Transport error: {}", e),
            FieldSyncError::Rejected { status, message, .. } => {
                write!(f, "Server rejected [{}]: {}", status, message)
            }
            FieldSyncError::NoResponse => write!(f, "No response"),
            FieldSyncError::Unauthorized => write!(f, "Unauthorized"),
        }
    }
}

impl std::error::Error for FieldSyncError {}

impl From<rusqlite::Error> for FieldSyncError {
    fn from(error: rusqlite::Error) -> Self {
        FieldSyncError::SqliteError(error)
    }
}

impl From<serde_json::Error> for FieldSyncError {
    fn from(error: serde_json::Error) -> Self {
        FieldSyncError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for FieldSyncError {
    fn from(error: std::io::Error) -> Self {
        FieldSyncError::IO(error.to_string())
    }
}

impl FieldSyncError {
    /// 判断是否是"可保留 last_error"的失败（模糊完成不落盘）
    pub fn is_recordable(&self) -> bool {
        !matches!(self, FieldSyncError::NoResponse)
    }

    /// 获取服务端拒绝的状态码（如果这是一个 Rejected 错误）
    pub fn rejection_status(&self) -> Option<u16> {
        match self {
            FieldSyncError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FieldSyncError>;
