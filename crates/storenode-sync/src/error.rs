use thiserror::Error;

/// 同步引擎错误
///
/// 需要 `Clone`：同一个请求的结果会原样分发给所有订阅者。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// 等待超时内没有可用的 store node
    #[error("Store node unavailable")]
    StoreNodeUnavailable,
    /// 单页历史请求失败（网络 / 协议）
    #[error("Page fetch error: {0}")]
    PageFetch(String),
    /// 传输层错误（过滤器安装、移除等）
    #[error("Transport error: {0}")]
    Transport(String),
    /// 持久化错误（topic 同步状态、同步标记、gap 消息）
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// 参数校验失败，发生在任何网络请求之前
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// 请求被关闭信号中断
    #[error("Cancelled")]
    Cancelled,
    #[error("Shutting down")]
    ShuttingDown,
}

impl SyncError {
    /// 调用方是否可以稍后重试
    ///
    /// 协调器内部从不重试，这里只是给调度层的提示。
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::StoreNodeUnavailable => true,
            SyncError::PageFetch(_) => true,
            SyncError::Transport(_) => true,
            SyncError::Persistence(_) => true,
            SyncError::KvStore(_) => true,
            SyncError::Cancelled => true,
            SyncError::Serialization(_) => false,
            SyncError::InvalidArgument(_) => false,
            SyncError::NotFound(_) => false,
            SyncError::ShuttingDown => false,
        }
    }

    /// 判断是否是 store node 不可用
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SyncError::StoreNodeUnavailable)
    }
}

impl From<sled::Error> for SyncError {
    fn from(error: sled::Error) -> Self {
        SyncError::KvStore(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
