//! Store node 历史同步
//!
//! 本 crate 负责从 store node 拉取历史消息的簿记与调度：
//! - 按目标去重的请求协调，结果扇出给所有等待者
//! - 过滤器分层、按 24 小时窗口切分的批次规划
//! - 基于游标的分页拉取，支持提前终止
//! - 时间线 gap 的检测、插入与补齐
//! - 同步生命周期事件
//!
//! 传输层（订阅、连接、编解码）与持久层通过 [`Transport`] 和 [`SyncStore`] 注入。
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storenode_sync::{FetchTarget, HistorySync, HistorySyncConfig, KvSyncStore, Transport};
//!
//! async fn run(transport: Arc<dyn Transport>) -> storenode_sync::Result<()> {
//!     let store = Arc::new(KvSyncStore::open(std::path::Path::new("/path/to/data/sync")).await?);
//!     let sync = HistorySync::new(HistorySyncConfig::default(), transport, store)?;
//!
//!     // 定期全量同步
//!     let response = sync.request_all_history().await?;
//!     println!("同步了 {} 个聊天", response.chats.len());
//!
//!     // 拉取社区描述，重复调用共享同一次拉取
//!     if let Some(result) = sync.fetch_one(FetchTarget::Community("0xabc".into()), true).await {
//!         println!("found: {}", result.is_found());
//!     }
//!
//!     sync.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod types;
pub mod utils;

#[cfg(test)]
mod test_helpers;

pub use config::{HistorySyncConfig, HistorySyncConfigBuilder};
pub use error::{Result, SyncError};
pub use events::{EventStats, SyncEvent, SyncEventManager};
pub use history::HistorySync;
pub use storage::{KvSyncStore, MemorySyncStore, SyncStore};
pub use sync::{FetchHandle, RequestInfo, RequestState, SyncTask};
pub use transport::{PageQuery, PageResponse, Transport};
pub use types::{
    Batch, ChatSyncRecord, ContentTopic, Cursor, FetchResult, FetchStats, FetchTarget, Filter,
    GapMessage, StoreNodePeer, SyncResponse, TopicSyncState,
};
