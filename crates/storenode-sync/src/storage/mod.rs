//! 同步簿记的持久化接口
//!
//! - `MemorySyncStore`：内存实现，测试与无盘场景使用
//! - `KvSyncStore`：基于 sled 的持久化实现

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::{ChatSyncRecord, FetchTarget, GapMessage, TopicSyncState};

pub mod kv;
pub mod memory;

pub use kv::KvSyncStore;
pub use memory::MemorySyncStore;

/// 持久化协作者
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// 读取所有 topic 同步状态
    async fn load_topic_sync_states(&self) -> Result<Vec<TopicSyncState>>;

    /// 写入 topic 同步状态（按 (pubsub, content) 覆盖）
    async fn persist_topic_sync_states(&self, states: &[TopicSyncState]) -> Result<()>;

    /// 读取聊天同步标记，不存在时返回 None
    async fn chat_sync_record(&self, chat_id: &str) -> Result<Option<ChatSyncRecord>>;

    /// 批量读取聊天同步标记，缺失的聊天直接跳过
    async fn chat_sync_records(&self, chat_ids: &[String]) -> Result<Vec<ChatSyncRecord>> {
        let mut records = Vec::with_capacity(chat_ids.len());
        for chat_id in chat_ids {
            if let Some(record) = self.chat_sync_record(chat_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn set_chat_sync_markers(&self, chat_id: &str, from: u64, to: u64) -> Result<()>;

    /// 保存 gap 消息（按 id 覆盖，重复写入是幂等的）
    async fn persist_messages(&self, messages: &[GapMessage]) -> Result<()>;

    async fn delete_messages(&self, ids: &[String]) -> Result<()>;

    /// 读取某个聊天里指定 id 的 gap 消息，不存在的 id 忽略
    async fn gap_messages(&self, chat_id: &str, ids: &[String]) -> Result<Vec<GapMessage>>;

    /// 本地是否已有目标数据（分页提前终止的判断，必须是廉价的同步调用）
    fn has_target(&self, target: &FetchTarget) -> bool;

    /// 读取本地的目标数据
    async fn load_target(&self, target: &FetchTarget) -> Result<Option<Bytes>>;
}
