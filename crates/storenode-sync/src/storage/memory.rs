use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::Result;
use crate::storage::SyncStore;
use crate::types::{ChatSyncRecord, ContentTopic, FetchTarget, GapMessage, TopicSyncState};

#[derive(Debug, Default)]
struct Inner {
    topics: HashMap<(String, ContentTopic), TopicSyncState>,
    chats: HashMap<String, ChatSyncRecord>,
    messages: HashMap<String, GapMessage>,
    targets: HashMap<FetchTarget, Bytes>,
}

/// 内存版同步存储
#[derive(Debug, Default)]
pub struct MemorySyncStore {
    inner: Mutex<Inner>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入聊天记录（包括阅读时间）
    pub fn upsert_chat(&self, record: ChatSyncRecord) {
        self.inner.lock().chats.insert(record.chat_id.clone(), record);
    }

    /// 模拟下层把目标数据写入本地
    pub fn insert_target(&self, target: FetchTarget, data: Bytes) {
        self.inner.lock().targets.insert(target, data);
    }

    pub fn topic_sync_state(&self, pubsub_topic: &str, content_topic: &ContentTopic) -> Option<TopicSyncState> {
        self.inner
            .lock()
            .topics
            .get(&(pubsub_topic.to_string(), content_topic.clone()))
            .cloned()
    }

    /// 某个聊天当前的所有 gap 消息，按时钟排序
    pub fn chat_gaps(&self, chat_id: &str) -> Vec<GapMessage> {
        let inner = self.inner.lock();
        let mut gaps: Vec<GapMessage> = inner
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        gaps.sort_by_key(|m| m.clock);
        gaps
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn load_topic_sync_states(&self) -> Result<Vec<TopicSyncState>> {
        Ok(self.inner.lock().topics.values().cloned().collect())
    }

    async fn persist_topic_sync_states(&self, states: &[TopicSyncState]) -> Result<()> {
        let mut inner = self.inner.lock();
        for state in states {
            inner.topics.insert(state.key(), state.clone());
        }
        Ok(())
    }

    async fn chat_sync_record(&self, chat_id: &str) -> Result<Option<ChatSyncRecord>> {
        Ok(self.inner.lock().chats.get(chat_id).cloned())
    }

    async fn set_chat_sync_markers(&self, chat_id: &str, from: u64, to: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .chats
            .entry(chat_id.to_string())
            .or_insert_with(|| ChatSyncRecord::new(chat_id));
        record.synced_from = from;
        record.synced_to = to;
        Ok(())
    }

    async fn persist_messages(&self, messages: &[GapMessage]) -> Result<()> {
        let mut inner = self.inner.lock();
        for message in messages {
            inner.messages.insert(message.id.clone(), message.clone());
        }
        Ok(())
    }

    async fn delete_messages(&self, ids: &[String]) -> Result<()> {
        let mut inner = self.inner.lock();
        for id in ids {
            inner.messages.remove(id);
        }
        Ok(())
    }

    async fn gap_messages(&self, chat_id: &str, ids: &[String]) -> Result<Vec<GapMessage>> {
        let inner = self.inner.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect())
    }

    fn has_target(&self, target: &FetchTarget) -> bool {
        self.inner.lock().targets.contains_key(target)
    }

    async fn load_target(&self, target: &FetchTarget) -> Result<Option<Bytes>> {
        Ok(self.inner.lock().targets.get(target).cloned())
    }
}
