//! 同步引擎的数据模型

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SyncError;

/// Content topic：由字节派生的不透明标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentTopic(pub Vec<u8>);

impl ContentTopic {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        ContentTopic(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for ContentTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

/// store node 返回的分页游标，空游标表示没有下一页
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(pub Vec<u8>);

impl Cursor {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// 一个 store node（历史消息归档节点）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreNodePeer(pub String);

impl fmt::Display for StoreNodePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Topic 订阅描述
///
/// 由传输层创建和销毁，同步引擎只读取 topic 与优先级。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// 所属聊天 / 社区 ID
    pub chat_id: String,
    pub pubsub_topic: String,
    pub content_topic: ContentTopic,
    /// 优先级（越大越先同步），通常来自最近一次阅读时间
    pub priority: Option<u64>,
    /// 是否在监听
    pub listen: bool,
}

impl Filter {
    pub fn new(
        chat_id: impl Into<String>,
        pubsub_topic: impl Into<String>,
        content_topic: ContentTopic,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            pubsub_topic: pubsub_topic.into(),
            content_topic,
            priority: None,
            listen: true,
        }
    }

    pub fn with_priority(mut self, priority: u64) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// (pubsub topic, content topic) 的最后请求时间（unix 秒）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSyncState {
    pub pubsub_topic: String,
    pub content_topic: ContentTopic,
    pub last_request: u64,
}

impl TopicSyncState {
    pub fn key(&self) -> (String, ContentTopic) {
        (self.pubsub_topic.clone(), self.content_topic.clone())
    }
}

/// 一次拉取批次
///
/// 同一 pubsub topic、同一优先级层内，兄弟批次的 content topic 互不相交。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub pubsub_topic: String,
    pub content_topics: Vec<ContentTopic>,
    pub chat_ids: Vec<String>,
    pub from: u64,
    pub to: u64,
    pub cursor: Option<Cursor>,
}

/// 拉取目标（一个逻辑对象，例如一个社区）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchTarget {
    Community(String),
    Contact(String),
}

impl FetchTarget {
    /// 用于解析过滤器的 ID
    pub fn id(&self) -> &str {
        match self {
            FetchTarget::Community(id) => id,
            FetchTarget::Contact(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchTarget::Community(_) => "community",
            FetchTarget::Contact(_) => "contact",
        }
    }
}

impl fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// 聊天的同步标记
///
/// `synced_from` 只会向前扩展（变小），`synced_to` 只会向后扩展（变大），0 表示未设置。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSyncRecord {
    pub chat_id: String,
    pub synced_from: u64,
    pub synced_to: u64,
    /// 最近一次阅读的时钟值，用于计算同步优先级
    pub read_messages_at: u64,
}

impl ChatSyncRecord {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            ..Default::default()
        }
    }
}

/// 时间线上的 gap 标记：[from, to) 区间内的历史尚未拉取
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapMessage {
    pub id: String,
    pub chat_id: String,
    pub from: u64,
    pub to: u64,
    /// 时间线排序用的时钟值
    pub clock: u64,
}

/// 拉取统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStats {
    pub envelopes: usize,
    pub pages: usize,
}

impl FetchStats {
    pub fn merge(&mut self, other: FetchStats) {
        self.envelopes += other.envelopes;
        self.pages += other.pages;
    }
}

/// 单目标拉取的最终结果，所有订阅者拿到的是同一个值
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub target: FetchTarget,
    /// 本地已有的目标数据（找到时）
    pub found: Option<Bytes>,
    pub error: Option<SyncError>,
    pub stats: FetchStats,
}

impl FetchResult {
    pub fn is_found(&self) -> bool {
        self.found.is_some()
    }
}

/// 聚合响应：被触及的聊天与新插入 / 删除的 gap 标记
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub chats: Vec<ChatSyncRecord>,
    pub gap_messages: Vec<GapMessage>,
    pub removed_gap_ids: Vec<String>,
}

impl SyncResponse {
    pub fn is_empty(&self) -> bool {
        self.chats.is_empty() && self.gap_messages.is_empty() && self.removed_gap_ids.is_empty()
    }

    /// 合并另一个响应；同一聊天只保留最新的同步标记
    pub fn merge(&mut self, other: SyncResponse) {
        for chat in other.chats {
            match self.chats.iter_mut().find(|c| c.chat_id == chat.chat_id) {
                Some(existing) => *existing = chat,
                None => self.chats.push(chat),
            }
        }
        self.gap_messages.extend(other.gap_messages);
        self.removed_gap_ids.extend(other.removed_gap_ids);
    }
}
