use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ContentTopic, Cursor, Filter, StoreNodePeer};

/// 单页历史请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    pub pubsub_topic: String,
    pub content_topics: Vec<ContentTopic>,
    pub from: u64,
    pub to: u64,
    pub cursor: Option<Cursor>,
    pub page_size: u32,
}

/// 单页响应：下一页游标 + 本页信封数量
///
/// 信封本身由传输层交给下层处理，同步引擎只关心数量。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResponse {
    pub cursor: Option<Cursor>,
    pub envelopes: usize,
}

impl PageResponse {
    /// 是否还有下一页
    pub fn has_more(&self) -> bool {
        self.cursor.as_ref().map(|c| !c.is_empty()).unwrap_or(false)
    }
}

/// 传输层接口（由外部实现：订阅 topic、连接节点、编解码信封）
#[async_trait]
pub trait Transport: Send + Sync {
    /// 查找已有的过滤器
    async fn resolve_filter(&self, chat_id: &str) -> Option<Filter>;

    /// 为给定的聊天 / 社区安装过滤器
    async fn install_filters(&self, chat_ids: &[String]) -> Result<Vec<Filter>>;

    /// 移除过滤器
    async fn remove_filters(&self, filters: &[Filter]) -> Result<()>;

    /// 当前所有过滤器（定期全量同步使用）
    async fn filters(&self) -> Vec<Filter>;

    /// 等待一个可用的 store node
    ///
    /// 调用方会套上超时；返回 `None` 表示当前没有可用节点。
    async fn wait_for_store_node(&self) -> Option<StoreNodePeer>;

    /// 请求一页历史消息
    async fn request_page(&self, peer: &StoreNodePeer, query: PageQuery) -> Result<PageResponse>;
}
