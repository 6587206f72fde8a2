//! 测试用的传输层与辅助函数

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::HistorySyncConfig;
use crate::error::Result;
use crate::transport::{PageQuery, PageResponse, Transport};
use crate::types::{ContentTopic, Filter, StoreNodePeer};

pub const TEST_PUBSUB: &str = "/waku/2/test";
pub const TEST_NOW: u64 = 1_700_000_000;

/// 测试日志输出，重复调用无副作用
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn peer() -> StoreNodePeer {
    StoreNodePeer("/ip4/127.0.0.1/tcp/60000/p2p/test-store".to_string())
}

/// 节点等待超时很短的配置
pub fn test_config() -> HistorySyncConfig {
    HistorySyncConfig::builder()
        .store_node_wait_timeout(Duration::from_millis(50))
        .build()
}

pub fn topic_for(chat_id: &str) -> ContentTopic {
    ContentTopic::from_bytes(chat_id.as_bytes().to_vec())
}

type PageHook = Box<dyn Fn(&PageQuery) + Send + Sync>;

/// 按脚本返回分页结果的传输层
///
/// 脚本用完后每次请求返回一页空结果（无游标）。
pub struct ScriptedTransport {
    pages: Mutex<VecDeque<Result<PageResponse>>>,
    queries: Mutex<Vec<PageQuery>>,
    filters: Mutex<Vec<Filter>>,
    installed: Mutex<Vec<String>>,
    removed: Mutex<Vec<Filter>>,
    store_node: Mutex<Option<StoreNodePeer>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    on_page: Mutex<Option<PageHook>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self {
            pages: Mutex::new(VecDeque::new()),
            queries: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
            installed: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            store_node: Mutex::new(Some(peer())),
            gate: Mutex::new(None),
            on_page: Mutex::new(None),
        }
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 没有可用 store node 的传输层
    pub fn without_store_node() -> Self {
        let transport = Self::default();
        *transport.store_node.lock() = None;
        transport
    }

    pub fn push_pages(&self, pages: Vec<Result<PageResponse>>) {
        self.pages.lock().extend(pages);
    }

    pub fn page_queries(&self) -> Vec<PageQuery> {
        self.queries.lock().clone()
    }

    pub fn add_filter(&self, filter: Filter) {
        self.filters.lock().push(filter);
    }

    pub fn installed(&self) -> Vec<String> {
        self.installed.lock().clone()
    }

    pub fn removed(&self) -> Vec<Filter> {
        self.removed.lock().clone()
    }

    /// 之后的分页请求都会挂起，直到 `release_pages`
    pub fn hold_pages(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_pages(&self) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// 每收到一个分页请求时回调（在返回结果之前）
    pub fn set_on_page<F>(&self, hook: F)
    where
        F: Fn(&PageQuery) + Send + Sync + 'static,
    {
        *self.on_page.lock() = Some(Box::new(hook));
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn resolve_filter(&self, chat_id: &str) -> Option<Filter> {
        self.filters
            .lock()
            .iter()
            .find(|f| f.chat_id == chat_id)
            .cloned()
    }

    async fn install_filters(&self, chat_ids: &[String]) -> Result<Vec<Filter>> {
        let created: Vec<Filter> = chat_ids
            .iter()
            .map(|id| Filter::new(id.clone(), TEST_PUBSUB, topic_for(id)))
            .collect();
        self.filters.lock().extend(created.iter().cloned());
        self.installed.lock().extend(chat_ids.iter().cloned());
        Ok(created)
    }

    async fn remove_filters(&self, filters: &[Filter]) -> Result<()> {
        self.filters.lock().retain(|f| !filters.contains(f));
        self.removed.lock().extend(filters.iter().cloned());
        Ok(())
    }

    async fn filters(&self) -> Vec<Filter> {
        self.filters.lock().clone()
    }

    async fn wait_for_store_node(&self) -> Option<StoreNodePeer> {
        let peer = self.store_node.lock().clone();
        match peer {
            Some(peer) => Some(peer),
            None => {
                std::future::pending::<()>().await;
                None
            }
        }
    }

    async fn request_page(&self, _peer: &StoreNodePeer, query: PageQuery) -> Result<PageResponse> {
        self.queries.lock().push(query.clone());

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }

        if let Some(hook) = self.on_page.lock().as_ref() {
            hook(&query);
        }

        self.pages
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(PageResponse::default()))
    }
}
