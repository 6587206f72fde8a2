//! 历史同步入口
//!
//! 对外的唯一门面：持有引擎、请求协调器与事件管理器。

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::HistorySyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{SyncEvent, SyncEventManager};
use crate::storage::SyncStore;
use crate::sync::{FetchHandle, HistorySyncEngine, RequestCoordinator, RequestInfo, SyncTask};
use crate::transport::Transport;
use crate::types::{FetchResult, FetchTarget, SyncResponse};
use crate::utils::{system_time_source, TimeSource};

pub struct HistorySync {
    engine: Arc<HistorySyncEngine>,
    coordinator: RequestCoordinator,
    events: Arc<SyncEventManager>,
}

impl HistorySync {
    pub fn new(
        config: HistorySyncConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SyncStore>,
    ) -> Result<Self> {
        Self::with_time_source(config, transport, store, system_time_source())
    }

    /// 指定时间源（测试里固定 now）
    pub fn with_time_source(
        config: HistorySyncConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SyncStore>,
        now: TimeSource,
    ) -> Result<Self> {
        config.validate()?;
        let events = Arc::new(SyncEventManager::new(config.event_capacity));
        let engine = Arc::new(HistorySyncEngine::new(
            config,
            transport,
            store,
            events.clone(),
            now,
        ));
        info!("历史同步已初始化");

        Ok(Self {
            coordinator: RequestCoordinator::new(engine.clone()),
            engine,
            events,
        })
    }

    /// 拉取单个目标，见 [`RequestCoordinator::fetch_one`]
    pub async fn fetch_one(&self, target: FetchTarget, wait_for_result: bool) -> Option<FetchResult> {
        self.coordinator.fetch_one(target, wait_for_result).await
    }

    pub fn fetch_many(&self, targets: Vec<FetchTarget>) -> Vec<FetchHandle> {
        self.coordinator.fetch_many(targets)
    }

    pub fn request(&self, target: FetchTarget) -> FetchHandle {
        self.coordinator.request(target)
    }

    /// 同步所有监听中的过滤器
    pub async fn request_all_history(&self) -> Result<SyncResponse> {
        self.coordinator
            .run_cancellable(self.engine.request_all_history())
            .await
    }

    /// 在后台执行一次全量同步
    pub fn spawn_history_sync(&self) -> SyncTask<SyncResponse> {
        let engine = self.engine.clone();
        let token = self.coordinator.shutdown_token().child_token();
        let task_token = token.clone();
        let handle = self.coordinator.tracker().spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => Err(SyncError::Cancelled),
                result = engine.request_all_history() => result,
            }
        });
        SyncTask::new(handle, token)
    }

    pub async fn sync_chat(&self, chat_id: &str) -> Result<SyncResponse> {
        self.coordinator
            .run_cancellable(self.engine.sync_chat(chat_id))
            .await
    }

    /// 补齐 gap；关闭时取消拉取，临时过滤器照常移除
    pub async fn fill_gaps(&self, chat_id: &str, gap_ids: &[String]) -> Result<SyncResponse> {
        if self.coordinator.is_shut_down() {
            return Err(SyncError::ShuttingDown);
        }
        self.engine
            .fill_gaps_until(chat_id, gap_ids, &self.coordinator.shutdown_token())
            .await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &Arc<SyncEventManager> {
        &self.events
    }

    pub fn active_requests(&self) -> Vec<RequestInfo> {
        self.coordinator.active_requests()
    }

    /// 取消所有后台请求并等待退出
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }
}
