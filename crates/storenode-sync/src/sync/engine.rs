//! 历史同步引擎
//!
//! 把规划、分页拉取、gap 对账串起来：
//!
//! ```text
//! 过滤器 → BatchPlanner → [窗口1, 窗口2, ...] → PageFetcher
//!                                     ↓ 整个批次成功
//!                     写 topic 同步状态 → 每个聊天做 gap 对账
//! ```
//!
//! 同一次同步内批次严格串行；引擎本身不重试，重试策略由调用方决定。

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HistorySyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{event_builders, SyncEventManager};
use crate::storage::SyncStore;
use crate::sync::batch_planner::{BatchPlan, BatchPlanner};
use crate::sync::gap_tracker::GapTracker;
use crate::sync::page_fetcher::{ContinuePredicate, PageFetcher, PageRunStatus};
use crate::transport::Transport;
use crate::types::{Filter, FetchStats, StoreNodePeer, SyncResponse};
use crate::utils::{format_unix_secs, TimeSource};

/// 一次同步的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub response: SyncResponse,
    /// 谓词提前终止时为 true；此时未完成的批次不写任何同步状态
    pub stopped_early: bool,
}

/// 解析出来的过滤器
#[derive(Debug, Clone, Default)]
pub struct ResolvedFilters {
    pub filters: Vec<Filter>,
    /// 仅为本次拉取临时安装的过滤器，结束后必须移除
    pub ephemeral: Vec<Filter>,
}

pub struct HistorySyncEngine {
    config: HistorySyncConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SyncStore>,
    planner: BatchPlanner,
    fetcher: PageFetcher,
    gaps: GapTracker,
    events: Arc<SyncEventManager>,
    now: TimeSource,
}

impl HistorySyncEngine {
    pub fn new(
        config: HistorySyncConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SyncStore>,
        events: Arc<SyncEventManager>,
        now: TimeSource,
    ) -> Self {
        Self {
            planner: BatchPlanner::new(config.clone()),
            fetcher: PageFetcher::new(transport.clone(), config.max_topics_per_request),
            gaps: GapTracker::new(store.clone()),
            config,
            transport,
            store,
            events,
            now,
        }
    }

    pub fn config(&self) -> &HistorySyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<SyncEventManager> {
        &self.events
    }

    pub fn now(&self) -> u64 {
        (self.now)()
    }

    /// 等待可用的 store node，超时返回 `StoreNodeUnavailable`
    pub async fn wait_for_store_node(&self) -> Result<StoreNodePeer> {
        let timeout = self.config.store_node_wait_timeout();
        match tokio::time::timeout(timeout, self.transport.wait_for_store_node()).await {
            Ok(Some(peer)) => {
                debug!("使用 store node: {}", peer);
                Ok(peer)
            }
            Ok(None) => {
                warn!("没有可用的 store node");
                Err(SyncError::StoreNodeUnavailable)
            }
            Err(_) => {
                warn!("等待 store node 超时: {:?}", timeout);
                Err(SyncError::StoreNodeUnavailable)
            }
        }
    }

    /// 查找已有过滤器，缺失的临时安装
    pub async fn resolve_filters(&self, ids: &[String]) -> Result<ResolvedFilters> {
        let mut resolved = ResolvedFilters::default();
        let mut missing = Vec::new();
        for id in ids {
            match self.transport.resolve_filter(id).await {
                Some(filter) => resolved.filters.push(filter),
                None => missing.push(id.clone()),
            }
        }

        if !missing.is_empty() {
            let installed = self.transport.install_filters(&missing).await?;
            debug!("临时安装过滤器: ids={:?}, count={}", missing, installed.len());
            resolved.filters.extend(installed.iter().cloned());
            resolved.ephemeral = installed;
        }

        Ok(resolved)
    }

    /// 移除临时过滤器；失败只记日志
    pub async fn release_filters(&self, ephemeral: &[Filter]) {
        if ephemeral.is_empty() {
            return;
        }
        match self.transport.remove_filters(ephemeral).await {
            Ok(()) => debug!("已移除临时过滤器: count={}", ephemeral.len()),
            Err(e) => warn!("移除临时过滤器失败: {}", e),
        }
    }

    /// 以聊天最近阅读时间作为优先级
    async fn priorities_for(&self, filters: &[Filter]) -> Result<HashMap<String, u64>> {
        let mut chat_ids: Vec<String> = filters.iter().map(|f| f.chat_id.clone()).collect();
        chat_ids.sort();
        chat_ids.dedup();

        let records = self.store.chat_sync_records(&chat_ids).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.read_messages_at > 0)
            .map(|r| (r.chat_id, r.read_messages_at))
            .collect())
    }

    /// 对一组过滤器做分层同步
    ///
    /// `stats` 是累加器，失败时也包含已完成的页。
    pub async fn sync_filters(
        &self,
        peer: &StoreNodePeer,
        filters: &[Filter],
        page_limit: u32,
        should_continue: Option<&ContinuePredicate>,
        stats: &mut FetchStats,
    ) -> Result<SyncOutcome> {
        let now = self.now();
        let topic_states = self.store.load_topic_sync_states().await?;
        let priorities = self.priorities_for(filters).await?;
        let plan = self.planner.plan(filters, &priorities, &topic_states, now);

        let request_id = Uuid::new_v4().to_string();
        info!(
            "开始历史请求: request_id={}, filters={}, batches={}, windows={}",
            request_id,
            filters.len(),
            plan.batches.len(),
            plan.window_count()
        );
        self.events
            .emit(event_builders::history_request_started(&request_id, plan.window_count()))
            .await;

        let result = self.execute_plan(peer, &plan, page_limit, should_continue, stats).await;

        match &result {
            Ok(outcome) => info!(
                "历史请求完成: request_id={}, envelopes={}, pages={}, stopped_early={}",
                request_id, stats.envelopes, stats.pages, outcome.stopped_early
            ),
            Err(e) => warn!("历史请求失败: request_id={}, error={}", request_id, e),
        }
        self.events
            .emit(event_builders::history_request_completed(
                &request_id,
                *stats,
                result.as_ref().err().map(|e| e.to_string()),
            ))
            .await;

        result
    }

    async fn execute_plan(
        &self,
        peer: &StoreNodePeer,
        plan: &BatchPlan,
        page_limit: u32,
        should_continue: Option<&ContinuePredicate>,
        stats: &mut FetchStats,
    ) -> Result<SyncOutcome> {
        let mut outcome = SyncOutcome::default();

        for planned in &plan.batches {
            debug!(
                "执行批次: tier={:?}, pubsub={}, topics={}, from={}, to={}",
                planned.tier,
                planned.batch.pubsub_topic,
                planned.batch.content_topics.len(),
                format_unix_secs(planned.batch.from),
                format_unix_secs(planned.batch.to)
            );

            for window in &planned.windows {
                let status = self
                    .fetcher
                    .run(peer, window, page_limit, should_continue, stats)
                    .await?;
                if status == PageRunStatus::StoppedEarly {
                    outcome.stopped_early = true;
                    return Ok(outcome);
                }
            }

            self.store
                .persist_topic_sync_states(&planned.topic_updates())
                .await?;

            for chat_id in &planned.batch.chat_ids {
                let reconciliation = self
                    .gaps
                    .reconcile(chat_id, planned.batch.from, planned.batch.to)
                    .await?;
                if let Some(gap) = reconciliation.gap {
                    self.events.emit(event_builders::gap_inserted(gap.clone())).await;
                    outcome.response.gap_messages.push(gap);
                }
                outcome.response.merge(SyncResponse {
                    chats: vec![reconciliation.record],
                    ..Default::default()
                });
            }
        }

        Ok(outcome)
    }

    /// 全量同步所有正在监听的过滤器
    pub async fn request_all_history(&self) -> Result<SyncResponse> {
        let filters: Vec<Filter> = self
            .transport
            .filters()
            .await
            .into_iter()
            .filter(|f| f.listen)
            .collect();
        if filters.is_empty() {
            debug!("没有监听中的过滤器，跳过历史同步");
            return Ok(SyncResponse::default());
        }

        let peer = self.wait_for_store_node().await?;
        let mut stats = FetchStats::default();
        let outcome = self
            .sync_filters(&peer, &filters, self.config.default_page_size, None, &mut stats)
            .await?;
        Ok(outcome.response)
    }

    /// 同步单个聊天
    pub async fn sync_chat(&self, chat_id: &str) -> Result<SyncResponse> {
        let filter = self
            .transport
            .resolve_filter(chat_id)
            .await
            .ok_or_else(|| SyncError::NotFound(format!("聊天 {} 没有过滤器", chat_id)))?;

        let peer = self.wait_for_store_node().await?;
        let mut stats = FetchStats::default();
        let outcome = self
            .sync_filters(&peer, &[filter], self.config.default_page_size, None, &mut stats)
            .await?;
        Ok(outcome.response)
    }

    /// 补齐 gap
    ///
    /// 拉取覆盖所有指定 gap 的单个显式区间，成功后才删除 gap 标记；
    /// 任意一页失败时标记保持不变，可安全重试。不改动聊天的同步标记。
    pub async fn fill_gaps(&self, chat_id: &str, gap_ids: &[String]) -> Result<SyncResponse> {
        self.fill_gaps_until(chat_id, gap_ids, &CancellationToken::new())
            .await
    }

    /// 同 [`fill_gaps`](Self::fill_gaps)，`cancel` 触发时返回 `Cancelled`
    ///
    /// 只有分页拉取参与取消竞争，临时过滤器在取消后同样会被移除。
    pub async fn fill_gaps_until(
        &self,
        chat_id: &str,
        gap_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<SyncResponse> {
        let range = self.gaps.fill_range(chat_id, gap_ids).await?;
        info!(
            "补齐 gap: chat_id={}, gaps={}, from={}, to={}",
            chat_id,
            range.gaps.len(),
            format_unix_secs(range.from),
            format_unix_secs(range.to)
        );

        let resolved = self.resolve_filters(&[chat_id.to_string()]).await?;
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = self.fetch_range(&resolved.filters, range.from, range.to) => result,
        };
        self.release_filters(&resolved.ephemeral).await;
        result?;

        let removed = self.gaps.remove_gaps(&range).await?;
        self.events
            .emit(event_builders::gaps_filled(chat_id, removed.clone()))
            .await;

        Ok(SyncResponse {
            removed_gap_ids: removed,
            ..Default::default()
        })
    }

    async fn fetch_range(&self, filters: &[Filter], from: u64, to: u64) -> Result<FetchStats> {
        let peer = self.wait_for_store_node().await?;
        let mut stats = FetchStats::default();
        for batch in self.planner.explicit(filters, from, to) {
            self.fetcher
                .run(&peer, &batch, self.config.default_page_size, None, &mut stats)
                .await?;
        }
        Ok(stats)
    }
}
