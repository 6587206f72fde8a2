//! 请求协调器
//!
//! 对同一个拉取目标（社区 / 联系人）的并发请求去重：只执行一次底层拉取，
//! 结果扇出给完成前登记的所有订阅者。每个目标的拉取是一个受管后台任务，
//! `shutdown()` 会取消并等待所有任务，挂起中的订阅者收到 `Cancelled`。

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::events::event_builders;
use crate::sync::engine::HistorySyncEngine;
use crate::sync::page_fetcher::ContinuePredicate;
use crate::sync::request::{FetchHandle, RequestInfo, RequestRegistry, RequestState};
use crate::types::{FetchResult, FetchStats, FetchTarget, Filter};

pub struct RequestCoordinator {
    engine: Arc<HistorySyncEngine>,
    registry: Arc<RequestRegistry>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl RequestCoordinator {
    pub fn new(engine: Arc<HistorySyncEngine>) -> Self {
        Self {
            engine,
            registry: Arc::new(RequestRegistry::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// 订阅进行中的请求，或启动新请求；不阻塞
    pub fn request(&self, target: FetchTarget) -> FetchHandle {
        if self.shutdown.is_cancelled() {
            debug!("协调器已关闭，拒绝请求: {}", target);
            return FetchHandle::ready(FetchResult {
                target,
                found: None,
                error: Some(SyncError::ShuttingDown),
                stats: FetchStats::default(),
            });
        }

        let (handle, created) = self.registry.subscribe_or_create(&target);
        if created {
            let engine = self.engine.clone();
            let registry = self.registry.clone();
            let token = self.shutdown.child_token();
            let request_id = handle.request_id().to_string();
            self.tasks.spawn(async move {
                run_request(engine, registry, token, target, request_id).await;
            });
        }
        handle
    }

    /// 拉取单个目标
    ///
    /// `wait_for_result` 为 false 时立即返回 `None`，拉取仍在后台进行。
    pub async fn fetch_one(&self, target: FetchTarget, wait_for_result: bool) -> Option<FetchResult> {
        let handle = self.request(target);
        if wait_for_result {
            Some(handle.wait().await)
        } else {
            None
        }
    }

    /// 为每个目标各自启动请求，不合并成一个网络批次
    pub fn fetch_many(&self, targets: Vec<FetchTarget>) -> Vec<FetchHandle> {
        targets.into_iter().map(|target| self.request(target)).collect()
    }

    /// 在关闭信号下执行一个同步操作
    pub async fn run_cancellable<F, T>(&self, operation: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(SyncError::Cancelled),
            result = operation => result,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn active_requests(&self) -> Vec<RequestInfo> {
        self.registry.snapshot()
    }

    pub fn request_state(&self, target: &FetchTarget) -> Option<RequestState> {
        self.registry.state(target)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 取消所有进行中的请求并等待任务退出
    pub async fn shutdown(&self) {
        info!("关闭请求协调器: active_requests={}", self.registry.len());
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("请求协调器已关闭");
    }
}

/// 保证请求一定被终结
///
/// 拉取任务被取消或 panic 时 future 会被直接丢弃，`Drop` 里以 `Cancelled`
/// 终结登记表条目，并在后台移除临时过滤器。
struct RequestGuard {
    engine: Arc<HistorySyncEngine>,
    registry: Arc<RequestRegistry>,
    target: FetchTarget,
    request_id: String,
    ephemeral: Vec<Filter>,
    finished: bool,
}

impl RequestGuard {
    fn new(
        engine: Arc<HistorySyncEngine>,
        registry: Arc<RequestRegistry>,
        target: FetchTarget,
        request_id: String,
    ) -> Self {
        Self {
            engine,
            registry,
            target,
            request_id,
            ephemeral: Vec::new(),
            finished: false,
        }
    }

    /// 终结请求，返回需要移除的临时过滤器
    fn finish(&mut self, result: FetchResult) -> Vec<Filter> {
        self.finished = true;
        let delivered = self.registry.finalize(&self.request_id, result);
        debug!("目标请求已完成: target={}, delivered={}", self.target, delivered);
        std::mem::take(&mut self.ephemeral)
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        warn!("目标请求异常退出: target={}", self.target);
        self.registry.set_state(&self.target, RequestState::Error);
        self.registry.finalize(
            &self.request_id,
            FetchResult {
                target: self.target.clone(),
                found: None,
                error: Some(SyncError::Cancelled),
                stats: FetchStats::default(),
            },
        );

        let ephemeral = std::mem::take(&mut self.ephemeral);
        if ephemeral.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let engine = self.engine.clone();
                runtime.spawn(async move {
                    engine.release_filters(&ephemeral).await;
                });
            }
            Err(_) => warn!("运行时已退出，无法移除临时过滤器: count={}", ephemeral.len()),
        }
    }
}

async fn run_request(
    engine: Arc<HistorySyncEngine>,
    registry: Arc<RequestRegistry>,
    token: CancellationToken,
    target: FetchTarget,
    request_id: String,
) {
    let mut guard = RequestGuard::new(engine.clone(), registry.clone(), target.clone(), request_id);
    let mut stats = FetchStats::default();

    // 过滤器安装不参与取消竞争，装上的过滤器一定被登记
    let outcome = match engine.resolve_filters(&[target.id().to_string()]).await {
        Ok(resolved) => {
            guard.ephemeral = resolved.ephemeral;
            tokio::select! {
                _ = token.cancelled() => Err(SyncError::Cancelled),
                result = fetch_target(&engine, &registry, &target, &resolved.filters, &mut stats) => result,
            }
        }
        Err(e) => Err(e),
    };

    let result = match outcome {
        Ok(found) => {
            registry.set_state(
                &target,
                if found.is_some() {
                    RequestState::Found
                } else {
                    RequestState::NotFound
                },
            );
            FetchResult {
                target: target.clone(),
                found,
                error: None,
                stats,
            }
        }
        Err(e) => {
            warn!("拉取目标失败: target={}, error={}", target, e);
            registry.set_state(&target, RequestState::Error);
            FetchResult {
                target: target.clone(),
                found: None,
                error: Some(e),
                stats,
            }
        }
    };

    if result.is_found() {
        engine
            .events()
            .emit(event_builders::target_found(target.clone()))
            .await;
    }

    let ephemeral = guard.finish(result);

    // 网络调用放在登记表锁之外
    engine.release_filters(&ephemeral).await;
}

async fn fetch_target(
    engine: &HistorySyncEngine,
    registry: &RequestRegistry,
    target: &FetchTarget,
    filters: &[Filter],
    stats: &mut FetchStats,
) -> Result<Option<bytes::Bytes>> {
    let peer = engine.wait_for_store_node().await?;
    registry.set_state(target, RequestState::Fetching);
    info!("开始拉取目标: target={}, peer={}", target, peer);

    let store = engine.store().clone();
    let wanted = target.clone();
    let should_continue: ContinuePredicate = Arc::new(move |_| !store.has_target(&wanted));

    engine
        .sync_filters(
            &peer,
            filters,
            engine.config().target_page_size,
            Some(&should_continue),
            stats,
        )
        .await?;

    engine.store().load_target(target).await
}
