//! 进行中的 store node 请求登记表
//!
//! 每个拉取目标同一时刻最多只有一个请求。"查找或创建" 与 "完成并移除" 在同一把锁里进行，
//! 所以在完成前登记的订阅者一定会收到结果，完成后的新调用一定会发起新请求。
//! 锁内只做簿记，不做任何网络调用。

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::types::{FetchResult, FetchStats, FetchTarget};

/// 请求状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// 已登记，正在解析过滤器
    Pending,
    /// 正在拉取批次
    Fetching,
    Found,
    NotFound,
    Error,
    /// 订阅者已通知，登记已移除
    Finalized,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Found | RequestState::NotFound | RequestState::Error | RequestState::Finalized
        )
    }
}

/// 对外可见的请求快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub request_id: String,
    pub target: FetchTarget,
    pub state: RequestState,
    pub subscribers: usize,
}

struct StoreNodeRequest {
    id: String,
    state: RequestState,
    subscribers: Vec<oneshot::Sender<FetchResult>>,
    created_at: Instant,
}

/// 订阅句柄：等待某个目标的唯一结果
#[derive(Debug)]
pub struct FetchHandle {
    target: FetchTarget,
    request_id: String,
    receiver: oneshot::Receiver<FetchResult>,
}

impl FetchHandle {
    /// 直接带着结果的句柄（例如已关闭时）
    pub(crate) fn ready(result: FetchResult) -> Self {
        let (sender, receiver) = oneshot::channel();
        let target = result.target.clone();
        let _ = sender.send(result);
        Self {
            target,
            request_id: String::new(),
            receiver,
        }
    }

    pub fn target(&self) -> &FetchTarget {
        &self.target
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// 等待结果
    ///
    /// 请求任务在通知之前消失（例如 panic）时，返回 `Cancelled`，不会一直挂起。
    pub async fn wait(self) -> FetchResult {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => {
                warn!("请求在通知订阅者之前结束: target={}", self.target);
                FetchResult {
                    target: self.target,
                    found: None,
                    error: Some(SyncError::Cancelled),
                    stats: FetchStats::default(),
                }
            }
        }
    }

    /// 非阻塞地检查结果
    pub fn try_result(&mut self) -> Option<FetchResult> {
        self.receiver.try_recv().ok()
    }
}

/// 等待一组句柄，结果顺序与句柄顺序一致
pub async fn wait_all(handles: Vec<FetchHandle>) -> Vec<FetchResult> {
    futures::future::join_all(handles.into_iter().map(FetchHandle::wait)).await
}

/// 请求登记表
#[derive(Default)]
pub struct RequestRegistry {
    requests: Mutex<HashMap<FetchTarget, StoreNodeRequest>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅已有请求，或创建新请求
    ///
    /// 返回订阅句柄；新建时第二个值为 `true`，调用方负责启动拉取任务。
    pub fn subscribe_or_create(&self, target: &FetchTarget) -> (FetchHandle, bool) {
        let (sender, receiver) = oneshot::channel();
        let mut requests = self.requests.lock();

        if let Some(request) = requests.get_mut(target) {
            request.subscribers.push(sender);
            debug!(
                "加入进行中的请求: target={}, request_id={}, subscribers={}",
                target,
                request.id,
                request.subscribers.len()
            );
            let handle = FetchHandle {
                target: target.clone(),
                request_id: request.id.clone(),
                receiver,
            };
            return (handle, false);
        }

        let id = Uuid::new_v4().to_string();
        requests.insert(
            target.clone(),
            StoreNodeRequest {
                id: id.clone(),
                state: RequestState::Pending,
                subscribers: vec![sender],
                created_at: Instant::now(),
            },
        );
        debug!("创建新请求: target={}, request_id={}", target, id);

        let handle = FetchHandle {
            target: target.clone(),
            request_id: id,
            receiver,
        };
        (handle, true)
    }

    pub fn set_state(&self, target: &FetchTarget, state: RequestState) {
        if let Some(request) = self.requests.lock().get_mut(target) {
            debug!("请求状态变更: target={}, {:?} -> {:?}", target, request.state, state);
            request.state = state;
        }
    }

    pub fn state(&self, target: &FetchTarget) -> Option<RequestState> {
        self.requests.lock().get(target).map(|r| r.state)
    }

    /// 完成请求：在同一把锁里移除登记并把同一个结果发给所有订阅者
    ///
    /// 返回收到结果的订阅者数量。
    pub fn finalize(&self, request_id: &str, result: FetchResult) -> usize {
        let mut requests = self.requests.lock();
        let matches = requests
            .get(&result.target)
            .map(|r| r.id == request_id)
            .unwrap_or(false);
        if !matches {
            warn!(
                "完成请求时找不到登记: target={}, request_id={}",
                result.target, request_id
            );
            return 0;
        }

        let Some(request) = requests.remove(&result.target) else {
            return 0;
        };
        let total = request.subscribers.len();
        let mut delivered = 0;
        for subscriber in request.subscribers {
            // 订阅者可能已放弃等待
            if subscriber.send(result.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(
            "请求已完成: target={}, request_id={}, delivered={}/{}, elapsed={:?}",
            result.target,
            request.id,
            delivered,
            total,
            request.created_at.elapsed()
        );
        delivered
    }

    pub fn snapshot(&self) -> Vec<RequestInfo> {
        self.requests
            .lock()
            .iter()
            .map(|(target, request)| RequestInfo {
                request_id: request.id.clone(),
                target: target.clone(),
                state: request.state,
                subscribers: request.subscribers.len(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn target() -> FetchTarget {
        FetchTarget::Community("c1".into())
    }

    fn result(found: Option<&'static [u8]>) -> FetchResult {
        FetchResult {
            target: target(),
            found: found.map(Bytes::from_static),
            error: None,
            stats: FetchStats { envelopes: 3, pages: 1 },
        }
    }

    #[tokio::test]
    async fn test_second_subscriber_joins_existing_request() {
        let registry = RequestRegistry::new();
        let (first, created_first) = registry.subscribe_or_create(&target());
        let (second, created_second) = registry.subscribe_or_create(&target());

        assert!(created_first);
        assert!(!created_second);
        assert_eq!(first.request_id(), second.request_id());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot()[0].subscribers, 2);

        let delivered = registry.finalize(first.request_id(), result(Some(b"data")));
        assert_eq!(delivered, 2);
        assert!(registry.is_empty());

        let a = first.wait().await;
        let b = second.wait().await;
        assert_eq!(a, b);
        assert!(a.is_found());
    }

    #[tokio::test]
    async fn test_after_finalize_new_request_is_created() {
        let registry = RequestRegistry::new();
        let (handle, _) = registry.subscribe_or_create(&target());
        registry.finalize(handle.request_id(), result(None));

        let (next, created) = registry.subscribe_or_create(&target());
        assert!(created);
        assert_ne!(next.request_id(), handle.request_id());
    }

    #[test]
    fn test_finalize_with_stale_id_is_ignored() {
        let registry = RequestRegistry::new();
        let (_handle, _) = registry.subscribe_or_create(&target());
        assert_eq!(registry.finalize("stale", result(None)), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_state_transitions() {
        let registry = RequestRegistry::new();
        let (_handle, _) = registry.subscribe_or_create(&target());
        assert_eq!(registry.state(&target()), Some(RequestState::Pending));
        registry.set_state(&target(), RequestState::Fetching);
        assert_eq!(registry.state(&target()), Some(RequestState::Fetching));
        assert!(!RequestState::Fetching.is_terminal());
        assert!(RequestState::NotFound.is_terminal());
    }

    #[tokio::test]
    async fn test_dropped_sender_yields_cancelled() {
        let registry = RequestRegistry::new();
        let (handle, _) = registry.subscribe_or_create(&target());
        drop(registry);

        let result = handle.wait().await;
        assert_eq!(result.error, Some(SyncError::Cancelled));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_block_others() {
        let registry = RequestRegistry::new();
        let (first, _) = registry.subscribe_or_create(&target());
        let (second, _) = registry.subscribe_or_create(&target());
        let request_id = first.request_id().to_string();
        drop(first);

        assert_eq!(registry.finalize(&request_id, result(None)), 1);
        assert!(second.wait().await.error.is_none());
    }
}
