//! 后台同步任务句柄
//!
//! 可以等待结果、取消，也可以查询是否已结束。句柄被丢弃时若任务未结束会自动取消。

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, SyncError};

pub struct SyncTask<T> {
    handle: Option<JoinHandle<Result<T>>>,
    token: CancellationToken,
}

impl<T> SyncTask<T> {
    pub(crate) fn new(handle: JoinHandle<Result<T>>, token: CancellationToken) -> Self {
        Self {
            handle: Some(handle),
            token,
        }
    }

    /// 取消任务
    pub fn cancel(&self) {
        debug!("取消同步任务");
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    /// 等待任务结束
    pub async fn join(mut self) -> Result<T> {
        let Some(handle) = self.handle.take() else {
            return Err(SyncError::Cancelled);
        };
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                debug!("同步任务异常结束: {}", e);
                Err(SyncError::Cancelled)
            }
        }
    }
}

impl<T> Drop for SyncTask<T> {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            if !handle.is_finished() {
                debug!("句柄丢弃，自动取消同步任务");
                self.token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spawn_sleeper(token: CancellationToken) -> JoinHandle<Result<u32>> {
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Err(SyncError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(1),
            }
        })
    }

    #[tokio::test]
    async fn test_cancel_then_join() {
        let token = CancellationToken::new();
        let task = SyncTask::new(spawn_sleeper(token.clone()), token);
        assert!(!task.is_finished());

        task.cancel();
        assert_eq!(task.join().await, Err(SyncError::Cancelled));
    }

    #[tokio::test]
    async fn test_join_returns_value() {
        let token = CancellationToken::new();
        let task = SyncTask::new(tokio::spawn(async { Ok(7u32) }), token);
        assert_eq!(task.join().await, Ok(7));
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let token = CancellationToken::new();
        let task = SyncTask::new(spawn_sleeper(token.clone()), token.clone());
        drop(task);
        assert!(token.is_cancelled());
    }
}
