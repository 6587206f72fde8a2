//! 分页拉取
//!
//! 对一个批次：content topic 按每请求上限切块，每块先发无游标请求，
//! 再用上一页返回的游标继续，直到游标为空或调用方的谓词要求停止。
//! 任意一页失败立即中止整个批次；已经拉到的消息不回滚，但调用方不能为该批次写同步状态。

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::transport::{PageQuery, Transport};
use crate::types::{Batch, FetchStats, StoreNodePeer};

/// 是否继续拉下一页；参数是本次运行累计的信封数
pub type ContinuePredicate = Arc<dyn Fn(usize) -> bool + Send + Sync>;

/// 一次运行的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRunStatus {
    /// 所有块的游标都已耗尽
    Exhausted,
    /// 谓词要求提前停止
    StoppedEarly,
}

/// 分页拉取器
pub struct PageFetcher {
    transport: Arc<dyn Transport>,
    max_topics_per_request: usize,
}

impl PageFetcher {
    pub fn new(transport: Arc<dyn Transport>, max_topics_per_request: usize) -> Self {
        Self {
            transport,
            max_topics_per_request: max_topics_per_request.max(1),
        }
    }

    /// 执行一个批次
    ///
    /// `stats` 是累加器：失败时已完成的页也计入其中。
    /// 批次上的 `cursor` 只作为第一块的续传起点。
    pub async fn run(
        &self,
        peer: &StoreNodePeer,
        batch: &Batch,
        page_limit: u32,
        should_continue: Option<&ContinuePredicate>,
        stats: &mut FetchStats,
    ) -> Result<PageRunStatus> {
        let mut envelopes_so_far = 0usize;
        let mut resume_cursor = batch.cursor.clone().filter(|c| !c.is_empty());

        for (chunk_index, chunk) in batch.content_topics.chunks(self.max_topics_per_request).enumerate() {
            let mut cursor = resume_cursor.take();
            loop {
                let query = PageQuery {
                    pubsub_topic: batch.pubsub_topic.clone(),
                    content_topics: chunk.to_vec(),
                    from: batch.from,
                    to: batch.to,
                    cursor: cursor.clone(),
                    page_size: page_limit,
                };

                let response = match self.transport.request_page(peer, query).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(
                            "拉取历史页失败: peer={}, pubsub={}, chunk={}, error={}",
                            peer, batch.pubsub_topic, chunk_index, e
                        );
                        return Err(e);
                    }
                };

                stats.pages += 1;
                stats.envelopes += response.envelopes;
                envelopes_so_far += response.envelopes;
                debug!(
                    "已拉取历史页: peer={}, chunk={}, envelopes={}, has_more={}",
                    peer,
                    chunk_index,
                    response.envelopes,
                    response.has_more()
                );

                if !response.has_more() {
                    break;
                }
                if let Some(predicate) = should_continue {
                    if !predicate(envelopes_so_far) {
                        debug!("谓词要求停止分页: envelopes_so_far={}", envelopes_so_far);
                        return Ok(PageRunStatus::StoppedEarly);
                    }
                }
                cursor = response.cursor;
            }
        }

        Ok(PageRunStatus::Exhausted)
    }
}
