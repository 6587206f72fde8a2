//! 时间线 gap 跟踪
//!
//! 每个批次完成后，根据聊天已有的 `synced_to` 判断时间线是否出现空洞：
//! - `synced_to == 0`：第一次同步，无 gap
//! - `synced_to >= batch_from`：新窗口与已有覆盖相接或重叠，无 gap
//! - 否则 `[synced_to, batch_from)` 是 gap，插入一条 gap 消息
//!
//! gap 不会被静默关闭，直到 `fill_gaps` 成功拉取该区间后删除。

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::storage::SyncStore;
use crate::types::{ChatSyncRecord, GapMessage};

/// 一次对账的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapReconciliation {
    pub record: ChatSyncRecord,
    pub gap: Option<GapMessage>,
}

/// gap 消息 ID：同一聊天同一区间得到同一个 ID，重复对账不会产生重复标记
pub fn gap_message_id(chat_id: &str, from: u64, to: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chat_id.as_bytes());
    hasher.update(from.to_be_bytes());
    hasher.update(to.to_be_bytes());
    format!("gap-{}", hex::encode(hasher.finalize()))
}

/// gap 消息在时间线里的时钟值（毫秒）
pub fn gap_clock(batch_from: u64) -> u64 {
    batch_from.saturating_mul(1000)
}

/// 纯计算：批次 [batch_from, batch_to) 完成后聊天的新同步标记与可能的 gap
pub fn reconcile_after_batch(
    record: &ChatSyncRecord,
    batch_from: u64,
    batch_to: u64,
) -> GapReconciliation {
    let synced_from = if record.synced_from == 0 {
        batch_from
    } else {
        record.synced_from.min(batch_from)
    };

    let mut updated = ChatSyncRecord {
        synced_from,
        ..record.clone()
    };

    if record.synced_to == 0 {
        updated.synced_to = batch_to;
        return GapReconciliation { record: updated, gap: None };
    }

    if record.synced_to >= batch_from {
        updated.synced_to = record.synced_to.max(batch_to);
        return GapReconciliation { record: updated, gap: None };
    }

    let gap = GapMessage {
        id: gap_message_id(&record.chat_id, record.synced_to, batch_from),
        chat_id: record.chat_id.clone(),
        from: record.synced_to,
        to: batch_from,
        clock: gap_clock(batch_from),
    };
    updated.synced_to = record.synced_to.max(batch_to);
    GapReconciliation {
        record: updated,
        gap: Some(gap),
    }
}

/// 待补齐的 gap 区间
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapFillRange {
    pub gaps: Vec<GapMessage>,
    pub from: u64,
    pub to: u64,
}

impl GapFillRange {
    pub fn gap_ids(&self) -> Vec<String> {
        self.gaps.iter().map(|g| g.id.clone()).collect()
    }
}

/// gap 跟踪器：把对账结果写入持久层
pub struct GapTracker {
    store: Arc<dyn SyncStore>,
}

impl GapTracker {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// 批次完成后对账并持久化
    pub async fn reconcile(
        &self,
        chat_id: &str,
        batch_from: u64,
        batch_to: u64,
    ) -> Result<GapReconciliation> {
        let record = self
            .store
            .chat_sync_record(chat_id)
            .await?
            .unwrap_or_else(|| ChatSyncRecord::new(chat_id));

        let result = reconcile_after_batch(&record, batch_from, batch_to);

        if let Some(gap) = &result.gap {
            info!(
                "检测到时间线 gap: chat_id={}, from={}, to={}",
                chat_id, gap.from, gap.to
            );
            self.store.persist_messages(std::slice::from_ref(gap)).await?;
        }

        if result.record.synced_from != record.synced_from
            || result.record.synced_to != record.synced_to
        {
            self.store
                .set_chat_sync_markers(chat_id, result.record.synced_from, result.record.synced_to)
                .await?;
            debug!(
                "更新聊天同步标记: chat_id={}, synced_from={}, synced_to={}",
                chat_id, result.record.synced_from, result.record.synced_to
            );
        }

        Ok(result)
    }

    /// 读取要补齐的 gap，并算出覆盖它们的最小区间
    ///
    /// 空列表或没有一个 id 属于该聊天时直接返回校验错误，不做任何网络请求。
    pub async fn fill_range(&self, chat_id: &str, gap_ids: &[String]) -> Result<GapFillRange> {
        if gap_ids.is_empty() {
            return Err(SyncError::InvalidArgument("gap 列表不能为空".to_string()));
        }

        let gaps = self.store.gap_messages(chat_id, gap_ids).await?;
        let from = gaps.iter().map(|g| g.from).min();
        let to = gaps.iter().map(|g| g.to).max();
        match (from, to) {
            (Some(from), Some(to)) => Ok(GapFillRange { gaps, from, to }),
            _ => Err(SyncError::NotFound(format!(
                "聊天 {} 中没有找到指定的 gap 消息",
                chat_id
            ))),
        }
    }

    /// 补齐成功后删除 gap 标记
    pub async fn remove_gaps(&self, range: &GapFillRange) -> Result<Vec<String>> {
        let ids = range.gap_ids();
        self.store.delete_messages(&ids).await?;
        info!("已删除 {} 条 gap 标记", ids.len());
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySyncStore;

    fn record(synced_from: u64, synced_to: u64) -> ChatSyncRecord {
        ChatSyncRecord {
            chat_id: "chat-1".into(),
            synced_from,
            synced_to,
            read_messages_at: 0,
        }
    }

    #[test]
    fn test_first_sync_has_no_gap() {
        let result = reconcile_after_batch(&record(0, 0), 50, 150);
        assert!(result.gap.is_none());
        assert_eq!(result.record.synced_from, 50);
        assert_eq!(result.record.synced_to, 150);
    }

    #[test]
    fn test_overlap_extends_synced_to() {
        let result = reconcile_after_batch(&record(10, 100), 50, 180);
        assert!(result.gap.is_none());
        assert_eq!(result.record.synced_to, 180);
        assert_eq!(result.record.synced_from, 10);

        // 较旧的批次不会让 synced_to 回退
        let result = reconcile_after_batch(&record(10, 100), 50, 80);
        assert_eq!(result.record.synced_to, 100);
    }

    #[test]
    fn test_hole_creates_gap_message() {
        let result = reconcile_after_batch(&record(10, 50), 100, 200);
        let gap = result.gap.expect("gap expected");
        assert_eq!((gap.from, gap.to), (50, 100));
        assert_eq!(gap.clock, 100_000);
        assert_eq!(gap.chat_id, "chat-1");
        assert_eq!(result.record.synced_to, 200);
    }

    #[test]
    fn test_synced_from_only_decreases() {
        let result = reconcile_after_batch(&record(40, 100), 60, 120);
        assert_eq!(result.record.synced_from, 40);
        let result = reconcile_after_batch(&record(40, 100), 20, 120);
        assert_eq!(result.record.synced_from, 20);
    }

    #[test]
    fn test_gap_id_is_deterministic() {
        assert_eq!(gap_message_id("a", 1, 2), gap_message_id("a", 1, 2));
        assert_ne!(gap_message_id("a", 1, 2), gap_message_id("a", 1, 3));
        assert_ne!(gap_message_id("a", 1, 2), gap_message_id("b", 1, 2));
    }

    #[tokio::test]
    async fn test_reconcile_persists_gap_and_markers() {
        let store = Arc::new(MemorySyncStore::new());
        store.upsert_chat(record(10, 50));
        let tracker = GapTracker::new(store.clone());

        let result = tracker.reconcile("chat-1", 100, 200).await.unwrap();
        assert!(result.gap.is_some());

        let persisted = store.chat_sync_record("chat-1").await.unwrap().unwrap();
        assert_eq!((persisted.synced_from, persisted.synced_to), (10, 200));
        assert_eq!(store.chat_gaps("chat-1").len(), 1);

        // 再次对账同一区间：已覆盖，不会产生新的 gap
        let again = tracker.reconcile("chat-1", 100, 200).await.unwrap();
        assert!(again.gap.is_none());
        assert_eq!(store.chat_gaps("chat-1").len(), 1);
    }

    #[tokio::test]
    async fn test_fill_range_validation() {
        let store = Arc::new(MemorySyncStore::new());
        let tracker = GapTracker::new(store.clone());

        let err = tracker.fill_range("chat-1", &[]).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));

        let err = tracker
            .fill_range("chat-1", &["nope".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fill_range_spans_all_gaps() {
        let store = Arc::new(MemorySyncStore::new());
        let gaps = vec![
            GapMessage { id: "g1".into(), chat_id: "chat-1".into(), from: 30, to: 60, clock: 60_000 },
            GapMessage { id: "g2".into(), chat_id: "chat-1".into(), from: 100, to: 140, clock: 140_000 },
        ];
        store.persist_messages(&gaps).await.unwrap();
        let tracker = GapTracker::new(store.clone());

        let ids = vec!["g1".to_string(), "g2".to_string()];
        let range = tracker.fill_range("chat-1", &ids).await.unwrap();
        assert_eq!((range.from, range.to), (30, 140));

        let removed = tracker.remove_gaps(&range).await.unwrap();
        assert_eq!(removed, ids);
        assert!(store.chat_gaps("chat-1").is_empty());
    }
}
