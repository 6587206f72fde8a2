//! 同步生命周期事件
//!
//! - 历史请求开始 / 完成
//! - 目标已找到
//! - gap 插入 / 补齐

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::types::{FetchStats, FetchTarget, GapMessage};
use crate::utils::now_unix_secs;

/// 同步事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 历史请求开始，携带批次数
    HistoryRequestStarted {
        request_id: String,
        num_batches: usize,
        timestamp: u64,
    },
    /// 历史请求结束（成功或失败）
    HistoryRequestCompleted {
        request_id: String,
        stats: FetchStats,
        error: Option<String>,
        timestamp: u64,
    },
    /// 拉取目标已在本地解析出数据
    TargetFound {
        target: FetchTarget,
        timestamp: u64,
    },
    GapInserted {
        chat_id: String,
        gap: GapMessage,
        timestamp: u64,
    },
    GapsFilled {
        chat_id: String,
        gap_ids: Vec<String>,
        timestamp: u64,
    },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::HistoryRequestStarted { .. } => "history_request_started",
            SyncEvent::HistoryRequestCompleted { .. } => "history_request_completed",
            SyncEvent::TargetFound { .. } => "target_found",
            SyncEvent::GapInserted { .. } => "gap_inserted",
            SyncEvent::GapsFilled { .. } => "gaps_filled",
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            SyncEvent::HistoryRequestStarted { timestamp, .. } => *timestamp,
            SyncEvent::HistoryRequestCompleted { timestamp, .. } => *timestamp,
            SyncEvent::TargetFound { timestamp, .. } => *timestamp,
            SyncEvent::GapInserted { timestamp, .. } => *timestamp,
            SyncEvent::GapsFilled { timestamp, .. } => *timestamp,
        }
    }

    /// 事件关联的聊天 ID
    pub fn chat_id(&self) -> Option<&str> {
        match self {
            SyncEvent::GapInserted { chat_id, .. } => Some(chat_id),
            SyncEvent::GapsFilled { chat_id, .. } => Some(chat_id),
            _ => None,
        }
    }
}

/// 事件生成器
pub mod event_builders {
    use super::*;

    pub fn history_request_started(request_id: &str, num_batches: usize) -> SyncEvent {
        SyncEvent::HistoryRequestStarted {
            request_id: request_id.to_string(),
            num_batches,
            timestamp: now_unix_secs(),
        }
    }

    pub fn history_request_completed(
        request_id: &str,
        stats: FetchStats,
        error: Option<String>,
    ) -> SyncEvent {
        SyncEvent::HistoryRequestCompleted {
            request_id: request_id.to_string(),
            stats,
            error,
            timestamp: now_unix_secs(),
        }
    }

    pub fn target_found(target: FetchTarget) -> SyncEvent {
        SyncEvent::TargetFound {
            target,
            timestamp: now_unix_secs(),
        }
    }

    pub fn gap_inserted(gap: GapMessage) -> SyncEvent {
        SyncEvent::GapInserted {
            chat_id: gap.chat_id.clone(),
            gap,
            timestamp: now_unix_secs(),
        }
    }

    pub fn gaps_filled(chat_id: &str, gap_ids: Vec<String>) -> SyncEvent {
        SyncEvent::GapsFilled {
            chat_id: chat_id.to_string(),
            gap_ids,
            timestamp: now_unix_secs(),
        }
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<u64>,
}

/// 事件管理器
pub struct SyncEventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl SyncEventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        debug!("发布同步事件: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 没有订阅者时 send 失败属正常情况
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("同步事件无订阅者: {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 添加监听器，`"*"` 监听所有事件
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("已添加同步事件监听器: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();
        self.stats.write().await.listener_count = 0;
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
