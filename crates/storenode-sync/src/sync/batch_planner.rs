//! 批次规划器
//!
//! 把一组过滤器 + 当前的 topic 同步状态，转换成有序的、按时间窗口切分的拉取批次：
//!
//! 1. 按 (pubsub topic, content topic) 归并过滤器，同一 content topic 只出现在一个批次里
//! 2. 按优先级降序排列，前几个有优先级的 topic 依次放进容量为 {1, 5, 10} 的小分层，
//!    其余（包括所有优先级为 0 的）按各自的最后请求时间归入默认层
//! 3. 每个批次计算 `from`（不早于 "now - 默认同步周期"，并减去容差）和 `to`（now）
//! 4. 每个批次再按 24 小时窗口从新到旧切分
//!
//! 规划是纯计算：优先级以临时映射传入，不修改共享的 `Filter`。

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::config::HistorySyncConfig;
use crate::types::{Batch, ContentTopic, Filter, TopicSyncState};
use crate::utils::format_unix_secs;

/// 批次所在的分层
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncTier {
    /// 优先级分层，序号从 0 开始
    Priority(usize),
    /// 默认层（批量 / 后台 topic）
    Default,
}

/// 规划出来的一个批次：完整区间 + 从新到旧的窗口
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBatch {
    pub tier: SyncTier,
    pub batch: Batch,
    pub windows: Vec<Batch>,
}

impl PlannedBatch {
    /// 批次成功后要写入的 topic 同步状态（last_request = to）
    pub fn topic_updates(&self) -> Vec<TopicSyncState> {
        self.batch
            .content_topics
            .iter()
            .map(|content_topic| TopicSyncState {
                pubsub_topic: self.batch.pubsub_topic.clone(),
                content_topic: content_topic.clone(),
                last_request: self.batch.to,
            })
            .collect()
    }
}

/// 规划结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    pub batches: Vec<PlannedBatch>,
    /// 全部批次成功后的 topic 同步状态
    pub topic_updates: Vec<TopicSyncState>,
}

impl BatchPlan {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// 窗口总数（即实际请求批次数）
    pub fn window_count(&self) -> usize {
        self.batches.iter().map(|b| b.windows.len()).sum()
    }
}

/// 按 content topic 归并后的条目
#[derive(Debug, Clone)]
struct TopicEntry {
    pubsub_topic: String,
    content_topic: ContentTopic,
    chat_ids: BTreeSet<String>,
    priority: u64,
    last_request: Option<u64>,
}

/// 批次规划器
#[derive(Debug, Clone)]
pub struct BatchPlanner {
    config: HistorySyncConfig,
}

impl BatchPlanner {
    pub fn new(config: HistorySyncConfig) -> Self {
        Self { config }
    }

    /// "now - 默认同步周期"
    fn default_start(&self, now: u64) -> u64 {
        now.saturating_sub(self.config.default_sync_period_secs)
    }

    /// 计算批次的起点
    ///
    /// 最后请求时间晚于默认起点时原样尊重（减去容差重新拉边界），否则截到默认起点。
    pub fn compute_from(&self, last_request: Option<u64>, now: u64) -> u64 {
        let default_start = self.default_start(now);
        match last_request {
            Some(last) if last > default_start => last.saturating_sub(self.config.tolerance_secs),
            _ => default_start,
        }
    }

    /// 规划分层批次
    pub fn plan(
        &self,
        filters: &[Filter],
        priorities: &HashMap<String, u64>,
        topic_states: &[TopicSyncState],
        now: u64,
    ) -> BatchPlan {
        let last_requests: HashMap<(&str, &ContentTopic), u64> = topic_states
            .iter()
            .map(|s| ((s.pubsub_topic.as_str(), &s.content_topic), s.last_request))
            .collect();

        // 1. 归并到 content topic（在副本上排序，不动调用方的过滤器）
        let mut entries: Vec<TopicEntry> = Vec::new();
        let mut index: HashMap<(String, ContentTopic), usize> = HashMap::new();
        for filter in filters {
            let priority = priorities
                .get(&filter.chat_id)
                .copied()
                .or(filter.priority)
                .unwrap_or(0);
            let key = (filter.pubsub_topic.clone(), filter.content_topic.clone());
            match index.get(&key) {
                Some(&i) => {
                    let entry = &mut entries[i];
                    entry.chat_ids.insert(filter.chat_id.clone());
                    entry.priority = entry.priority.max(priority);
                }
                None => {
                    let last_request = last_requests
                        .get(&(filter.pubsub_topic.as_str(), &filter.content_topic))
                        .copied();
                    index.insert(key, entries.len());
                    entries.push(TopicEntry {
                        pubsub_topic: filter.pubsub_topic.clone(),
                        content_topic: filter.content_topic.clone(),
                        chat_ids: BTreeSet::from([filter.chat_id.clone()]),
                        priority,
                        last_request,
                    });
                }
            }
        }

        // 2. 优先级降序；同优先级按 topic 排，保证结果稳定
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.pubsub_topic.cmp(&b.pubsub_topic))
                .then_with(|| a.content_topic.cmp(&b.content_topic))
        });

        let tiers = self.assign_tiers(entries);

        // 3. 每层按 pubsub topic（默认层再按最后请求时间）生成批次
        let mut plan = BatchPlan::default();
        for (tier, tier_entries) in tiers {
            for group in group_entries(tier, tier_entries) {
                let last_request = group
                    .iter()
                    .map(|e| e.last_request)
                    .min()
                    .flatten();
                let from = self.compute_from(last_request, now);
                let to = now;
                if from >= to {
                    debug!("跳过空区间批次: tier={:?}, from={}, to={}", tier, from, to);
                    continue;
                }

                let mut chat_ids = BTreeSet::new();
                for entry in &group {
                    chat_ids.extend(entry.chat_ids.iter().cloned());
                }
                let batch = Batch {
                    pubsub_topic: group[0].pubsub_topic.clone(),
                    content_topics: group.iter().map(|e| e.content_topic.clone()).collect(),
                    chat_ids: chat_ids.into_iter().collect(),
                    from,
                    to,
                    cursor: None,
                };
                let windows = split_into_windows(&batch, self.config.window_secs);
                debug!(
                    "规划批次: tier={:?}, pubsub={}, topics={}, from={}, to={}, windows={}",
                    tier,
                    batch.pubsub_topic,
                    batch.content_topics.len(),
                    format_unix_secs(from),
                    format_unix_secs(to),
                    windows.len()
                );
                let planned = PlannedBatch { tier, batch, windows };
                plan.topic_updates.extend(planned.topic_updates());
                plan.batches.push(planned);
            }
        }

        plan
    }

    /// 显式区间的单批次规划（补 gap 用，不分层）
    pub fn explicit(&self, filters: &[Filter], from: u64, to: u64) -> Vec<Batch> {
        let mut batches: Vec<Batch> = Vec::new();
        for filter in filters {
            match batches.iter_mut().find(|b| b.pubsub_topic == filter.pubsub_topic) {
                Some(batch) => {
                    if !batch.content_topics.contains(&filter.content_topic) {
                        batch.content_topics.push(filter.content_topic.clone());
                    }
                    if !batch.chat_ids.contains(&filter.chat_id) {
                        batch.chat_ids.push(filter.chat_id.clone());
                    }
                }
                None => batches.push(Batch {
                    pubsub_topic: filter.pubsub_topic.clone(),
                    content_topics: vec![filter.content_topic.clone()],
                    chat_ids: vec![filter.chat_id.clone()],
                    from,
                    to,
                    cursor: None,
                }),
            }
        }
        batches
    }

    /// 把排好序的条目放进分层：有优先级的依次填满各小分层，其余进默认层
    fn assign_tiers(&self, entries: Vec<TopicEntry>) -> Vec<(SyncTier, Vec<TopicEntry>)> {
        let capacities = &self.config.tier_capacities;
        let mut tiers: Vec<(SyncTier, Vec<TopicEntry>)> = capacities
            .iter()
            .enumerate()
            .map(|(i, _)| (SyncTier::Priority(i), Vec::new()))
            .collect();
        let mut default_tier = Vec::new();

        let mut current = 0;
        for entry in entries {
            if entry.priority == 0 {
                default_tier.push(entry);
                continue;
            }
            while current < capacities.len() && tiers[current].1.len() >= capacities[current] {
                current += 1;
            }
            if current < capacities.len() {
                tiers[current].1.push(entry);
            } else {
                default_tier.push(entry);
            }
        }

        tiers.retain(|(_, entries)| !entries.is_empty());
        if !default_tier.is_empty() {
            tiers.push((SyncTier::Default, default_tier));
        }
        tiers
    }
}

/// 层内分组：按 pubsub topic；默认层还要按最后请求时间分开
fn group_entries(tier: SyncTier, entries: Vec<TopicEntry>) -> Vec<Vec<TopicEntry>> {
    let mut groups: Vec<(String, Option<u64>, Vec<TopicEntry>)> = Vec::new();
    for entry in entries {
        let key_last = match tier {
            SyncTier::Default => entry.last_request,
            SyncTier::Priority(_) => None,
        };
        match groups
            .iter_mut()
            .find(|(pubsub, last, _)| *pubsub == entry.pubsub_topic && *last == key_last)
        {
            Some((_, _, group)) => group.push(entry),
            None => groups.push((entry.pubsub_topic.clone(), key_last, vec![entry])),
        }
    }
    groups.into_iter().map(|(_, _, group)| group).collect()
}

/// 把 [from, to) 从新到旧切成连续的窗口
pub fn split_into_windows(batch: &Batch, window_secs: u64) -> Vec<Batch> {
    let mut windows = Vec::new();
    if window_secs == 0 || batch.from >= batch.to {
        return windows;
    }
    let mut end = batch.to;
    while end > batch.from {
        let start = end.saturating_sub(window_secs).max(batch.from);
        windows.push(Batch {
            from: start,
            to: end,
            cursor: None,
            ..batch.clone()
        });
        end = start;
    }
    windows
}
