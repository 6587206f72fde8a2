//! 历史同步配置
//!
//! 所有时间单位都是秒，除了 `store_node_wait_timeout_ms`。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// 一天（秒）
pub const ONE_DAY_SECS: u64 = 24 * 60 * 60;
/// 一个月（秒），默认同步周期
pub const ONE_MONTH_SECS: u64 = 31 * ONE_DAY_SECS;

/// 历史同步配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistorySyncConfig {
    /// 从未同步过的 topic 向前回溯多久
    pub default_sync_period_secs: u64,
    /// 重新拉取边界的容差，防止乱序消息漏掉
    pub tolerance_secs: u64,
    /// 每个请求窗口的跨度（默认 24 小时）
    pub window_secs: u64,
    /// 单次请求最多携带多少个 content topic
    pub max_topics_per_request: usize,
    /// 优先级分层容量，按顺序填充
    pub tier_capacities: Vec<usize>,
    /// 普通同步的分页大小
    pub default_page_size: u32,
    /// 单目标拉取（社区 / 联系人）的分页大小
    pub target_page_size: u32,
    /// 等待 store node 可用的超时（毫秒）
    pub store_node_wait_timeout_ms: u64,
    /// 事件广播容量
    pub event_capacity: usize,
}

impl Default for HistorySyncConfig {
    fn default() -> Self {
        Self {
            default_sync_period_secs: ONE_MONTH_SECS,
            tolerance_secs: 60,
            window_secs: ONE_DAY_SECS,
            max_topics_per_request: 10,
            tier_capacities: vec![1, 5, 10],
            default_page_size: 50,
            target_page_size: 4,
            store_node_wait_timeout_ms: 5_000,
            event_capacity: 100,
        }
    }
}

impl HistorySyncConfig {
    pub fn builder() -> HistorySyncConfigBuilder {
        HistorySyncConfigBuilder::new()
    }

    pub fn store_node_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.store_node_wait_timeout_ms)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.window_secs == 0 {
            return Err(SyncError::InvalidArgument("window_secs 不能为 0".to_string()));
        }
        if self.max_topics_per_request == 0 {
            return Err(SyncError::InvalidArgument(
                "max_topics_per_request 不能为 0".to_string(),
            ));
        }
        if self.default_page_size == 0 || self.target_page_size == 0 {
            return Err(SyncError::InvalidArgument("分页大小不能为 0".to_string()));
        }
        if self.tier_capacities.is_empty() || self.tier_capacities.contains(&0) {
            return Err(SyncError::InvalidArgument(
                "tier_capacities 不能为空且不能包含 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 配置构建器
pub struct HistorySyncConfigBuilder {
    config: HistorySyncConfig,
}

impl HistorySyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: HistorySyncConfig::default(),
        }
    }

    pub fn default_sync_period(mut self, period: Duration) -> Self {
        self.config.default_sync_period_secs = period.as_secs();
        self
    }

    pub fn tolerance(mut self, tolerance: Duration) -> Self {
        self.config.tolerance_secs = tolerance.as_secs();
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window_secs = window.as_secs();
        self
    }

    pub fn max_topics_per_request(mut self, max: usize) -> Self {
        self.config.max_topics_per_request = max;
        self
    }

    /// 设置优先级分层容量（按顺序填充）
    pub fn tier_capacities<I>(mut self, capacities: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        self.config.tier_capacities = capacities.into_iter().collect();
        self
    }

    pub fn default_page_size(mut self, size: u32) -> Self {
        self.config.default_page_size = size;
        self
    }

    pub fn target_page_size(mut self, size: u32) -> Self {
        self.config.target_page_size = size;
        self
    }

    pub fn store_node_wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.store_node_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn build(self) -> HistorySyncConfig {
        self.config
    }
}

impl Default for HistorySyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = HistorySyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tier_capacities, vec![1, 5, 10]);
        assert_eq!(config.store_node_wait_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_builder_overrides() {
        let config = HistorySyncConfig::builder()
            .window(Duration::from_secs(3600))
            .max_topics_per_request(3)
            .tier_capacities([2, 4])
            .store_node_wait_timeout(Duration::from_millis(250))
            .build();

        assert_eq!(config.window_secs, 3600);
        assert_eq!(config.max_topics_per_request, 3);
        assert_eq!(config.tier_capacities, vec![2, 4]);
        assert_eq!(config.store_node_wait_timeout_ms, 250);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = HistorySyncConfig::builder().window(Duration::ZERO).build();
        assert!(matches!(config.validate(), Err(SyncError::InvalidArgument(_))));

        let config = HistorySyncConfig::builder().tier_capacities(Vec::new()).build();
        assert!(config.validate().is_err());

        let config = HistorySyncConfig::builder().default_page_size(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = HistorySyncConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: HistorySyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
