//! 时间工具
//!
//! 同步簿记里的时间统一使用 UTC unix 秒；gap 消息的时钟值使用毫秒。

use chrono::{TimeZone, Utc};
use std::sync::Arc;

/// 可注入的时间源（测试里固定 "now"）
pub type TimeSource = Arc<dyn Fn() -> u64 + Send + Sync>;

/// 当前 UTC unix 秒
pub fn now_unix_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// 系统时间源
pub fn system_time_source() -> TimeSource {
    Arc::new(now_unix_secs)
}

/// 固定时间源
pub fn fixed_time_source(now: u64) -> TimeSource {
    Arc::new(move || now)
}

/// 日志用：unix 秒格式化为 ISO 8601
pub fn format_unix_secs(secs: u64) -> String {
    match Utc.timestamp_opt(secs as i64, 0).single() {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        None => secs.to_string(),
    }
}
