//! 历史同步模块
//!
//! - `batch_planner`：过滤器 → 分层、按窗口切分的批次
//! - `page_fetcher`：单批次的分页拉取
//! - `gap_tracker`：时间线 gap 的插入与补齐
//! - `request` / `coordinator`：按目标去重的请求登记与扇出
//! - `engine`：把以上串成完整的同步流程

pub mod batch_planner;
pub mod coordinator;
pub mod engine;
pub mod gap_tracker;
pub mod page_fetcher;
pub mod request;
pub mod task;

pub use batch_planner::{split_into_windows, BatchPlan, BatchPlanner, PlannedBatch, SyncTier};
pub use coordinator::RequestCoordinator;
pub use engine::{HistorySyncEngine, ResolvedFilters, SyncOutcome};
pub use gap_tracker::{gap_message_id, reconcile_after_batch, GapFillRange, GapReconciliation, GapTracker};
pub use page_fetcher::{ContinuePredicate, PageFetcher, PageRunStatus};
pub use request::{wait_all, FetchHandle, RequestInfo, RequestRegistry, RequestState};
pub use task::SyncTask;
