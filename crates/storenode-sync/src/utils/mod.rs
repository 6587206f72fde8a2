pub mod time;

pub use time::{fixed_time_source, format_unix_secs, now_unix_secs, system_time_source, TimeSource};
