//! # Reporting Module / 报告模块
//!
//! Reporters observe the lifecycle event stream and the final report. The
//! console reporter prints colorful, localized progress and summaries; the
//! JSON reporter writes the report to disk for CI and shard merging.
//!
//! 报告器观察生命周期事件流和最终报告。控制台报告器打印彩色的本地化进度和摘要；
//! JSON 报告器将报告写入磁盘，供 CI 和分片合并使用。

pub mod console;
pub mod json;

pub use console::{ConsoleReporter, print_failure_details, print_summary};
pub use json::{JsonReporter, read_report, write_report};
