//! # Grove Runner Library / Grove Runner 库
//!
//! This library provides a test orchestration engine: nested suites with
//! lifecycle hooks, bounded concurrency inside a unit, and a crash-tolerant
//! pool of isolated workers running whole units.
//!
//! 此库提供一个测试编排引擎：带生命周期钩子的嵌套测试套件、单元内有界并发，
//! 以及运行整个测试单元、可容忍崩溃的隔离 worker 池。
//!
//! ## Modules / 模块
//!
//! - `core` - Suite trees, the executor, the worker pool and result aggregation
//! - `infra` - Worker backends (threads and child processes)
//! - `reporting` - Console and JSON reporters
//! - `harness` - Entry point for `harness = false` test binaries
//! - `cli` - The companion command-line tool
//!
//! - `core` - 测试树、执行器、worker 池和结果聚合
//! - `infra` - worker 后端（线程和子进程）
//! - `reporting` - 控制台和 JSON 报告器
//! - `harness` - `harness = false` 测试二进制的入口
//! - `cli` - 配套命令行工具

pub mod cli;
pub mod commands;
pub mod core;
pub mod harness;
pub mod infra;
pub mod reporting;

pub use rust_i18n::t;

// Re-export commonly used items
pub use core::context::{Fixtures, TestContext};
pub use core::error::{Thrown, crash_worker};
pub use core::registry::SuiteRegistry;
pub use core::suite::SuiteBuilder;
pub use core::value::Value;

// Initialize i18n
rust_i18n::i18n!("locales", fallback = "en");

fn match_locale(locale: &str) -> String {
    let available_locales = rust_i18n::available_locales!();

    // Try to match the full locale first (e.g., "zh-CN")
    // Then try to match the language part only (e.g., "en" from "en-US")
    // Finally, fall back to "en"
    if available_locales.contains(&locale) {
        locale.to_string()
    } else {
        locale
            .split('-')
            .next()
            .filter(|lang_code| available_locales.contains(lang_code))
            .unwrap_or("en")
            .to_string()
    }
}

/// Picks the display language: an explicit `--lang <VALUE>` in `args`,
/// otherwise the system locale.
pub fn detect_language<S: AsRef<std::ffi::OsStr>>(args: &[S]) -> String {
    let explicit = args
        .iter()
        .position(|arg| arg.as_ref() == "--lang")
        .and_then(|pos| args.get(pos + 1))
        .and_then(|lang| lang.as_ref().to_str().map(str::to_string));
    match explicit {
        Some(lang) => lang,
        None => match_locale(&sys_locale::get_locale().unwrap_or_else(|| "en".to_string())),
    }
}

/// Initializes the application's internationalization (i18n) based on the system locale.
pub fn init() {
    let args: Vec<String> = std::env::args().collect();
    rust_i18n::set_locale(&detect_language(&args));
}
