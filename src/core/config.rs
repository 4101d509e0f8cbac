//! # Run Configuration / 运行配置
//!
//! Settings for one run, loaded from `Grove.toml` and overridden by harness
//! flags. Every field has a default, so an empty file is a valid config.
//!
//! 一次运行的设置，从 `Grove.toml` 加载，并可被 harness 命令行参数覆盖。
//! 每个字段都有默认值，因此空文件也是有效配置。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::models::UnitSettings;

/// File name looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "Grove.toml";

/// Where a worker executes its units.
/// worker 执行测试单元的位置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// A dedicated OS thread with its own runtime.
    /// 拥有独立运行时的专用操作系统线程。
    #[default]
    Thread,
    /// A child process running the same binary in worker mode.
    /// 以 worker 模式运行同一二进制文件的子进程。
    Process,
}

impl std::str::FromStr for Isolation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "thread" => Ok(Isolation::Thread),
            "process" => Ok(Isolation::Process),
            other => Err(format!("unknown isolation mode `{other}`, expected `thread` or `process`")),
        }
    }
}

/// The run configuration, as read from TOML.
/// 从 TOML 读取的运行配置。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// The language for console output (e.g., "en", "zh-CN").
    /// 控制台输出的语言（例如 "en", "zh-CN"）。
    #[serde(default = "default_language")]
    pub language: String,

    /// Number of workers; each runs one unit at a time.
    /// worker 数量；每个 worker 一次运行一个测试单元。
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// How many concurrent cases of one group may run at once.
    /// 同一分组中可同时运行的并发用例数量。
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Default deadline of tests and hooks, in milliseconds.
    /// 测试和钩子的默认截止时间（毫秒）。
    #[serde(default = "default_test_timeout_ms")]
    pub test_timeout_ms: u64,

    /// How many times a unit is retried after its worker crashed.
    /// 测试单元在 worker 崩溃后重试的次数。
    #[serde(default = "default_worker_retries")]
    pub worker_retries: u32,

    /// How long shutdown waits for in-flight units and exiting workers.
    /// 关闭时等待进行中的单元和退出中的 worker 的时长。
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default)]
    pub isolation: Isolation,

    /// Cancel the run once this many units have failed.
    /// 当失败的单元达到此数量时取消运行。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bail: Option<usize>,

    /// Exit successfully when no unit matched.
    /// 没有匹配的测试单元时以成功状态退出。
    #[serde(default)]
    pub pass_with_no_tests: bool,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_max_workers() -> usize {
    num_cpus::get() / 2 + 1
}

fn default_max_concurrency() -> usize {
    5
}

fn default_test_timeout_ms() -> u64 {
    5_000
}

fn default_worker_retries() -> u32 {
    2
}

fn default_shutdown_grace_ms() -> u64 {
    500
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            max_workers: default_max_workers(),
            max_concurrency: default_max_concurrency(),
            test_timeout_ms: default_test_timeout_ms(),
            worker_retries: default_worker_retries(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            isolation: Isolation::default(),
            bail: None,
            pass_with_no_tests: false,
        }
    }
}

/// Command-line values that take precedence over the file.
/// 优先于配置文件的命令行值。
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub language: Option<String>,
    pub max_workers: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub test_timeout_ms: Option<u64>,
    pub worker_retries: Option<u32>,
    pub isolation: Option<Isolation>,
    pub bail: Option<usize>,
    pub pass_with_no_tests: bool,
}

impl RunConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let config: RunConfig = toml::from_str(text).context("Failed to parse run config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Loads `explicit` if given, else `Grove.toml` from `dir` if it exists,
    /// else the defaults. Returns the path that was read, if any.
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }
        let candidate = dir.join(DEFAULT_CONFIG_FILE);
        if candidate.is_file() {
            Ok((Self::load(&candidate)?, Some(candidate)))
        } else {
            Ok((Self::default(), None))
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be at least 1");
        }
        if self.bail == Some(0) {
            anyhow::bail!("bail must be at least 1 when set");
        }
        Ok(())
    }

    pub fn apply(&mut self, overrides: &ConfigOverrides) -> Result<()> {
        if let Some(language) = &overrides.language {
            self.language = language.clone();
        }
        if let Some(workers) = overrides.max_workers {
            self.max_workers = workers;
        }
        if let Some(concurrency) = overrides.max_concurrency {
            self.max_concurrency = concurrency;
        }
        if let Some(timeout) = overrides.test_timeout_ms {
            self.test_timeout_ms = timeout;
        }
        if let Some(retries) = overrides.worker_retries {
            self.worker_retries = retries;
        }
        if let Some(isolation) = overrides.isolation {
            self.isolation = isolation;
        }
        if overrides.bail.is_some() {
            self.bail = overrides.bail;
        }
        self.pass_with_no_tests |= overrides.pass_with_no_tests;
        self.validate()
    }

    pub fn unit_settings(&self) -> UnitSettings {
        UnitSettings {
            test_timeout_ms: self.test_timeout_ms,
            max_concurrency: self.max_concurrency,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize run config")
    }
}
