//! # Data Models Module / 数据模型模块
//!
//! This module defines the data structures that travel between the dispatcher,
//! the workers and the reporters: units and tasks going out, per-case results
//! and whole-unit results coming back.
//!
//! 此模块定义了在调度器、worker 和报告器之间传递的数据结构：
//! 发出的测试单元和任务，以及返回的单个用例结果和整个单元的结果。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::core::error::UnitError;
use crate::core::transport::Transport;

/// Identifies one schedulable file of tests.
/// 标识一个可调度的测试文件。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestUnit(String);

impl TestUnit {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-unit execution settings shipped with every task.
/// 随每个任务一起发送的单元执行设置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSettings {
    /// Deadline for a test or hook without its own override, in milliseconds.
    pub test_timeout_ms: u64,
    /// How many concurrent cases of one group may run at once.
    pub max_concurrency: usize,
}

impl UnitSettings {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }
}

impl Default for UnitSettings {
    fn default() -> Self {
        Self {
            test_timeout_ms: 5_000,
            max_concurrency: 5,
        }
    }
}

/// One unit of work handed to a worker.
/// 交给 worker 的一个工作单元。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTask {
    pub unit: TestUnit,
    pub settings: UnitSettings,
    /// Position of the unit in the original run order.
    pub seq: usize,
    /// 1 for the first attempt, incremented on every crash retry.
    pub attempt: u32,
}

/// The four hook scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
}

impl HookKind {
    pub fn is_all_scope(self) -> bool {
        matches!(self, HookKind::BeforeAll | HookKind::AfterAll)
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookKind::BeforeAll => "beforeAll",
            HookKind::AfterAll => "afterAll",
            HookKind::BeforeEach => "beforeEach",
            HookKind::AfterEach => "afterEach",
        })
    }
}

/// Enumerates where a failure came from.
/// 枚举失败的来源。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The test body returned an error or panicked.
    Test,
    /// A hook guarding the test failed.
    Hook,
    /// A test or hook exceeded its deadline.
    Timeout,
    /// A `failing` test completed cleanly.
    UnexpectedPass,
}

/// A single recorded error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    /// Set when the failure originated in a hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookKind>,
    pub message: String,
    /// The thrown value, if the error carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Transport>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            hook: None,
            message: message.into(),
            payload: None,
        }
    }

    pub fn timeout(limit: Duration, is_hook: bool) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!(
                "Exceeded timeout of {} ms for a {}.",
                limit.as_millis(),
                if is_hook { "hook" } else { "test" }
            ),
        )
    }

    /// Tags a failure as coming from `hook`. The original kind is kept for
    /// timeouts so reporters can still tell them apart.
    pub fn in_hook(mut self, hook: HookKind) -> Self {
        if self.kind != FailureKind::Timeout {
            self.kind = FailureKind::Hook;
        }
        self.hook = Some(hook);
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hook {
            Some(hook) => write!(f, "[{hook}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Terminal status of a test case.
/// 测试用例的最终状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
    Todo,
}

/// The reported outcome of one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    /// Group names from the outermost describe block down to the case name.
    pub path: Vec<String>,
    pub status: CaseStatus,
    /// Absent for cases that never ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Failure>,
}

impl CaseResult {
    /// The case name joined with its describe blocks, e.g. `math adds`.
    pub fn full_name(&self) -> String {
        self.path.join(" ")
    }

    pub fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or("")
    }
}

/// An after-all hook failure, recorded against its group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookFailure {
    /// Names of the describe blocks leading to the group; empty for the root.
    pub group: Vec<String>,
    pub failure: Failure,
}

/// The serialized outcome of one unit.
/// 一个测试单元的序列化结果。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub unit: TestUnit,
    /// Case outcomes in declaration order.
    pub cases: Vec<CaseResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hook_errors: Vec<HookFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<UnitError>,
    pub duration_ms: u64,
    /// True if a cancellation stopped the unit before all cases ran.
    #[serde(default)]
    pub interrupted: bool,
}

impl TaskResult {
    /// A result carrying only a fatal unit error.
    pub fn fatal(unit: TestUnit, error: UnitError) -> Self {
        Self {
            unit,
            cases: Vec::new(),
            hook_errors: Vec::new(),
            fatal: Some(error),
            duration_ms: 0,
            interrupted: false,
        }
    }

    pub fn count(&self, status: CaseStatus) -> usize {
        self.cases.iter().filter(|c| c.status == status).count()
    }

    /// A unit fails on any failed case, after-all error or fatal error.
    pub fn is_failure(&self) -> bool {
        self.fatal.is_some() || !self.hook_errors.is_empty() || self.count(CaseStatus::Failed) > 0
    }
}
