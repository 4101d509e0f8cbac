//! # Suite Execution Engine / 测试套件执行引擎
//!
//! Phase two of a unit's life: walks a frozen [`SuiteTree`], runs hooks and
//! test bodies with deadlines, and produces one [`CaseResult`] per case in
//! declaration order.
//!
//! 测试单元生命周期的第二阶段：遍历冻结的 [`SuiteTree`]，带截止时间地运行钩子
//! 和测试体，并按声明顺序为每个用例生成一个 [`CaseResult`]。
//!
//! Bodies and hooks are spawned onto the worker's runtime. A body that
//! outlives its deadline is detached, not aborted: the executor records the
//! timeout and moves on while the abandoned task keeps running in the
//! background.
//!
//! 测试体和钩子被派生到 worker 的运行时上。超过截止时间的测试体会被分离而不是中止：
//! 执行器记录超时后继续前进，被放弃的任务在后台继续运行。

use futures::future::{FutureExt, LocalBoxFuture};
use futures::stream::{self, StreamExt};
use std::cell::{Cell, RefCell};
use std::panic::resume_unwind;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::context::TestContext;
use crate::core::error::{UnitError, is_worker_crash};
use crate::core::events::RunEvent;
use crate::core::models::{
    CaseResult, CaseStatus, Failure, FailureKind, HookFailure, HookKind, TaskResult, TestUnit,
    UnitSettings,
};
use crate::core::registry::SuiteRegistry;
use crate::core::suite::{self, BodyFn, CaseId, Child, FocusPlan, GroupId, Hook, SuiteTree};

/// How a spawned body or hook ended.
enum Invocation {
    Completed(Result<(), Failure>),
    TimedOut,
}

/// Spawns `body` and waits for it up to `limit`.
///
/// A worker-crash panic inside the body is re-raised here so it unwinds the
/// worker instead of being recorded as a failure.
async fn invoke(body: &BodyFn, ctx: TestContext, limit: Duration) -> Invocation {
    let handle = tokio::spawn(body(ctx));
    match tokio::time::timeout(limit, handle).await {
        // Dropping the join handle detaches the task.
        Err(_) => Invocation::TimedOut,
        Ok(Ok(Ok(()))) => Invocation::Completed(Ok(())),
        Ok(Ok(Err(error))) => {
            Invocation::Completed(Err(Failure::from_error(FailureKind::Test, &error)))
        }
        Ok(Err(join_error)) => match join_error.try_into_panic() {
            Ok(payload) if is_worker_crash(payload.as_ref()) => resume_unwind(payload),
            Ok(payload) => {
                Invocation::Completed(Err(Failure::from_panic(FailureKind::Test, payload.as_ref())))
            }
            Err(join_error) => Invocation::Completed(Err(Failure::new(
                FailureKind::Test,
                join_error.to_string(),
            ))),
        },
    }
}

/// State of one unit's execution.
struct UnitExecution<'a> {
    tree: &'a SuiteTree,
    plan: FocusPlan,
    ctx: TestContext,
    settings: UnitSettings,
    events: &'a UnboundedSender<RunEvent>,
    results: RefCell<Vec<Option<CaseResult>>>,
    hook_errors: RefCell<Vec<HookFailure>>,
    interrupted: Cell<bool>,
}

impl<'a> UnitExecution<'a> {
    fn emit(&self, event: RunEvent) {
        // The receiver disappears when the dispatcher gave up on this unit.
        if self.events.send(event).is_err() {
            debug!(unit = %self.unit(), "event receiver closed, event dropped");
        }
    }

    fn unit(&self) -> &TestUnit {
        self.ctx.unit()
    }

    fn record(&self, case: CaseId, result: CaseResult) {
        self.results.borrow_mut()[case.index()] = Some(result);
    }

    fn is_recorded(&self, case: CaseId) -> bool {
        self.results.borrow()[case.index()].is_some()
    }

    /// Stops before starting new work once the unit is cancelled.
    fn should_stop(&self) -> bool {
        if self.ctx.is_cancelled() {
            self.interrupted.set(true);
            true
        } else {
            false
        }
    }

    fn hook_limit(&self, hook: &Hook) -> Duration {
        hook.timeout.unwrap_or_else(|| self.settings.test_timeout())
    }

    async fn run_hook(&self, hook: &Hook, ctx: TestContext) -> Result<(), Failure> {
        let limit = self.hook_limit(hook);
        match invoke(&hook.body, ctx, limit).await {
            Invocation::Completed(Ok(())) => Ok(()),
            Invocation::Completed(Err(failure)) => Err(failure.in_hook(hook.kind)),
            Invocation::TimedOut => Err(Failure::timeout(limit, true).in_hook(hook.kind)),
        }
    }

    /// Runs the body of `case`, applying `failing` inversion.
    async fn run_body(&self, case: CaseId, ctx: TestContext) -> Option<Failure> {
        let node = self.tree.case(case);
        let body = node.body.as_ref()?;
        let limit = node.timeout.unwrap_or_else(|| self.settings.test_timeout());
        match invoke(body, ctx, limit).await {
            Invocation::TimedOut => Some(Failure::timeout(limit, false)),
            Invocation::Completed(Ok(())) if node.failing => Some(Failure::new(
                FailureKind::UnexpectedPass,
                "expected failure did not occur",
            )),
            Invocation::Completed(Ok(())) => None,
            Invocation::Completed(Err(_)) if node.failing => None,
            Invocation::Completed(Err(failure)) => Some(failure),
        }
    }

    async fn run_case(&self, case: CaseId) {
        if self.is_recorded(case) || self.should_stop() {
            return;
        }
        let path = self.tree.case_path(case);
        self.emit(RunEvent::CaseStart {
            unit: self.unit().clone(),
            path: path.clone(),
        });

        let ctx = self.ctx.for_test(&path);
        let lineage = self.tree.lineage(self.tree.case(case).group);
        let started = Instant::now();
        let mut errors = Vec::new();

        'before: for group in &lineage {
            for hook in self.tree.group(*group).hooks_of(HookKind::BeforeEach) {
                if let Err(failure) = self.run_hook(hook, ctx.clone()).await {
                    errors.push(failure);
                    break 'before;
                }
            }
        }

        if errors.is_empty() {
            if let Some(failure) = self.run_body(case, ctx.clone()).await {
                errors.push(failure);
            }
        }

        for group in lineage.iter().rev() {
            for hook in self.tree.group(*group).hooks_of(HookKind::AfterEach).rev() {
                if let Err(failure) = self.run_hook(hook, ctx.clone()).await {
                    errors.push(failure);
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.finish_case(case, path, duration_ms, errors);
    }

    fn finish_case(&self, case: CaseId, path: Vec<String>, duration_ms: u64, errors: Vec<Failure>) {
        let status = if errors.is_empty() {
            self.emit(RunEvent::CaseSuccess {
                unit: self.unit().clone(),
                path: path.clone(),
                duration_ms,
            });
            CaseStatus::Passed
        } else {
            self.emit(RunEvent::CaseFailure {
                unit: self.unit().clone(),
                path: path.clone(),
                duration_ms,
                errors: errors.clone(),
            });
            CaseStatus::Failed
        };
        self.record(
            case,
            CaseResult {
                path,
                status,
                duration_ms: Some(duration_ms),
                errors,
            },
        );
    }

    /// Fails every enabled, not yet finished case under `group` with `failure`.
    fn fail_subtree(&self, group: GroupId, failure: &Failure) {
        for case in self.tree.cases_under(group) {
            if !self.plan.is_enabled(case) || self.is_recorded(case) {
                continue;
            }
            let path = self.tree.case_path(case);
            self.emit(RunEvent::CaseStart {
                unit: self.unit().clone(),
                path: path.clone(),
            });
            self.finish_case(case, path, 0, vec![failure.clone()]);
        }
    }

    fn run_group(&self, group: GroupId) -> LocalBoxFuture<'_, ()> {
        async move {
            if !self.plan.group_enabled(group) || self.should_stop() {
                return;
            }
            let node = self.tree.group(group);

            let mut entry_failure = None;
            for hook in node.hooks_of(HookKind::BeforeAll) {
                if let Err(failure) = self.run_hook(hook, self.ctx.clone()).await {
                    entry_failure = Some(failure);
                    break;
                }
            }

            match entry_failure {
                Some(failure) => self.fail_subtree(group, &failure),
                None => {
                    let batch: Vec<CaseId> = node
                        .children
                        .iter()
                        .filter_map(|child| match *child {
                            Child::Case(id)
                                if self.plan.is_enabled(id) && self.tree.case(id).concurrent =>
                            {
                                Some(id)
                            }
                            _ => None,
                        })
                        .collect();
                    if !batch.is_empty() {
                        stream::iter(batch)
                            .map(|id| self.run_case(id))
                            .buffered(self.settings.max_concurrency.max(1))
                            .collect::<Vec<()>>()
                            .await;
                    }

                    for child in &node.children {
                        match *child {
                            Child::Case(id) if self.plan.is_enabled(id) => self.run_case(id).await,
                            Child::Case(_) => {}
                            Child::Group(id) => self.run_group(id).await,
                        }
                    }
                }
            }

            for hook in node.hooks_of(HookKind::AfterAll).rev() {
                if let Err(failure) = self.run_hook(hook, self.ctx.clone()).await {
                    self.hook_errors.borrow_mut().push(HookFailure {
                        group: self.tree.group_path(group),
                        failure,
                    });
                }
            }
        }
        .boxed_local()
    }
}

/// Runs every case of `tree` and returns the unit's result.
pub async fn execute(
    tree: &SuiteTree,
    ctx: TestContext,
    settings: UnitSettings,
    events: &UnboundedSender<RunEvent>,
) -> TaskResult {
    let started = Instant::now();
    let plan = tree.focus_plan();

    let mut results = vec![None; tree.case_count()];
    for case in tree.cases_under(GroupId::ROOT) {
        if let Some(status) = plan.filtered[case.index()] {
            results[case.index()] = Some(CaseResult {
                path: tree.case_path(case),
                status,
                duration_ms: None,
                errors: Vec::new(),
            });
        }
    }

    let execution = UnitExecution {
        tree,
        plan,
        ctx,
        settings,
        events,
        results: RefCell::new(results),
        hook_errors: RefCell::new(Vec::new()),
        interrupted: Cell::new(false),
    };
    execution.run_group(GroupId::ROOT).await;

    let UnitExecution {
        ctx,
        results,
        hook_errors,
        interrupted,
        ..
    } = execution;
    let mut results = results.into_inner();
    let cases = tree
        .cases_under(GroupId::ROOT)
        .into_iter()
        .map(|case| {
            results[case.index()].take().unwrap_or_else(|| CaseResult {
                path: tree.case_path(case),
                status: CaseStatus::Skipped,
                duration_ms: None,
                errors: Vec::new(),
            })
        })
        .collect();

    TaskResult {
        unit: ctx.unit().clone(),
        cases,
        hook_errors: hook_errors.into_inner(),
        fatal: None,
        duration_ms: started.elapsed().as_millis() as u64,
        interrupted: interrupted.get(),
    }
}

/// Resolves, collects and executes one unit.
///
/// Every outcome, including an unknown unit or a broken declaration, is
/// returned as a [`TaskResult`]. Only a worker crash unwinds out of here.
pub async fn run_unit(
    registry: &SuiteRegistry,
    unit: &TestUnit,
    settings: UnitSettings,
    cancel: CancellationToken,
    events: &UnboundedSender<RunEvent>,
) -> TaskResult {
    let started = Instant::now();
    let Some(declare) = registry.resolve(unit) else {
        return TaskResult::fatal(unit.clone(), UnitError::UnknownUnit);
    };

    let tree = match suite::collect(&declare) {
        Ok(tree) => tree,
        Err(error) => {
            debug!(unit = %unit, error = %error, "collection failed");
            let mut result = TaskResult::fatal(
                unit.clone(),
                UnitError::Collection {
                    message: error.to_string(),
                },
            );
            result.duration_ms = started.elapsed().as_millis() as u64;
            return result;
        }
    };
    debug!(unit = %unit, cases = tree.case_count(), "collected suite");

    let ctx = TestContext::new(unit.clone(), cancel);
    execute(&tree, ctx, settings, events).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::suite::SuiteBuilder;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        fn push(&self, entry: &str) {
            self.0.lock().unwrap().push(entry.to_string());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    async fn run(declare: impl Fn(&mut SuiteBuilder) -> anyhow::Result<()> + Send + Sync + 'static) -> TaskResult {
        let mut registry = SuiteRegistry::new();
        registry.register("unit", declare);
        let (tx, _rx) = mpsc::unbounded_channel();
        run_unit(
            &registry,
            &TestUnit::new("unit"),
            UnitSettings::default(),
            CancellationToken::new(),
            &tx,
        )
        .await
    }

    fn statuses(result: &TaskResult) -> Vec<CaseStatus> {
        result.cases.iter().map(|c| c.status).collect()
    }

    #[tokio::test]
    async fn hooks_wrap_each_case_in_order() {
        let journal = Journal::default();
        let j = journal.clone();
        let result = run(move |s| {
            let j1 = j.clone();
            s.before_all(move |_| {
                let j = j1.clone();
                async move {
                    j.push("beforeAll");
                    Ok(())
                }
            });
            let j2 = j.clone();
            s.before_each(move |_| {
                let j = j2.clone();
                async move {
                    j.push("beforeEach");
                    Ok(())
                }
            });
            let j3 = j.clone();
            s.after_each(move |_| {
                let j = j3.clone();
                async move {
                    j.push("afterEach");
                    Ok(())
                }
            });
            let j4 = j.clone();
            s.after_all(move |_| {
                let j = j4.clone();
                async move {
                    j.push("afterAll");
                    Ok(())
                }
            });
            for name in ["one", "two"] {
                let j = j.clone();
                s.test(name, move |_| {
                    let j = j.clone();
                    async move {
                        j.push(name);
                        Ok(())
                    }
                });
            }
            Ok(())
        })
        .await;

        assert_eq!(statuses(&result), [CaseStatus::Passed, CaseStatus::Passed]);
        assert_eq!(
            journal.entries(),
            [
                "beforeAll",
                "beforeEach",
                "one",
                "afterEach",
                "beforeEach",
                "two",
                "afterEach",
                "afterAll"
            ]
        );
    }

    #[tokio::test]
    async fn failing_cases_are_inverted() {
        let result = run(|s| {
            s.test("throws", |_| async { anyhow::bail!("expected") }).failing();
            s.test("passes", |_| async { Ok(()) }).failing();
            Ok(())
        })
        .await;

        assert_eq!(statuses(&result), [CaseStatus::Passed, CaseStatus::Failed]);
        assert_eq!(result.cases[1].errors[0].kind, FailureKind::UnexpectedPass);
        assert_eq!(result.cases[1].errors[0].message, "expected failure did not occur");
    }

    #[tokio::test]
    async fn panics_become_failures() {
        let result = run(|s| {
            s.test("panics", |_| async {
                let empty: Vec<u8> = Vec::new();
                let _ = empty[3];
                Ok(())
            });
            s.test("after", |_| async { Ok(()) });
            Ok(())
        })
        .await;

        assert_eq!(statuses(&result), [CaseStatus::Failed, CaseStatus::Passed]);
        assert!(result.cases[0].errors[0].message.starts_with("index out of bounds"));
    }

    #[tokio::test]
    async fn before_each_failure_skips_the_body_but_not_after_each() {
        let journal = Journal::default();
        let j = journal.clone();
        let result = run(move |s| {
            s.before_each(|_| async { anyhow::bail!("no connection") });
            let j1 = j.clone();
            s.after_each(move |_| {
                let j = j1.clone();
                async move {
                    j.push("afterEach");
                    Ok(())
                }
            });
            let j2 = j.clone();
            s.test("body", move |_| {
                let j = j2.clone();
                async move {
                    j.push("body");
                    Ok(())
                }
            });
            Ok(())
        })
        .await;

        assert_eq!(statuses(&result), [CaseStatus::Failed]);
        let failure = &result.cases[0].errors[0];
        assert_eq!(failure.kind, FailureKind::Hook);
        assert_eq!(failure.hook, Some(HookKind::BeforeEach));
        assert_eq!(journal.entries(), ["afterEach"]);
    }

    #[tokio::test]
    async fn after_all_failures_are_recorded_against_the_group() {
        let result = run(|s| {
            s.describe("db", |s| {
                s.after_all(|_| async { anyhow::bail!("drop failed") });
                s.test("query", |_| async { Ok(()) });
            });
            Ok(())
        })
        .await;

        assert_eq!(statuses(&result), [CaseStatus::Passed]);
        assert_eq!(result.hook_errors.len(), 1);
        assert_eq!(result.hook_errors[0].group, ["db"]);
        assert!(result.is_failure());
    }

    #[tokio::test]
    async fn unknown_and_broken_units_are_fatal() {
        let registry = SuiteRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = run_unit(
            &registry,
            &TestUnit::new("ghost"),
            UnitSettings::default(),
            CancellationToken::new(),
            &tx,
        )
        .await;
        assert_eq!(result.fatal, Some(UnitError::UnknownUnit));

        let result = run(|_| anyhow::bail!("fixture missing")).await;
        assert!(matches!(result.fatal, Some(UnitError::Collection { .. })));
        assert!(result.cases.is_empty());
    }

    #[tokio::test]
    async fn cancelled_units_skip_remaining_cases() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut registry = SuiteRegistry::new();
        registry.register("unit", move |s| {
            let trigger = trigger.clone();
            s.test("first", move |_| {
                let trigger = trigger.clone();
                async move {
                    trigger.cancel();
                    Ok(())
                }
            });
            s.test("second", |_| async { Ok(()) });
            Ok(())
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = run_unit(
            &registry,
            &TestUnit::new("unit"),
            UnitSettings::default(),
            cancel,
            &tx,
        )
        .await;

        assert_eq!(statuses(&result), [CaseStatus::Passed, CaseStatus::Skipped]);
        assert!(result.interrupted);
    }
}
