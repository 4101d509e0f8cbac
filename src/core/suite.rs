//! # Suite Tree Builder / 测试树构建器
//!
//! Phase one of a unit's life: its declaration function runs once, against a
//! [`SuiteBuilder`] that can only append groups, hooks and cases to an arena.
//! No hook or test body runs here. The finished [`SuiteTree`] is frozen and
//! handed to the executor.
//!
//! 测试单元生命周期的第一阶段：其声明函数针对 [`SuiteBuilder`] 运行一次，
//! 该构建器只能向 arena 追加分组、钩子和用例。此处不会运行任何钩子或测试体。
//! 构建完成的 [`SuiteTree`] 被冻结并交给执行器。

use futures::future::BoxFuture;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::time::Duration;

use crate::core::context::TestContext;
use crate::core::error::{CollectError, is_worker_crash, panic_message};
use crate::core::models::{CaseStatus, HookKind};

/// The future a hook or test body produces.
pub type BodyFuture = BoxFuture<'static, anyhow::Result<()>>;
/// A registered hook or test body.
pub type BodyFn = Arc<dyn Fn(TestContext) -> BodyFuture + Send + Sync>;
/// A unit's declaration function, as supplied by the resolver.
pub type DeclareFn = Arc<dyn Fn(&mut SuiteBuilder) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaseId(usize);

impl GroupId {
    pub const ROOT: GroupId = GroupId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

impl CaseId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Explicit mode of a describe block. A block without one inherits its
/// parent's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    Skip,
    Only,
}

/// Explicit mode of a test case. `failing` is a separate flag so it can be
/// combined with `only` and `skip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseMode {
    Skip,
    Only,
    Todo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Child {
    Group(GroupId),
    Case(CaseId),
}

pub struct Hook {
    pub kind: HookKind,
    pub group: GroupId,
    pub body: BodyFn,
    pub timeout: Option<Duration>,
}

pub struct GroupNode {
    pub name: String,
    /// Back-reference only; the arena owns every node.
    pub parent: Option<GroupId>,
    pub children: Vec<Child>,
    /// All hooks of this group, in registration order.
    pub hooks: Vec<Hook>,
    pub mode: Option<BlockMode>,
}

impl GroupNode {
    pub fn hooks_of(&self, kind: HookKind) -> impl DoubleEndedIterator<Item = &Hook> {
        self.hooks.iter().filter(move |h| h.kind == kind)
    }
}

pub struct TestCase {
    pub name: String,
    pub group: GroupId,
    /// `None` for todo entries.
    pub body: Option<BodyFn>,
    pub mode: Option<CaseMode>,
    pub failing: bool,
    pub concurrent: bool,
    pub timeout: Option<Duration>,
}

/// A frozen tree of groups, hooks and cases.
pub struct SuiteTree {
    groups: Vec<GroupNode>,
    cases: Vec<TestCase>,
}

/// What the focus filter decided for every case and group.
#[derive(Debug, Clone)]
pub struct FocusPlan {
    /// `None` for cases that will run; otherwise the status they are reported with.
    pub filtered: Vec<Option<CaseStatus>>,
    /// Whether the subtree of each group contains at least one case that runs.
    pub group_enabled: Vec<bool>,
}

impl FocusPlan {
    pub fn is_enabled(&self, case: CaseId) -> bool {
        self.filtered[case.0].is_none()
    }

    pub fn group_enabled(&self, group: GroupId) -> bool {
        self.group_enabled[group.0]
    }
}

impl SuiteTree {
    pub fn group(&self, id: GroupId) -> &GroupNode {
        &self.groups[id.0]
    }

    pub fn case(&self, id: CaseId) -> &TestCase {
        &self.cases[id.0]
    }

    pub fn case_count(&self) -> usize {
        self.cases.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Names of the describe blocks leading to `group`, root excluded.
    pub fn group_path(&self, group: GroupId) -> Vec<String> {
        let mut names = Vec::new();
        let mut cursor = Some(group);
        while let Some(id) = cursor {
            let node = &self.groups[id.0];
            if node.parent.is_some() {
                names.push(node.name.clone());
            }
            cursor = node.parent;
        }
        names.reverse();
        names
    }

    /// Describe block names followed by the case name.
    pub fn case_path(&self, case: CaseId) -> Vec<String> {
        let node = &self.cases[case.0];
        let mut path = self.group_path(node.group);
        path.push(node.name.clone());
        path
    }

    /// Ancestors of `group` from the root down to `group` itself.
    pub fn lineage(&self, group: GroupId) -> Vec<GroupId> {
        let mut chain = Vec::new();
        let mut cursor = Some(group);
        while let Some(id) = cursor {
            chain.push(id);
            cursor = self.groups[id.0].parent;
        }
        chain.reverse();
        chain
    }

    /// Every case under `group`, depth-first in declaration order.
    pub fn cases_under(&self, group: GroupId) -> Vec<CaseId> {
        let mut out = Vec::new();
        self.collect_cases(group, &mut out);
        out
    }

    fn collect_cases(&self, group: GroupId, out: &mut Vec<CaseId>) {
        for child in &self.groups[group.0].children {
            match *child {
                Child::Case(id) => out.push(id),
                Child::Group(id) => self.collect_cases(id, out),
            }
        }
    }

    fn effective_group_mode(&self, group: GroupId) -> Option<BlockMode> {
        let mut cursor = Some(group);
        while let Some(id) = cursor {
            let node = &self.groups[id.0];
            if node.mode.is_some() {
                return node.mode;
            }
            cursor = node.parent;
        }
        None
    }

    fn effective_case_mode(&self, case: &TestCase) -> Option<CaseMode> {
        if case.mode.is_some() {
            return case.mode;
        }
        match self.effective_group_mode(case.group) {
            Some(BlockMode::Skip) => Some(CaseMode::Skip),
            Some(BlockMode::Only) => {
                // An `only` block that already focuses one of its own cases
                // does not pass `only` down to the others.
                let siblings_focused = self.groups[case.group.0].children.iter().any(|child| {
                    matches!(child, Child::Case(id) if self.cases[id.0].mode == Some(CaseMode::Only))
                });
                (!siblings_focused).then_some(CaseMode::Only)
            }
            None => None,
        }
    }

    /// Applies skip, todo and `only` focus to the frozen tree.
    pub fn focus_plan(&self) -> FocusPlan {
        let modes: Vec<_> = self
            .cases
            .iter()
            .map(|case| {
                let group_skipped =
                    self.effective_group_mode(case.group) == Some(BlockMode::Skip);
                (self.effective_case_mode(case), group_skipped)
            })
            .collect();

        let has_focus = modes
            .iter()
            .any(|(mode, group_skipped)| *mode == Some(CaseMode::Only) && !group_skipped);

        let filtered: Vec<_> = modes
            .iter()
            .map(|(mode, group_skipped)| match mode {
                Some(CaseMode::Todo) => Some(CaseStatus::Todo),
                Some(CaseMode::Skip) => Some(CaseStatus::Skipped),
                _ if *group_skipped => Some(CaseStatus::Skipped),
                Some(CaseMode::Only) => None,
                None if has_focus => Some(CaseStatus::Skipped),
                None => None,
            })
            .collect();

        let mut group_enabled = vec![false; self.groups.len()];
        for (index, status) in filtered.iter().enumerate() {
            if status.is_none() {
                let mut cursor = Some(self.cases[index].group);
                while let Some(id) = cursor {
                    if group_enabled[id.0] {
                        break;
                    }
                    group_enabled[id.0] = true;
                    cursor = self.groups[id.0].parent;
                }
            }
        }

        FocusPlan {
            filtered,
            group_enabled,
        }
    }
}

/// The restricted registration API handed to a declaration function.
pub struct SuiteBuilder {
    groups: Vec<GroupNode>,
    cases: Vec<TestCase>,
    current: GroupId,
    error: Option<CollectError>,
}

impl Default for SuiteBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn boxed_body<F, Fut>(f: F) -> BodyFn
where
    F: Fn(TestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx: TestContext| -> BodyFuture { Box::pin(f(ctx)) })
}

impl SuiteBuilder {
    pub fn new() -> Self {
        Self {
            groups: vec![GroupNode {
                name: String::new(),
                parent: None,
                children: Vec::new(),
                hooks: Vec::new(),
                mode: None,
            }],
            cases: Vec::new(),
            current: GroupId::ROOT,
            error: None,
        }
    }

    fn open_group(
        &mut self,
        name: String,
        mode: Option<BlockMode>,
        declare: impl FnOnce(&mut SuiteBuilder),
    ) {
        let id = GroupId(self.groups.len());
        let parent = self.current;
        self.groups.push(GroupNode {
            name,
            parent: Some(parent),
            children: Vec::new(),
            hooks: Vec::new(),
            mode,
        });
        self.groups[parent.0].children.push(Child::Group(id));

        self.current = id;
        declare(self);
        self.close_group(id);
        self.current = parent;
    }

    fn close_group(&mut self, id: GroupId) {
        if self.error.is_some() {
            return;
        }
        let has_tests = self.subtree_has_cases(id);
        if let Some(hook) = self.groups[id.0].hooks.first().filter(|_| !has_tests) {
            self.error = Some(CollectError::HooksWithoutTests {
                hook: hook.kind.to_string(),
                group: self.groups[id.0].name.clone(),
            });
        }
    }

    fn subtree_has_cases(&self, id: GroupId) -> bool {
        self.groups[id.0].children.iter().any(|child| match *child {
            Child::Case(_) => true,
            Child::Group(g) => self.subtree_has_cases(g),
        })
    }

    /// Opens a describe block and runs `declare` inside it.
    pub fn describe(&mut self, name: impl Into<String>, declare: impl FnOnce(&mut SuiteBuilder)) {
        self.open_group(name.into(), None, declare);
    }

    /// A describe block whose cases take focus.
    pub fn describe_only(
        &mut self,
        name: impl Into<String>,
        declare: impl FnOnce(&mut SuiteBuilder),
    ) {
        self.open_group(name.into(), Some(BlockMode::Only), declare);
    }

    /// A describe block whose cases are all skipped.
    pub fn describe_skip(
        &mut self,
        name: impl Into<String>,
        declare: impl FnOnce(&mut SuiteBuilder),
    ) {
        self.open_group(name.into(), Some(BlockMode::Skip), declare);
    }

    /// Registers a test case in the current block.
    pub fn test<F, Fut>(&mut self, name: impl Into<String>, body: F) -> CaseOptions<'_>
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push_case(name.into(), Some(boxed_body(body)), None)
    }

    /// Registers a placeholder that is reported as todo.
    pub fn todo(&mut self, name: impl Into<String>) {
        self.push_case(name.into(), None, Some(CaseMode::Todo));
    }

    fn push_case(
        &mut self,
        name: String,
        body: Option<BodyFn>,
        mode: Option<CaseMode>,
    ) -> CaseOptions<'_> {
        let id = CaseId(self.cases.len());
        self.cases.push(TestCase {
            name,
            group: self.current,
            body,
            mode,
            failing: false,
            concurrent: false,
            timeout: None,
        });
        self.groups[self.current.0].children.push(Child::Case(id));
        CaseOptions {
            case: &mut self.cases[id.0],
        }
    }

    fn push_hook<F, Fut>(&mut self, kind: HookKind, body: F) -> HookOptions<'_>
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let group = self.current;
        let hooks = &mut self.groups[group.0].hooks;
        hooks.push(Hook {
            kind,
            group,
            body: boxed_body(body),
            timeout: None,
        });
        let index = hooks.len() - 1;
        HookOptions {
            hook: &mut hooks[index],
        }
    }

    pub fn before_all<F, Fut>(&mut self, body: F) -> HookOptions<'_>
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push_hook(HookKind::BeforeAll, body)
    }

    pub fn after_all<F, Fut>(&mut self, body: F) -> HookOptions<'_>
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push_hook(HookKind::AfterAll, body)
    }

    pub fn before_each<F, Fut>(&mut self, body: F) -> HookOptions<'_>
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push_hook(HookKind::BeforeEach, body)
    }

    pub fn after_each<F, Fut>(&mut self, body: F) -> HookOptions<'_>
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push_hook(HookKind::AfterEach, body)
    }

    /// Freezes the tree, or reports the first declaration problem.
    pub fn finish(self) -> Result<SuiteTree, CollectError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(SuiteTree {
                groups: self.groups,
                cases: self.cases,
            }),
        }
    }
}

/// Chained options for a freshly registered case.
pub struct CaseOptions<'a> {
    case: &'a mut TestCase,
}

impl CaseOptions<'_> {
    pub fn only(self) -> Self {
        self.case.mode = Some(CaseMode::Only);
        self
    }

    pub fn skip(self) -> Self {
        self.case.mode = Some(CaseMode::Skip);
        self
    }

    /// The case passes only if its body fails.
    pub fn failing(self) -> Self {
        self.case.failing = true;
        self
    }

    /// Runs together with the other concurrent cases of its block.
    pub fn concurrent(self) -> Self {
        self.case.concurrent = true;
        self
    }

    pub fn timeout(self, limit: Duration) -> Self {
        self.case.timeout = Some(limit);
        self
    }
}

pub struct HookOptions<'a> {
    hook: &'a mut Hook,
}

impl HookOptions<'_> {
    pub fn timeout(self, limit: Duration) -> Self {
        self.hook.timeout = Some(limit);
        self
    }
}

/// Runs a declaration function and freezes the resulting tree.
///
/// Errors and panics abort collection. A worker-crash panic is re-raised so
/// the worker goes down with it.
pub fn collect(declare: &DeclareFn) -> Result<SuiteTree, CollectError> {
    let mut builder = SuiteBuilder::new();
    match catch_unwind(AssertUnwindSafe(|| declare(&mut builder))) {
        Ok(Ok(())) => builder.finish(),
        Ok(Err(error)) => Err(CollectError::Declaration(error)),
        Err(payload) if is_worker_crash(payload.as_ref()) => resume_unwind(payload),
        Err(payload) => Err(CollectError::Panicked(panic_message(payload.as_ref()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declare(f: impl Fn(&mut SuiteBuilder) -> anyhow::Result<()> + Send + Sync + 'static) -> DeclareFn {
        Arc::new(f)
    }

    fn names(tree: &SuiteTree, cases: &[CaseId]) -> Vec<String> {
        cases.iter().map(|id| tree.case_path(*id).join(" ")).collect()
    }

    #[test]
    fn nested_declarations_attach_to_the_open_group() {
        let tree = collect(&declare(|s| {
            s.test("first", |_| async { Ok(()) });
            s.describe("outer", |s| {
                s.before_each(|_| async { Ok(()) });
                s.test("a", |_| async { Ok(()) });
                s.describe("inner", |s| {
                    s.test("b", |_| async { Ok(()) });
                });
                s.test("c", |_| async { Ok(()) });
            });
            s.todo("later");
            Ok(())
        }))
        .unwrap();

        let all = tree.cases_under(GroupId::ROOT);
        assert_eq!(
            names(&tree, &all),
            ["first", "outer a", "outer inner b", "outer c", "later"]
        );
        let outer = tree.case(all[1]).group;
        assert_eq!(tree.group(outer).hooks.len(), 1);
        assert_eq!(tree.group(outer).parent, Some(GroupId::ROOT));
        assert_eq!(tree.lineage(tree.case(all[2]).group).len(), 3);
    }

    #[test]
    fn declaration_errors_abort_collection() {
        let result = collect(&declare(|s| {
            s.test("never runs", |_| async { Ok(()) });
            anyhow::bail!("cannot read fixture file")
        }));
        assert!(matches!(result, Err(CollectError::Declaration(_))));
    }

    #[test]
    fn declaration_panics_abort_collection() {
        let result = collect(&declare(|s| {
            s.describe("broken", |_| panic!("bad table"));
            Ok(())
        }));
        match result {
            Err(CollectError::Panicked(message)) => assert_eq!(message, "bad table"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("collection should fail"),
        }
    }

    #[test]
    fn hooks_in_a_group_without_tests_are_rejected() {
        let result = collect(&declare(|s| {
            s.describe("empty", |s| {
                s.before_all(|_| async { Ok(()) });
            });
            s.test("other", |_| async { Ok(()) });
            Ok(())
        }));
        assert!(matches!(result, Err(CollectError::HooksWithoutTests { .. })));
    }

    #[test]
    fn only_focuses_across_the_whole_unit() {
        let tree = collect(&declare(|s| {
            s.test("plain", |_| async { Ok(()) });
            s.describe("group", |s| {
                s.test("focused", |_| async { Ok(()) }).only();
                s.test("sibling", |_| async { Ok(()) });
            });
            s.todo("todo");
            Ok(())
        }))
        .unwrap();

        let plan = tree.focus_plan();
        assert_eq!(
            plan.filtered,
            vec![
                Some(CaseStatus::Skipped),
                None,
                Some(CaseStatus::Skipped),
                Some(CaseStatus::Todo),
            ]
        );
        assert!(plan.group_enabled(GroupId::ROOT));
    }

    #[test]
    fn describe_only_passes_focus_down_unless_a_child_is_focused() {
        let tree = collect(&declare(|s| {
            s.describe_only("all focused", |s| {
                s.test("x", |_| async { Ok(()) });
                s.test("y", |_| async { Ok(()) });
            });
            s.describe_only("one focused", |s| {
                s.test("z", |_| async { Ok(()) }).only();
                s.test("w", |_| async { Ok(()) });
            });
            s.test("outside", |_| async { Ok(()) });
            Ok(())
        }))
        .unwrap();

        let plan = tree.focus_plan();
        assert_eq!(
            plan.filtered,
            vec![None, None, None, Some(CaseStatus::Skipped), Some(CaseStatus::Skipped)]
        );
    }

    #[test]
    fn skipped_groups_disable_their_subtree() {
        let tree = collect(&declare(|s| {
            s.describe_skip("off", |s| {
                s.before_all(|_| async { Ok(()) });
                s.test("a", |_| async { Ok(()) });
                s.test("b", |_| async { Ok(()) }).only();
            });
            s.test("on", |_| async { Ok(()) });
            Ok(())
        }))
        .unwrap();

        let plan = tree.focus_plan();
        assert_eq!(
            plan.filtered,
            vec![Some(CaseStatus::Skipped), Some(CaseStatus::Skipped), None]
        );
        let off = tree.case(CaseId(0)).group;
        assert!(!plan.group_enabled(off));
    }
}
