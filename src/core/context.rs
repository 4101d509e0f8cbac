//! # Execution Context / 执行上下文
//!
//! Hooks and test bodies receive a [`TestContext`] instead of capturing shared
//! state lexically. It gives access to the unit's [`Fixtures`], which are owned
//! by the worker running the unit and dropped when the unit finishes.
//!
//! 钩子和测试体接收一个 [`TestContext`]，而不是通过词法捕获共享状态。
//! 通过它可以访问单元的 [`Fixtures`]，夹具由运行该单元的 worker 持有，
//! 单元结束时释放。

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::core::models::TestUnit;

/// A typed store with one slot per type.
///
/// Concurrent test cases of the same unit share this store; the lock only
/// protects the map itself, coordinating access to a fixture is up to the
/// tests.
#[derive(Default)]
pub struct Fixtures {
    slots: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl Fixtures {
    fn slots(&self) -> MutexGuard<'_, HashMap<TypeId, Box<dyn Any + Send + Sync>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&self, value: T) -> Option<T> {
        self.slots()
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Returns a clone of the stored `T`.
    pub fn get<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.slots()
            .get(&TypeId::of::<T>())
            .and_then(|slot| slot.downcast_ref::<T>())
            .cloned()
    }

    /// Runs `f` with mutable access to the stored `T`.
    pub fn with<T: Any + Send + Sync, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.slots()
            .get_mut(&TypeId::of::<T>())
            .and_then(|slot| slot.downcast_mut::<T>())
            .map(f)
    }

    pub fn remove<T: Any + Send + Sync>(&self) -> Option<T> {
        self.slots()
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.slots().contains_key(&TypeId::of::<T>())
    }
}

struct Shared {
    unit: TestUnit,
    fixtures: Fixtures,
    cancel: CancellationToken,
}

/// Handle passed to every hook and test body.
#[derive(Clone)]
pub struct TestContext {
    shared: Arc<Shared>,
    test: Option<Arc<[String]>>,
}

impl TestContext {
    pub fn new(unit: TestUnit, cancel: CancellationToken) -> Self {
        Self {
            shared: Arc::new(Shared {
                unit,
                fixtures: Fixtures::default(),
                cancel,
            }),
            test: None,
        }
    }

    /// The same context, scoped to one test case.
    pub(crate) fn for_test(&self, path: &[String]) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            test: Some(path.into()),
        }
    }

    pub fn unit(&self) -> &TestUnit {
        &self.shared.unit
    }

    pub fn fixtures(&self) -> &Fixtures {
        &self.shared.fixtures
    }

    /// Path of the running test case; `None` inside all-scope hooks.
    pub fn test_path(&self) -> Option<&[String]> {
        self.test.as_deref()
    }

    /// True once the run asked this unit to stop.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Database(Vec<&'static str>);

    #[test]
    fn fixtures_are_typed_slots() {
        let fixtures = Fixtures::default();
        assert!(fixtures.insert(Database(vec!["users"])).is_none());
        assert!(fixtures.insert(7_u32).is_none());

        fixtures.with(|db: &mut Database| db.0.push("orders"));
        assert_eq!(fixtures.get::<Database>(), Some(Database(vec!["users", "orders"])));
        assert_eq!(fixtures.insert(8_u32), Some(7));
        assert_eq!(fixtures.remove::<u32>(), Some(8));
        assert!(!fixtures.contains::<u32>());
    }

    #[test]
    fn test_scoped_context_shares_fixtures() {
        let ctx = TestContext::new(TestUnit::new("unit"), CancellationToken::new());
        ctx.fixtures().insert(String::from("shared"));

        let scoped = ctx.for_test(&["group".to_string(), "case".to_string()]);
        assert_eq!(scoped.fixtures().get::<String>().as_deref(), Some("shared"));
        assert_eq!(scoped.test_path().map(|p| p.len()), Some(2));
        assert!(ctx.test_path().is_none());
    }
}
