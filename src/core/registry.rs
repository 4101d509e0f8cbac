//! # Suite Registry / 测试套件注册表
//!
//! Maps unit ids to declaration functions. The registry is built once by the
//! test binary and shared read-only with every worker, so a worker only needs
//! the unit id to find what to collect.
//!
//! 将单元 id 映射到声明函数。注册表由测试二进制构建一次，
//! 并以只读方式与所有 worker 共享，worker 只需单元 id 即可找到要收集的内容。

use std::sync::Arc;
use tracing::warn;

use crate::core::models::TestUnit;
use crate::core::suite::{DeclareFn, SuiteBuilder};

#[derive(Clone, Default)]
pub struct SuiteRegistry {
    entries: Vec<(TestUnit, DeclareFn)>,
}

impl SuiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `declare` under `id`. Registering the same id twice keeps the
    /// original position and replaces the function.
    pub fn register<F>(&mut self, id: impl Into<String>, declare: F) -> &mut Self
    where
        F: Fn(&mut SuiteBuilder) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let unit = TestUnit::new(id);
        let declare: DeclareFn = Arc::new(declare);
        match self.entries.iter_mut().find(|(u, _)| *u == unit) {
            Some(entry) => {
                warn!(unit = %unit, "suite registered twice, keeping the last declaration");
                entry.1 = declare;
            }
            None => self.entries.push((unit, declare)),
        }
        self
    }

    /// Unit ids in registration order.
    pub fn units(&self) -> Vec<TestUnit> {
        self.entries.iter().map(|(unit, _)| unit.clone()).collect()
    }

    pub fn resolve(&self, unit: &TestUnit) -> Option<DeclareFn> {
        self.entries
            .iter()
            .find(|(u, _)| u == unit)
            .map(|(_, declare)| Arc::clone(declare))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_keep_registration_order() {
        let mut registry = SuiteRegistry::new();
        registry
            .register("b", |_| Ok(()))
            .register("a", |_| Ok(()))
            .register("b", |_| anyhow::bail!("replaced"));

        assert_eq!(registry.units(), vec![TestUnit::new("b"), TestUnit::new("a")]);
        assert!(registry.resolve(&TestUnit::new("a")).is_some());
        assert!(registry.resolve(&TestUnit::new("missing")).is_none());

        let replaced = registry.resolve(&TestUnit::new("b")).unwrap();
        assert!(replaced(&mut SuiteBuilder::new()).is_err());
    }
}
