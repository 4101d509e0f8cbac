//! # Execution Planner Module / 执行计划模块
//!
//! This module decides which registered units this run executes: it applies
//! the name filter and, in CI, keeps only this runner's share of the units.
//!
//! 此模块决定本次运行执行哪些已注册的测试单元：应用名称过滤，
//! 并在 CI 中只保留当前运行器负责的那部分单元。

use anyhow::{Result, bail};

use crate::core::models::TestUnit;

/// The units selected for this run.
/// 本次运行选中的测试单元。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Units to run, in registration order.
    /// 要运行的单元，按注册顺序排列。
    pub units: Vec<TestUnit>,
    /// Units dropped by the name filter.
    /// 被名称过滤掉的单元数量。
    pub filtered_count: usize,
    /// Whether units are distributed across multiple runners.
    /// 单元是否分布在多个运行器上。
    pub is_distributed: bool,
}

/// Builds the plan for `units`.
///
/// A unit matches `filter` when its id contains the filter string. Sharding
/// is applied after filtering, so every runner sees the same filtered list
/// and takes every `total`-th unit starting at `index`.
///
/// # Arguments
/// * `units` - All registered units, in registration order
/// * `filter` - Optional substring a unit id must contain
/// * `total_runners` - Optional total number of runners for distributed execution
/// * `runner_index` - Optional index of this runner (0-based)
pub fn plan_execution(
    units: Vec<TestUnit>,
    filter: Option<&str>,
    total_runners: Option<usize>,
    runner_index: Option<usize>,
) -> Result<ExecutionPlan> {
    let (selected, dropped): (Vec<_>, Vec<_>) = units
        .into_iter()
        .partition(|unit| filter.is_none_or(|pattern| unit.id().contains(pattern)));

    let (units, is_distributed) = match (total_runners, runner_index) {
        (Some(total), Some(index)) => {
            if total == 0 || index >= total {
                bail!("Runner index must be less than total runners.");
            }
            let shard = selected
                .into_iter()
                .enumerate()
                .filter(|(i, _)| i % total == index)
                .map(|(_, unit)| unit)
                .collect();
            (shard, true)
        }
        (None, None) => (selected, false),
        _ => bail!("Both --total-runners and --runner-index must be provided."),
    };

    Ok(ExecutionPlan {
        units,
        filtered_count: dropped.len(),
        is_distributed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(names: &[&str]) -> Vec<TestUnit> {
        names.iter().map(|n| TestUnit::new(*n)).collect()
    }

    #[test]
    fn filter_keeps_matching_units_in_order() {
        let plan = plan_execution(units(&["db/users", "http/routes", "db/orders"]), Some("db/"), None, None)
            .unwrap();
        assert_eq!(plan.units, units(&["db/users", "db/orders"]));
        assert_eq!(plan.filtered_count, 1);
        assert!(!plan.is_distributed);
    }

    #[test]
    fn shards_partition_the_filtered_units() {
        let all = units(&["a", "b", "c", "d", "e"]);
        let first = plan_execution(all.clone(), None, Some(2), Some(0)).unwrap();
        let second = plan_execution(all, None, Some(2), Some(1)).unwrap();
        assert_eq!(first.units, units(&["a", "c", "e"]));
        assert_eq!(second.units, units(&["b", "d"]));
        assert!(first.is_distributed);
    }

    #[test]
    fn shard_flags_are_validated() {
        assert!(plan_execution(units(&["a"]), None, Some(2), Some(2)).is_err());
        assert!(plan_execution(units(&["a"]), None, Some(2), None).is_err());
    }
}
