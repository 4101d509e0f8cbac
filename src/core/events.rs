//! # Lifecycle Events / 生命周期事件
//!
//! The closed set of events reporters observe while a run progresses, and the
//! [`Reporter`] trait they implement. Reporters only ever see shared
//! references, so they cannot influence scheduling.
//!
//! 报告器在运行过程中观察到的封闭事件集合，以及它们实现的 [`Reporter`] trait。
//! 报告器只能拿到共享引用，因此无法影响调度。

use serde::{Deserialize, Serialize};

use crate::core::aggregate::RunReport;
use crate::core::models::{Failure, TaskResult, TestUnit};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStart {
        units: usize,
        workers: usize,
    },
    UnitStart {
        unit: TestUnit,
        worker: usize,
        attempt: u32,
    },
    CaseStart {
        unit: TestUnit,
        path: Vec<String>,
    },
    CaseSuccess {
        unit: TestUnit,
        path: Vec<String>,
        duration_ms: u64,
    },
    CaseFailure {
        unit: TestUnit,
        path: Vec<String>,
        duration_ms: u64,
        errors: Vec<Failure>,
    },
    UnitFinish {
        result: TaskResult,
    },
    RunFinish {
        success: bool,
    },
}

/// An observer of the event stream.
pub trait Reporter: Send {
    fn on_event(&mut self, event: &RunEvent);

    /// Called once with the aggregated report after `RunFinish`.
    fn on_run_complete(&mut self, _report: &RunReport) {}
}

/// Fans events out to every registered reporter, in registration order.
#[derive(Default)]
pub struct ReporterSet {
    reporters: Vec<Box<dyn Reporter>>,
}

impl ReporterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, reporter: impl Reporter + 'static) {
        self.reporters.push(Box::new(reporter));
    }

    pub fn emit(&mut self, event: &RunEvent) {
        for reporter in &mut self.reporters {
            reporter.on_event(event);
        }
    }

    pub fn complete(&mut self, report: &RunReport) {
        for reporter in &mut self.reporters {
            reporter.on_run_complete(report);
        }
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

/// Collects every event; useful for tests and for replaying a run.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    events: std::sync::Arc<std::sync::Mutex<Vec<RunEvent>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl Reporter for RecordingReporter {
    fn on_event(&mut self, event: &RunEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporter_set_fans_out_in_order() {
        let first = RecordingReporter::new();
        let second = RecordingReporter::new();
        let mut set = ReporterSet::new();
        set.add(first.clone());
        set.add(second.clone());

        set.emit(&RunEvent::RunStart { units: 2, workers: 1 });
        set.emit(&RunEvent::RunFinish { success: true });

        assert_eq!(first.events().len(), 2);
        assert_eq!(first.events(), second.events());
    }

    #[test]
    fn events_are_tagged_in_json() {
        let json = serde_json::to_string(&RunEvent::CaseStart {
            unit: TestUnit::new("a"),
            path: vec!["x".into()],
        })
        .unwrap();
        assert!(json.starts_with(r#"{"event":"case_start""#));
    }
}
