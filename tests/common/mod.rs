// Shared test helpers for integration tests
#![allow(dead_code)]

use grove_runner::SuiteBuilder;
use grove_runner::core::aggregate::RunReport;
use grove_runner::core::events::{RecordingReporter, ReporterSet};
use grove_runner::core::execution::run_unit;
use grove_runner::core::models::{CaseStatus, TaskResult, TestUnit, UnitSettings};
use grove_runner::core::pool::{Launcher, PoolOptions, WorkerLink, WorkerPool};
use grove_runner::core::registry::SuiteRegistry;
use grove_runner::core::transport::FRAME_PREFIX;
use grove_runner::infra::ThreadLauncher;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// An append-only log shared between a test and the suites it declares.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

/// Registers a hook that appends `entry` to the journal.
pub fn log_hook(
    journal: &Journal,
    entry: &'static str,
) -> impl Fn(grove_runner::TestContext) -> std::future::Ready<anyhow::Result<()>> + Send + Sync + 'static {
    let journal = journal.clone();
    move |_| {
        journal.push(entry);
        std::future::ready(Ok(()))
    }
}

/// Executes one unit declared by `declare` with the given settings.
pub async fn run_with(
    settings: UnitSettings,
    declare: impl Fn(&mut SuiteBuilder) -> anyhow::Result<()> + Send + Sync + 'static,
) -> TaskResult {
    let mut registry = SuiteRegistry::new();
    registry.register("unit", declare);
    let (tx, _rx) = mpsc::unbounded_channel();
    run_unit(
        &registry,
        &TestUnit::new("unit"),
        settings,
        CancellationToken::new(),
        &tx,
    )
    .await
}

pub async fn run_single(
    declare: impl Fn(&mut SuiteBuilder) -> anyhow::Result<()> + Send + Sync + 'static,
) -> TaskResult {
    run_with(UnitSettings::default(), declare).await
}

pub fn statuses(result: &TaskResult) -> Vec<CaseStatus> {
    result.cases.iter().map(|c| c.status).collect()
}

pub fn names(result: &TaskResult) -> Vec<String> {
    result.cases.iter().map(|c| c.full_name()).collect()
}

/// Runs every unit of `registry` on thread workers.
pub async fn run_pool(
    registry: SuiteRegistry,
    options: PoolOptions,
    cancel: &CancellationToken,
) -> (RunReport, RecordingReporter) {
    let units = registry.units();
    let launcher = Arc::new(ThreadLauncher::new(Arc::new(registry)));
    run_on(launcher, units, options, cancel).await
}

/// Runs `units` on workers started by `launcher`.
pub async fn run_on(
    launcher: Arc<dyn Launcher>,
    units: Vec<TestUnit>,
    options: PoolOptions,
    cancel: &CancellationToken,
) -> (RunReport, RecordingReporter) {
    let recorder = RecordingReporter::new();
    let mut reporters = ReporterSet::new();
    reporters.add(recorder.clone());

    let pool = WorkerPool::start(launcher, options, &mut reporters, cancel).unwrap();
    let report = pool.run(units).await;
    (report, recorder)
}

/// How a scripted worker answers a task.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Goes away without a result.
    Crash,
    /// Answers with a frame that does not decode, then stays alive.
    Garble,
}

/// Starts fake workers that follow a [`Script`] instead of running suites.
/// Launches past `limit` fail.
pub struct ScriptedLauncher {
    script: Script,
    limit: usize,
    launches: AtomicUsize,
}

impl ScriptedLauncher {
    pub fn new(script: Script, limit: usize) -> Self {
        Self {
            script,
            limit,
            launches: AtomicUsize::new(0),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, _id: usize) -> io::Result<WorkerLink> {
        if self.launches.fetch_add(1, Ordering::SeqCst) >= self.limit {
            return Err(io::Error::other("no more workers"));
        }
        let (sender, mut inbox) = mpsc::unbounded_channel::<String>();
        let (outbox, receiver) = mpsc::unbounded_channel();
        let script = self.script;
        tokio::spawn(async move {
            while let Some(line) = inbox.recv().await {
                if !line.contains(r#""type":"run""#) {
                    continue;
                }
                match script {
                    Script::Crash => return,
                    Script::Garble => {
                        let _ = outbox.send(format!(r#"{FRAME_PREFIX}{{"type":"done","result":"#));
                    }
                }
            }
        });
        Ok(WorkerLink {
            sender,
            receiver,
            terminate: Box::new(|| {}),
        })
    }
}
