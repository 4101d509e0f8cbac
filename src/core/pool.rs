//! # Worker Pool & Dispatcher / Worker 池与调度器
//!
//! Distributes units over a fixed number of isolated workers, one unit per
//! worker at a time. The dispatcher is a single loop that owns every
//! [`WorkerHandle`] and reacts to messages and exits reported by the workers,
//! so claiming a task never races with another claim.
//!
//! 将测试单元分发给固定数量的隔离 worker，每个 worker 同一时间只运行一个单元。
//! 调度器是一个拥有全部 [`WorkerHandle`] 的单一循环，响应 worker 上报的消息和退出，
//! 因此认领任务不会与其他认领发生竞争。
//!
//! A worker that goes away without a result is a crash. The unit is retried on
//! a fresh worker until the retry budget runs out, then recorded as
//! [`UnitError::WorkerCrashed`].
//!
//! 没有返回结果就消失的 worker 视为崩溃。该单元会在新的 worker 上重试，
//! 直到重试次数耗尽，然后记录为 [`UnitError::WorkerCrashed`]。

use chrono::Utc;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::aggregate::RunReport;
use crate::core::config::RunConfig;
use crate::core::error::{PoolError, UnitError};
use crate::core::events::{ReporterSet, RunEvent};
use crate::core::models::{TaskResult, TestUnit, UnitSettings, WorkerTask};
use crate::core::transport::{self, ChildMessage, ParentMessage};

/// Forcibly stops a worker. Must not block.
pub type Terminator = Box<dyn FnOnce() + Send>;

/// The dispatcher's end of a running worker.
///
/// `receiver` yields protocol lines written by the worker; it closes when the
/// worker is gone, for whatever reason.
pub struct WorkerLink {
    pub sender: UnboundedSender<String>,
    pub receiver: UnboundedReceiver<String>,
    pub terminate: Terminator,
}

/// Starts isolated workers.
pub trait Launcher: Send + Sync {
    fn launch(&self, id: usize) -> io::Result<WorkerLink>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Exited,
}

/// The pool's record of one worker slot.
pub struct WorkerHandle {
    pub id: usize,
    pub state: WorkerState,
    /// Incremented every time the slot gets a new worker.
    pub generation: u32,
    pub restarts: u32,
    task: Option<WorkerTask>,
    sender: Option<UnboundedSender<String>>,
    terminate: Option<Terminator>,
    /// Set once the dispatcher asked the worker to go away.
    retiring: bool,
}

impl WorkerHandle {
    fn new(id: usize) -> Self {
        Self {
            id,
            state: WorkerState::Exited,
            generation: 0,
            restarts: 0,
            task: None,
            sender: None,
            terminate: None,
            retiring: false,
        }
    }

    fn is_live(&self) -> bool {
        self.state != WorkerState::Exited
    }

    fn send(&self, message: &ParentMessage) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match transport::encode(message) {
            Ok(line) => sender.send(line).is_ok(),
            Err(err) => {
                error!(worker = self.id, error = %err, "failed to encode message");
                false
            }
        }
    }

    fn kill(&mut self) {
        self.sender = None;
        if let Some(terminate) = self.terminate.take() {
            terminate();
        }
    }
}

/// What a worker's link reported.
#[derive(Debug)]
enum PoolEvent {
    Line {
        worker: usize,
        generation: u32,
        line: String,
    },
    Exited {
        worker: usize,
        generation: u32,
    },
}

/// Tunables of a pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub workers: usize,
    /// Crash retries per unit on top of the first attempt.
    pub worker_retries: u32,
    pub shutdown_grace: Duration,
    /// Cancel the run after this many failed units.
    pub bail: Option<usize>,
    pub settings: UnitSettings,
}

impl PoolOptions {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            workers: config.max_workers,
            worker_retries: config.worker_retries,
            shutdown_grace: config.shutdown_grace(),
            bail: config.bail,
            settings: config.unit_settings(),
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            worker_retries: 2,
            shutdown_grace: Duration::from_millis(500),
            bail: None,
            settings: UnitSettings::default(),
        }
    }
}

pub struct WorkerPool<'r> {
    launcher: Arc<dyn Launcher>,
    options: PoolOptions,
    workers: Vec<WorkerHandle>,
    queue: VecDeque<WorkerTask>,
    events_tx: UnboundedSender<PoolEvent>,
    events_rx: UnboundedReceiver<PoolEvent>,
    reporters: &'r mut ReporterSet,
    results: Vec<(usize, TaskResult)>,
    next_seq: usize,
    /// Units submitted but not yet reported.
    outstanding: usize,
    failed_units: usize,
    accepting: bool,
    cancel: CancellationToken,
    cancelling: bool,
    /// When busy workers get killed after a cancellation.
    cancel_deadline: Option<Instant>,
}

impl<'r> WorkerPool<'r> {
    /// Launches `options.workers` idle workers.
    ///
    /// `cancel` stops the run the same way a bail does.
    pub fn start(
        launcher: Arc<dyn Launcher>,
        options: PoolOptions,
        reporters: &'r mut ReporterSet,
        cancel: &CancellationToken,
    ) -> Result<Self, PoolError> {
        if options.workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut pool = Self {
            launcher,
            workers: (0..options.workers).map(WorkerHandle::new).collect(),
            options,
            queue: VecDeque::new(),
            events_tx,
            events_rx,
            reporters,
            results: Vec::new(),
            next_seq: 0,
            outstanding: 0,
            failed_units: 0,
            accepting: true,
            cancel: cancel.child_token(),
            cancelling: false,
            cancel_deadline: None,
        };

        for id in 0..pool.workers.len() {
            if let Err(source) = pool.spawn_worker(id) {
                for worker in &mut pool.workers {
                    worker.kill();
                }
                return Err(PoolError::Launch { id, source });
            }
        }
        info!(workers = pool.workers.len(), "worker pool started");
        Ok(pool)
    }

    fn spawn_worker(&mut self, id: usize) -> io::Result<()> {
        let WorkerLink {
            sender,
            mut receiver,
            terminate,
        } = self.launcher.launch(id)?;

        let handle = &mut self.workers[id];
        handle.generation += 1;
        handle.state = WorkerState::Idle;
        handle.sender = Some(sender);
        handle.terminate = Some(terminate);
        handle.retiring = false;

        let generation = handle.generation;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(line) = receiver.recv().await {
                let event = PoolEvent::Line {
                    worker: id,
                    generation,
                    line,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            let _ = events.send(PoolEvent::Exited {
                worker: id,
                generation,
            });
        });
        debug!(worker = id, generation, "worker launched");
        Ok(())
    }

    /// Queues `unit` for execution. Returns false once shutdown has begun.
    pub fn submit(&mut self, unit: TestUnit) -> bool {
        if !self.accepting {
            warn!(unit = %unit, "pool is shutting down, submission rejected");
            return false;
        }
        let task = WorkerTask {
            unit,
            settings: self.options.settings,
            seq: self.next_seq,
            attempt: 1,
        };
        self.next_seq += 1;
        self.outstanding += 1;
        self.queue.push_back(task);
        self.dispatch();
        true
    }

    /// Hands queued tasks to idle workers, oldest first.
    fn dispatch(&mut self) {
        // A pending cancellation (bail included) must not start new units.
        if self.cancel.is_cancelled() {
            return;
        }
        while !self.queue.is_empty() {
            let Some(worker) = self.workers.iter().position(|w| w.state == WorkerState::Idle) else {
                return;
            };
            let Some(task) = self.queue.pop_front() else {
                return;
            };
            self.assign(worker, task);
        }
    }

    fn assign(&mut self, worker: usize, task: WorkerTask) {
        let handle = &mut self.workers[worker];
        let message = ParentMessage::Run { task: task.clone() };
        handle.state = WorkerState::Busy;
        handle.task = Some(task.clone());
        if !handle.send(&message) {
            // The link is already closed; its exit event will retry the task.
            debug!(worker, unit = %task.unit, "worker link closed before assignment");
        }
        self.reporters.emit(&RunEvent::UnitStart {
            unit: task.unit,
            worker,
            attempt: task.attempt,
        });
    }

    fn finish_unit(&mut self, seq: usize, result: TaskResult) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if result.is_failure() && !self.cancel.is_cancelled() {
            self.failed_units += 1;
            if self.options.bail.is_some_and(|limit| self.failed_units >= limit) {
                info!(failed = self.failed_units, "bail limit reached, cancelling run");
                self.cancel.cancel();
            }
        }
        self.reporters.emit(&RunEvent::UnitFinish {
            result: result.clone(),
        });
        self.results.push((seq, result));
    }

    fn fail_task(&mut self, task: WorkerTask, error: UnitError) {
        self.finish_unit(task.seq, TaskResult::fatal(task.unit, error));
    }

    fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Line {
                worker,
                generation,
                line,
            } => {
                if self.workers[worker].generation == generation {
                    self.on_line(worker, &line);
                }
            }
            PoolEvent::Exited { worker, generation } => {
                let handle = &self.workers[worker];
                if handle.generation == generation && handle.is_live() {
                    let crashed = !handle.retiring;
                    self.on_worker_exit(worker, crashed);
                }
            }
        }
    }

    fn on_line(&mut self, worker: usize, line: &str) {
        let (output, frame) = transport::split_frame(line);
        // Output of the tests themselves, possibly a partial line ahead of a frame.
        if frame.is_none() || !output.is_empty() {
            println!("{output}");
        }
        let Some(json) = frame else { return };

        match transport::parse::<ChildMessage>(json) {
            Ok(ChildMessage::Event { event }) => self.reporters.emit(&event),
            Ok(ChildMessage::Done { result }) => {
                let handle = &mut self.workers[worker];
                let Some(task) = handle.task.take() else {
                    warn!(worker, "result from a worker without a task, dropped");
                    return;
                };
                if handle.state == WorkerState::Busy {
                    handle.state = WorkerState::Idle;
                }
                self.finish_unit(task.seq, result);
                if self.accepting {
                    self.dispatch();
                }
            }
            Err(err) if self.workers[worker].state == WorkerState::Busy => {
                error!(worker, error = %err, "unreadable message from a busy worker");
                self.replace_worker(worker, format!("unreadable worker message: {err}"));
            }
            Err(err) => warn!(worker, error = %err, "dropping malformed worker message"),
        }
    }

    /// Discards a worker whose protocol stream can no longer be trusted. Its
    /// unit is reported as crashed and not retried.
    fn replace_worker(&mut self, worker: usize, detail: String) {
        let handle = &mut self.workers[worker];
        handle.kill();
        handle.state = WorkerState::Exited;
        handle.generation += 1;
        if let Some(task) = handle.task.take() {
            let attempts = task.attempt;
            self.fail_task(task, UnitError::WorkerCrashed { attempts, detail });
        }

        if self.accepting && !self.queue.is_empty() {
            self.respawn(worker);
        }
        self.dispatch();
        self.check_exhausted();
    }

    /// Reacts to a worker going away.
    pub fn on_worker_exit(&mut self, worker: usize, crashed: bool) {
        let handle = &mut self.workers[worker];
        handle.state = WorkerState::Exited;
        handle.sender = None;
        handle.terminate = None;
        let task = handle.task.take();

        if !crashed {
            debug!(worker, "worker exited");
            if let Some(task) = task {
                self.fail_task(task, UnitError::Terminated);
            }
            return;
        }

        match task {
            Some(task) if self.accepting && task.attempt <= self.options.worker_retries => {
                warn!(
                    worker,
                    unit = %task.unit,
                    attempt = task.attempt,
                    "worker crashed, retrying unit"
                );
                self.queue.push_front(WorkerTask {
                    attempt: task.attempt + 1,
                    ..task
                });
            }
            Some(task) => {
                error!(worker, unit = %task.unit, attempts = task.attempt, "worker crashed, retries exceeded");
                let attempts = task.attempt;
                self.fail_task(
                    task,
                    UnitError::WorkerCrashed {
                        attempts,
                        detail: "worker exited without reporting a result".to_string(),
                    },
                );
            }
            None => warn!(worker, "idle worker exited unexpectedly"),
        }

        if self.accepting && !self.queue.is_empty() {
            self.respawn(worker);
        }
        self.dispatch();
        self.check_exhausted();
    }

    fn respawn(&mut self, worker: usize) {
        match self.spawn_worker(worker) {
            Ok(()) => self.workers[worker].restarts += 1,
            Err(err) => error!(worker, error = %err, "failed to respawn worker"),
        }
    }

    /// Fails every queued unit once no worker is left to run it.
    fn check_exhausted(&mut self) {
        if self.workers.iter().any(WorkerHandle::is_live) {
            return;
        }
        while let Some(task) = self.queue.pop_front() {
            self.fail_task(task, UnitError::PoolExhausted);
        }
    }

    fn busy_workers(&self) -> Vec<usize> {
        self.workers
            .iter()
            .filter(|w| w.state == WorkerState::Busy)
            .map(|w| w.id)
            .collect()
    }

    /// Stops dispatching, reports queued units as cancelled and asks busy
    /// workers to stop after their current case.
    fn begin_cancel(&mut self) {
        info!(queued = self.queue.len(), "cancelling run");
        self.cancelling = true;
        self.accepting = false;
        while let Some(task) = self.queue.pop_front() {
            self.fail_task(task, UnitError::Cancelled);
        }
        for worker in self.busy_workers() {
            self.workers[worker].send(&ParentMessage::Cancel);
        }
        self.cancel_deadline = Some(Instant::now() + self.options.shutdown_grace);
    }

    /// Kills a worker that did not finish in time.
    fn force_terminate(&mut self, worker: usize) {
        let handle = &mut self.workers[worker];
        warn!(worker, "force-terminating worker");
        handle.kill();
        handle.state = WorkerState::Exited;
        // Events of the killed generation are ignored from now on.
        handle.generation += 1;
        if let Some(task) = handle.task.take() {
            self.fail_task(task, UnitError::Terminated);
        }
    }

    /// Waits for events until `done` holds or `deadline` passes.
    async fn drain_until(&mut self, deadline: Instant, done: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::from_std(deadline);
        while !done(self) {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => return false,
                },
                _ = tokio::time::sleep_until(deadline) => return done(self),
            }
        }
        true
    }

    /// Stops the pool: waits for in-flight units, then for the workers to
    /// exit, each within the grace period, killing what is left.
    pub async fn shutdown(&mut self) {
        self.accepting = false;
        let grace = self.options.shutdown_grace;

        let idle = self
            .drain_until(Instant::now() + grace, |pool| pool.busy_workers().is_empty())
            .await;
        if !idle {
            for worker in self.busy_workers() {
                self.force_terminate(worker);
            }
        }

        for handle in self.workers.iter_mut().filter(|w| w.is_live()) {
            handle.retiring = true;
            handle.send(&ParentMessage::Shutdown);
            handle.sender = None;
        }
        let exited = self
            .drain_until(Instant::now() + grace, |pool| {
                !pool.workers.iter().any(WorkerHandle::is_live)
            })
            .await;
        if !exited {
            for handle in self.workers.iter_mut().filter(|w| w.is_live()) {
                warn!(worker = handle.id, "worker ignored shutdown, killing it");
                handle.kill();
                handle.state = WorkerState::Exited;
            }
        }
        debug!("worker pool stopped");
    }

    /// Runs `units` to completion and returns the aggregated report.
    pub async fn run(mut self, units: Vec<TestUnit>) -> RunReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        self.reporters.emit(&RunEvent::RunStart {
            units: units.len(),
            workers: self.workers.len(),
        });

        for unit in units {
            self.submit(unit);
        }

        while self.outstanding > 0 {
            let deadline = self
                .cancel_deadline
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(tokio::time::Instant::now);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !self.cancelling => self.begin_cancel(),
                _ = tokio::time::sleep_until(deadline), if self.cancel_deadline.is_some() => {
                    self.cancel_deadline = None;
                    for worker in self.busy_workers() {
                        self.force_terminate(worker);
                    }
                }
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }

        self.shutdown().await;

        let report = RunReport::from_results(
            started_at,
            std::mem::take(&mut self.results),
            clock.elapsed().as_millis() as u64,
        );
        self.reporters.emit(&RunEvent::RunFinish {
            success: report.success,
        });
        self.reporters.complete(&report);
        report
    }
}
