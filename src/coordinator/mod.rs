//! Coordinator module
//!
//! Owns a search run from start to finish:
//!
//! ```text
//! Validating ──▶ Ready ──▶ Dispatching ──▶ Draining ──▶ Terminated
//! ```
//!
//! - **Validating**: every target directory is checked and prepared; any
//!   failure ends the run before a worker starts
//! - **Ready**: targets are named and their base scores printed
//! - **Dispatching**: one feedback item in, one task out, until the seeds run
//!   dry or a perfect match stops the run
//! - **Draining**: one `Finished` per live executor, then feedback is read
//!   until every executor has acknowledged
//! - **Terminated**: workers are joined and the final scores returned
//!
//! With a single local thread and no network the run skips the queues and
//! evaluates inline on the calling thread, printing the same events in the
//! same order.

pub mod aggregator;
pub mod watchdog;

use crate::config::Config;
use crate::distributed::client::RemotePool;
use crate::error::{RunError, ValidationError};
use crate::eval::{build_evaluators, evaluate_work, EvaluatorFactory, TargetSpec};
use crate::seed::SeedCycle;
use crate::target::layout::TargetLayout;
use crate::target::{assign_unique_names, SearchTarget};
use crate::worker::channel::{channels, CancelToken, CoordinatorEnd, Feedback, Received, Task};
use crate::worker::spawn_local_workers;
use crate::Result;
use aggregator::RunState;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};
use watchdog::Heartbeat;

/// Lifecycle phase, recorded with every heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Validating = 0,
    Ready = 1,
    Dispatching = 2,
    Draining = 3,
    Terminated = 4,
}

impl Phase {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Validating,
            1 => Phase::Ready,
            2 => Phase::Dispatching,
            3 => Phase::Draining,
            _ => Phase::Terminated,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Phase::Validating => "validating targets",
            Phase::Ready => "starting workers",
            Phase::Dispatching => "waiting for results",
            Phase::Draining => "waiting for workers to finish",
            Phase::Terminated => "shutting down",
        }
    }
}

/// Final state of one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSummary {
    pub name: String,
    pub dir: PathBuf,
    pub base_score: u64,
    pub best_score: u64,
    pub distinct_outputs: usize,
}

/// Outcome of a completed run, targets in command-line order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub errors: u64,
    pub found_zero: bool,
    pub targets: Vec<TargetSummary>,
    /// Executor shutdown accounting; empty for inline runs
    pub shutdown: ShutdownLedger,
}

impl RunSummary {
    fn from_state(state: &RunState, found_zero: bool, shutdown: ShutdownLedger) -> Self {
        Self {
            iterations: state.iteration,
            errors: state.errors,
            found_zero,
            shutdown,
            targets: state
                .targets
                .iter()
                .map(|t| TargetSummary {
                    name: t.unique_name.clone(),
                    dir: t.dir().to_path_buf(),
                    base_score: t.base_score(),
                    best_score: t.best_score(),
                    distinct_outputs: t.distinct_outputs(),
                })
                .collect(),
        }
    }

    /// Best score per target
    pub fn best_scores(&self) -> Vec<u64> {
        self.targets.iter().map(|t| t.best_score).collect()
    }
}

/// Executor accounting for shutdown
///
/// Every executor owes exactly one `Finished` acknowledgement. An executor is
/// active until it acknowledges, or until the feedback queue disconnects and
/// the remainder are written off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownLedger {
    executors: usize,
    sentinels_sent: usize,
    acknowledged: usize,
    lost: usize,
}

impl ShutdownLedger {
    pub fn new(executors: usize) -> Self {
        Self {
            executors,
            sentinels_sent: 0,
            acknowledged: 0,
            lost: 0,
        }
    }

    pub fn executors(&self) -> usize {
        self.executors
    }

    pub fn active(&self) -> usize {
        self.executors - self.acknowledged - self.lost
    }

    pub fn sentinel_sent(&mut self) {
        self.sentinels_sent += 1;
    }

    pub fn acknowledge(&mut self) {
        if self.active() > 0 {
            self.acknowledged += 1;
        } else {
            warn!("Finished acknowledgement from an executor that was not active");
        }
    }

    /// Write off every executor that has not acknowledged
    pub fn abandon(&mut self) {
        self.lost += self.active();
    }

    pub fn sentinels_sent(&self) -> usize {
        self.sentinels_sent
    }

    pub fn acknowledged(&self) -> usize {
        self.acknowledged
    }
}

/// Task queue capacity for `slots` concurrent evaluations spread over
/// `executors` executors
pub fn channel_capacity(slots: usize, slack: usize, executors: usize) -> usize {
    slots.max(1) * slack.max(1) + executors
}

/// Fold one feedback item into the run; true on a perfect score
fn apply_feedback(state: &mut RunState, feedback: Feedback) -> Result<bool> {
    match feedback {
        Feedback::Scored { target, candidate } => Ok(state.process_scored(target, candidate)?.perfect),
        Feedback::EvalError { target, seed, message } => {
            state.process_error(target, seed, &message)?;
            Ok(false)
        }
        Feedback::NeedMoreWork | Feedback::Finished => Ok(false),
    }
}

/// Executors started for a pooled run
struct Pool {
    local: Vec<JoinHandle<()>>,
    remote: Option<RemotePool>,
}

impl Pool {
    fn join(self) {
        for handle in self.local {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        if let Some(remote) = self.remote {
            remote.join();
        }
    }

    fn abandon(self) {
        drop(self.local);
        if let Some(remote) = self.remote {
            remote.abandon();
        }
    }
}

/// Runs one search over a set of target directories
pub struct Coordinator {
    config: Arc<Config>,
    factory: Arc<dyn EvaluatorFactory>,
    heartbeat: Heartbeat,
    cancel: CancelToken,
}

impl Coordinator {
    pub fn new(
        config: Arc<Config>,
        factory: Arc<dyn EvaluatorFactory>,
        heartbeat: Heartbeat,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            factory,
            heartbeat,
            cancel,
        }
    }

    /// Run the search to completion
    ///
    /// Fails with [`ValidationError`] when a target cannot be loaded, with
    /// [`RunError::Interrupted`] when cancelled, and with
    /// [`RunError::NoWorkers`] when no executor could be started.
    pub fn run(&self) -> Result<RunSummary> {
        self.heartbeat.beat(Phase::Validating);
        let targets = self.load_targets()?;
        self.check_cancelled()?;

        self.heartbeat.beat(Phase::Ready);
        let forced = self.config.forced_seed()?;
        let mut master = Xoshiro256PlusPlus::from_entropy();
        let seeds = SeedCycle::from_spaces(targets.iter().map(|t| &t.spec.seed_space), forced, &mut master);
        let mut state = RunState::new(targets, self.config.aggregator_settings());

        let outcome = if self.config.is_inline() {
            self.run_inline(&mut state, seeds).map(|found| (found, ShutdownLedger::new(0)))
        } else {
            self.run_pooled(&mut state, seeds)
        };
        state.finish_progress();
        let (found_zero, ledger) = outcome?;

        self.heartbeat.beat(Phase::Terminated);
        if found_zero {
            println!("\nFound zero score! Exiting.");
        }
        Ok(RunSummary::from_state(&state, found_zero, ledger))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RunError::Interrupted.into());
        }
        Ok(())
    }

    fn load_targets(&self) -> Result<Vec<SearchTarget>> {
        let settings = self.config.eval_settings();
        let mut targets = Vec::with_capacity(self.config.directories.len());

        for dir in &self.config.directories {
            self.heartbeat.beat(Phase::Validating);
            let layout = TargetLayout::validate(dir)?;
            println!("{}", layout);

            let spec = self
                .factory
                .prepare(&layout, &settings)
                .map_err(|e| ValidationError::Construction {
                    dir: dir.clone(),
                    message: format!("{:#}", e),
                })?;
            debug!(name = %spec.name, seed_space = %spec.seed_space, "prepared target");
            targets.push(SearchTarget::new(spec));
        }
        println!();

        assign_unique_names(&mut targets);
        for target in &targets {
            println!("[{}] base score = {}", target.unique_name, target.best_score());
        }
        Ok(targets)
    }

    /// Evaluate on this thread, one seed at a time
    fn run_inline(&self, state: &mut RunState, seeds: SeedCycle) -> Result<bool> {
        let specs: Vec<TargetSpec> = state.targets.iter().map(|t| t.spec.clone()).collect();
        let mut evaluators = build_evaluators(self.factory.as_ref(), &specs, 0)?;
        let mut found_zero = false;

        for item in seeds {
            self.check_cancelled()?;
            self.heartbeat.beat(Phase::Dispatching);
            let feedback = evaluate_work(&mut evaluators, item);
            self.check_cancelled()?;

            if apply_feedback(state, feedback)? {
                found_zero = true;
                if self.config.search.stop_on_zero {
                    break;
                }
            }
        }
        Ok(found_zero)
    }

    /// Evaluate on local worker threads and remote servers
    fn run_pooled(&self, state: &mut RunState, mut seeds: SeedCycle) -> Result<(bool, ShutdownLedger)> {
        let specs = Arc::new(state.targets.iter().map(|t| t.spec.clone()).collect::<Vec<_>>());

        let remote = if self.config.network.enabled {
            Some(RemotePool::connect(&self.config.network, &specs)?)
        } else {
            None
        };
        let remote_executors = remote.as_ref().map_or(0, RemotePool::len);
        let remote_slots = remote.as_ref().map_or(0, RemotePool::slots);
        let local = self.config.threads();
        let executors = local + remote_executors;
        if executors == 0 {
            return Err(RunError::NoWorkers.into());
        }

        let capacity = channel_capacity(local + remote_slots, self.config.workers.channel_slack, executors);
        info!(local, remote = remote_executors, capacity, "starting executors");
        let (coord, end) = channels(capacity);

        let mut pool = Pool { local: Vec::new(), remote };
        match spawn_local_workers(local, Arc::clone(&specs), Arc::clone(&self.factory), &end, &self.cancel) {
            Ok(handles) => pool.local = handles,
            Err(e) => {
                self.cancel.cancel();
                pool.abandon();
                return Err(e);
            }
        }
        if let Some(remote) = pool.remote.as_mut() {
            remote.start(&end, &self.cancel);
        }
        // Executors hold their own clones; ours would keep the queues alive
        drop(end);

        let mut ledger = ShutdownLedger::new(executors);
        let mut found_zero = false;
        let outcome = self
            .dispatch(state, &mut seeds, &coord, &mut ledger, &mut found_zero)
            .and_then(|()| self.drain(state, &coord, &mut ledger, &mut found_zero));

        match outcome {
            Ok(()) => {
                self.heartbeat.beat(Phase::Terminated);
                pool.join();
                debug!(
                    executors = ledger.executors(),
                    sentinels = ledger.sentinels_sent(),
                    acknowledged = ledger.acknowledged(),
                    "executors stopped"
                );
                Ok((found_zero, ledger))
            }
            Err(e) => {
                self.cancel.cancel();
                pool.abandon();
                Err(e)
            }
        }
    }

    fn dispatch(
        &self,
        state: &mut RunState,
        seeds: &mut SeedCycle,
        coord: &CoordinatorEnd,
        ledger: &mut ShutdownLedger,
        found_zero: &mut bool,
    ) -> Result<()> {
        while ledger.active() > 0 {
            self.heartbeat.beat(Phase::Dispatching);
            let feedback = match coord.recv_feedback(&self.cancel) {
                Received::Feedback(feedback) => feedback,
                Received::Cancelled => return Err(RunError::Interrupted.into()),
                Received::Disconnected => {
                    warn!("every executor went away during dispatch");
                    ledger.abandon();
                    break;
                }
            };

            match feedback {
                Feedback::Finished => {
                    ledger.acknowledge();
                    continue;
                }
                Feedback::NeedMoreWork => {}
                other => {
                    if apply_feedback(state, other)? {
                        *found_zero = true;
                        if self.config.search.stop_on_zero {
                            break;
                        }
                    }
                }
            }

            let Some(item) = seeds.next() else {
                debug!("seed supply exhausted");
                break;
            };
            if !coord.send_task(Task::Evaluate(item), &self.cancel) {
                // Executors are gone; whatever they sent is read while draining
                self.check_cancelled()?;
                warn!("task queue closed during dispatch");
                break;
            }
        }
        Ok(())
    }

    fn drain(
        &self,
        state: &mut RunState,
        coord: &CoordinatorEnd,
        ledger: &mut ShutdownLedger,
        found_zero: &mut bool,
    ) -> Result<()> {
        self.heartbeat.beat(Phase::Draining);
        for _ in 0..ledger.active() {
            if !coord.send_task(Task::Finished, &self.cancel) {
                self.check_cancelled()?;
                warn!("task queue closed while stopping executors");
                break;
            }
            ledger.sentinel_sent();
        }
        debug!(sentinels = ledger.sentinels_sent(), "stopping executors");

        while ledger.active() > 0 {
            self.heartbeat.beat(Phase::Draining);
            match coord.recv_feedback(&self.cancel) {
                Received::Feedback(Feedback::Finished) => ledger.acknowledge(),
                Received::Feedback(Feedback::NeedMoreWork) => {}
                Received::Feedback(other) => {
                    if !(self.config.search.stop_on_zero && *found_zero) && apply_feedback(state, other)? {
                        *found_zero = true;
                    }
                }
                Received::Cancelled => return Err(RunError::Interrupted.into()),
                Received::Disconnected => {
                    warn!(missing = ledger.active(), "executors exited without acknowledging");
                    ledger.abandon();
                }
            }
        }
        Ok(())
    }
}
