//! Task and feedback channels
//!
//! The coordinator talks to every executor (local worker thread or remote
//! server driver) through two shared bounded queues:
//!
//! ```text
//!             tasks (Evaluate | Finished)
//! Coordinator ───────────────────────────────▶ executors
//!             ◀───────────────────────────────
//!             feedback (Scored | EvalError | NeedMoreWork | Finished)
//! ```
//!
//! # Demand-driven supply
//!
//! An executor first polls the task queue without blocking. If the queue is
//! empty it announces `NeedMoreWork` and then blocks; as soon as it receives a
//! real task it goes back to polling. The coordinator pushes exactly one task
//! per feedback item, so the queue holds at most as many tasks as there are
//! outstanding requests.
//!
//! # Cancellation
//!
//! Every blocking point selects on the [`CancelToken`] as well, so an
//! interrupt wakes coordinator and executors alike.

use crate::eval::Candidate;
use crate::seed::{Seed, WorkItem};
use crossbeam::channel::{bounded, select, Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Instruction from coordinator to executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    Evaluate(WorkItem),
    /// Sentinel: acknowledge with [`Feedback::Finished`] and stop
    Finished,
}

/// Report from executor to coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Feedback {
    /// A candidate was produced and scored for `target`
    Scored { target: usize, candidate: Candidate },
    /// Evaluation failed; `target` and `seed` are known unless the executor
    /// failed before it could take any work
    EvalError {
        target: Option<usize>,
        seed: Option<Seed>,
        message: String,
    },
    /// The executor found the task queue empty and is now blocking on it
    NeedMoreWork,
    /// Acknowledgement of a `Finished` sentinel; the executor has stopped
    Finished,
}

/// Shared interrupt signal
///
/// Cheap to clone. Once cancelled it stays cancelled, and [`signal`] becomes
/// permanently ready so it can sit in any `select!`.
///
/// [`signal`]: CancelToken::signal
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new(Mutex::new(Some(trigger))),
            signal,
        }
    }

    /// Cancel the run. Safe to call from a signal-handler thread and more
    /// than once.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        // Dropping the only sender disconnects every clone of `signal`
        let mut trigger = match self.trigger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        trigger.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Receiver that becomes ready (disconnected) once cancelled
    pub fn signal(&self) -> &Receiver<()> {
        &self.signal
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Create the task/feedback queue pair, each bounded to `capacity`
pub fn channels(capacity: usize) -> (CoordinatorEnd, ExecutorEnd) {
    let (task_tx, task_rx) = bounded(capacity);
    let (feedback_tx, feedback_rx) = bounded(capacity);
    (
        CoordinatorEnd { tasks: task_tx, feedback: feedback_rx },
        ExecutorEnd { tasks: task_rx, feedback: feedback_tx },
    )
}

/// Outcome of a blocking receive on the feedback queue
#[derive(Debug)]
pub enum Received {
    Feedback(Feedback),
    Cancelled,
    /// Every executor end has been dropped
    Disconnected,
}

/// The coordinator's half: pushes tasks, drains feedback
pub struct CoordinatorEnd {
    tasks: Sender<Task>,
    feedback: Receiver<Feedback>,
}

impl CoordinatorEnd {
    /// Push a task, blocking while the queue is full
    ///
    /// Returns `false` if the run was cancelled or no executor is left to
    /// receive it.
    pub fn send_task(&self, task: Task, cancel: &CancelToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        select! {
            send(self.tasks, task) -> res => res.is_ok(),
            recv(cancel.signal()) -> _ => false,
        }
    }

    /// Block until the next feedback item arrives
    pub fn recv_feedback(&self, cancel: &CancelToken) -> Received {
        if cancel.is_cancelled() {
            return Received::Cancelled;
        }
        select! {
            recv(self.feedback) -> msg => match msg {
                Ok(feedback) => Received::Feedback(feedback),
                Err(_) => Received::Disconnected,
            },
            recv(cancel.signal()) -> _ => Received::Cancelled,
        }
    }
}

/// The executors' half, cloned once per executor
#[derive(Clone)]
pub struct ExecutorEnd {
    tasks: Receiver<Task>,
    feedback: Sender<Feedback>,
}

impl ExecutorEnd {
    /// Task puller starting in non-blocking mode
    pub fn puller(&self, cancel: CancelToken) -> TaskPuller {
        TaskPuller {
            tasks: self.tasks.clone(),
            sink: self.sink(cancel),
            should_block: false,
        }
    }

    /// Feedback sender for executors that pull and report on different threads
    pub fn sink(&self, cancel: CancelToken) -> FeedbackSink {
        FeedbackSink {
            feedback: self.feedback.clone(),
            cancel,
        }
    }
}

/// Cancellation-aware feedback sender
#[derive(Clone)]
pub struct FeedbackSink {
    feedback: Sender<Feedback>,
    cancel: CancelToken,
}

impl FeedbackSink {
    /// Send one feedback item; `false` means the coordinator is gone or the
    /// run was cancelled and the executor should stop
    pub fn push(&self, feedback: Feedback) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        select! {
            send(self.feedback, feedback) -> res => res.is_ok(),
            recv(self.cancel.signal()) -> _ => false,
        }
    }
}

/// What an executor got from the task queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulled {
    Work(WorkItem),
    Finished,
    Cancelled,
}

/// Executor-side task reader implementing the demand-driven protocol
pub struct TaskPuller {
    tasks: Receiver<Task>,
    sink: FeedbackSink,
    /// Set after announcing `NeedMoreWork`, cleared by the next real task
    should_block: bool,
}

impl TaskPuller {
    /// Fetch the next task
    ///
    /// Polls first; on an empty queue sends `NeedMoreWork` once and blocks
    /// until a task arrives or the run is cancelled.
    pub fn pull(&mut self) -> Pulled {
        loop {
            if self.sink.cancel.is_cancelled() {
                return Pulled::Cancelled;
            }

            let task = if self.should_block {
                select! {
                    recv(self.tasks) -> task => match task {
                        Ok(task) => task,
                        Err(_) => return Pulled::Cancelled,
                    },
                    recv(self.sink.cancel.signal()) -> _ => return Pulled::Cancelled,
                }
            } else {
                match self.tasks.try_recv() {
                    Ok(task) => task,
                    Err(TryRecvError::Empty) => {
                        if !self.sink.push(Feedback::NeedMoreWork) {
                            return Pulled::Cancelled;
                        }
                        self.should_block = true;
                        continue;
                    }
                    Err(TryRecvError::Disconnected) => return Pulled::Cancelled,
                }
            };

            self.should_block = false;
            return match task {
                Task::Evaluate(item) => Pulled::Work(item),
                Task::Finished => Pulled::Finished,
            };
        }
    }

    /// Report a result for the last pulled task
    pub fn push(&self, feedback: Feedback) -> bool {
        self.sink.push(feedback)
    }

    /// Acknowledge a `Finished` sentinel
    pub fn acknowledge_finished(&self) -> bool {
        self.sink.push(Feedback::Finished)
    }

    pub fn is_blocking(&self) -> bool {
        self.should_block
    }
}
