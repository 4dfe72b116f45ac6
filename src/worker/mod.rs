//! Local worker threads
//!
//! A local worker is an executor that lives in this process. It builds its
//! own evaluator for every target, then loops over the task queue using the
//! demand-driven protocol in [`channel`]:
//!
//! ```text
//! pull ──▶ Evaluate(item) ──▶ evaluate ──▶ push Scored / EvalError ──┐
//!   ▲                                                                │
//!   └────────────────────────────────────────────────────────────────┘
//! pull ──▶ Finished  ──▶ push Finished, exit
//! pull ──▶ Cancelled ──▶ exit silently
//! ```
//!
//! A worker that cannot build its evaluators reports the failure as an
//! evaluation error and acknowledges `Finished` straight away, so the
//! coordinator's accounting still balances.

pub mod channel;

use crate::eval::{build_evaluators, evaluate_work, EvaluatorFactory, TargetSpec};
use crate::Result;
use anyhow::Context;
use channel::{CancelToken, ExecutorEnd, Feedback, Pulled, TaskPuller};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// One local executor
pub struct Worker {
    id: usize,
    specs: Arc<Vec<TargetSpec>>,
    factory: Arc<dyn EvaluatorFactory>,
    puller: TaskPuller,
}

impl Worker {
    pub fn new(
        id: usize,
        specs: Arc<Vec<TargetSpec>>,
        factory: Arc<dyn EvaluatorFactory>,
        end: &ExecutorEnd,
        cancel: &CancelToken,
    ) -> Self {
        Self {
            id,
            specs,
            factory,
            puller: end.puller(cancel.clone()),
        }
    }

    /// Run until `Finished` or cancellation
    pub fn run(mut self) {
        let mut evaluators = match build_evaluators(self.factory.as_ref(), &self.specs, self.id as u64) {
            Ok(evaluators) => evaluators,
            Err(e) => {
                warn!(worker = self.id, "failed to build evaluators: {:#}", e);
                let reported = self.puller.push(Feedback::EvalError {
                    target: None,
                    seed: None,
                    message: format!("worker {} failed to start: {:#}", self.id, e),
                });
                if reported {
                    self.puller.acknowledge_finished();
                }
                return;
            }
        };

        loop {
            match self.puller.pull() {
                Pulled::Work(item) => {
                    let feedback = evaluate_work(&mut evaluators, item);
                    if !self.puller.push(feedback) {
                        debug!(worker = self.id, "feedback queue closed");
                        return;
                    }
                }
                Pulled::Finished => {
                    self.puller.acknowledge_finished();
                    debug!(worker = self.id, "finished");
                    return;
                }
                Pulled::Cancelled => {
                    debug!(worker = self.id, "cancelled");
                    return;
                }
            }
        }
    }
}

/// Start `count` worker threads on `end`
pub fn spawn_local_workers(
    count: usize,
    specs: Arc<Vec<TargetSpec>>,
    factory: Arc<dyn EvaluatorFactory>,
    end: &ExecutorEnd,
    cancel: &CancelToken,
) -> Result<Vec<JoinHandle<()>>> {
    (0..count)
        .map(|id| {
            let worker = Worker::new(id, Arc::clone(&specs), Arc::clone(&factory), end, cancel);
            thread::Builder::new()
                .name(format!("permuter-worker-{}", id))
                .spawn(move || worker.run())
                .with_context(|| format!("Failed to spawn worker thread {}", id))
        })
        .collect()
}
