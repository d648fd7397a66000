//! Ingress Dispatcher: a bounded worker pool that claims pending runs and
//! drives each through the [`AgentLoop`] until it suspends or terminates.
//!
//! Grounded on the teacher's channel-based concurrency idiom (the same
//! `tokio::sync::mpsc` shape as [`crate::bus::EventBus`]) plus a
//! `tokio::sync::Semaphore` to cap concurrently active runs, per spec §4.9.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{error, info, warn};

use crate::agent::AgentLoop;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::ids::RunId;
use crate::scope::Scope;
use crate::store::RunRepository;

/// One unit of submitted work: a run id plus the scope it must be read back
/// under.
#[derive(Debug, Clone)]
pub struct Submission {
    /// The run to claim and drive.
    pub run_id: RunId,
    /// Scope the run was created under.
    pub scope: Scope,
}

/// A cloneable handle onto the dispatcher's intake queue, independent of the
/// running [`Dispatcher`] itself.
///
/// The Swarm Coordinator and Approval Gate both need to re-submit a run they
/// just returned to `pending` (spec §4.2, §4.6), but both are constructed
/// before the [`AgentLoop`] that wraps them, which is itself constructed
/// before the `Dispatcher` that wraps *that*. Splitting the channel's
/// construction out of `Dispatcher::spawn` lets every collaborator hold the
/// same sender from the start, with the `Dispatcher` wired in last.
#[derive(Clone)]
pub struct RunQueue {
    tx: mpsc::Sender<Submission>,
}

impl RunQueue {
    /// Build a bounded channel pair: a cloneable sender-side handle plus the
    /// receiver the eventual `Dispatcher::spawn` call consumes.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Submission>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue a run for a worker to pick up.
    ///
    /// # Errors
    /// Returns `AGENT_ERROR` if the dispatcher's intake loop has shut down.
    pub async fn enqueue(&self, run_id: RunId, scope: Scope) -> Result<()> {
        self.tx
            .send(Submission { run_id, scope })
            .await
            .map_err(|_| RuntimeError::agent("dispatcher queue is closed"))
    }
}

/// Drives submissions pulled off a [`RunQueue`] through the [`AgentLoop`]
/// with no more than `dispatcher_workers` runs active at once.
pub struct Dispatcher {
    queue: RunQueue,
    cancel_all: watch::Sender<bool>,
}

impl Dispatcher {
    /// Spawn the dispatcher's intake loop over an already-built
    /// [`RunQueue`]/receiver pair (see [`RunQueue::channel`]) and return a
    /// handle for submitting work and signalling shutdown.
    #[must_use]
    pub fn spawn(
        queue: RunQueue,
        queue_rx: mpsc::Receiver<Submission>,
        runs: Arc<dyn RunRepository>,
        agent_loop: Arc<AgentLoop>,
        config: RuntimeConfig,
    ) -> Self {
        let (cancel_all, cancel_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(config.dispatcher_workers.max(1)));

        tokio::spawn(Self::intake_loop(queue_rx, runs, agent_loop, semaphore, cancel_rx));

        Self { queue, cancel_all }
    }

    /// A cloneable handle to this dispatcher's intake queue, for collaborators
    /// assembled after the dispatcher itself (tests, callers wiring up a
    /// second enqueuer).
    #[must_use]
    pub fn queue(&self) -> RunQueue {
        self.queue.clone()
    }

    /// Enqueue a run for a worker to pick up. Blocks only on the bounded
    /// queue filling up, never on run execution itself.
    ///
    /// # Errors
    /// Returns an error if the dispatcher's intake loop has shut down.
    pub async fn submit(&self, submission: Submission) -> Result<()> {
        self.queue.enqueue(submission.run_id, submission.scope).await
    }

    /// Signal every in-flight run's cancellation watch and stop accepting
    /// new submissions. Runs already dispatched finish their current step
    /// before observing the signal.
    pub fn shutdown(&self) {
        let _ = self.cancel_all.send(true);
    }

    async fn intake_loop(
        mut rx: mpsc::Receiver<Submission>,
        runs: Arc<dyn RunRepository>,
        agent_loop: Arc<AgentLoop>,
        semaphore: Arc<Semaphore>,
        cancel_rx: watch::Receiver<bool>,
    ) {
        while let Some(submission) = rx.recv().await {
            if *cancel_rx.borrow() {
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let runs = runs.clone();
            let agent_loop = agent_loop.clone();
            let cancel_rx = cancel_rx.clone();

            tokio::spawn(async move {
                let _permit = permit;
                Self::drive_one(submission, runs, agent_loop, cancel_rx).await;
            });
        }
        info!("dispatcher intake loop stopped");
    }

    async fn drive_one(
        submission: Submission,
        runs: Arc<dyn RunRepository>,
        agent_loop: Arc<AgentLoop>,
        cancel_rx: watch::Receiver<bool>,
    ) {
        let claimed = match runs.claim_running(&submission.run_id).await {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(run.id = %submission.run_id, error = %err, "failed to claim run");
                return;
            }
        };
        if !claimed {
            warn!(run.id = %submission.run_id, "run was not pending; skipping");
            return;
        }

        let run = match runs.get(&submission.run_id, &submission.scope).await {
            Ok(run) => run,
            Err(err) => {
                error!(run.id = %submission.run_id, error = %err, "failed to load claimed run");
                return;
            }
        };

        if let Err(err) = agent_loop.drive(&run, &submission.scope, cancel_rx).await {
            warn!(run.id = %submission.run_id, error = %err, "run ended with an error");
        }
    }
}
