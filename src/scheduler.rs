//! Single-flight release dispatch.
//!
//! The ledger is the source of truth for what is running; the semaphore
//! only serializes dispatch within this process so two code paths (the
//! fast path after a claim and the periodic drain) never race to start
//! work. The permit is released strictly after the terminal write commits,
//! so the next release starts only once the previous outcome is durable.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::executor::Executor;
use crate::ledger::SqliteLedger;

/// What one drain pass did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The queue head was promoted and its release dispatched.
    Dispatched(String),
    /// Nothing to do: queue empty, or a release already running.
    Idle,
    /// A dispatch is already in flight in this process.
    Busy,
}

#[derive(Clone)]
pub struct Scheduler {
    ledger: SqliteLedger,
    executor: Executor,
    permit: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(ledger: SqliteLedger, executor: Executor) -> Self {
        Self {
            ledger,
            executor,
            permit: Arc::new(Semaphore::new(1)),
        }
    }

    /// Fast path for a claim that was created directly in `running`.
    ///
    /// Waits for the permit rather than trying it: the ledger row already
    /// blocks every other dispatch, so the wait is bounded by a concurrent
    /// drain pass observing the row and releasing its permit.
    pub async fn launch(&self, commit_sha: String) {
        match self.permit.clone().acquire_owned().await {
            Ok(permit) => self.spawn_run(commit_sha, permit),
            Err(_) => warn!(commit_sha, "dispatch semaphore closed, release not launched"),
        }
    }

    /// One drain pass: promote the queue head and dispatch it, if possible.
    pub async fn drain_once(&self) -> Result<DrainOutcome, StoreError> {
        let permit = match self.permit.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Ok(DrainOutcome::Busy),
        };
        match self.ledger.dequeue_next(Utc::now())? {
            Some(commit_sha) => {
                info!(commit_sha, "dispatching queued release");
                self.spawn_run(commit_sha.clone(), permit);
                Ok(DrainOutcome::Dispatched(commit_sha))
            }
            None => Ok(DrainOutcome::Idle),
        }
    }

    /// Periodic drain loop; runs until the process exits.
    pub async fn run_ticker(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.drain_once().await {
                warn!(error = %e, "drain pass failed");
            }
        }
    }

    fn spawn_run(&self, commit_sha: String, permit: OwnedSemaphorePermit) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.executor.run_release(&commit_sha).await;
            // Terminal write is durable; let the next release through.
            drop(permit);
            if let Err(e) = scheduler.drain_once().await {
                warn!(error = %e, "post-release drain failed");
            }
        });
    }
}
