//! Global tick loop.
//!
//! One background task wakes every `global_tick_interval`, claims the jobs
//! that are due and hands each claim to its own task. Claims still running
//! when the next tick fires are skipped by `claim_due`, so a slow executor
//! never gets the same job twice.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use paygate_core::JobId;

use crate::reconciler::{Outcome, Reconciler};

/// Drives a [`Reconciler`] on a fixed interval.
pub struct PollScheduler {
    reconciler: Arc<Reconciler>,
    tick: Duration,
}

impl PollScheduler {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        let tick = reconciler.config().global_tick_interval;
        Self { reconciler, tick }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Start the loop on the current runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let shutdown = Arc::new(Notify::new());
        let join = tokio::spawn(run(
            Arc::clone(&self.reconciler),
            self.tick,
            Arc::clone(&shutdown),
        ));
        SchedulerHandle {
            shutdown,
            join,
            reconciler: self.reconciler,
        }
    }
}

/// Owner of a running scheduler loop.
pub struct SchedulerHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
    reconciler: Arc<Reconciler>,
}

impl SchedulerHandle {
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Close the registry, stop the loop and abandon running job tasks.
    ///
    /// Returns once the loop has exited. No registry write happens after
    /// this point.
    pub async fn shutdown(self) {
        self.reconciler.begin_shutdown();
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            error!(error = %e, "scheduler loop ended abnormally");
        }
    }
}

async fn run(reconciler: Arc<Reconciler>, tick: Duration, shutdown: Arc<Notify>) {
    info!(tick_ms = tick.as_millis() as u64, "poll scheduler started");

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tasks: JoinSet<(JobId, Outcome)> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!("poll scheduler received shutdown signal");
                break;
            }
            _ = interval.tick() => {
                while let Some(joined) = tasks.try_join_next() {
                    reap(joined);
                }

                let claims = reconciler.claim_due();
                if claims.is_empty() {
                    continue;
                }
                debug!(claims = claims.len(), running = tasks.len(), "tick");

                for claim in claims {
                    let reconciler = Arc::clone(&reconciler);
                    tasks.spawn(async move { (claim.job.id, reconciler.process(claim).await) });
                }
            }
        }
    }

    let abandoned = tasks.len();
    tasks.shutdown().await;
    info!(abandoned, "poll scheduler stopped");
}

fn reap(joined: Result<(JobId, Outcome), tokio::task::JoinError>) {
    match joined {
        Ok((job_id, outcome)) => debug!(job_id = %job_id, ?outcome, "job task finished"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!(error = %e, "job task panicked"),
    }
}
