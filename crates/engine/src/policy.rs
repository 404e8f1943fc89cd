//! When to trust a payment nobody has confirmed yet.

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::jobs::{Job, JobStatus};

/// Decides whether a still-pending job should be worked on early.
///
/// Kept separate from the state machine so the trust rule can be swapped
/// (time-based, amount-based, per-requester) without touching transitions.
pub trait OptimisticPolicy: Send + Sync {
    fn should_process(&self, job: &Job, now: DateTime<Utc>) -> bool;
}

/// Trust a payment after a fixed number of pending checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptThresholdPolicy {
    pub threshold: u32,
    /// Cap on optimistic executor invocations for one job.
    pub max_attempts: u32,
}

impl AttemptThresholdPolicy {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            max_attempts: u32::MAX,
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            threshold: cfg.optimistic_threshold,
            max_attempts: cfg.max_optimistic_attempts,
        }
    }
}

impl OptimisticPolicy for AttemptThresholdPolicy {
    fn should_process(&self, job: &Job, now: DateTime<Utc>) -> bool {
        job.status == JobStatus::AwaitingPayment
            && !job.optimistically_executed
            && job.poll_attempts >= self.threshold
            && job.optimistic_attempts < self.max_attempts
            && job.optimistic_retry_after.is_none_or(|at| now >= at)
    }
}

/// Never work before payment is confirmed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverOptimistic;

impl OptimisticPolicy for NeverOptimistic {
    fn should_process(&self, _job: &Job, _now: DateTime<Utc>) -> bool {
        false
    }
}
