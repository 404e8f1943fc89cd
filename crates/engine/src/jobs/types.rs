//! Core job types and the reconciliation state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use paygate_core::{DomainError, DomainResult, JobId};

/// What the requester asked to be computed.
///
/// Opaque to the engine; handed to the executor verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub prompt: String,
    /// Model selection, when the requester made one.
    pub model: Option<String>,
    /// Free-form parameters (temperature, size, ...).
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RequestPayload {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Reconciliation status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Invoice issued, settlement not yet observed
    AwaitingPayment,
    /// Work done on trust; settlement still unconfirmed
    OptimisticallyProcessing,
    /// Paid, result published, success reported
    Completed,
    /// Invoice expired or the job aged out
    Expired,
    /// Invoice or paid execution failed
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Expired | JobStatus::Failed
        )
    }

    /// Statuses the scheduler keeps polling.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::AwaitingPayment | JobStatus::OptimisticallyProcessing
        )
    }

    /// Edges of the state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (AwaitingPayment, OptimisticallyProcessing)
                | (AwaitingPayment, Completed)
                | (AwaitingPayment, Expired)
                | (AwaitingPayment, Failed)
                | (OptimisticallyProcessing, AwaitingPayment)
                | (OptimisticallyProcessing, Completed)
                | (OptimisticallyProcessing, Expired)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::AwaitingPayment => "awaiting_payment",
            JobStatus::OptimisticallyProcessing => "optimistically_processing",
            JobStatus::Completed => "completed",
            JobStatus::Expired => "expired",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A paid unit of work tracked until it settles one way or the other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    pub request: RequestPayload,
    /// Handle the status checker looks settlement up by
    pub payment_reference: String,
    /// Price in the rail's smallest unit
    pub amount_units: u64,
    pub created_at: DateTime<Utc>,
    /// Anchor of the backoff curve; equals `created_at` until the first check
    pub last_polled_at: DateTime<Utc>,
    /// Status checks performed so far
    pub poll_attempts: u32,
    /// Executor invoked without confirmed payment and not reverted
    pub optimistically_executed: bool,
    /// Optimistic executor invocations, including failed ones
    pub optimistic_attempts: u32,
    /// No optimistic attempt before this instant
    pub optimistic_retry_after: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// Claimed by the scheduler; work for this job is running
    #[serde(default)]
    pub in_flight: bool,
}

impl Job {
    /// Create a job awaiting payment of an already issued invoice.
    pub fn new(
        id: JobId,
        request: RequestPayload,
        payment_reference: impl Into<String>,
        amount_units: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            request,
            payment_reference: payment_reference.into(),
            amount_units,
            created_at: now,
            last_polled_at: now,
            poll_attempts: 0,
            optimistically_executed: false,
            optimistic_attempts: 0,
            optimistic_retry_after: None,
            status: JobStatus::AwaitingPayment,
            in_flight: false,
        }
    }

    /// Move along a state machine edge.
    pub fn transition(&mut self, next: JobStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(self.status, next));
        }
        self.status = next;
        Ok(())
    }

    /// Polling bookkeeping for one status check.
    pub fn record_poll(&mut self, now: DateTime<Utc>) {
        self.last_polled_at = now;
        self.poll_attempts = self.poll_attempts.saturating_add(1);
    }

    /// Flag the job as running work on trust.
    pub fn mark_optimistic(&mut self) -> DomainResult<()> {
        self.transition(JobStatus::OptimisticallyProcessing)?;
        self.optimistically_executed = true;
        self.optimistic_attempts = self.optimistic_attempts.saturating_add(1);
        self.optimistic_retry_after = None;
        Ok(())
    }

    /// Undo [`Job::mark_optimistic`] after the work failed.
    pub fn revert_optimistic(&mut self, retry_after: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::AwaitingPayment)?;
        self.optimistically_executed = false;
        self.optimistic_retry_after = Some(retry_after);
        Ok(())
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// A status change, as broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobTransition {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
    /// Work was done on trust and payment never arrived.
    pub uncompensated_work: bool,
}
