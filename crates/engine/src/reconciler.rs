//! Reconciliation core: intake, state transitions, execution and expiry.
//!
//! ## Flow
//!
//! - `submit` issues an invoice, announces it and registers the job
//! - `claim_due` picks the jobs that need attention this tick and marks them
//!   in flight in the same atomic registry update, so a job is never worked on
//!   by two tasks at once
//! - `process` runs one claim: a timeout expiry or a status check plus
//!   whatever transition the answer calls for
//!
//! Collaborator failures are translated into transitions and feedback here;
//! nothing escapes to the scheduler loop.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use paygate_core::{Clock, JobId, SystemClock};

use crate::config::{BackoffPolicy, EngineConfig, add_saturating, to_chrono};
use crate::jobs::{Job, JobRegistry, JobStatus, JobTransition, RegistryError, RequestPayload};
use crate::policy::{AttemptThresholdPolicy, OptimisticPolicy};
use crate::ports::{
    FeedbackKind, FeedbackPublisher, InvoiceError, InvoiceIssuer, JobExecutor,
    PaymentStatus, PaymentStatusChecker, ResultPublisher,
};
use crate::stats::{Counters, ReconcilerStats};

const DETAIL_INVOICE_EXPIRED: &str = "payment expired";
const DETAIL_TIMED_OUT: &str = "payment not confirmed in time";
const DETAIL_SHUTTING_DOWN: &str = "service shutting down";

/// The external parties the engine orchestrates.
#[derive(Clone)]
pub struct Collaborators {
    pub invoices: Arc<dyn InvoiceIssuer>,
    pub checker: Arc<dyn PaymentStatusChecker>,
    pub executor: Arc<dyn JobExecutor>,
    pub feedback: Arc<dyn FeedbackPublisher>,
    pub results: Arc<dyn ResultPublisher>,
}

/// Job intake error.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("free jobs are not allowed")]
    FreeJobsDisabled,
    #[error("job {job_id} failed: {source}")]
    Invoice {
        job_id: JobId,
        #[source]
        source: InvoiceError,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What a claimed job is due for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Aged past the job timeout
    Expire,
    /// Backoff elapsed; check payment status
    Poll,
}

/// A job taken by the scheduler for one unit of work.
#[derive(Debug, Clone)]
pub struct Claim {
    /// The job as left by the claiming update.
    pub job: Job,
    pub action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    InvoiceExpired,
    TimedOut,
}

impl ExpiryReason {
    fn detail(self) -> &'static str {
        match self {
            ExpiryReason::InvoiceExpired => DETAIL_INVOICE_EXPIRED,
            ExpiryReason::TimedOut => DETAIL_TIMED_OUT,
        }
    }
}

/// Result of processing one claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing changed beyond polling bookkeeping
    Pending,
    /// Work done and published on trust; job stays registered
    OptimisticallyExecuted,
    /// Work on trust failed; job is back to awaiting payment
    OptimisticFailed,
    Completed,
    Failed,
    Expired {
        reason: ExpiryReason,
        uncompensated_work: bool,
    },
    /// The registry closed underneath us; state left as is
    Abandoned,
}

/// Ties registry, policy and collaborators together.
pub struct Reconciler {
    config: EngineConfig,
    backoff: BackoffPolicy,
    registry: Arc<dyn JobRegistry>,
    ports: Collaborators,
    policy: Arc<dyn OptimisticPolicy>,
    clock: Arc<dyn Clock>,
    counters: Counters,
    events: broadcast::Sender<JobTransition>,
}

impl Reconciler {
    pub fn new(config: EngineConfig, registry: Arc<dyn JobRegistry>, ports: Collaborators) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer_capacity.max(1));
        Self {
            backoff: config.backoff(),
            policy: Arc::new(AttemptThresholdPolicy::from_config(&config)),
            clock: Arc::new(SystemClock),
            config,
            registry,
            ports,
            counters: Counters::default(),
            events,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn OptimisticPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn JobRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.counters.snapshot()
    }

    /// Receive every status transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobTransition> {
        self.events.subscribe()
    }

    /// Stop accepting registry writes; in-flight work ends as `Abandoned`.
    pub fn begin_shutdown(&self) {
        self.registry.close();
    }

    /// Accept a job request. Sole entry point for new jobs.
    pub async fn submit(
        &self,
        request: RequestPayload,
        amount_units: u64,
    ) -> Result<JobId, SubmitError> {
        if amount_units == 0 {
            if !self.config.allow_free_jobs {
                return Err(SubmitError::FreeJobsDisabled);
            }
            return Ok(self.run_free(request).await);
        }
        if self.registry.is_closed() {
            return Err(SubmitError::Registry(RegistryError::Closed));
        }

        let job_id = JobId::new();
        Counters::bump(&self.counters.submitted);

        let memo = format!("paygate job {job_id}");
        let invoice = match self.ports.invoices.issue_invoice(amount_units, &memo).await {
            Ok(invoice) => invoice,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "invoice issuance failed");
                Counters::bump(&self.counters.invoice_failures);
                Counters::bump(&self.counters.failed);
                self.feedback(job_id, FeedbackKind::Error, Some(&e.to_string()))
                    .await;
                self.emit(job_id, JobStatus::AwaitingPayment, JobStatus::Failed, false);
                return Err(SubmitError::Invoice { job_id, source: e });
            }
        };

        let job = Job::new(
            job_id,
            request,
            invoice.payment_reference,
            amount_units,
            self.clock.now(),
        );

        self.feedback(job_id, FeedbackKind::PaymentRequired, Some(&invoice.renderable))
            .await;

        if let Err(e) = self.registry.put(job) {
            warn!(job_id = %job_id, error = %e, "could not register job");
            self.feedback(job_id, FeedbackKind::Error, Some(DETAIL_SHUTTING_DOWN))
                .await;
            return Err(e.into());
        }

        info!(job_id = %job_id, amount_units, "job awaiting payment");
        Ok(job_id)
    }

    /// Claim every job that needs attention now.
    ///
    /// Expiry dominates: a job past its timeout is claimed for expiry no matter
    /// where it is on its backoff curve.
    pub fn claim_due(&self) -> Vec<Claim> {
        let now = self.clock.now();
        let timeout = to_chrono(self.config.job_timeout);
        let mut claims = Vec::new();

        for job in self.registry.list_all() {
            if job.in_flight || !job.status.is_active() {
                continue;
            }

            let mut action = None;
            let claimed = self.registry.update(job.id, &mut |j: &mut Job| {
                if j.in_flight || !j.status.is_active() {
                    return;
                }
                if j.age(now) > timeout {
                    j.in_flight = true;
                    action = Some(Action::Expire);
                } else if self.backoff.next_due(j.last_polled_at, j.poll_attempts) <= now {
                    j.in_flight = true;
                    j.record_poll(now);
                    action = Some(Action::Poll);
                }
            });

            match (claimed, action) {
                (Ok(Some(job)), Some(action)) => {
                    debug!(job_id = %job.id, ?action, attempts = job.poll_attempts, "claimed job");
                    claims.push(Claim { job, action });
                }
                (Ok(_), _) => {}
                (Err(RegistryError::Closed), _) => break,
                (Err(e), _) => warn!(job_id = %job.id, error = %e, "failed to claim job"),
            }
        }

        claims
    }

    /// Run one claim to the end of its transition.
    pub async fn process(&self, claim: Claim) -> Outcome {
        if self.registry.is_closed() {
            return Outcome::Abandoned;
        }
        match claim.action {
            Action::Expire => self.expire(claim.job, ExpiryReason::TimedOut).await,
            Action::Poll => self.poll(claim.job).await,
        }
    }

    /// Claim and process everything due, concurrently, and wait for all of it.
    pub async fn run_tick(self: &Arc<Self>) -> Vec<(JobId, Outcome)> {
        let mut tasks = JoinSet::new();
        for claim in self.claim_due() {
            let this = Arc::clone(self);
            tasks.spawn(async move { (claim.job.id, this.process(claim).await) });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "job task aborted"),
            }
        }
        outcomes
    }

    async fn poll(&self, job: Job) -> Outcome {
        Counters::bump(&self.counters.status_checks);

        let check = match self.ports.checker.check_status(&job.payment_reference).await {
            Ok(check) => check,
            Err(e) => {
                // Transient: keep the job, retry on its next due tick.
                Counters::bump(&self.counters.check_errors);
                warn!(job_id = %job.id, attempts = job.poll_attempts, error = %e, "status check failed");
                return self.release(job.id);
            }
        };

        match check.status {
            PaymentStatus::Paid if check.amount_paid.is_some_and(|paid| paid < job.amount_units) => {
                Counters::bump(&self.counters.underpayments);
                warn!(
                    job_id = %job.id,
                    amount_units = job.amount_units,
                    amount_paid = ?check.amount_paid,
                    "underpaid; treating as pending"
                );
                self.on_pending(job).await
            }
            PaymentStatus::Paid => match job.status {
                JobStatus::AwaitingPayment => self.execute_paid(job).await,
                JobStatus::OptimisticallyProcessing => self.confirm_optimistic(job).await,
                other => {
                    error!(job_id = %job.id, status = ?other, "paid job in unexpected status");
                    self.release(job.id)
                }
            },
            PaymentStatus::Pending => self.on_pending(job).await,
            PaymentStatus::Expired => self.expire(job, ExpiryReason::InvoiceExpired).await,
        }
    }

    async fn on_pending(&self, job: Job) -> Outcome {
        if self.policy.should_process(&job, self.clock.now()) {
            return self.execute_optimistic(job).await;
        }
        debug!(job_id = %job.id, attempts = job.poll_attempts, status = %job.status, "still pending");
        self.release(job.id)
    }

    /// Payment confirmed before any work was done.
    async fn execute_paid(&self, job: Job) -> Outcome {
        info!(job_id = %job.id, "payment confirmed; executing");
        self.feedback(job.id, FeedbackKind::Processing, None).await;

        let content = match self.ports.executor.execute(&job.request).await {
            Ok(content) => content,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "paid execution failed");
                let detail = e.to_string();
                let notice = (FeedbackKind::Error, Some(detail.as_str()));
                return self
                    .finish(&job, JobStatus::Failed, false, notice, Outcome::Failed)
                    .await;
            }
        };

        if let Err(e) = self
            .ports
            .results
            .publish_result(job.id, &content, job.amount_units, &job.payment_reference)
            .await
        {
            warn!(job_id = %job.id, error = %e, "result publication failed");
            let detail = e.to_string();
            let notice = (FeedbackKind::Error, Some(detail.as_str()));
            return self
                .finish(&job, JobStatus::Failed, false, notice, Outcome::Failed)
                .await;
        }

        let notice = (FeedbackKind::Success, None);
        self.finish(&job, JobStatus::Completed, false, notice, Outcome::Completed)
            .await
    }

    /// Payment confirmed after the result already went out.
    async fn confirm_optimistic(&self, job: Job) -> Outcome {
        info!(job_id = %job.id, "payment confirmed for optimistic work");
        let notice = (FeedbackKind::Success, None);
        self.finish(&job, JobStatus::Completed, false, notice, Outcome::Completed)
            .await
    }

    async fn execute_optimistic(&self, job: Job) -> Outcome {
        let mut marked = Ok(());
        match self.registry.update(job.id, &mut |j: &mut Job| marked = j.mark_optimistic()) {
            Ok(Some(_)) => {}
            Ok(None) => return Outcome::Abandoned,
            Err(e) => {
                debug!(job_id = %job.id, error = %e, "optimistic start not recorded");
                return Outcome::Abandoned;
            }
        }
        if let Err(e) = marked {
            error!(job_id = %job.id, error = %e, "cannot start optimistic work");
            return self.release(job.id);
        }

        Counters::bump(&self.counters.optimistic_executions);
        self.emit(
            job.id,
            JobStatus::AwaitingPayment,
            JobStatus::OptimisticallyProcessing,
            false,
        );
        info!(job_id = %job.id, attempts = job.poll_attempts, "executing before payment confirmation");

        let failure = match self.ports.executor.execute(&job.request).await {
            Ok(content) => match self
                .ports
                .results
                .publish_result(job.id, &content, job.amount_units, &job.payment_reference)
                .await
            {
                Ok(()) => None,
                Err(e) => Some(e.to_string()),
            },
            Err(e) => Some(e.to_string()),
        };

        let Some(reason) = failure else {
            return match self.release(job.id) {
                Outcome::Abandoned => Outcome::Abandoned,
                _ => Outcome::OptimisticallyExecuted,
            };
        };

        // No promise was made to the requester yet: revert and try again later.
        Counters::bump(&self.counters.optimistic_failures);
        let cooldown = self
            .backoff
            .delay(job.poll_attempts)
            .max(self.config.optimistic_retry_cooldown);
        let retry_after = add_saturating(self.clock.now(), cooldown);
        warn!(job_id = %job.id, error = %reason, ?cooldown, "optimistic execution failed; reverting");

        let mut reverted = Ok(());
        let updated = self.registry.update(job.id, &mut |j: &mut Job| {
            reverted = j.revert_optimistic(retry_after);
            j.in_flight = false;
        });
        match (updated, reverted) {
            (Ok(Some(_)), Ok(())) => {
                self.emit(
                    job.id,
                    JobStatus::OptimisticallyProcessing,
                    JobStatus::AwaitingPayment,
                    false,
                );
                Outcome::OptimisticFailed
            }
            (Ok(Some(_)), Err(e)) => {
                error!(job_id = %job.id, error = %e, "cannot revert optimistic work");
                Outcome::OptimisticFailed
            }
            (Ok(None), _) | (Err(_), _) => Outcome::Abandoned,
        }
    }

    async fn expire(&self, job: Job, reason: ExpiryReason) -> Outcome {
        let uncompensated = job.optimistically_executed;
        if uncompensated {
            Counters::bump(&self.counters.uncompensated);
            warn!(
                job_id = %job.id,
                uncompensated_work = true,
                amount_units = job.amount_units,
                reason = reason.detail(),
                "job expired after optimistic work was delivered"
            );
        } else {
            info!(job_id = %job.id, reason = reason.detail(), "job expired");
        }

        let notice = (FeedbackKind::Error, Some(reason.detail()));
        let expired = Outcome::Expired {
            reason,
            uncompensated_work: uncompensated,
        };
        self.finish(&job, JobStatus::Expired, uncompensated, notice, expired)
            .await
    }

    /// Zero-priced work, when the deployment allows it: no invoice, no polling.
    async fn run_free(&self, request: RequestPayload) -> JobId {
        let job_id = JobId::new();
        Counters::bump(&self.counters.submitted);
        info!(job_id = %job_id, "free job; executing immediately");
        self.feedback(job_id, FeedbackKind::Processing, None).await;

        let published = match self.ports.executor.execute(&request).await {
            Ok(content) => self
                .ports
                .results
                .publish_result(job_id, &content, 0, "")
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match published {
            Ok(()) => {
                self.feedback(job_id, FeedbackKind::Success, None).await;
                Counters::bump(&self.counters.completed);
                self.emit(job_id, JobStatus::AwaitingPayment, JobStatus::Completed, false);
            }
            Err(reason) => {
                warn!(job_id = %job_id, error = %reason, "free job failed");
                self.feedback(job_id, FeedbackKind::Error, Some(&reason)).await;
                Counters::bump(&self.counters.failed);
                self.emit(job_id, JobStatus::AwaitingPayment, JobStatus::Failed, false);
            }
        }
        job_id
    }

    /// Apply a terminal transition, drop the job from the registry, then tell
    /// the requester.
    ///
    /// `notice` goes out only once both writes landed, so terminal feedback
    /// always matches a terminal status. Yields `done` in that case.
    async fn finish(
        &self,
        job: &Job,
        to: JobStatus,
        uncompensated: bool,
        notice: (FeedbackKind, Option<&str>),
        done: Outcome,
    ) -> Outcome {
        let mut from = job.status;
        let mut moved = Ok(());
        match self.registry.update(job.id, &mut |j: &mut Job| {
            from = j.status;
            moved = j.transition(to);
        }) {
            Ok(Some(_)) => {}
            Ok(None) => return Outcome::Abandoned,
            Err(e) => {
                debug!(job_id = %job.id, error = %e, to = %to, "terminal transition not recorded");
                return Outcome::Abandoned;
            }
        }
        if let Err(e) = moved {
            error!(job_id = %job.id, error = %e, "illegal terminal transition");
            return self.release(job.id);
        }
        if let Err(e) = self.registry.delete(job.id) {
            debug!(job_id = %job.id, error = %e, "terminal job not removed");
            return Outcome::Abandoned;
        }

        let (kind, detail) = notice;
        self.feedback(job.id, kind, detail).await;

        match to {
            JobStatus::Completed => Counters::bump(&self.counters.completed),
            JobStatus::Expired => Counters::bump(&self.counters.expired),
            JobStatus::Failed => Counters::bump(&self.counters.failed),
            _ => {}
        }
        self.emit(job.id, from, to, uncompensated);
        info!(job_id = %job.id, from = %from, to = %to, "job finished");
        done
    }

    /// Drop the in-flight mark, leaving status untouched.
    fn release(&self, job_id: JobId) -> Outcome {
        match self.registry.update(job_id, &mut |j: &mut Job| j.in_flight = false) {
            Ok(Some(_)) => Outcome::Pending,
            Ok(None) => Outcome::Abandoned,
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "claim not released");
                Outcome::Abandoned
            }
        }
    }

    fn emit(&self, job_id: JobId, from: JobStatus, to: JobStatus, uncompensated_work: bool) {
        // Nobody listening is fine.
        let _ = self.events.send(JobTransition {
            job_id,
            from,
            to,
            at: self.clock.now(),
            uncompensated_work,
        });
    }

    async fn feedback(&self, job_id: JobId, kind: FeedbackKind, detail: Option<&str>) {
        if let Err(e) = self.ports.feedback.publish(job_id, kind, detail).await {
            warn!(job_id = %job_id, kind = %kind, error = %e, "feedback publication failed");
        }
    }
}
