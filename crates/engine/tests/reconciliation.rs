//! End-to-end reconciliation runs against in-memory collaborators and a
//! manually driven clock.

use std::sync::Arc;
use std::time::Duration;

use paygate_core::{FakeClock, JobId};
use paygate_engine::memory::{
    InMemoryPublisher, Published, ScriptedJobExecutor, ScriptedPaymentChecker,
    SequentialInvoiceIssuer,
};
use paygate_engine::ports::{CheckError, FeedbackKind, PaymentCheck};
use paygate_engine::{
    Collaborators, EngineConfig, ExpiryReason, InMemoryJobRegistry, JobRegistry, JobStatus,
    JobTransition, NeverOptimistic, Outcome, Reconciler, RegistryError, RequestPayload,
    SubmitError,
};

/// Longer than any backoff delay under the default config.
const STEP: Duration = Duration::from_secs(60);

struct Harness {
    clock: FakeClock,
    registry: Arc<InMemoryJobRegistry>,
    issuer: Arc<SequentialInvoiceIssuer>,
    checker: Arc<ScriptedPaymentChecker>,
    executor: Arc<ScriptedJobExecutor>,
    publisher: Arc<InMemoryPublisher>,
    reconciler: Arc<Reconciler>,
}

impl Harness {
    fn new(config: EngineConfig) -> Self {
        Self::build(config, |r| r)
    }

    fn build(config: EngineConfig, customize: impl FnOnce(Reconciler) -> Reconciler) -> Self {
        let clock = FakeClock::new();
        let registry = InMemoryJobRegistry::arc();
        let issuer = Arc::new(SequentialInvoiceIssuer::new());
        let checker = Arc::new(ScriptedPaymentChecker::new());
        let executor = Arc::new(ScriptedJobExecutor::new());
        let publisher = Arc::new(InMemoryPublisher::new());

        let ports = Collaborators {
            invoices: issuer.clone(),
            checker: checker.clone(),
            executor: executor.clone(),
            feedback: publisher.clone(),
            results: publisher.clone(),
        };
        let reconciler = Reconciler::new(config, registry.clone(), ports)
            .with_clock(Arc::new(clock.clone()));

        Self {
            clock,
            registry,
            issuer,
            checker,
            executor,
            publisher,
            reconciler: Arc::new(customize(reconciler)),
        }
    }

    async fn submit(&self, amount_units: u64) -> JobId {
        self.reconciler
            .submit(RequestPayload::new("summarize this"), amount_units)
            .await
            .unwrap()
    }

    fn reference(&self, id: JobId) -> String {
        self.registry.get(id).unwrap().payment_reference
    }

    /// Advance the clock one step and run a full tick.
    async fn step(&self) -> Vec<(JobId, Outcome)> {
        self.clock.advance(STEP);
        self.reconciler.run_tick().await
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<JobTransition>) -> Vec<JobTransition> {
    let mut out = Vec::new();
    while let Ok(t) = rx.try_recv() {
        out.push(t);
    }
    out
}

fn result_precedes_success(timeline: &[Published]) -> bool {
    let result = timeline
        .iter()
        .position(|p| matches!(p, Published::Result { .. }));
    let success = timeline.iter().position(|p| {
        matches!(
            p,
            Published::Feedback {
                kind: FeedbackKind::Success,
                ..
            }
        )
    });
    matches!((result, success), (Some(r), Some(s)) if r < s)
}

#[tokio::test]
async fn optimistic_execution_then_payment_completes_without_rerun() {
    let h = Harness::new(EngineConfig::default());
    let id = h.submit(10).await;
    let reference = h.reference(id);
    h.checker.script(
        &reference,
        [
            Ok(PaymentCheck::pending()),
            Ok(PaymentCheck::pending()),
            Ok(PaymentCheck::pending()),
            Ok(PaymentCheck::paid(10)),
        ],
    );

    assert_eq!(h.step().await, vec![(id, Outcome::Pending)]);
    assert_eq!(h.step().await, vec![(id, Outcome::Pending)]);
    assert_eq!(h.executor.calls(), 0);

    assert_eq!(h.step().await, vec![(id, Outcome::OptimisticallyExecuted)]);
    assert_eq!(h.executor.calls(), 1);
    assert_eq!(h.publisher.results(id).len(), 1);
    assert_eq!(
        h.publisher.feedback_kinds(id),
        vec![FeedbackKind::PaymentRequired]
    );
    let job = h.registry.get(id).unwrap();
    assert_eq!(job.status, JobStatus::OptimisticallyProcessing);
    assert!(job.optimistically_executed);
    assert!(!job.in_flight);

    assert_eq!(h.step().await, vec![(id, Outcome::Completed)]);
    assert_eq!(h.executor.calls(), 1);
    assert!(h.registry.get(id).is_none());
    assert_eq!(
        h.publisher.feedback_kinds(id),
        vec![FeedbackKind::PaymentRequired, FeedbackKind::Success]
    );
    assert!(result_precedes_success(&h.publisher.timeline(id)));
    assert_eq!(h.checker.checks(&reference), 4);
}

#[tokio::test]
async fn confirmed_payment_executes_once_and_publishes_before_success() {
    let h = Harness::new(EngineConfig::default());
    let id = h.submit(10).await;
    let reference = h.reference(id);
    h.checker.script(
        &reference,
        [Ok(PaymentCheck::pending()), Ok(PaymentCheck::paid(10))],
    );

    h.step().await;
    assert_eq!(h.step().await, vec![(id, Outcome::Completed)]);

    assert_eq!(h.executor.calls(), 1);
    assert_eq!(h.publisher.results(id).len(), 1);
    assert_eq!(
        h.publisher.feedback_kinds(id),
        vec![
            FeedbackKind::PaymentRequired,
            FeedbackKind::Processing,
            FeedbackKind::Success
        ]
    );
    assert!(result_precedes_success(&h.publisher.timeline(id)));
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn invoice_announcement_carries_renderable_request() {
    let h = Harness::new(EngineConfig::default());
    let id = h.submit(42).await;

    let detail = h
        .publisher
        .detail(id, FeedbackKind::PaymentRequired)
        .unwrap();
    assert!(detail.starts_with("lnbc42n1"));
    assert!(detail.ends_with(&h.reference(id)));
}

#[tokio::test]
async fn expired_invoice_ends_job_without_execution() {
    let h = Harness::new(EngineConfig::default());
    let id = h.submit(10).await;
    h.checker
        .script(&h.reference(id), [Ok(PaymentCheck::expired())]);

    assert_eq!(
        h.step().await,
        vec![(
            id,
            Outcome::Expired {
                reason: ExpiryReason::InvoiceExpired,
                uncompensated_work: false
            }
        )]
    );
    assert_eq!(h.executor.calls(), 0);
    assert!(h.registry.is_empty());
    assert_eq!(
        h.publisher.detail(id, FeedbackKind::Error).as_deref(),
        Some("payment expired")
    );
}

#[tokio::test]
async fn repeated_pending_checks_only_update_bookkeeping() {
    let h = Harness::build(EngineConfig::default(), |r| {
        r.with_policy(Arc::new(NeverOptimistic))
    });
    let id = h.submit(10).await;

    for attempt in 1..=5 {
        assert_eq!(h.step().await, vec![(id, Outcome::Pending)]);
        let job = h.registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::AwaitingPayment);
        assert_eq!(job.poll_attempts, attempt);
    }
    assert_eq!(h.executor.calls(), 0);
    assert_eq!(
        h.publisher.feedback_kinds(id),
        vec![FeedbackKind::PaymentRequired]
    );
}

#[tokio::test]
async fn backoff_gates_status_checks() {
    let h = Harness::new(EngineConfig::default());
    let id = h.submit(10).await;
    let reference = h.reference(id);

    // First check is due after the initial delay.
    h.clock.advance(Duration::from_secs(4));
    assert!(h.reconciler.run_tick().await.is_empty());
    h.clock.advance(Duration::from_secs(1));
    assert_eq!(h.reconciler.run_tick().await, vec![(id, Outcome::Pending)]);

    // Second one 7.5s after the first.
    h.clock.advance(Duration::from_secs(7));
    assert!(h.reconciler.run_tick().await.is_empty());
    h.clock.advance(Duration::from_millis(500));
    assert_eq!(h.reconciler.run_tick().await, vec![(id, Outcome::Pending)]);

    assert_eq!(h.checker.checks(&reference), 2);
}

#[tokio::test]
async fn timeout_dominates_backoff() {
    let h = Harness::new(EngineConfig::default());
    let id = h.submit(10).await;
    let reference = h.reference(id);

    // Never polled, but past the timeout: expiry wins.
    h.clock.advance(Duration::from_secs(601));
    assert_eq!(
        h.reconciler.run_tick().await,
        vec![(
            id,
            Outcome::Expired {
                reason: ExpiryReason::TimedOut,
                uncompensated_work: false
            }
        )]
    );
    assert_eq!(h.checker.checks(&reference), 0);
    assert_eq!(
        h.publisher.detail(id, FeedbackKind::Error).as_deref(),
        Some("payment not confirmed in time")
    );
    assert!(h.registry.is_empty());
    assert_eq!(h.reconciler.stats().expired, 1);
}

#[tokio::test]
async fn timeout_after_optimistic_work_flags_uncompensated_execution() {
    let h = Harness::new(EngineConfig::default());
    let mut events = h.reconciler.subscribe();
    let id = h.submit(10).await;

    for _ in 0..3 {
        h.step().await;
    }
    assert_eq!(h.executor.calls(), 1);

    h.clock.advance(Duration::from_secs(600));
    assert_eq!(
        h.reconciler.run_tick().await,
        vec![(
            id,
            Outcome::Expired {
                reason: ExpiryReason::TimedOut,
                uncompensated_work: true
            }
        )]
    );

    let transitions = drain(&mut events);
    let last = transitions.last().unwrap();
    assert_eq!(last.from, JobStatus::OptimisticallyProcessing);
    assert_eq!(last.to, JobStatus::Expired);
    assert!(last.uncompensated_work);
    assert!(
        transitions[..transitions.len() - 1]
            .iter()
            .all(|t| !t.uncompensated_work)
    );
    assert_eq!(h.reconciler.stats().uncompensated, 1);
}

#[tokio::test]
async fn check_errors_keep_the_job_and_retry() {
    let h = Harness::new(EngineConfig::default());
    let id = h.submit(10).await;
    h.checker.script(
        &h.reference(id),
        [
            Err(CheckError("ledger timeout".into())),
            Ok(PaymentCheck::paid(10)),
        ],
    );

    assert_eq!(h.step().await, vec![(id, Outcome::Pending)]);
    let job = h.registry.get(id).unwrap();
    assert_eq!(job.status, JobStatus::AwaitingPayment);
    assert!(!job.in_flight);
    assert_eq!(h.reconciler.stats().check_errors, 1);

    assert_eq!(h.step().await, vec![(id, Outcome::Completed)]);
}

#[tokio::test]
async fn underpayment_is_treated_as_pending() {
    let h = Harness::new(EngineConfig::default());
    let id = h.submit(10).await;
    h.checker
        .script(&h.reference(id), [Ok(PaymentCheck::paid(4))]);

    assert_eq!(h.step().await, vec![(id, Outcome::Pending)]);
    assert_eq!(h.executor.calls(), 0);
    assert_eq!(h.reconciler.stats().underpayments, 1);
}

#[tokio::test]
async fn invoice_failure_fails_the_job_before_polling() {
    let h = Harness::new(EngineConfig::default());
    let mut events = h.reconciler.subscribe();
    h.issuer.fail_next(1);

    let err = h
        .reconciler
        .submit(RequestPayload::new("x"), 10)
        .await
        .unwrap_err();
    let SubmitError::Invoice { job_id, .. } = err else {
        panic!("unexpected error: {err}");
    };

    assert!(h.registry.is_empty());
    assert_eq!(
        h.publisher.feedback_kinds(job_id),
        vec![FeedbackKind::Error]
    );
    let transitions = drain(&mut events);
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].to, JobStatus::Failed);
    assert_eq!(h.reconciler.stats().failed, 1);
    assert!(h.step().await.is_empty());
}

#[tokio::test]
async fn paid_execution_failure_is_terminal() {
    let h = Harness::new(EngineConfig::default());
    let id = h.submit(10).await;
    h.checker
        .script(&h.reference(id), [Ok(PaymentCheck::paid(10))]);
    h.executor.fail_next(1);

    assert_eq!(h.step().await, vec![(id, Outcome::Failed)]);
    assert!(h.registry.is_empty());
    assert!(h.publisher.results(id).is_empty());
    assert_eq!(
        h.publisher.feedback_kinds(id).last(),
        Some(&FeedbackKind::Error)
    );
}

#[tokio::test]
async fn result_publication_failure_on_paid_path_is_terminal() {
    let h = Harness::new(EngineConfig::default());
    let id = h.submit(10).await;
    h.checker
        .script(&h.reference(id), [Ok(PaymentCheck::paid(10))]);
    h.publisher.fail_next_results(1);

    assert_eq!(h.step().await, vec![(id, Outcome::Failed)]);
    assert!(
        !h.publisher
            .feedback_kinds(id)
            .contains(&FeedbackKind::Success)
    );
}

#[tokio::test]
async fn failed_optimistic_attempt_reverts_and_waits_for_cooldown() {
    let config = EngineConfig {
        optimistic_retry_cooldown: Duration::from_secs(120),
        ..EngineConfig::default()
    };
    let h = Harness::new(config);
    let mut events = h.reconciler.subscribe();
    let id = h.submit(10).await;
    h.executor.fail_next(1);

    h.step().await;
    h.step().await;
    assert_eq!(h.step().await, vec![(id, Outcome::OptimisticFailed)]);

    let job = h.registry.get(id).unwrap();
    assert_eq!(job.status, JobStatus::AwaitingPayment);
    assert!(!job.optimistically_executed);
    assert_eq!(job.optimistic_attempts, 1);
    assert!(job.optimistic_retry_after.is_some());
    // No feedback for a failure the requester was never promised anything on.
    assert_eq!(
        h.publisher.feedback_kinds(id),
        vec![FeedbackKind::PaymentRequired]
    );

    // Still cooling down.
    assert_eq!(h.step().await, vec![(id, Outcome::Pending)]);
    assert_eq!(h.executor.calls(), 1);

    assert_eq!(h.step().await, vec![(id, Outcome::OptimisticallyExecuted)]);
    assert_eq!(h.executor.calls(), 2);
    assert_eq!(h.reconciler.stats().optimistic_failures, 1);

    let moves: Vec<_> = drain(&mut events)
        .into_iter()
        .map(|t| (t.from, t.to))
        .collect();
    assert_eq!(
        moves,
        vec![
            (JobStatus::AwaitingPayment, JobStatus::OptimisticallyProcessing),
            (JobStatus::OptimisticallyProcessing, JobStatus::AwaitingPayment),
            (JobStatus::AwaitingPayment, JobStatus::OptimisticallyProcessing),
        ]
    );
}

#[tokio::test]
async fn optimistic_attempts_are_capped() {
    let config = EngineConfig {
        max_optimistic_attempts: 1,
        ..EngineConfig::default()
    };
    let h = Harness::new(config);
    let id = h.submit(10).await;
    h.executor.fail_next(1);

    for _ in 0..6 {
        h.step().await;
    }
    assert_eq!(h.executor.calls(), 1);
    assert_eq!(
        h.registry.get(id).unwrap().status,
        JobStatus::AwaitingPayment
    );
}

#[tokio::test]
async fn free_jobs_run_immediately_when_allowed() {
    let config = EngineConfig {
        allow_free_jobs: true,
        ..EngineConfig::default()
    };
    let h = Harness::new(config);
    let id = h.submit(0).await;

    assert!(h.registry.is_empty());
    assert_eq!(h.issuer.issued(), 0);
    assert_eq!(h.executor.calls(), 1);
    assert_eq!(
        h.publisher.feedback_kinds(id),
        vec![FeedbackKind::Processing, FeedbackKind::Success]
    );
    assert!(result_precedes_success(&h.publisher.timeline(id)));
    assert_eq!(h.reconciler.stats().completed, 1);
}

#[tokio::test]
async fn free_jobs_are_refused_by_default() {
    let h = Harness::new(EngineConfig::default());
    let err = h
        .reconciler
        .submit(RequestPayload::new("x"), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::FreeJobsDisabled));
    assert_eq!(h.executor.calls(), 0);
}

#[tokio::test]
async fn claimed_job_is_not_claimed_again() {
    let h = Harness::new(EngineConfig::default());
    let id = h.submit(10).await;
    h.clock.advance(STEP);

    let first = h.reconciler.claim_due();
    assert_eq!(first.len(), 1);
    assert!(h.reconciler.claim_due().is_empty());

    let claim = first.into_iter().next().unwrap();
    assert_eq!(h.reconciler.process(claim).await, Outcome::Pending);

    h.clock.advance(STEP);
    assert_eq!(h.reconciler.claim_due().len(), 1);
    assert_eq!(h.registry.get(id).unwrap().poll_attempts, 2);
}

#[tokio::test]
async fn no_registry_writes_after_shutdown() {
    let h = Harness::new(EngineConfig::default());
    let id = h.submit(10).await;
    h.checker
        .script(&h.reference(id), [Ok(PaymentCheck::paid(10))]);
    h.clock.advance(STEP);

    let claim = h.reconciler.claim_due().into_iter().next().unwrap();
    h.reconciler.begin_shutdown();
    let before = h.registry.get(id).unwrap();

    assert_eq!(h.reconciler.process(claim).await, Outcome::Abandoned);
    assert!(h.reconciler.claim_due().is_empty());
    assert_eq!(h.registry.get(id).unwrap(), before);
    assert_eq!(h.executor.calls(), 0);

    let err = h
        .reconciler
        .submit(RequestPayload::new("late"), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Registry(RegistryError::Closed)));
}

#[tokio::test]
async fn many_jobs_complete_independently() {
    let h = Harness::new(EngineConfig::default());
    let mut ids = Vec::new();
    for _ in 0..20 {
        let id = h.submit(10).await;
        h.checker
            .script(&h.reference(id), [Ok(PaymentCheck::paid(10))]);
        ids.push(id);
    }

    let outcomes = h.step().await;
    assert_eq!(outcomes.len(), 20);
    assert!(outcomes.iter().all(|(_, o)| *o == Outcome::Completed));
    for id in ids {
        assert_eq!(h.publisher.results(id).len(), 1);
        assert!(result_precedes_success(&h.publisher.timeline(id)));
    }
    assert!(h.registry.is_empty());
    assert_eq!(h.reconciler.stats().terminal(), 20);
}

#[tokio::test]
async fn shutdown_during_paid_execution_sends_no_success() {
    let h = Harness::new(EngineConfig::default());
    let id = h.submit(10).await;
    h.checker
        .script(&h.reference(id), [Ok(PaymentCheck::paid(10))]);
    h.executor.set_delay(Duration::from_millis(50));
    h.clock.advance(STEP);

    let claim = h.reconciler.claim_due().into_iter().next().unwrap();
    let reconciler = Arc::clone(&h.reconciler);
    let task = tokio::spawn(async move { reconciler.process(claim).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    h.reconciler.begin_shutdown();

    assert_eq!(task.await.unwrap(), Outcome::Abandoned);
    assert_eq!(h.executor.calls(), 1);
    assert!(
        !h.publisher
            .feedback_kinds(id)
            .contains(&FeedbackKind::Success)
    );
    assert_eq!(
        h.registry.get(id).unwrap().status,
        JobStatus::AwaitingPayment
    );
    assert_eq!(h.reconciler.stats().completed, 0);
}

#[tokio::test]
async fn invoice_expiry_after_optimistic_work_flags_uncompensated_execution() {
    let h = Harness::new(EngineConfig::default());
    let mut events = h.reconciler.subscribe();
    let id = h.submit(10).await;
    h.checker.script(
        &h.reference(id),
        [
            Ok(PaymentCheck::pending()),
            Ok(PaymentCheck::pending()),
            Ok(PaymentCheck::pending()),
            Ok(PaymentCheck::expired()),
        ],
    );

    for _ in 0..3 {
        h.step().await;
    }
    assert_eq!(
        h.registry.get(id).unwrap().status,
        JobStatus::OptimisticallyProcessing
    );

    assert_eq!(
        h.step().await,
        vec![(
            id,
            Outcome::Expired {
                reason: ExpiryReason::InvoiceExpired,
                uncompensated_work: true
            }
        )]
    );
    assert_eq!(h.executor.calls(), 1);
    assert!(h.registry.is_empty());
    assert_eq!(
        h.publisher.detail(id, FeedbackKind::Error).as_deref(),
        Some("payment expired")
    );

    let last = drain(&mut events).pop().unwrap();
    assert_eq!(last.from, JobStatus::OptimisticallyProcessing);
    assert_eq!(last.to, JobStatus::Expired);
    assert!(last.uncompensated_work);
    assert_eq!(h.reconciler.stats().uncompensated, 1);
}
