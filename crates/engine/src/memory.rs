//! In-memory collaborators for tests, development and the simulator.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use paygate_core::JobId;

use crate::jobs::RequestPayload;
use crate::ports::{
    CheckError, ExecutionError, FeedbackKind, FeedbackPublisher, Invoice, InvoiceError,
    InvoiceIssuer, JobExecutor, PaymentCheck, PaymentStatus, PaymentStatusChecker, PublishError,
    ResultPublisher,
};

/// Something the engine sent towards the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Published {
    Feedback {
        job_id: JobId,
        kind: FeedbackKind,
        detail: Option<String>,
    },
    Result {
        job_id: JobId,
        content: String,
        amount_units: u64,
        payment_reference: String,
    },
}

impl Published {
    pub fn job_id(&self) -> JobId {
        match self {
            Published::Feedback { job_id, .. } | Published::Result { job_id, .. } => *job_id,
        }
    }
}

/// Feedback and result sink keeping one ordered timeline.
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    inner: Mutex<Vec<Published>>,
    fail_results: AtomicUsize,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` result publications fail.
    pub fn fail_next_results(&self, n: usize) {
        self.fail_results.store(n, Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<Published> {
        self.inner.lock().clone()
    }

    /// Everything published for one job, in order.
    pub fn timeline(&self, job_id: JobId) -> Vec<Published> {
        self.inner
            .lock()
            .iter()
            .filter(|p| p.job_id() == job_id)
            .cloned()
            .collect()
    }

    pub fn feedback_kinds(&self, job_id: JobId) -> Vec<FeedbackKind> {
        self.timeline(job_id)
            .into_iter()
            .filter_map(|p| match p {
                Published::Feedback { kind, .. } => Some(kind),
                Published::Result { .. } => None,
            })
            .collect()
    }

    pub fn results(&self, job_id: JobId) -> Vec<String> {
        self.timeline(job_id)
            .into_iter()
            .filter_map(|p| match p {
                Published::Result { content, .. } => Some(content),
                Published::Feedback { .. } => None,
            })
            .collect()
    }

    /// Detail of the last feedback of `kind` for a job.
    pub fn detail(&self, job_id: JobId, kind: FeedbackKind) -> Option<String> {
        self.timeline(job_id).into_iter().rev().find_map(|p| match p {
            Published::Feedback {
                kind: k, detail, ..
            } if k == kind => detail,
            _ => None,
        })
    }
}

#[async_trait::async_trait]
impl FeedbackPublisher for InMemoryPublisher {
    async fn publish(
        &self,
        job_id: JobId,
        kind: FeedbackKind,
        detail: Option<&str>,
    ) -> Result<(), PublishError> {
        self.inner.lock().push(Published::Feedback {
            job_id,
            kind,
            detail: detail.map(str::to_string),
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResultPublisher for InMemoryPublisher {
    async fn publish_result(
        &self,
        job_id: JobId,
        content: &str,
        amount_units: u64,
        payment_reference: &str,
    ) -> Result<(), PublishError> {
        let failing = self
            .fail_results
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PublishError("relay unavailable".to_string()));
        }
        self.inner.lock().push(Published::Result {
            job_id,
            content: content.to_string(),
            amount_units,
            payment_reference: payment_reference.to_string(),
        });
        Ok(())
    }
}

/// Issues invoices with unique references.
#[derive(Debug, Default)]
pub struct SequentialInvoiceIssuer {
    issued: AtomicU64,
    fail_next: AtomicUsize,
}

impl SequentialInvoiceIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` issuances fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl InvoiceIssuer for SequentialInvoiceIssuer {
    async fn issue_invoice(&self, amount_units: u64, memo: &str) -> Result<Invoice, InvoiceError> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(InvoiceError(format!("wallet refused invoice for {memo:?}")));
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let payment_reference = format!("{n:06}-{}", Uuid::now_v7().simple());
        Ok(Invoice {
            renderable: format!("lnbc{amount_units}n1{payment_reference}"),
            payment_reference,
        })
    }
}

type CheckResponse = Result<PaymentCheck, CheckError>;

/// Status checker driven by per-reference scripts.
///
/// A reference answers from its script first, then from the `settle_after`
/// rule if one is set, then with the fallback.
#[derive(Debug)]
pub struct ScriptedPaymentChecker {
    scripts: Mutex<HashMap<String, VecDeque<CheckResponse>>>,
    checks: Mutex<HashMap<String, u32>>,
    settle_after: Option<u32>,
    fallback: Mutex<PaymentCheck>,
}

impl Default for ScriptedPaymentChecker {
    fn default() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            checks: Mutex::new(HashMap::new()),
            settle_after: None,
            fallback: Mutex::new(PaymentCheck::pending()),
        }
    }
}

impl ScriptedPaymentChecker {
    /// Pending forever unless scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every reference reads as paid from its `n`th check on.
    pub fn settling_after(n: u32) -> Self {
        Self {
            settle_after: Some(n),
            ..Self::default()
        }
    }

    pub fn script(&self, payment_reference: &str, responses: impl IntoIterator<Item = CheckResponse>) {
        self.scripts
            .lock()
            .entry(payment_reference.to_string())
            .or_default()
            .extend(responses);
    }

    pub fn set_fallback(&self, check: PaymentCheck) {
        *self.fallback.lock() = check;
    }

    /// Checks performed for one reference.
    pub fn checks(&self, payment_reference: &str) -> u32 {
        self.checks.lock().get(payment_reference).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl PaymentStatusChecker for ScriptedPaymentChecker {
    async fn check_status(&self, payment_reference: &str) -> Result<PaymentCheck, CheckError> {
        let n = {
            let mut checks = self.checks.lock();
            let n = checks.entry(payment_reference.to_string()).or_insert(0);
            *n += 1;
            *n
        };

        if let Some(next) = self
            .scripts
            .lock()
            .get_mut(payment_reference)
            .and_then(VecDeque::pop_front)
        {
            return next;
        }
        if self.settle_after.is_some_and(|after| n >= after) {
            return Ok(PaymentCheck {
                status: PaymentStatus::Paid,
                amount_paid: None,
            });
        }
        Ok(*self.fallback.lock())
    }
}

/// Executor that echoes the prompt, with scripted failures and latency.
#[derive(Debug, Default)]
pub struct ScriptedJobExecutor {
    calls: AtomicU32,
    running: AtomicU32,
    max_running: AtomicU32,
    fail_next: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    seen: Mutex<Vec<RequestPayload>>,
}

impl ScriptedJobExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` executions fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Simulated compute time per execution.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of executions observed running at once.
    pub fn max_concurrency(&self) -> u32 {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Requests received, in call order.
    pub fn requests(&self) -> Vec<RequestPayload> {
        self.seen.lock().clone()
    }
}

#[async_trait::async_trait]
impl JobExecutor for ScriptedJobExecutor {
    async fn execute(&self, request: &RequestPayload) -> Result<String, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(request.clone());
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.running.fetch_sub(1, Ordering::SeqCst);

        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ExecutionError("model backend unavailable".to_string()));
        }
        Ok(format!("result for: {}", request.prompt))
    }
}
