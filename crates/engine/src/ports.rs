//! Collaborator boundaries.
//!
//! The engine decides *when* these are called; *how* an invoice is issued,
//! settlement is looked up, work is computed or a message reaches the
//! requester is up to the implementations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use paygate_core::JobId;

use crate::jobs::RequestPayload;

/// An issued payment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// Lookup handle for the status checker (e.g. a payment hash).
    pub payment_reference: String,
    /// What the requester is shown and pays (e.g. a bolt11 string).
    pub renderable: String,
}

/// Settlement state as seen by the payee's ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Expired,
}

/// Answer of one status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCheck {
    pub status: PaymentStatus,
    /// Settled amount, when the rail reports it.
    pub amount_paid: Option<u64>,
}

impl PaymentCheck {
    pub fn pending() -> Self {
        Self {
            status: PaymentStatus::Pending,
            amount_paid: None,
        }
    }

    pub fn paid(amount: u64) -> Self {
        Self {
            status: PaymentStatus::Paid,
            amount_paid: Some(amount),
        }
    }

    pub fn expired() -> Self {
        Self {
            status: PaymentStatus::Expired,
            amount_paid: None,
        }
    }
}

/// Kind of a status notification sent to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedbackKind {
    PaymentRequired,
    Processing,
    Success,
    Error,
}

impl std::fmt::Display for FeedbackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FeedbackKind::PaymentRequired => "payment-required",
            FeedbackKind::Processing => "processing",
            FeedbackKind::Success => "success",
            FeedbackKind::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invoice issuance failed: {0}")]
pub struct InvoiceError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("payment status check failed: {0}")]
pub struct CheckError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("execution failed: {0}")]
pub struct ExecutionError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

#[async_trait::async_trait]
pub trait InvoiceIssuer: Send + Sync {
    /// Create a payment request. References must be unique per call.
    async fn issue_invoice(&self, amount_units: u64, memo: &str) -> Result<Invoice, InvoiceError>;
}

#[async_trait::async_trait]
pub trait PaymentStatusChecker: Send + Sync {
    async fn check_status(&self, payment_reference: &str) -> Result<PaymentCheck, CheckError>;
}

/// Performs the paid computation.
#[async_trait::async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, request: &RequestPayload) -> Result<String, ExecutionError>;
}

#[async_trait::async_trait]
pub trait FeedbackPublisher: Send + Sync {
    async fn publish(
        &self,
        job_id: JobId,
        kind: FeedbackKind,
        detail: Option<&str>,
    ) -> Result<(), PublishError>;
}

#[async_trait::async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish_result(
        &self,
        job_id: JobId,
        content: &str,
        amount_units: u64,
        payment_reference: &str,
    ) -> Result<(), PublishError>;
}
