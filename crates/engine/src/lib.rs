//! `paygate-engine`
//!
//! **Responsibility:** pay-per-request job orchestration.
//!
//! A job is admitted with an invoice, polled on a backoff curve until the
//! payment settles, expires or times out, and executed either after
//! confirmation or optimistically once the payment has stayed pending long
//! enough. Every job ends in exactly one terminal status and leaves the
//! registry when it gets there.
//!
//! - [`Reconciler`] owns intake and state transitions
//! - [`PollScheduler`] drives it on a fixed tick
//! - [`ports`] are the seams to invoicing, payment lookup, compute and relays

pub mod config;
pub mod jobs;
pub mod memory;
pub mod policy;
pub mod ports;
pub mod reconciler;
pub mod scheduler;
mod stats;

pub use config::{BackoffPolicy, ConfigError, EngineConfig};
pub use jobs::{
    InMemoryJobRegistry, Job, JobRegistry, JobStatus, JobTransition, RegistryError, RequestPayload,
};
pub use policy::{AttemptThresholdPolicy, NeverOptimistic, OptimisticPolicy};
pub use reconciler::{Action, Claim, Collaborators, ExpiryReason, Outcome, Reconciler, SubmitError};
pub use scheduler::{PollScheduler, SchedulerHandle};
pub use stats::ReconcilerStats;
