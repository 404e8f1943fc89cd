//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated lock-free from per-job tasks.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub submitted: AtomicU64,
    pub invoice_failures: AtomicU64,
    pub status_checks: AtomicU64,
    pub check_errors: AtomicU64,
    pub underpayments: AtomicU64,
    pub optimistic_executions: AtomicU64,
    pub optimistic_failures: AtomicU64,
    pub completed: AtomicU64,
    pub expired: AtomicU64,
    pub failed: AtomicU64,
    pub uncompensated: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReconcilerStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ReconcilerStats {
            submitted: load(&self.submitted),
            invoice_failures: load(&self.invoice_failures),
            status_checks: load(&self.status_checks),
            check_errors: load(&self.check_errors),
            underpayments: load(&self.underpayments),
            optimistic_executions: load(&self.optimistic_executions),
            optimistic_failures: load(&self.optimistic_failures),
            completed: load(&self.completed),
            expired: load(&self.expired),
            failed: load(&self.failed),
            uncompensated: load(&self.uncompensated),
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReconcilerStats {
    pub submitted: u64,
    pub invoice_failures: u64,
    pub status_checks: u64,
    pub check_errors: u64,
    pub underpayments: u64,
    pub optimistic_executions: u64,
    pub optimistic_failures: u64,
    pub completed: u64,
    pub expired: u64,
    pub failed: u64,
    /// Jobs expired after optimistic work was delivered.
    pub uncompensated: u64,
}

impl ReconcilerStats {
    pub fn terminal(&self) -> u64 {
        self.completed + self.expired + self.failed
    }
}
