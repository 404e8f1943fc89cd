//! Job registry: the single shared table of jobs in flight.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use paygate_core::JobId;

use super::types::{Job, JobStatus};

/// Registry abstraction.
///
/// Every operation is atomic with respect to a single job id: nobody ever sees
/// a half-applied mutation. Reads keep working after [`JobRegistry::close`];
/// writes do not.
pub trait JobRegistry: Send + Sync {
    /// Insert a new job.
    fn put(&self, job: Job) -> Result<(), RegistryError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Option<Job>;

    /// Atomic read-modify-write of one job.
    ///
    /// Returns the job as left by `mutation`, or `None` if it is not registered.
    fn update(
        &self,
        job_id: JobId,
        mutation: &mut dyn FnMut(&mut Job),
    ) -> Result<Option<Job>, RegistryError>;

    /// Remove a job, returning its last state.
    fn delete(&self, job_id: JobId) -> Result<Option<Job>, RegistryError>;

    /// Point-in-time copy of every registered job, oldest first.
    fn list_all(&self) -> Vec<Job>;

    /// Number of registered jobs.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse all further writes.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("registry is closed")]
    Closed,
}

#[derive(Debug)]
struct Slot {
    job: Job,
    removed: bool,
}

/// In-memory registry.
///
/// The map lock is held only long enough to find or insert an entry; each job
/// then has its own mutex, so updates to different jobs never wait on each other.
/// `gate` is held shared by every write and exclusively by `close`, which makes
/// "no writes after close" exact rather than best-effort.
#[derive(Debug, Default)]
pub struct InMemoryJobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<Slot>>>>,
    gate: RwLock<bool>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn slot(&self, job_id: JobId) -> Option<Arc<Mutex<Slot>>> {
        self.jobs.read().get(&job_id).cloned()
    }

    /// Count of registered jobs per status.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for job in self.list_all() {
            match job.status {
                JobStatus::AwaitingPayment => stats.awaiting_payment += 1,
                JobStatus::OptimisticallyProcessing => stats.optimistically_processing += 1,
                _ => stats.terminal += 1,
            }
            if job.in_flight {
                stats.in_flight += 1;
            }
        }
        stats
    }
}

/// Registry occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub awaiting_payment: usize,
    pub optimistically_processing: usize,
    /// Terminal jobs not yet removed (only visible mid-transition).
    pub terminal: usize,
    pub in_flight: usize,
}

impl JobRegistry for InMemoryJobRegistry {
    fn put(&self, job: Job) -> Result<(), RegistryError> {
        let closed = self.gate.read();
        if *closed {
            return Err(RegistryError::Closed);
        }
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.id) {
            return Err(RegistryError::AlreadyExists(job.id));
        }
        jobs.insert(
            job.id,
            Arc::new(Mutex::new(Slot {
                job,
                removed: false,
            })),
        );
        Ok(())
    }

    fn get(&self, job_id: JobId) -> Option<Job> {
        let slot = self.slot(job_id)?;
        let slot = slot.lock();
        (!slot.removed).then(|| slot.job.clone())
    }

    fn update(
        &self,
        job_id: JobId,
        mutation: &mut dyn FnMut(&mut Job),
    ) -> Result<Option<Job>, RegistryError> {
        let closed = self.gate.read();
        if *closed {
            return Err(RegistryError::Closed);
        }
        let Some(slot) = self.slot(job_id) else {
            return Ok(None);
        };
        let mut slot = slot.lock();
        if slot.removed {
            return Ok(None);
        }
        mutation(&mut slot.job);
        Ok(Some(slot.job.clone()))
    }

    fn delete(&self, job_id: JobId) -> Result<Option<Job>, RegistryError> {
        let closed = self.gate.read();
        if *closed {
            return Err(RegistryError::Closed);
        }
        let Some(slot) = self.jobs.write().remove(&job_id) else {
            return Ok(None);
        };
        let mut slot = slot.lock();
        slot.removed = true;
        Ok(Some(slot.job.clone()))
    }

    fn list_all(&self) -> Vec<Job> {
        let slots: Vec<_> = self.jobs.read().values().cloned().collect();
        let mut jobs: Vec<Job> = slots
            .iter()
            .filter_map(|slot| {
                let slot = slot.lock();
                (!slot.removed).then(|| slot.job.clone())
            })
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }

    fn len(&self) -> usize {
        self.jobs.read().len()
    }

    fn close(&self) {
        *self.gate.write() = true;
    }

    fn is_closed(&self) -> bool {
        *self.gate.read()
    }
}

impl<R: JobRegistry + ?Sized> JobRegistry for Arc<R> {
    fn put(&self, job: Job) -> Result<(), RegistryError> {
        (**self).put(job)
    }

    fn get(&self, job_id: JobId) -> Option<Job> {
        (**self).get(job_id)
    }

    fn update(
        &self,
        job_id: JobId,
        mutation: &mut dyn FnMut(&mut Job),
    ) -> Result<Option<Job>, RegistryError> {
        (**self).update(job_id, mutation)
    }

    fn delete(&self, job_id: JobId) -> Result<Option<Job>, RegistryError> {
        (**self).delete(job_id)
    }

    fn list_all(&self) -> Vec<Job> {
        (**self).list_all()
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn close(&self) {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}
