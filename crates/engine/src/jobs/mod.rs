//! Jobs and the registry that tracks them.
//!
//! ## Design
//!
//! - One job type, one payment gate, one terminal result
//! - The registry is the only shared mutable state; every mutation is an
//!   atomic read-modify-write on a single job
//! - Jobs leave the registry on their terminal transition

pub mod registry;
pub mod types;

pub use registry::{InMemoryJobRegistry, JobRegistry, RegistryError, RegistryStats};
pub use types::{Job, JobStatus, JobTransition, RequestPayload};
