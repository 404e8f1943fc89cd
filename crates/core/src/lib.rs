//! `paygate-core` — foundation building blocks.
//!
//! This crate contains **pure** primitives (no IO, no runtime): identifiers,
//! the domain error model and the clock abstraction every timestamp goes through.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, FakeClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
