//! # pebs
//!
//! Precise event-based sampling on Intel processors.
//!
//! A [`SamplingSession`] owns one core's sample buffer and counter
//! configuration and programs the PMU registers through a
//! [`msr::RegisterAccess`] implementation. Once started, the processor writes
//! fixed-stride records into the buffer on its own; [`drain`] and friends
//! read them back as [`Record`]s, decoded according to the [`RecordFormat`]
//! negotiated from `IA32_PERF_CAPABILITIES`.
//!
//! [`PerCoreManager`] runs one session per core and reports per-core
//! failures instead of aborting. [`SimulatedPmu`] models the PMU in memory
//! for tests and dry runs.
//!

mod broadcast;
mod buffer;
mod drain;
mod event;
mod format;
mod manager;
mod session;
pub mod sim;
mod storage;

pub use broadcast::*;
pub use buffer::*;
pub use drain::*;
pub use event::*;
pub use format::*;
pub use manager::*;
pub use session::*;
pub use sim::SimulatedPmu;
pub use storage::*;

use std::fmt;

/// Coarse classification of a failure, shared by every error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A register read or write failed
    RegisterAccess,
    /// The sample buffer could not be allocated
    Allocation,
    /// The processor reports a PEBS record format this crate cannot decode
    UnsupportedFormat,
    /// The operation is not valid in the session's current phase
    ConfigurationOrderViolation,
    /// The configuration cannot produce any samples
    InvalidConfiguration,
    /// Work could not be dispatched to the core
    Affinity,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::RegisterAccess => "register access",
            ErrorKind::Allocation => "allocation",
            ErrorKind::UnsupportedFormat => "unsupported format",
            ErrorKind::ConfigurationOrderViolation => "configuration order violation",
            ErrorKind::InvalidConfiguration => "invalid configuration",
            ErrorKind::Affinity => "affinity",
        };
        f.write_str(name)
    }
}
