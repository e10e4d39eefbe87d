//! # msr
//!
//! Read and write 64-bit model-specific registers on a given logical core.
//!
//! The sampling code only depends on the [`RegisterAccess`] trait. Two
//! transports are provided:
//!
//! - [`MsrFile`] goes through the per-core `/dev/cpu/<n>/msr` device files
//!   exposed by the Linux `msr` driver. The kernel executes the access on the
//!   target core, so the caller may run anywhere.
//! - [`Intrinsic`] issues `rdmsr`/`wrmsr` directly. It only works at
//!   privilege level 0 and always targets the core it executes on.
//!

mod file;
#[cfg(target_arch = "x86_64")]
mod intrinsic;
pub mod registers;

pub use file::*;
#[cfg(target_arch = "x86_64")]
pub use intrinsic::*;

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Index of a logical core as numbered by the operating system
pub type CoreId = usize;

/// Errors that can occur when accessing a register
#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("failed to open register device for core {core}: {source}")]
    Open { core: CoreId, source: io::Error },

    #[error("failed to read register {index:#x} on core {core}: {source}")]
    Read {
        core: CoreId,
        index: u32,
        source: io::Error,
    },

    #[error("failed to write {value:#x} to register {index:#x} on core {core}: {source}")]
    Write {
        core: CoreId,
        index: u32,
        value: u64,
        source: io::Error,
    },

    /// The core was never opened, or opening it failed earlier
    #[error("register device for core {0} is unavailable")]
    Unavailable(CoreId),
}

impl RegisterError {
    /// The core the failed access was aimed at
    pub fn core(&self) -> CoreId {
        match self {
            RegisterError::Open { core, .. }
            | RegisterError::Read { core, .. }
            | RegisterError::Write { core, .. } => *core,
            RegisterError::Unavailable(core) => *core,
        }
    }
}

/// Per-core register access capability
pub trait RegisterAccess: Send + Sync {
    /// Read register `index` on `core`
    fn read(&self, core: CoreId, index: u32) -> Result<u64, RegisterError>;

    /// Write `value` to register `index` on `core`
    fn write(&self, core: CoreId, index: u32, value: u64) -> Result<(), RegisterError>;
}

impl<T: RegisterAccess + ?Sized> RegisterAccess for Arc<T> {
    fn read(&self, core: CoreId, index: u32) -> Result<u64, RegisterError> {
        (**self).read(core, index)
    }

    fn write(&self, core: CoreId, index: u32, value: u64) -> Result<(), RegisterError> {
        (**self).write(core, index, value)
    }
}
