use std::arch::asm;

use log::debug;

use crate::{CoreId, RegisterAccess, RegisterError};

/// Register access through the `rdmsr`/`wrmsr` instructions
///
/// Both instructions fault outside ring 0, so this is only usable from a
/// kernel or hypervisor context. The instructions always act on the core
/// executing them: the `core` argument is only used for logging, and callers
/// must run each access on the intended core (e.g. from a per-core
/// broadcast callback).
pub struct Intrinsic {
    _private: (),
}

impl Intrinsic {
    /// Creates the accessor
    ///
    /// # Safety
    ///
    /// The caller must be executing at privilege level 0, and every access
    /// must happen on the core it names.
    pub unsafe fn new() -> Self {
        Intrinsic { _private: () }
    }
}

impl RegisterAccess for Intrinsic {
    fn read(&self, core: CoreId, index: u32) -> Result<u64, RegisterError> {
        let (low, high): (u32, u32);
        // Safety: construction guarantees ring 0
        unsafe {
            asm!("rdmsr", in("ecx") index, out("eax") low, out("edx") high, options(nomem, nostack, preserves_flags));
        }
        let value = (u64::from(high) << 32) | u64::from(low);
        debug!("c{} read msr={:#x} val={:#x}", core, index, value);
        Ok(value)
    }

    fn write(&self, core: CoreId, index: u32, value: u64) -> Result<(), RegisterError> {
        debug!("c{} write msr={:#x} val={:#x}", core, index, value);
        let low = value as u32;
        let high = (value >> 32) as u32;
        // Safety: construction guarantees ring 0
        unsafe {
            asm!("wrmsr", in("ecx") index, in("eax") low, in("edx") high, options(nostack, preserves_flags));
        }
        Ok(())
    }
}
