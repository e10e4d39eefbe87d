//! Architectural performance-monitoring register indices and bit fields
//! (Intel SDM Vol. 3B, chapters 18-20).

/// Number of general-purpose counters that can feed PEBS
pub const NUM_COUNTERS: usize = 4;

/// Width in bits of the general-purpose counters
pub const COUNTER_WIDTH: u32 = 48;

/// Mask selecting the implemented counter bits
pub const COUNTER_MASK: u64 = (1 << COUNTER_WIDTH) - 1;

pub const IA32_PMC0: u32 = 0x0c1;
pub const IA32_PERFEVTSEL0: u32 = 0x186;
pub const IA32_PERF_CAPABILITIES: u32 = 0x345;
pub const IA32_PERF_GLOBAL_STATUS: u32 = 0x38e;
pub const IA32_PERF_GLOBAL_CTRL: u32 = 0x38f;
pub const IA32_PEBS_ENABLE: u32 = 0x3f1;
pub const MSR_PEBS_LD_LAT_THRESHOLD: u32 = 0x3f6;
pub const IA32_DS_AREA: u32 = 0x600;

/// Counter register for general-purpose slot `slot`
pub const fn pmc(slot: usize) -> u32 {
    IA32_PMC0 + slot as u32
}

/// Event select register for general-purpose slot `slot`
pub const fn perfevtsel(slot: usize) -> u32 {
    IA32_PERFEVTSEL0 + slot as u32
}

// IA32_PERFEVTSELx bits
pub const EVTSEL_USR: u64 = 1 << 16;
pub const EVTSEL_OS: u64 = 1 << 17;
pub const EVTSEL_EN: u64 = 1 << 22;

/// First load-latency enable bit in IA32_PEBS_ENABLE
pub const PEBS_LD_LAT_SHIFT: u32 = 32;

/// IA32_PERF_GLOBAL_STATUS bit set when the DS buffer crossed its threshold
pub const GLOBAL_STATUS_OVF_BUFFER: u64 = 1 << 62;

/// PEBS record format field of IA32_PERF_CAPABILITIES, bits 11:8
pub const fn pebs_record_format(capabilities: u64) -> u64 {
    (capabilities >> 8) & 0xf
}
