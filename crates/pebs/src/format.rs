//! PEBS record layouts.
//!
//! The processor reports its record format in IA32_PERF_CAPABILITIES. Each
//! format extends the previous one with trailing fields, so a record is a
//! fixed basic block followed by zero or more extension words:
//!
//! | format | stride | adds                                    |
//! |--------|--------|-----------------------------------------|
//! | 1      | 0xb0   | flags, ip, GPRs, memory info            |
//! | 2      | 0xc0   | eventing ip, reserved word              |
//! | 3      | 0xc8   | timestamp counter                       |

use std::fmt;
use std::mem::size_of;

use plain::Plain;
use thiserror::Error;

/// Errors that can occur when selecting or applying a record format
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FormatError {
    #[error("unsupported PEBS record format {0}")]
    UnsupportedFormat(u64),

    #[error("record needs {expected} bytes, got {actual}")]
    ShortRecord { expected: usize, actual: usize },
}

/// Largest stride of any known format
pub const MAX_STRIDE: usize = 0xc8;

/// Record format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FormatVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", *self as u8)
    }
}

/// General purpose registers captured by a record, in record order
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl Registers {
    const NAMES: [&'static str; 16] = [
        "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];

    fn words(&self) -> [u64; 16] {
        [
            self.rax, self.rbx, self.rcx, self.rdx, self.rsi, self.rdi, self.rbp, self.rsp,
            self.r8, self.r9, self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
        ]
    }
}

/// The part of a record shared by every format (0x00..0xb0)
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct BasicBlock {
    rflags: u64,
    rip: u64,
    regs: Registers,
    applicable_counters: u64,
    data_linear_address: u64,
    data_source: u64,
    latency: u64,
}
unsafe impl Plain for BasicBlock {}

const BASIC_LEN: usize = size_of::<BasicBlock>();
const EVENTING_IP_OFFSET: usize = 0xb0;
const RESERVED_OFFSET: usize = 0xb8;
const TSC_OFFSET: usize = 0xc0;

/// A decoded sample
///
/// Fields that the active format does not carry are `None`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub rflags: u64,
    /// Instruction pointer after the eventing instruction retired
    pub ip: u64,
    pub regs: Registers,
    /// Counters whose overflow produced this record
    pub applicable_counters: u64,
    pub data_linear_address: u64,
    pub data_source: u64,
    pub latency: u64,
    /// Instruction pointer of the eventing instruction (format 2+)
    pub eventing_ip: Option<u64>,
    pub reserved: Option<u64>,
    /// Timestamp counter at record time (format 3+)
    pub tsc: Option<u64>,
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ip: {:x}, ac: {:x}, dse: {:x}, dla: {:x}, lv: {:x}",
            self.ip,
            self.applicable_counters,
            self.data_source,
            self.data_linear_address,
            self.latency
        )?;
        if let Some(eventing_ip) = self.eventing_ip {
            write!(f, ", eventing ip: {:x}", eventing_ip)?;
        }
        if let Some(tsc) = self.tsc {
            write!(f, ", tsc: {}", tsc)?;
        }
        write!(f, ", flags: {:x}", self.rflags)?;
        for (name, value) in Registers::NAMES.iter().zip(self.regs.words()) {
            write!(f, ", {}: {:x}", name, value)?;
        }
        Ok(())
    }
}

/// The record layout active for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFormat {
    version: FormatVersion,
}

impl RecordFormat {
    pub const fn new(version: FormatVersion) -> Self {
        RecordFormat { version }
    }

    /// Selects the format for a PEBS record format code
    pub fn negotiate(code: u64) -> Result<Self, FormatError> {
        let version = match code {
            1 => FormatVersion::V1,
            2 => FormatVersion::V2,
            3 => FormatVersion::V3,
            other => return Err(FormatError::UnsupportedFormat(other)),
        };
        Ok(Self::new(version))
    }

    /// Selects the format from a raw IA32_PERF_CAPABILITIES value
    pub fn from_capabilities(capabilities: u64) -> Result<Self, FormatError> {
        Self::negotiate(msr::registers::pebs_record_format(capabilities))
    }

    pub fn version(&self) -> FormatVersion {
        self.version
    }

    /// Bytes per record
    pub const fn stride(&self) -> usize {
        match self.version {
            FormatVersion::V1 => 0xb0,
            FormatVersion::V2 => 0xc0,
            FormatVersion::V3 => 0xc8,
        }
    }

    /// Decodes the first `stride()` bytes of `raw`
    pub fn decode(&self, raw: &[u8]) -> Result<Record, FormatError> {
        let stride = self.stride();
        let short = || FormatError::ShortRecord {
            expected: stride,
            actual: raw.len(),
        };
        if raw.len() < stride {
            return Err(short());
        }
        let raw = &raw[..stride];

        // Copied out: slots in the buffer carry no alignment guarantee
        let mut basic = BasicBlock::default();
        if plain::copy_from_bytes(&mut basic, &raw[..BASIC_LEN]).is_err() {
            return Err(short());
        }

        let word = |offset: usize| -> Option<u64> {
            let bytes = raw.get(offset..offset + 8)?;
            Some(u64::from_ne_bytes(bytes.try_into().ok()?))
        };

        Ok(Record {
            rflags: basic.rflags,
            ip: basic.rip,
            regs: basic.regs,
            applicable_counters: basic.applicable_counters,
            data_linear_address: basic.data_linear_address,
            data_source: basic.data_source,
            latency: basic.latency,
            eventing_ip: word(EVENTING_IP_OFFSET),
            reserved: word(RESERVED_OFFSET),
            tsc: word(TSC_OFFSET),
        })
    }

    /// Serialises `record` into exactly `stride()` bytes
    ///
    /// Fields the format does not carry are dropped; absent fields the
    /// format does carry are written as zero.
    pub fn encode(&self, record: &Record) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.stride());
        let mut push = |value: u64| out.extend_from_slice(&value.to_ne_bytes());

        push(record.rflags);
        push(record.ip);
        for reg in record.regs.words() {
            push(reg);
        }
        push(record.applicable_counters);
        push(record.data_linear_address);
        push(record.data_source);
        push(record.latency);
        if self.version >= FormatVersion::V2 {
            push(record.eventing_ip.unwrap_or(0));
            push(record.reserved.unwrap_or(0));
        }
        if self.version >= FormatVersion::V3 {
            push(record.tsc.unwrap_or(0));
        }

        debug_assert_eq!(out.len(), self.stride());
        out
    }
}
