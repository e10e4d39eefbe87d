//! The DS save area and the PEBS record buffer it describes.
//!
//! The DS area lives at the start of a [`Region`]'s control page and the
//! records start on the next page. Once `IA32_DS_AREA` points at the control
//! page, the processor appends records and advances the PEBS index on its
//! own; software only ever reads the index.
//!
//! There is no backpressure. When the index reaches the absolute maximum the
//! processor stops writing (or raises an interrupt this crate does not
//! service), so samples are dropped under load.

use std::mem::{offset_of, size_of};
use std::ptr;

use msr::registers::NUM_COUNTERS;

use crate::format::RecordFormat;
use crate::storage::Region;

/// 64-bit DS save area layout (Intel SDM Vol. 3B, "DS Save Area")
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DsArea {
    pub bts_buffer_base: u64,
    pub bts_index: u64,
    pub bts_absolute_maximum: u64,
    pub bts_interrupt_threshold: u64,
    pub pebs_buffer_base: u64,
    /// Where the processor writes the next record
    pub pebs_index: u64,
    pub pebs_absolute_maximum: u64,
    pub pebs_interrupt_threshold: u64,
    pub pebs_counter_reset: [u64; NUM_COUNTERS],
    pub reserved: u64,
}

const PEBS_INDEX_OFFSET: usize = offset_of!(DsArea, pebs_index);

/// Record slot at which the threshold interrupt would fire: 90% full, and
/// never beyond the last slot
pub fn threshold_index(capacity: usize) -> usize {
    (capacity - capacity / 10).min(capacity.saturating_sub(1))
}

/// A sampling buffer: allocated region plus initialised DS area
pub struct SampleBuffer {
    region: Region,
    format: RecordFormat,
}

impl SampleBuffer {
    /// Writes a fresh DS area into `region` for records of `format`
    pub fn new(region: Region, format: RecordFormat, resets: &[u64; NUM_COUNTERS]) -> Self {
        debug_assert!(region.stride() >= format.stride());

        let stride = format.stride() as u64;
        let capacity = region.capacity();
        let base = region.records_start() as u64;
        let last = base + (capacity as u64 - 1) * stride;

        let ds = DsArea {
            pebs_buffer_base: base,
            pebs_index: base,
            pebs_absolute_maximum: last,
            pebs_interrupt_threshold: base + threshold_index(capacity) as u64 * stride,
            pebs_counter_reset: *resets,
            ..DsArea::default()
        };

        // Safety: the control page is page aligned and larger than DsArea
        unsafe { ptr::write_volatile(region.header() as *mut DsArea, ds) };

        SampleBuffer { region, format }
    }

    /// Value to program into IA32_DS_AREA
    pub fn ds_address(&self) -> u64 {
        self.region.header() as u64
    }

    pub fn format(&self) -> RecordFormat {
        self.format
    }

    /// Number of record slots the buffer was sized for
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Snapshot of the whole DS area
    pub fn descriptor(&self) -> DsArea {
        // Safety: initialised in new(), aligned, and lives as long as self
        unsafe { ptr::read_volatile(self.region.header() as *const DsArea) }
    }

    /// Current PEBS index as last published by the processor
    pub fn write_cursor(&self) -> u64 {
        // Safety: see descriptor()
        unsafe { ptr::read_volatile(self.region.header().add(PEBS_INDEX_OFFSET) as *const u64) }
    }

    /// Overwrites the PEBS index
    ///
    /// Only sound while the processor is not sampling into this buffer.
    pub fn set_write_cursor(&self, cursor: u64) {
        // Safety: see descriptor()
        unsafe {
            ptr::write_volatile(self.region.header().add(PEBS_INDEX_OFFSET) as *mut u64, cursor)
        }
    }

    /// Number of complete records below `cursor`, clamped to the buffer
    pub fn records_below(&self, cursor: u64) -> usize {
        let base = self.region.records_start() as u64;
        let filled = cursor.saturating_sub(base) / self.format.stride() as u64;
        (filled as usize).min(self.capacity())
    }

    /// Copies record slot `slot` into `out`, which must hold at least one
    /// stride
    pub(crate) fn read_slot(&self, slot: usize, out: &mut [u8]) {
        let stride = self.format.stride();
        assert!(slot < self.capacity() && out.len() >= stride);
        // Safety: slot is within the region and out has room for one record
        unsafe {
            let src = self.region.records_start().add(slot * stride);
            for (i, byte) in out[..stride].iter_mut().enumerate() {
                *byte = ptr::read_volatile(src.add(i));
            }
        }
    }
}

/// Size of the DS area in bytes
pub const DS_AREA_LEN: usize = size_of::<DsArea>();
