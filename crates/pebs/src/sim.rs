//! A software model of the PEBS-capable PMU.
//!
//! [`SimulatedPmu`] is a [`RegisterAccess`] backed by an in-memory register
//! file per core, plus a PEBS assist: [`SimulatedPmu::retire`] counts events
//! on the programmed counters and, on overflow, writes a record into the DS
//! area whose address was programmed into `IA32_DS_AREA`, advances the PEBS
//! index and reloads the counter from the DS area's reset value. It follows
//! the same rules as the hardware: nothing counts without the global enable,
//! records are dropped once the index reaches the absolute maximum, and
//! crossing the interrupt threshold sets the buffer overflow status bit.

use std::collections::{HashMap, HashSet};
use std::mem::offset_of;
use std::ptr;
use std::sync::{Mutex, MutexGuard};

use msr::registers::{
    perfevtsel, pmc, COUNTER_MASK, EVTSEL_EN, GLOBAL_STATUS_OVF_BUFFER, IA32_DS_AREA,
    IA32_PEBS_ENABLE, IA32_PERF_CAPABILITIES, IA32_PERF_GLOBAL_CTRL, IA32_PERF_GLOBAL_STATUS,
    NUM_COUNTERS,
};
use msr::{CoreId, RegisterAccess, RegisterError};

use crate::buffer::DsArea;
use crate::event::Event;
use crate::format::{FormatVersion, Record, RecordFormat, Registers};

#[derive(Default)]
struct CoreState {
    registers: HashMap<u32, u64>,
    writes: Vec<(u32, u64)>,
    failing: bool,
    rejected_writes: HashSet<(u32, u64)>,
    samples: u64,
}

impl CoreState {
    fn get(&self, index: u32) -> u64 {
        self.registers.get(&index).copied().unwrap_or(0)
    }
}

/// In-memory PMU model for tests and dry runs
pub struct SimulatedPmu {
    capabilities: u64,
    cores: Vec<Mutex<CoreState>>,
}

impl SimulatedPmu {
    /// A PMU reporting PEBS record format `version` on `num_cores` cores
    pub fn new(num_cores: usize, version: FormatVersion) -> Self {
        Self::with_capabilities(num_cores, (version as u64) << 8)
    }

    /// A PMU reporting a raw IA32_PERF_CAPABILITIES value
    pub fn with_capabilities(num_cores: usize, capabilities: u64) -> Self {
        SimulatedPmu {
            capabilities,
            cores: (0..num_cores).map(|_| Mutex::default()).collect(),
        }
    }

    fn state(&self, core: CoreId) -> Option<MutexGuard<'_, CoreState>> {
        let state = self.cores.get(core)?;
        Some(state.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Current value of a register, bypassing failure injection
    pub fn register(&self, core: CoreId, index: u32) -> u64 {
        self.state(core).map_or(0, |s| s.get(index))
    }

    /// Every successful write to `core`, oldest first
    pub fn write_log(&self, core: CoreId) -> Vec<(u32, u64)> {
        self.state(core).map_or_else(Vec::new, |s| s.writes.clone())
    }

    /// Makes every access to `core` fail until cleared
    pub fn set_failing(&self, core: CoreId, failing: bool) {
        if let Some(mut s) = self.state(core) {
            s.failing = failing;
        }
    }

    /// Makes writes of exactly `value` to `index` on `core` fail
    pub fn fail_writes_to(&self, core: CoreId, index: u32, value: u64) {
        if let Some(mut s) = self.state(core) {
            s.rejected_writes.insert((index, value));
        }
    }

    /// Retires `count` occurrences of `event` on `core`
    ///
    /// Returns the number of records written.
    ///
    /// # Safety
    ///
    /// Like the real PEBS assist, this writes through the address held in
    /// `IA32_DS_AREA`. The register must be zero or point at a live DS area
    /// whose buffer is not concurrently accessed by another thread.
    /// [`SamplingSession`](crate::SamplingSession) upholds this by clearing
    /// the register before releasing its buffer.
    pub unsafe fn retire(&self, core: CoreId, event: Event, count: u64) -> usize {
        let Some(mut state) = self.state(core) else {
            return 0;
        };
        let global = state.get(IA32_PERF_GLOBAL_CTRL);
        let pebs = state.get(IA32_PEBS_ENABLE);
        let mut written = 0;

        for slot in 0..NUM_COUNTERS {
            let select = state.get(perfevtsel(slot));
            let counts = global & (1 << slot) != 0
                && select & EVTSEL_EN != 0
                && select as u8 == event.code
                && (select >> 8) as u8 == event.umask;
            if !counts {
                continue;
            }

            let mut counter = state.get(pmc(slot)) & COUNTER_MASK;
            let mut remaining = count;
            while remaining > 0 {
                let to_overflow = COUNTER_MASK + 1 - counter;
                if remaining < to_overflow {
                    counter += remaining;
                    break;
                }
                remaining -= to_overflow;
                counter = 0;

                if pebs & (1 << slot) == 0 {
                    let status = state.get(IA32_PERF_GLOBAL_STATUS) | 1 << slot;
                    state.registers.insert(IA32_PERF_GLOBAL_STATUS, status);
                    continue;
                }

                let ds = state.get(IA32_DS_AREA);
                if ds == 0 {
                    continue;
                }
                if self.assist(&mut state, ds as *mut DsArea, slot) {
                    written += 1;
                }
                let reset = ptr::read_volatile(
                    (ds as *const u8).add(offset_of!(DsArea, pebs_counter_reset) + slot * 8)
                        as *const u64,
                );
                counter = reset & COUNTER_MASK;
            }
            state.registers.insert(pmc(slot), counter);
        }

        written
    }

    /// Appends one record for `slot`; false when the buffer is full
    unsafe fn assist(&self, state: &mut CoreState, ds: *mut DsArea, slot: usize) -> bool {
        let Ok(format) = RecordFormat::from_capabilities(self.capabilities) else {
            return false;
        };
        let area = ptr::read_volatile(ds);
        let stride = format.stride() as u64;

        if area.pebs_index >= area.pebs_absolute_maximum {
            let status = state.get(IA32_PERF_GLOBAL_STATUS) | GLOBAL_STATUS_OVF_BUFFER;
            state.registers.insert(IA32_PERF_GLOBAL_STATUS, status);
            return false;
        }

        state.samples += 1;
        let raw = format.encode(&synthetic_record(format.version(), slot, state.samples));
        let dst = area.pebs_index as *mut u8;
        for (i, byte) in raw.iter().enumerate() {
            ptr::write_volatile(dst.add(i), *byte);
        }

        let index = area.pebs_index + stride;
        ptr::write_volatile(ptr::addr_of_mut!((*ds).pebs_index), index);

        if index >= area.pebs_interrupt_threshold {
            let status = state.get(IA32_PERF_GLOBAL_STATUS) | GLOBAL_STATUS_OVF_BUFFER;
            state.registers.insert(IA32_PERF_GLOBAL_STATUS, status);
        }
        true
    }
}

/// Plausible record contents for the `n`th sample
fn synthetic_record(version: FormatVersion, slot: usize, n: u64) -> Record {
    let ip = 0x40_1000 + n * 0x10;
    Record {
        rflags: 0x246,
        ip,
        regs: Registers {
            rax: n,
            rsp: 0x7ffd_0000_0000 - n * 8,
            ..Registers::default()
        },
        applicable_counters: 1 << slot,
        data_linear_address: 0x7f00_0000_0000 + n * 64,
        data_source: 0x1,
        latency: 200 + n % 100,
        eventing_ip: (version >= FormatVersion::V2).then_some(ip - 4),
        reserved: (version >= FormatVersion::V2).then_some(0),
        tsc: (version >= FormatVersion::V3).then_some(n * 1000),
    }
}

impl RegisterAccess for SimulatedPmu {
    fn read(&self, core: CoreId, index: u32) -> Result<u64, RegisterError> {
        let state = self.state(core).ok_or(RegisterError::Unavailable(core))?;
        if state.failing {
            return Err(RegisterError::Unavailable(core));
        }
        if index == IA32_PERF_CAPABILITIES {
            return Ok(self.capabilities);
        }
        Ok(state.get(index))
    }

    fn write(&self, core: CoreId, index: u32, value: u64) -> Result<(), RegisterError> {
        let mut state = self.state(core).ok_or(RegisterError::Unavailable(core))?;
        if state.failing {
            return Err(RegisterError::Unavailable(core));
        }
        if state.rejected_writes.contains(&(index, value)) {
            return Err(RegisterError::Write {
                core,
                index,
                value,
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        state.writes.push((index, value));
        state.registers.insert(index, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SampleBuffer;
    use crate::storage::{Allocator, Backing};

    fn armed(pmu: &SimulatedPmu, buffer: &SampleBuffer, event: Event, reset: u64) {
        pmu.write(0, IA32_DS_AREA, buffer.ds_address()).unwrap();
        pmu.write(0, IA32_PEBS_ENABLE, 0x1).unwrap();
        pmu.write(0, pmc(0), reset).unwrap();
        pmu.write(0, perfevtsel(0), event.raw() as u64 | EVTSEL_EN).unwrap();
        pmu.write(0, IA32_PERF_GLOBAL_CTRL, 0x1).unwrap();
    }

    #[test]
    fn test_capabilities() {
        let pmu = SimulatedPmu::new(2, FormatVersion::V2);
        assert_eq!(pmu.read(1, IA32_PERF_CAPABILITIES).unwrap(), 0x200);
        assert!(matches!(
            pmu.read(2, IA32_PERF_CAPABILITIES),
            Err(RegisterError::Unavailable(2))
        ));
    }

    #[test]
    fn test_failure_injection() {
        let pmu = SimulatedPmu::new(1, FormatVersion::V1);
        pmu.fail_writes_to(0, IA32_PEBS_ENABLE, 0xf);
        assert!(pmu.write(0, IA32_PEBS_ENABLE, 0xf).is_err());
        pmu.write(0, IA32_PEBS_ENABLE, 0x1).unwrap();
        assert_eq!(pmu.write_log(0), vec![(IA32_PEBS_ENABLE, 0x1)]);

        pmu.set_failing(0, true);
        assert!(pmu.read(0, IA32_PEBS_ENABLE).is_err());
        pmu.set_failing(0, false);
        assert_eq!(pmu.read(0, IA32_PEBS_ENABLE).unwrap(), 0x1);
    }

    #[test]
    fn test_counts_without_pebs_set_status() {
        let pmu = SimulatedPmu::new(1, FormatVersion::V1);
        let event = Event::LLC_MISSES;
        pmu.write(0, pmc(0), 10u64.wrapping_neg()).unwrap();
        pmu.write(0, perfevtsel(0), event.raw() as u64 | EVTSEL_EN)
            .unwrap();
        pmu.write(0, IA32_PERF_GLOBAL_CTRL, 0x1).unwrap();

        assert_eq!(unsafe { pmu.retire(0, event, 15) }, 0);
        assert_eq!(pmu.register(0, pmc(0)), 5);
        assert_eq!(pmu.register(0, IA32_PERF_GLOBAL_STATUS), 0x1);
    }

    #[test]
    fn test_global_disable_stops_counting() {
        let pmu = SimulatedPmu::new(1, FormatVersion::V1);
        let event = Event::LLC_MISSES;
        pmu.write(0, perfevtsel(0), event.raw() as u64 | EVTSEL_EN)
            .unwrap();

        assert_eq!(unsafe { pmu.retire(0, event, 1000) }, 0);
        assert_eq!(pmu.register(0, pmc(0)), 0);
    }

    #[test]
    fn test_assist_writes_and_reloads() {
        let format = RecordFormat::new(FormatVersion::V3);
        let allocator = Allocator::new(Backing::Memory);
        let region = allocator.allocate(format.stride(), 8).unwrap();
        let reset = 100u64.wrapping_neg();
        let buffer = SampleBuffer::new(region, format, &[reset, 0, 0, 0]);

        let pmu = SimulatedPmu::new(1, FormatVersion::V3);
        let event = Event::MEM_LOAD_L2_MISS;
        armed(&pmu, &buffer, event, reset);

        // Events that do not match the event select are ignored
        assert_eq!(unsafe { pmu.retire(0, Event::LLC_MISSES, 500) }, 0);

        assert_eq!(unsafe { pmu.retire(0, event, 99) }, 0);
        assert_eq!(unsafe { pmu.retire(0, event, 1) }, 1);
        assert_eq!(unsafe { pmu.retire(0, event, 250) }, 2);
        assert_eq!(pmu.register(0, pmc(0)), reset.wrapping_add(50) & COUNTER_MASK);

        let base = buffer.descriptor().pebs_buffer_base;
        assert_eq!(buffer.write_cursor(), base + 3 * format.stride() as u64);
    }

    #[test]
    fn test_full_buffer_drops_records() {
        let format = RecordFormat::new(FormatVersion::V1);
        let allocator = Allocator::new(Backing::Memory);
        let region = allocator.allocate(format.stride(), 4).unwrap();
        let reset = 1u64.wrapping_neg();
        let buffer = SampleBuffer::new(region, format, &[reset, 0, 0, 0]);

        let pmu = SimulatedPmu::new(1, FormatVersion::V1);
        let event = Event::PRECISE_STORE;
        armed(&pmu, &buffer, event, reset);

        // Slots up to the absolute maximum are usable
        assert_eq!(unsafe { pmu.retire(0, event, 10) }, 3);
        let ds = buffer.descriptor();
        assert_eq!(ds.pebs_index, ds.pebs_absolute_maximum);
        assert_ne!(pmu.register(0, IA32_PERF_GLOBAL_STATUS) & GLOBAL_STATUS_OVF_BUFFER, 0);
    }
}
