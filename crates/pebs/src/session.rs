//! One core's PEBS configuration and buffer.
//!
//! A session moves through `Idle -> Configuring -> Running -> Stopped`.
//! Starting follows the PEBS programming order: global enable is cleared
//! first and set last, and the DS area is live before any event select is
//! armed, so the processor never samples into a half-configured buffer.
//! `pause`/`resume` are an extension that toggles the global enable without
//! releasing the buffer.

use std::fmt;

use log::{debug, info, warn};
use msr::registers::{
    perfevtsel, pmc, IA32_DS_AREA, IA32_PEBS_ENABLE, IA32_PERF_CAPABILITIES,
    IA32_PERF_GLOBAL_CTRL, IA32_PERF_GLOBAL_STATUS, MSR_PEBS_LD_LAT_THRESHOLD, NUM_COUNTERS,
    PEBS_LD_LAT_SHIFT,
};
use msr::{CoreId, RegisterAccess, RegisterError};
use thiserror::Error;

use crate::buffer::SampleBuffer;
use crate::event::{enabled_mask, CounterConfig};
use crate::format::{FormatError, RecordFormat};
use crate::storage::{Allocator, StorageError};
use crate::ErrorKind;

/// Lifecycle phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Configuring,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Configuring => "configuring",
            Phase::Running => "running",
            Phase::Paused => "paused",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Step of the session lifecycle an error happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Negotiate,
    DisableGlobal,
    DisablePebs,
    Allocate,
    ProgramDsArea,
    EnablePebs,
    SeedCounters,
    ProgramEventSelects,
    EnableGlobal,
    Pause,
    Resume,
    Stop,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Negotiate => "format negotiation",
            Stage::DisableGlobal => "global disable",
            Stage::DisablePebs => "PEBS disable",
            Stage::Allocate => "buffer allocation",
            Stage::ProgramDsArea => "DS area programming",
            Stage::EnablePebs => "PEBS enable",
            Stage::SeedCounters => "counter seeding",
            Stage::ProgramEventSelects => "event select programming",
            Stage::EnableGlobal => "global enable",
            Stage::Pause => "pause",
            Stage::Resume => "resume",
            Stage::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while driving a session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("register access failed during {stage}: {source}")]
    Register { stage: Stage, source: RegisterError },

    #[error("buffer allocation failed: {0}")]
    Allocation(#[from] StorageError),

    #[error("{0}")]
    Format(#[from] FormatError),

    #[error("cannot {operation} a session that is {phase}")]
    OrderViolation {
        operation: &'static str,
        phase: Phase,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Register { .. } => ErrorKind::RegisterAccess,
            SessionError::Allocation(_) => ErrorKind::Allocation,
            SessionError::Format(_) => ErrorKind::UnsupportedFormat,
            SessionError::OrderViolation { .. } => ErrorKind::ConfigurationOrderViolation,
            SessionError::InvalidConfig(_) => ErrorKind::InvalidConfiguration,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            SessionError::Register { stage, .. } => Some(*stage),
            SessionError::Allocation(_) => Some(Stage::Allocate),
            SessionError::Format(_) => Some(Stage::Negotiate),
            SessionError::OrderViolation { .. } | SessionError::InvalidConfig(_) => None,
        }
    }
}

/// How large a buffer to allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSize {
    /// A fixed number of record slots
    Records(usize),
    /// As many slots as fit in this many bytes of the negotiated format
    Bytes(usize),
}

impl BufferSize {
    pub fn records(&self, stride: usize) -> usize {
        match *self {
            BufferSize::Records(n) => n,
            BufferSize::Bytes(bytes) => bytes / stride,
        }
    }
}

/// Buffer budget used when none is given
pub const DEFAULT_BUFFER_SIZE: BufferSize = BufferSize::Bytes(64 * 1024);

/// Everything needed to start sampling on one core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub counters: [CounterConfig; NUM_COUNTERS],
    pub buffer: BufferSize,
    /// Minimum load latency in cycles; enables load-latency sampling on
    /// every enabled slot
    pub load_latency: Option<u64>,
}

impl SessionConfig {
    pub fn new(counters: [CounterConfig; NUM_COUNTERS]) -> Self {
        SessionConfig {
            counters,
            buffer: DEFAULT_BUFFER_SIZE,
            load_latency: None,
        }
    }

    pub fn with_buffer(mut self, buffer: BufferSize) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn with_load_latency(mut self, threshold: u64) -> Self {
        self.load_latency = Some(threshold);
        self
    }

    pub fn enabled_mask(&self) -> u64 {
        enabled_mask(&self.counters)
    }
}

/// PEBS sampling state for one logical core
pub struct SamplingSession<A: RegisterAccess> {
    core: CoreId,
    access: A,
    allocator: Allocator,
    config: SessionConfig,
    buffer: Option<SampleBuffer>,
    phase: Phase,
}

impl<A: RegisterAccess> SamplingSession<A> {
    /// Creates an idle session; nothing is programmed until [`start`](Self::start)
    pub fn new(core: CoreId, access: A, allocator: Allocator, config: SessionConfig) -> Self {
        SamplingSession {
            core,
            access,
            allocator,
            config,
            buffer: None,
            phase: Phase::Idle,
        }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Format negotiated at start, while a buffer is live
    pub fn format(&self) -> Option<RecordFormat> {
        self.buffer.as_ref().map(SampleBuffer::format)
    }

    /// The live buffer; only available while running or paused
    pub fn sample_buffer(&self) -> Result<&SampleBuffer, SessionError> {
        self.buffer.as_ref().ok_or(SessionError::OrderViolation {
            operation: "read the buffer of",
            phase: self.phase,
        })
    }

    /// Replaces the counter configuration of an idle session
    pub fn set_counters(
        &mut self,
        counters: [CounterConfig; NUM_COUNTERS],
    ) -> Result<(), SessionError> {
        self.require(Phase::Idle, "reconfigure")?;
        self.config.counters = counters;
        Ok(())
    }

    /// Replaces the whole configuration of an idle session
    pub fn set_config(&mut self, config: SessionConfig) -> Result<(), SessionError> {
        self.require(Phase::Idle, "reconfigure")?;
        self.config = config;
        Ok(())
    }

    /// Programs the PMU and starts sampling
    ///
    /// On failure everything configured so far is torn down, the buffer is
    /// released and the session is back to `Idle`.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.require(Phase::Idle, "start")?;
        self.phase = Phase::Configuring;

        match self.configure() {
            Ok(()) => {
                self.phase = Phase::Running;
                info!(
                    "core {}: sampling started, mask={:#x}",
                    self.core,
                    self.config.enabled_mask()
                );
                Ok(())
            }
            Err(e) => {
                warn!("core {}: start failed: {}", self.core, e);
                self.teardown();
                self.phase = Phase::Idle;
                Err(e)
            }
        }
    }

    fn configure(&mut self) -> Result<(), SessionError> {
        let counters = self.config.counters;
        let mask = enabled_mask(&counters);
        if mask == 0 {
            return Err(SessionError::InvalidConfig("no counter slot is enabled"));
        }

        let capabilities = self.read(Stage::Negotiate, IA32_PERF_CAPABILITIES)?;
        let format = RecordFormat::from_capabilities(capabilities)?;
        let records = self.config.buffer.records(format.stride());
        if records == 0 {
            return Err(SessionError::InvalidConfig("buffer holds no records"));
        }
        debug!(
            "core {}: PEBS record format {}, {} records",
            self.core,
            format.version(),
            records
        );

        self.write(Stage::DisableGlobal, IA32_PERF_GLOBAL_CTRL, 0)?;
        self.write(Stage::DisablePebs, IA32_PEBS_ENABLE, 0)?;

        let resets = counters.map(|c| if c.enabled { c.reset } else { 0 });
        let region = self.allocator.allocate(format.stride(), records)?;
        let buffer = SampleBuffer::new(region, format, &resets);
        let ds_address = buffer.ds_address();
        self.buffer = Some(buffer);

        self.write(Stage::ProgramDsArea, IA32_DS_AREA, ds_address)?;

        let mut pebs_enable = mask;
        if let Some(threshold) = self.config.load_latency {
            self.write(Stage::EnablePebs, MSR_PEBS_LD_LAT_THRESHOLD, threshold)?;
            pebs_enable |= mask << PEBS_LD_LAT_SHIFT;
        }
        self.write(Stage::EnablePebs, IA32_PEBS_ENABLE, pebs_enable)?;

        for (slot, counter) in enabled(&counters) {
            self.write(Stage::SeedCounters, pmc(slot), counter.reset)?;
        }
        for (slot, counter) in enabled(&counters) {
            self.write(Stage::ProgramEventSelects, perfevtsel(slot), counter.event_select())?;
        }

        self.write(Stage::EnableGlobal, IA32_PERF_GLOBAL_CTRL, mask)
    }

    /// Stops sampling, clears every register the session touched and
    /// releases the buffer
    ///
    /// Always completes; the first register failure, if any, is returned
    /// after the buffer has been released.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        let failure = match self.phase {
            Phase::Stopped => return Ok(()),
            // A failed start already tore down
            Phase::Idle => None,
            _ => self.teardown(),
        };
        self.phase = Phase::Stopped;
        info!("core {}: sampling stopped", self.core);

        match failure {
            Some(source) => Err(SessionError::Register {
                stage: Stage::Stop,
                source,
            }),
            None => Ok(()),
        }
    }

    /// Best-effort reset of all sampling registers, then buffer release
    fn teardown(&mut self) -> Option<RegisterError> {
        let mut registers = vec![IA32_PERF_GLOBAL_CTRL, IA32_PEBS_ENABLE, IA32_DS_AREA];
        if self.config.load_latency.is_some() {
            registers.push(MSR_PEBS_LD_LAT_THRESHOLD);
        }
        for slot in 0..NUM_COUNTERS {
            registers.push(perfevtsel(slot));
            registers.push(pmc(slot));
        }

        let mut first_failure = None;
        for index in registers {
            if let Err(e) = self.access.write(self.core, index, 0) {
                warn!("core {}: teardown: {}", self.core, e);
                first_failure.get_or_insert(e);
            }
        }

        // IA32_DS_AREA no longer points here
        self.buffer = None;
        first_failure
    }

    /// Clears the global enable but keeps the buffer, so it can be drained
    /// without the processor appending to it
    pub fn pause(&mut self) -> Result<(), SessionError> {
        self.require(Phase::Running, "pause")?;
        self.write(Stage::Pause, IA32_PERF_GLOBAL_CTRL, 0)?;
        self.phase = Phase::Paused;
        debug!("core {}: sampling paused", self.core);
        Ok(())
    }

    /// Restores the global enable of a paused session
    pub fn resume(&mut self) -> Result<(), SessionError> {
        self.require(Phase::Paused, "resume")?;
        self.write(Stage::Resume, IA32_PERF_GLOBAL_CTRL, self.config.enabled_mask())?;
        self.phase = Phase::Running;
        debug!("core {}: sampling resumed", self.core);
        Ok(())
    }

    /// Rewinds the PEBS index to the buffer base, discarding all records
    pub fn reset_cursor(&mut self) -> Result<(), SessionError> {
        self.require(Phase::Paused, "reset the buffer of")?;
        let buffer = self.sample_buffer()?;
        buffer.set_write_cursor(buffer.descriptor().pebs_buffer_base);
        Ok(())
    }

    /// Raw IA32_PERF_GLOBAL_STATUS of the session's core
    pub fn overflow_status(&self) -> Result<u64, RegisterError> {
        self.access.read(self.core, IA32_PERF_GLOBAL_STATUS)
    }

    fn require(&self, phase: Phase, operation: &'static str) -> Result<(), SessionError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(SessionError::OrderViolation {
                operation,
                phase: self.phase,
            })
        }
    }

    fn read(&self, stage: Stage, index: u32) -> Result<u64, SessionError> {
        self.access
            .read(self.core, index)
            .map_err(|source| SessionError::Register { stage, source })
    }

    fn write(&self, stage: Stage, index: u32, value: u64) -> Result<(), SessionError> {
        self.access
            .write(self.core, index, value)
            .map_err(|source| SessionError::Register { stage, source })
    }
}

impl<A: RegisterAccess> Drop for SamplingSession<A> {
    fn drop(&mut self) {
        // The buffer must not be freed while IA32_DS_AREA still points at it
        if self.buffer.is_some() {
            self.teardown();
        }
    }
}

fn enabled(
    counters: &[CounterConfig; NUM_COUNTERS],
) -> impl Iterator<Item = (usize, &CounterConfig)> {
    counters.iter().enumerate().filter(|(_, c)| c.enabled)
}
