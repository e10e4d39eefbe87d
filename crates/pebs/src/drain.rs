//! Reading records out of a session's buffer.
//!
//! A drain snapshots the PEBS index once, when it is created, and walks the
//! records below it in write order. It never rereads the index, so it always
//! terminates even while the processor keeps appending. Draining a running
//! session therefore yields a point-in-time prefix and may even observe a
//! tail record that is still being written; pause the session first for a
//! complete and consistent view.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use log::{info, warn};
use msr::RegisterAccess;
use thiserror::Error;

use crate::buffer::SampleBuffer;
use crate::format::{Record, MAX_STRIDE};
use crate::session::{SamplingSession, SessionError};

/// Errors that can occur when draining to a sink
#[derive(Error, Debug)]
pub enum DrainError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("failed to write records: {0}")]
    Io(#[from] io::Error),
}

/// Finite iterator over the records present when it was created
pub struct Drain<'a> {
    buffer: &'a SampleBuffer,
    next: usize,
    end: usize,
    scratch: [u8; MAX_STRIDE],
}

impl<'a> Drain<'a> {
    pub fn new(buffer: &'a SampleBuffer) -> Self {
        let end = buffer.records_below(buffer.write_cursor());
        Drain {
            buffer,
            next: 0,
            end,
            scratch: [0; MAX_STRIDE],
        }
    }

    /// Raw bytes of the next record, exactly one stride long
    pub fn next_raw(&mut self) -> Option<&[u8]> {
        if self.next >= self.end {
            return None;
        }
        self.buffer.read_slot(self.next, &mut self.scratch);
        self.next += 1;
        Some(&self.scratch[..self.buffer.format().stride()])
    }
}

impl Iterator for Drain<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        let format = self.buffer.format();
        let raw = self.next_raw()?;
        match format.decode(raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("undecodable record: {}", e);
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Drain<'_> {}

/// Starts a drain of `session`'s buffer
pub fn drain<A: RegisterAccess>(session: &SamplingSession<A>) -> Result<Drain<'_>, SessionError> {
    Ok(Drain::new(session.sample_buffer()?))
}

/// Drains `session` into a vector
pub fn collect<A: RegisterAccess>(session: &SamplingSession<A>) -> Result<Vec<Record>, SessionError> {
    Ok(drain(session)?.collect())
}

/// Writes every record's raw bytes to `sink`, oldest first
///
/// The output has no header: readers must know the record format that was
/// active. Returns the number of records written.
pub fn dump_to_sink<A: RegisterAccess, W: Write>(
    session: &SamplingSession<A>,
    sink: &mut W,
) -> Result<usize, DrainError> {
    let mut records = drain(session)?;
    let mut count = 0;
    while let Some(raw) = records.next_raw() {
        sink.write_all(raw)?;
        count += 1;
    }
    sink.flush()?;
    Ok(count)
}

/// Appends every record's raw bytes to the file at `path`, creating it if
/// needed
pub fn dump_to_file<A: RegisterAccess>(
    session: &SamplingSession<A>,
    path: impl AsRef<Path>,
) -> Result<usize, DrainError> {
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path.as_ref())?;
    dump_to_sink(session, &mut file)
}

/// Logs the buffer bounds and every record at info level
pub fn log_records<A: RegisterAccess>(session: &SamplingSession<A>) -> Result<usize, SessionError> {
    let buffer = session.sample_buffer()?;
    let ds = buffer.descriptor();
    info!(
        "core {}: pebs_base: {:x}, pebs_index: {:x}, pebs_max: {:x}",
        session.core(),
        ds.pebs_buffer_base,
        ds.pebs_index,
        ds.pebs_absolute_maximum
    );

    let mut count = 0;
    for (n, record) in Drain::new(buffer).enumerate() {
        info!("core {}: {}: {}", session.core(), n, record);
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{counters, CounterConfig, Event, SampleFrequency};
    use crate::format::FormatVersion;
    use crate::session::{BufferSize, SessionConfig};
    use crate::sim::SimulatedPmu;
    use crate::storage::{Allocator, Backing};
    use std::sync::Arc;

    fn running(version: FormatVersion, period: u64) -> (Arc<SimulatedPmu>, SamplingSession<Arc<SimulatedPmu>>) {
        let pmu = Arc::new(SimulatedPmu::new(1, version));
        let config = SessionConfig::new(counters(&[(
            0,
            CounterConfig::sampling(Event::MEM_LOAD_L2_MISS, SampleFrequency(period)),
        )]))
        .with_buffer(BufferSize::Records(32));
        let mut session =
            SamplingSession::new(0, pmu.clone(), Allocator::new(Backing::Memory), config);
        session.start().unwrap();
        (pmu, session)
    }

    #[test]
    fn test_drain_empty() {
        let (_pmu, session) = running(FormatVersion::V1, 10);
        assert_eq!(drain(&session).unwrap().len(), 0);
        assert!(collect(&session).unwrap().is_empty());
    }

    #[test]
    fn test_drain_requires_buffer() {
        let pmu = Arc::new(SimulatedPmu::new(1, FormatVersion::V1));
        let session = SamplingSession::new(
            0,
            pmu,
            Allocator::new(Backing::Memory),
            SessionConfig::new(counters(&[])),
        );
        assert!(drain(&session).is_err());
    }

    #[test]
    fn test_drain_is_a_snapshot() {
        let (pmu, session) = running(FormatVersion::V2, 10);
        unsafe { pmu.retire(0, Event::MEM_LOAD_L2_MISS, 30) };

        let mut records = drain(&session).unwrap();
        assert_eq!(records.len(), 3);
        let first = records.next().unwrap();

        // Records appended mid-walk are not picked up
        unsafe { pmu.retire(0, Event::MEM_LOAD_L2_MISS, 50) };
        assert_eq!(records.count(), 2);
        assert_eq!(first.applicable_counters, 0x1);
        assert!(first.eventing_ip.is_some());

        assert_eq!(collect(&session).unwrap().len(), 8);
    }

    #[test]
    fn test_dump_appends_raw_records() {
        let (pmu, mut session) = running(FormatVersion::V3, 10);
        unsafe { pmu.retire(0, Event::MEM_LOAD_L2_MISS, 40) };
        session.pause().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pebs.out");
        std::fs::write(&path, b"previous").unwrap();

        assert_eq!(dump_to_file(&session, &path).unwrap(), 4);
        assert_eq!(dump_to_file(&session, &path).unwrap(), 4);

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 8 + 2 * 4 * 0xc8);
        assert_eq!(&contents[..8], b"previous");

        // The file is a flat sequence of fixed-stride records
        let format = session.format().unwrap();
        let records = collect(&session).unwrap();
        for (i, chunk) in contents[8..].chunks(format.stride()).take(4).enumerate() {
            assert_eq!(format.decode(chunk).unwrap(), records[i]);
        }
    }

    #[test]
    fn test_dump_to_memory_sink() {
        let (pmu, session) = running(FormatVersion::V1, 5);
        unsafe { pmu.retire(0, Event::MEM_LOAD_L2_MISS, 12) };

        let mut sink = Vec::new();
        assert_eq!(dump_to_sink(&session, &mut sink).unwrap(), 2);
        assert_eq!(sink.len(), 2 * 0xb0);
    }

    #[test]
    fn test_log_records() {
        let (pmu, session) = running(FormatVersion::V1, 100);
        unsafe { pmu.retire(0, Event::MEM_LOAD_L2_MISS, 200) };

        // Only capture the read-out, not the start-up lines
        testing_logger::setup();
        assert_eq!(log_records(&session).unwrap(), 2);

        testing_logger::validate(|captured_logs| {
            assert_eq!(captured_logs.len(), 3);
            let lines: Vec<_> = captured_logs.iter().collect();
            assert!(lines[0].body.contains("pebs_base: "));
            assert!(lines[1].body.starts_with("core 0: 0: ip: "));
            assert!(lines[2].body.starts_with("core 0: 1: ip: "));
        });
    }
}
