//! One sampling session per core.

use std::collections::BTreeMap;
use std::path::Path;

use log::{info, warn};
use msr::registers::GLOBAL_STATUS_OVF_BUFFER;
use msr::{CoreId, RegisterAccess};

use crate::broadcast::{Broadcast, BroadcastError};
use crate::drain::{collect, dump_to_file, log_records, DrainError};
use crate::format::Record;
use crate::session::{Phase, SamplingSession, SessionConfig, SessionError, Stage};
use crate::storage::Allocator;
use crate::ErrorKind;

/// Why an operation failed on one core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreFailure {
    pub core: CoreId,
    pub stage: Option<Stage>,
    pub kind: ErrorKind,
    pub message: String,
}

impl CoreFailure {
    fn session(core: CoreId, error: &SessionError) -> Self {
        CoreFailure {
            core,
            stage: error.stage(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    fn broadcast(core: CoreId, error: &BroadcastError) -> Self {
        CoreFailure {
            core,
            stage: None,
            kind: ErrorKind::Affinity,
            message: error.to_string(),
        }
    }
}

/// Outcome of an operation across cores
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    pub succeeded: Vec<CoreId>,
    pub failures: Vec<CoreFailure>,
}

impl Report {
    /// True when no core failed
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn collect(
        operation: &str,
        results: Vec<(CoreId, Result<Result<(), SessionError>, BroadcastError>)>,
    ) -> Self {
        let mut report = Report::default();
        for (core, result) in results {
            let failure = match result {
                Ok(Ok(())) => {
                    report.succeeded.push(core);
                    continue;
                }
                Ok(Err(e)) => CoreFailure::session(core, &e),
                Err(e) => CoreFailure::broadcast(core, &e),
            };
            warn!("core {}: {} failed: {}", core, operation, failure.message);
            report.failures.push(failure);
        }
        info!(
            "{}: {} cores ok, {} failed",
            operation,
            report.succeeded.len(),
            report.failures.len()
        );
        report
    }
}

/// Owns a [`SamplingSession`] per core and fans operations out to them
pub struct PerCoreManager<A: RegisterAccess + Clone, B: Broadcast> {
    access: A,
    allocator: Allocator,
    broadcast: B,
    sessions: BTreeMap<CoreId, SamplingSession<A>>,
}

impl<A: RegisterAccess + Clone, B: Broadcast> PerCoreManager<A, B> {
    pub fn new(access: A, allocator: Allocator, broadcast: B) -> Self {
        PerCoreManager {
            access,
            allocator,
            broadcast,
            sessions: BTreeMap::new(),
        }
    }

    /// Starts sampling with `config` on every online core
    pub fn start_all(&mut self, config: &SessionConfig) -> Report {
        let cores = self.broadcast.online_cores();
        self.start_on(&cores, config)
    }

    /// Starts sampling with `config` on each of `cores`
    ///
    /// A core that already has a live session is reported as a
    /// configuration order violation and left untouched. Cores whose start
    /// fails keep an idle session so the failure can be inspected.
    pub fn start_on(&mut self, cores: &[CoreId], config: &SessionConfig) -> Report {
        let PerCoreManager {
            access,
            allocator,
            broadcast,
            sessions,
        } = self;

        let results = broadcast.run_on(cores, |core| {
            if let Some(existing) = sessions.get(&core) {
                if !matches!(existing.phase(), Phase::Idle | Phase::Stopped) {
                    return Err(SessionError::OrderViolation {
                        operation: "start",
                        phase: existing.phase(),
                    });
                }
            }
            let mut session =
                SamplingSession::new(core, access.clone(), allocator.clone(), config.clone());
            let result = session.start();
            sessions.insert(core, session);
            result
        });
        Report::collect("start", results)
    }

    /// Stops every session; failed teardowns are reported but do not stop
    /// the remaining cores
    pub fn stop_all(&mut self) -> Report {
        self.for_each_session("stop", SamplingSession::stop)
    }

    pub fn pause_all(&mut self) -> Report {
        self.for_each_session("pause", |s| {
            if s.phase() == Phase::Running {
                s.pause()
            } else {
                Ok(())
            }
        })
    }

    pub fn resume_all(&mut self) -> Report {
        self.for_each_session("resume", |s| {
            if s.phase() == Phase::Paused {
                s.resume()
            } else {
                Ok(())
            }
        })
    }

    /// Discards the records of every paused session so the buffers can be
    /// refilled
    pub fn reset_all(&mut self) -> Report {
        self.for_each_session("reset", |s| {
            if s.phase() == Phase::Paused {
                s.reset_cursor()
            } else {
                Ok(())
            }
        })
    }

    fn for_each_session<F>(&mut self, operation: &str, mut f: F) -> Report
    where
        F: FnMut(&mut SamplingSession<A>) -> Result<(), SessionError>,
    {
        let cores = self.cores();
        let PerCoreManager {
            broadcast,
            sessions,
            ..
        } = self;

        let results = broadcast.run_on(&cores, |core| match sessions.get_mut(&core) {
            Some(session) => f(session),
            None => Ok(()),
        });
        Report::collect(operation, results)
    }

    pub fn session(&self, core: CoreId) -> Option<&SamplingSession<A>> {
        self.sessions.get(&core)
    }

    pub fn session_mut(&mut self, core: CoreId) -> Option<&mut SamplingSession<A>> {
        self.sessions.get_mut(&core)
    }

    /// Cores that have a session, in ascending order
    pub fn cores(&self) -> Vec<CoreId> {
        self.sessions.keys().copied().collect()
    }

    /// Iterates over sessions in core order
    pub fn sessions(&self) -> impl Iterator<Item = &SamplingSession<A>> {
        self.sessions.values()
    }

    /// Records of every session that has a buffer, in core order
    pub fn drain_all(&self) -> Vec<(CoreId, Vec<Record>)> {
        self.sessions
            .values()
            .filter_map(|s| collect(s).ok().map(|records| (s.core(), records)))
            .collect()
    }

    /// Logs the records of every session that has a buffer
    ///
    /// Returns the total number of records printed.
    pub fn print_all(&self) -> usize {
        self.sessions
            .values()
            .filter_map(|s| log_records(s).ok())
            .sum()
    }

    /// Appends every session's raw records to `path`, cores in order
    pub fn dump_all(&self, path: &Path) -> Result<usize, DrainError> {
        let mut total = 0;
        for session in self.sessions.values() {
            match dump_to_file(session, path) {
                Ok(n) => total += n,
                Err(DrainError::Session(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Cores whose PEBS buffer has reached its interrupt threshold
    ///
    /// The status bit is only read, never cleared: without an interrupt
    /// handler nothing empties the buffer, so it stays set until the session
    /// is stopped.
    pub fn overflowed_cores(&self) -> Vec<CoreId> {
        self.sessions
            .values()
            .filter(|s| matches!(s.phase(), Phase::Running | Phase::Paused))
            .filter_map(|s| match s.overflow_status() {
                Ok(status) if status & GLOBAL_STATUS_OVF_BUFFER != 0 => Some(s.core()),
                Ok(_) => None,
                Err(e) => {
                    warn!("{}", e);
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Sequential;
    use crate::event::{counters, CounterConfig, Event, SampleFrequency};
    use crate::format::FormatVersion;
    use crate::session::BufferSize;
    use crate::sim::SimulatedPmu;
    use crate::storage::Backing;
    use msr::registers::{IA32_DS_AREA, IA32_PEBS_ENABLE};
    use std::sync::Arc;

    type Manager = PerCoreManager<Arc<SimulatedPmu>, Sequential>;

    fn manager(n: usize) -> (Arc<SimulatedPmu>, Allocator, Manager) {
        let pmu = Arc::new(SimulatedPmu::new(n, FormatVersion::V2));
        let allocator = Allocator::new(Backing::Memory);
        let manager = PerCoreManager::new(pmu.clone(), allocator.clone(), Sequential::with_cores(n));
        (pmu, allocator, manager)
    }

    fn config(period: u64) -> SessionConfig {
        SessionConfig::new(counters(&[(
            0,
            CounterConfig::sampling(Event::MEM_LOAD_L2_MISS, SampleFrequency(period)),
        )]))
        .with_buffer(BufferSize::Records(16))
    }

    #[test]
    fn test_start_and_stop_all() {
        let (pmu, allocator, mut manager) = manager(4);
        let report = manager.start_all(&config(100));
        assert!(report.is_complete());
        assert_eq!(report.succeeded, vec![0, 1, 2, 3]);
        assert_eq!(allocator.live_regions(), 4);

        let report = manager.stop_all();
        assert_eq!(report.succeeded, vec![0, 1, 2, 3]);
        assert_eq!(allocator.live_regions(), 0);
        for core in 0..4 {
            assert_eq!(pmu.register(core, IA32_DS_AREA), 0);
            assert_eq!(manager.session(core).unwrap().phase(), Phase::Stopped);
        }
    }

    #[test]
    fn test_failure_on_one_core_does_not_abort_others() {
        let (pmu, _allocator, mut manager) = manager(3);
        pmu.fail_writes_to(1, IA32_PEBS_ENABLE, 0x1);

        let report = manager.start_all(&config(100));
        assert_eq!(report.succeeded, vec![0, 2]);
        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(failure.core, 1);
        assert_eq!(failure.stage, Some(Stage::EnablePebs));
        assert_eq!(failure.kind, ErrorKind::RegisterAccess);

        assert_eq!(manager.session(1).unwrap().phase(), Phase::Idle);
        assert_eq!(manager.session(2).unwrap().phase(), Phase::Running);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (_pmu, _allocator, mut manager) = manager(1);
        manager.start_on(&[0], &config(100));
        let report = manager.start_on(&[0], &config(10));
        assert_eq!(report.failures[0].kind, ErrorKind::ConfigurationOrderViolation);
        assert_eq!(
            manager.session(0).unwrap().config().counters[0].reset,
            SampleFrequency(100).reset_value()
        );
    }

    #[test]
    fn test_single_core() {
        let (pmu, _allocator, mut manager) = manager(4);
        let report = manager.start_on(&[2], &config(100));
        assert_eq!(report.succeeded, vec![2]);
        assert_eq!(manager.cores(), vec![2]);
        assert_eq!(pmu.register(0, IA32_DS_AREA), 0);
        assert_ne!(pmu.register(2, IA32_DS_AREA), 0);
    }

    #[test]
    fn test_drain_all_in_core_order() {
        let (pmu, _allocator, mut manager) = manager(3);
        manager.start_all(&config(10));
        unsafe {
            pmu.retire(2, Event::MEM_LOAD_L2_MISS, 30);
            pmu.retire(0, Event::MEM_LOAD_L2_MISS, 10);
        }

        manager.pause_all();
        let drained = manager.drain_all();
        let counts: Vec<_> = drained.iter().map(|(c, r)| (*c, r.len())).collect();
        assert_eq!(counts, vec![(0, 1), (1, 0), (2, 3)]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.bin");
        assert_eq!(manager.dump_all(&path).unwrap(), 4);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * 0xc0);
    }

    #[test]
    fn test_overflowed_cores() {
        let (pmu, _allocator, mut manager) = manager(2);
        manager.start_all(&config(1));
        assert!(manager.overflowed_cores().is_empty());

        // 16 slots: the threshold sits on the last usable slot
        unsafe { pmu.retire(1, Event::MEM_LOAD_L2_MISS, 14) };
        assert!(manager.overflowed_cores().is_empty());
        unsafe { pmu.retire(1, Event::MEM_LOAD_L2_MISS, 1) };
        assert_eq!(manager.overflowed_cores(), vec![1]);
    }

    #[test]
    fn test_pause_and_resume_all() {
        let (_pmu, _allocator, mut manager) = manager(2);
        manager.start_all(&config(100));
        assert!(manager.pause_all().is_complete());
        assert!(manager.sessions().all(|s| s.phase() == Phase::Paused));
        assert!(manager.resume_all().is_complete());
        assert!(manager.sessions().all(|s| s.phase() == Phase::Running));
    }

    #[test]
    fn test_reset_all_reuses_buffers() {
        let (pmu, _allocator, mut manager) = manager(2);
        manager.start_all(&config(10));
        unsafe { pmu.retire(0, Event::MEM_LOAD_L2_MISS, 40) };

        manager.pause_all();
        assert!(manager.reset_all().is_complete());
        manager.resume_all();
        assert!(manager.drain_all().iter().all(|(_, r)| r.is_empty()));

        unsafe { pmu.retire(0, Event::MEM_LOAD_L2_MISS, 20) };
        assert_eq!(manager.drain_all()[0].1.len(), 2);
    }
}
