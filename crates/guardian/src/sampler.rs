use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use msr::{CoreId, RegisterAccess};
use pebs::{Event, PerCoreManager, Report, Sequential, SimulatedPmu};

use crate::format_time;
use crate::poller::PollStats;

pub type Manager = PerCoreManager<Arc<dyn RegisterAccess>, Sequential>;

/// Synthetic load for a simulated PMU
pub struct Simulation {
    pub pmu: Arc<SimulatedPmu>,
    pub event: Event,
    /// Events retired on every core per poll
    pub events_per_poll: u64,
}

/// What the poller does on every visit: read out the buffers, log the
/// records, append them to the output file and hand the buffers back
pub struct Sampler {
    manager: Manager,
    simulation: Option<Simulation>,
    output: Option<PathBuf>,
    overflowed: BTreeSet<CoreId>,
}

impl Sampler {
    pub fn new(manager: Manager, simulation: Option<Simulation>, output: Option<PathBuf>) -> Self {
        Sampler {
            manager,
            simulation,
            output,
            overflowed: BTreeSet::new(),
        }
    }

    #[cfg(test)]
    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn poll(&mut self) -> Result<PollStats> {
        if let Some(sim) = &self.simulation {
            for core in self.manager.cores() {
                // Safety: sessions clear IA32_DS_AREA before releasing their
                // buffer, and they cannot be stopped while we hold &mut self
                unsafe { sim.pmu.retire(core, sim.event, sim.events_per_poll) };
            }
        }

        let overflows = self.check_overflow();

        log_failures(self.manager.pause_all());
        let records = self.read_out()?;
        log_failures(self.manager.reset_all());
        log_failures(self.manager.resume_all());

        info!("{} poll: {} records", format_time(), records);
        Ok(PollStats::visit(records as u64, overflows))
    }

    /// Final read-out, then teardown of every session
    pub fn finish(&mut self) -> Result<()> {
        log_failures(self.manager.pause_all());
        let records = self.read_out();
        let report = self.manager.stop_all();
        let failed = report.failures.len();
        log_failures(report);

        let records = records?;
        info!("{} stopped: {} records in final read-out", format_time(), records);
        if failed > 0 {
            anyhow::bail!("teardown failed on {} cores", failed);
        }
        Ok(())
    }

    fn read_out(&self) -> Result<usize> {
        let records = self.manager.print_all();
        if let Some(path) = &self.output {
            self.manager
                .dump_all(path)
                .with_context(|| format!("failed to append records to {}", path.display()))?;
        }
        Ok(records)
    }

    fn check_overflow(&mut self) -> u64 {
        let mut new = 0;
        for core in self.manager.overflowed_cores() {
            if self.overflowed.insert(core) {
                warn!(
                    "core {}: PEBS buffer reached its interrupt threshold, samples may be dropped",
                    core
                );
                new += 1;
            }
        }
        new
    }
}

fn log_failures(report: Report) {
    for failure in report.failures {
        warn!(
            "core {}: {} ({})",
            failure.core, failure.message, failure.kind
        );
    }
}
