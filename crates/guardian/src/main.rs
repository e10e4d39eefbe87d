use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::info;
use msr::{MsrFile, RegisterAccess, DEFAULT_MSR_ROOT};
use pebs::{
    counters, Allocator, Backing, Broadcast, BufferSize, CounterConfig, Event, FormatVersion,
    PerCoreManager, Pinned, Privilege, SampleFrequency, Sequential, SessionConfig, SimulatedPmu,
};
use time::macros::format_description;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

mod poller;
mod sampler;
mod supervisor;

use poller::run_poller;
use sampler::{Sampler, Simulation};
use supervisor::supervise;

/// Samples memory-access events with PEBS and logs or dumps the records
#[derive(Debug, Parser)]
struct Command {
    /// Verbose debug output, including every register write
    #[arg(short, long)]
    verbose: bool,

    /// Sampling duration in seconds (0 = until interrupted)
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// Milliseconds between buffer read-outs
    #[arg(short, long, default_value = "1000")]
    interval_ms: u64,

    /// Only sample this core
    #[arg(short, long)]
    core: Option<usize>,

    /// Event to sample: a name such as mem-load-l2-miss, or 0xUUEE
    #[arg(short, long, default_value = "mem-load-l2-miss")]
    event: Event,

    /// Take a sample every this many events
    #[arg(short, long, default_value = "10000")]
    period: u64,

    /// Buffer size in records (default: as many as fit in 64 KiB)
    #[arg(short, long)]
    records: Option<usize>,

    /// Minimum load latency in cycles; enables load-latency sampling
    #[arg(long)]
    load_latency: Option<u64>,

    /// Privilege levels to count at: user, kernel or all
    #[arg(long, default_value = "all")]
    privilege: Privilege,

    /// Append raw records to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory holding the per-core msr devices
    #[arg(long, default_value = DEFAULT_MSR_ROOT)]
    msr_root: PathBuf,

    /// Drive a simulated PMU with this many cores instead of the hardware
    #[arg(long)]
    simulate: Option<usize>,

    /// Events retired on each simulated core per read-out
    #[arg(long, default_value = "1000")]
    sim_events: u64,
}

impl Command {
    fn session_config(&self) -> Result<SessionConfig> {
        if self.period == 0 || self.period > SampleFrequency::MAX {
            bail!(
                "sample period must be between 1 and {}",
                SampleFrequency::MAX
            );
        }
        let counter = CounterConfig::sampling(self.event, SampleFrequency(self.period))
            .with_privilege(self.privilege);
        let mut config = SessionConfig::new(counters(&[(0, counter)]));
        if let Some(records) = self.records {
            config = config.with_buffer(BufferSize::Records(records));
        }
        if let Some(threshold) = self.load_latency {
            config = config.with_load_latency(threshold);
        }
        Ok(config)
    }

    fn cores(&self, available: Vec<usize>) -> Vec<usize> {
        match self.core {
            Some(core) => vec![core],
            None => available,
        }
    }
}

fn format_time() -> String {
    if let Ok(now) = OffsetDateTime::now_local() {
        let format = format_description!("[hour]:[minute]:[second].[subsecond digits:3]");
        now.format(&format)
            .unwrap_or_else(|_| "00:00:00.000".to_string())
    } else {
        "00:00:00.000".to_string()
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Waits for ctrl-c or the end of the run, then cancels `token`
async fn wait_for_shutdown(token: CancellationToken, duration: Option<Duration>) {
    let elapsed = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                log::error!("failed to listen for ctrl-c: {}", e);
            }
            info!("interrupted, stopping");
        }
        _ = elapsed => info!("duration elapsed, stopping"),
        _ = token.cancelled() => {}
    }
    token.cancel();
}

fn main() -> Result<()> {
    let opts = Command::parse();
    init_logging(opts.verbose);

    let config = opts.session_config()?;
    if opts.interval_ms == 0 {
        bail!("read-out interval must be at least 1 ms");
    }

    let (access, simulation, cores, backing) = match opts.simulate {
        Some(n_cores) => {
            let pmu = Arc::new(SimulatedPmu::new(n_cores, FormatVersion::V3));
            let simulation = Simulation {
                pmu: pmu.clone(),
                event: opts.event,
                events_per_poll: opts.sim_events,
            };
            let access: Arc<dyn RegisterAccess> = pmu;
            let cores = opts.cores((0..n_cores).collect());
            (access, Some(simulation), cores, Backing::Memory)
        }
        None => {
            let cores = opts.cores(Pinned.online_cores());
            let msr = MsrFile::open_at(&opts.msr_root, &cores);
            if msr.open_handles() == 0 {
                bail!(
                    "no register device could be opened under {} (is the msr module loaded?)",
                    opts.msr_root.display()
                );
            }
            let access: Arc<dyn RegisterAccess> = Arc::new(msr);
            (access, None, cores, Backing::Locked)
        }
    };

    let mut manager = PerCoreManager::new(access, Allocator::new(backing), Sequential::new(cores));
    let report = manager.start_all(&config);
    if report.succeeded.is_empty() {
        manager.stop_all();
        bail!(
            "sampling did not start on any core ({} failed)",
            report.failures.len()
        );
    }
    info!(
        "{} sampling event {} every {} events on {} cores",
        format_time(),
        opts.event,
        opts.period,
        report.succeeded.len()
    );

    let sampler = Arc::new(Mutex::new(Sampler::new(manager, simulation, opts.output.clone())));

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async {
        let token = CancellationToken::new();
        let duration = (opts.duration > 0).then(|| Duration::from_secs(opts.duration));
        let shutdown = tokio::spawn(wait_for_shutdown(token.clone(), duration));

        let poller = run_poller(
            sampler.clone(),
            Duration::from_millis(opts.interval_ms),
            token.clone(),
            Sampler::poll,
        );
        supervise(poller, token).await;

        if let Err(e) = shutdown.await {
            log::error!("shutdown listener failed: {:?}", e);
        }
    });

    let mut sampler = sampler
        .lock()
        .map_err(|_| anyhow!("sampler state poisoned by a panic in the poller"))?;
    sampler.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_bounds() {
        let parse = |period: u64| {
            Command::parse_from(["guardian", "--period", &period.to_string()]).session_config()
        };
        assert!(parse(0).is_err());
        assert!(parse(1).is_ok());
        assert!(parse(SampleFrequency::MAX).is_ok());
        assert!(parse(SampleFrequency::MAX + 1).is_err());
    }
}
