//! Running a closure on specific cores.
//!
//! The PEBS registers are per logical core, so every session operation has to
//! reach the right core. With register access through `/dev/cpu/N/msr` the
//! kernel already routes each access, and [`Sequential`] is enough. Direct
//! `rdmsr`/`wrmsr` only touch the executing core, which needs [`Pinned`].

use msr::CoreId;
use thiserror::Error;

/// Errors that can occur when dispatching work to a core
#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("failed to pin to core {core}: {source}")]
    Pin { core: CoreId, source: nix::Error },

    #[error("asked for core {core} but running on core {actual}")]
    Migrated { core: CoreId, actual: usize },

    #[error("failed to query CPU affinity: {0}")]
    Affinity(nix::Error),
}

/// Dispatches closures to cores
pub trait Broadcast {
    /// Cores this broadcaster can reach
    fn online_cores(&self) -> Vec<CoreId>;

    /// Runs `f` once for every core in `cores`, in order
    ///
    /// A core that cannot be reached gets an error entry and `f` is not
    /// called for it; the remaining cores are still visited.
    fn run_on<R, F>(&self, cores: &[CoreId], f: F) -> Vec<(CoreId, Result<R, BroadcastError>)>
    where
        F: FnMut(CoreId) -> R;

    fn run_on_each_online_core<R, F>(&self, f: F) -> Vec<(CoreId, Result<R, BroadcastError>)>
    where
        F: FnMut(CoreId) -> R,
    {
        self.run_on(&self.online_cores(), f)
    }
}

/// Calls the closure on the current thread, for register access that is
/// already core-addressed
#[derive(Debug, Clone)]
pub struct Sequential {
    cores: Vec<CoreId>,
}

impl Sequential {
    pub fn new(cores: Vec<CoreId>) -> Self {
        Sequential { cores }
    }

    /// Cores `0..n`
    pub fn with_cores(n: usize) -> Self {
        Sequential {
            cores: (0..n).collect(),
        }
    }
}

impl Broadcast for Sequential {
    fn online_cores(&self) -> Vec<CoreId> {
        self.cores.clone()
    }

    fn run_on<R, F>(&self, cores: &[CoreId], mut f: F) -> Vec<(CoreId, Result<R, BroadcastError>)>
    where
        F: FnMut(CoreId) -> R,
    {
        cores.iter().map(|&core| (core, Ok(f(core)))).collect()
    }
}

#[cfg(target_os = "linux")]
pub use pinned::Pinned;

#[cfg(target_os = "linux")]
mod pinned {
    use log::{debug, warn};
    use nix::sched::{sched_getaffinity, sched_getcpu, sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    use super::{Broadcast, BroadcastError};
    use msr::CoreId;

    /// Migrates the calling thread to each core in turn, then restores its
    /// original affinity
    #[derive(Debug, Clone, Copy, Default)]
    pub struct Pinned;

    impl Pinned {
        fn current_affinity() -> nix::Result<CpuSet> {
            // 0 means the calling thread
            sched_getaffinity(Pid::from_raw(0))
        }

        fn pin(core: CoreId) -> Result<(), BroadcastError> {
            let mut cpu_set = CpuSet::new();
            cpu_set
                .set(core)
                .map_err(|source| BroadcastError::Pin { core, source })?;
            sched_setaffinity(Pid::from_raw(0), &cpu_set)
                .map_err(|source| BroadcastError::Pin { core, source })?;

            let actual = sched_getcpu().map_err(BroadcastError::Affinity)?;
            if actual != core {
                return Err(BroadcastError::Migrated { core, actual });
            }
            Ok(())
        }
    }

    impl Broadcast for Pinned {
        fn online_cores(&self) -> Vec<CoreId> {
            match Self::current_affinity() {
                Ok(set) => (0..CpuSet::count())
                    .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
                    .collect(),
                Err(e) => {
                    warn!("{}", BroadcastError::Affinity(e));
                    Vec::new()
                }
            }
        }

        fn run_on<R, F>(
            &self,
            cores: &[CoreId],
            mut f: F,
        ) -> Vec<(CoreId, Result<R, BroadcastError>)>
        where
            F: FnMut(CoreId) -> R,
        {
            let original = match Self::current_affinity() {
                Ok(set) => set,
                Err(errno) => {
                    warn!("not dispatching to {} cores: {}", cores.len(), errno);
                    return cores
                        .iter()
                        .map(|&core| (core, Err(BroadcastError::Affinity(errno))))
                        .collect();
                }
            };

            let results = cores
                .iter()
                .map(|&core| {
                    let result = Self::pin(core).map(|()| {
                        debug!("running on core {}", core);
                        f(core)
                    });
                    if let Err(e) = &result {
                        warn!("core {}: {}", core, e);
                    }
                    (core, result)
                })
                .collect();

            if let Err(e) = sched_setaffinity(Pid::from_raw(0), &original) {
                warn!("failed to restore CPU affinity: {}", e);
            }
            results
        }
    }
}
