use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::{debug, warn};

use crate::{CoreId, RegisterAccess, RegisterError};

/// Default location of the per-core register devices
pub const DEFAULT_MSR_ROOT: &str = "/dev/cpu";

/// Register access through the Linux `msr` driver's per-core device files
///
/// Each register is addressed by seeking to its index inside
/// `<root>/<core>/msr` and transferring exactly eight bytes.
pub struct MsrFile {
    // Indexed by core; None when the device could not be opened
    files: Vec<Option<File>>,
}

impl MsrFile {
    /// Opens the register devices for each core in `cores` under `/dev/cpu`
    pub fn open(cores: &[CoreId]) -> Self {
        Self::open_at(DEFAULT_MSR_ROOT, cores)
    }

    /// Opens `<root>/<core>/msr` for each core in `cores`
    ///
    /// A core whose device cannot be opened is logged and left unavailable;
    /// every later access to it fails with [`RegisterError::Unavailable`].
    pub fn open_at(root: impl AsRef<Path>, cores: &[CoreId]) -> Self {
        let root = root.as_ref();
        let n_slots = cores.iter().max().map_or(0, |&max| max + 1);
        let mut files: Vec<Option<File>> = (0..n_slots).map(|_| None).collect();

        for &core in cores {
            match Self::open_device(root, core) {
                Ok(file) => files[core] = Some(file),
                Err(e) => warn!("{}", e),
            }
        }

        MsrFile { files }
    }

    fn open_device(root: &Path, core: CoreId) -> Result<File, RegisterError> {
        let path = root.join(core.to_string()).join("msr");
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| RegisterError::Open { core, source })
    }

    /// Number of cores with an open device
    pub fn open_handles(&self) -> usize {
        self.files.iter().filter(|f| f.is_some()).count()
    }

    fn device(&self, core: CoreId) -> Result<&File, RegisterError> {
        self.files
            .get(core)
            .and_then(Option::as_ref)
            .ok_or(RegisterError::Unavailable(core))
    }
}

impl RegisterAccess for MsrFile {
    fn read(&self, core: CoreId, index: u32) -> Result<u64, RegisterError> {
        let mut buf = [0u8; 8];
        self.device(core)?
            .read_exact_at(&mut buf, u64::from(index))
            .map_err(|source| RegisterError::Read {
                core,
                index,
                source,
            })?;

        let value = u64::from_ne_bytes(buf);
        debug!("c{} read msr={:#x} val={:#x}", core, index, value);
        Ok(value)
    }

    fn write(&self, core: CoreId, index: u32, value: u64) -> Result<(), RegisterError> {
        debug!("c{} write msr={:#x} val={:#x}", core, index, value);
        self.device(core)?
            .write_all_at(&value.to_ne_bytes(), u64::from(index))
            .map_err(|source| RegisterError::Write {
                core,
                index,
                value,
                source,
            })
    }
}
