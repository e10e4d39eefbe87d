//! Memory regions backing a sampling buffer.
//!
//! A region is one control page (holding the DS area) followed by enough
//! data pages for the requested number of records. The processor writes into
//! the region on its own schedule, so it is exposed as a raw pointer rather
//! than a slice.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur when allocating buffer memory
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("OS error: {0}")]
    OsError(std::io::Error),

    #[error("cannot allocate a buffer for {records} records of {stride} bytes")]
    InvalidSize { stride: usize, records: usize },

    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),
}

/// Backing memory for a sampling buffer
pub trait Storage: Send {
    /// Start of the region; page aligned
    fn as_ptr(&self) -> *mut u8;

    /// Total length of the region in bytes
    fn len(&self) -> usize;

    /// Return the number of data pages following the control page
    fn num_data_pages(&self) -> u32;

    /// Return the system page size
    fn page_size(&self) -> u64;
}

/// Number of data pages needed for `records` records of `stride` bytes
pub fn data_pages(stride: usize, records: usize, page_size: u64) -> Result<u32, StorageError> {
    let bytes = stride
        .checked_mul(records)
        .filter(|&b| b > 0)
        .ok_or(StorageError::InvalidSize { stride, records })?;
    let pages = (bytes as u64).div_ceil(page_size);
    u32::try_from(pages).map_err(|_| StorageError::InvalidSize { stride, records })
}

/// Heap-backed storage
///
/// This is useful for testing and for simulated sampling. The memory is page
/// aligned and zeroed but not pinned.
pub struct MemoryStorage {
    data: NonNull<u8>,
    layout: Layout,
    n_data_pages: u32,
    page_size: u64,
}

// Safety: the region is exclusively owned; concurrent writes only come from
// the sampling hardware (or its simulation).
unsafe impl Send for MemoryStorage {}

impl MemoryStorage {
    /// Create a new memory storage with `n_pages` data pages
    pub fn new(n_pages: u32) -> Result<Self, StorageError> {
        let page_size = page_size::get() as u64;
        let total_size = (page_size * (1 + u64::from(n_pages))) as usize; // 1 control page + data pages

        let layout = Layout::from_size_align(total_size, page_size as usize)
            .map_err(|_| StorageError::OutOfMemory(total_size))?;
        // Safety: layout has a non-zero size
        let data = unsafe { alloc::alloc_zeroed(layout) };
        let data = NonNull::new(data).ok_or(StorageError::OutOfMemory(total_size))?;

        Ok(MemoryStorage {
            data,
            layout,
            n_data_pages: n_pages,
            page_size,
        })
    }
}

impl Storage for MemoryStorage {
    fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn num_data_pages(&self) -> u32 {
        self.n_data_pages
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        // Safety: allocated in new() with the same layout
        unsafe { alloc::dealloc(self.data.as_ptr(), self.layout) };
    }
}

#[cfg(target_os = "linux")]
pub use locked::LockedStorage;

#[cfg(target_os = "linux")]
mod locked {
    use std::io;
    use std::ptr;

    use libc::{c_void, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_LOCKED, MAP_PRIVATE};
    use libc::{PROT_READ, PROT_WRITE};

    use super::{Storage, StorageError};

    /// Anonymous, locked memory mapping
    ///
    /// The pages are faulted in and pinned at map time (`MAP_LOCKED`), so the
    /// processor never takes a page fault while writing a record. Mapping
    /// fails when the locked-memory limit (`RLIMIT_MEMLOCK`) is too small.
    pub struct LockedStorage {
        data: *mut u8,
        data_len: usize,
        n_data_pages: u32,
        page_size: u64,
    }

    // Safety: see MemoryStorage
    unsafe impl Send for LockedStorage {}

    impl LockedStorage {
        /// Create a new locked mapping with `n_pages` data pages
        pub fn new(n_pages: u32) -> Result<Self, StorageError> {
            let page_size = page_size::get() as u64;
            let total_size = (page_size * (1 + u64::from(n_pages))) as usize;

            let data_ptr = unsafe {
                mmap(
                    ptr::null_mut(),
                    total_size,
                    PROT_READ | PROT_WRITE,
                    MAP_ANONYMOUS | MAP_LOCKED | MAP_PRIVATE,
                    -1,
                    0,
                )
            };

            if data_ptr == MAP_FAILED {
                return Err(StorageError::OsError(io::Error::last_os_error()));
            }

            Ok(LockedStorage {
                data: data_ptr as *mut u8,
                data_len: total_size,
                n_data_pages: n_pages,
                page_size,
            })
        }
    }

    impl Storage for LockedStorage {
        fn as_ptr(&self) -> *mut u8 {
            self.data
        }

        fn len(&self) -> usize {
            self.data_len
        }

        fn num_data_pages(&self) -> u32 {
            self.n_data_pages
        }

        fn page_size(&self) -> u64 {
            self.page_size
        }
    }

    impl Drop for LockedStorage {
        fn drop(&mut self) {
            if !self.data.is_null() {
                unsafe {
                    let _ = munmap(self.data as *mut c_void, self.data_len);
                }
                self.data = ptr::null_mut();
            }
        }
    }
}

/// Which kind of memory an [`Allocator`] hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Pinned anonymous mapping, required for real hardware
    Locked,
    /// Ordinary heap memory
    Memory,
}

/// Hands out buffer regions and tracks how many are still alive
#[derive(Debug, Clone)]
pub struct Allocator {
    backing: Backing,
    live: Arc<AtomicUsize>,
}

impl Allocator {
    pub fn new(backing: Backing) -> Self {
        Allocator {
            backing,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn backing(&self) -> Backing {
        self.backing
    }

    /// Reserve a zeroed region for `records` records of `stride` bytes, plus
    /// one control page
    pub fn allocate(&self, stride: usize, records: usize) -> Result<Region, StorageError> {
        let page_size = page_size::get() as u64;
        let n_pages = data_pages(stride, records, page_size)?;

        let storage: Box<dyn Storage> = match self.backing {
            Backing::Memory => Box::new(MemoryStorage::new(n_pages)?),
            #[cfg(target_os = "linux")]
            Backing::Locked => Box::new(LockedStorage::new(n_pages)?),
            #[cfg(not(target_os = "linux"))]
            Backing::Locked => {
                return Err(StorageError::OsError(std::io::Error::from(
                    std::io::ErrorKind::Unsupported,
                )))
            }
        };

        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(Region {
            storage,
            stride,
            records,
            live: self.live.clone(),
        })
    }

    /// Number of regions allocated by this allocator that are not yet released
    pub fn live_regions(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

/// An allocated buffer region; released when dropped
pub struct Region {
    storage: Box<dyn Storage>,
    stride: usize,
    records: usize,
    live: Arc<AtomicUsize>,
}

impl Region {
    /// Address of the control page
    pub fn header(&self) -> *mut u8 {
        self.storage.as_ptr()
    }

    /// Address of the first record slot
    pub fn records_start(&self) -> *mut u8 {
        // Safety: the region always has at least one page
        unsafe { self.storage.as_ptr().add(self.storage.page_size() as usize) }
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn page_size(&self) -> u64 {
        self.storage.page_size()
    }

    pub fn num_data_pages(&self) -> u32 {
        self.storage.num_data_pages()
    }

    /// Bytes per record the region was sized for
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of records the region was sized for
    pub fn capacity(&self) -> usize {
        self.records
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}
