use std::fmt;
use std::ptr::NonNull;

use super::control::BLOCK;

#[derive(Debug)]
pub enum HeapError {
    AcquireFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    /// The pages source could not supply a new zone.
    OutOfMemory,
    InitializationFailed(String),
    InvalidLayout {
        size: usize,
        align: usize,
    },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::AcquireFailed(e) => write!(f, "page acquisition failed: {e}"),
            HeapError::ReleaseFailed(e) => write!(f, "page release failed: {e}"),
            HeapError::OutOfMemory => write!(f, "out of memory"),
            HeapError::InitializationFailed(msg) => write!(f, "heap initialization failed: {msg}"),
            HeapError::InvalidLayout { size, align } => {
                write!(f, "invalid layout: size {size}, alignment {align}")
            }
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HeapError::AcquireFailed(e) | HeapError::ReleaseFailed(e) => Some(e),
            HeapError::OutOfMemory
            | HeapError::InitializationFailed(_)
            | HeapError::InvalidLayout { .. } => None,
        }
    }
}

/// Abstract source of zone memory.
///
/// The allocator presumes returned pages are mapped read/write and that
/// any `align >= 512` is honoured.  Nothing else is assumed; the methods
/// map to one `mmap`/`munmap` pair per zone on unix.
pub(crate) trait PageSource {
    /// Obtain at least `min_bytes` of read/write memory aligned to `align`.
    unsafe fn acquire(min_bytes: usize, align: usize) -> Result<NonNull<u8>, HeapError>;

    /// Return a region obtained from [`acquire`](PageSource::acquire).
    unsafe fn release(base: NonNull<u8>, bytes: usize) -> Result<(), HeapError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformPages;

/// Round `bytes` up to page granularity.
pub(crate) fn round_to_pages(bytes: usize) -> usize {
    let page = PlatformPages::page_size();
    (bytes + page - 1) / page * page
}

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{HeapError, NonNull, PageSource, PlatformPages};
    use std::io;

    impl PageSource for PlatformPages {
        unsafe fn acquire(min_bytes: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
            debug_assert!(align.is_power_of_two() && align >= super::BLOCK);
            let size = super::round_to_pages(min_bytes);

            // mmap gives page alignment only; over-map by `align` and trim
            // the misaligned head and the tail back to the kernel.
            let padded = size + align;
            // Safety: FFI call to mmap.
            let raw = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    padded,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };
            if raw == libc::MAP_FAILED {
                return Err(HeapError::AcquireFailed(io::Error::last_os_error()));
            }

            let addr = raw as usize;
            let base = (addr + align - 1) & !(align - 1);
            let head = base - addr;
            let tail = padded - head - size;
            if head > 0 {
                // Safety: trimming the unused head of our own mapping.
                unsafe { libc::munmap(raw, head) };
            }
            if tail > 0 {
                // Safety: trimming the unused tail of our own mapping.
                unsafe { libc::munmap((base + size) as *mut libc::c_void, tail) };
            }

            match NonNull::new(base as *mut u8) {
                Some(p) => Ok(p),
                None => Err(HeapError::AcquireFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn release(base: NonNull<u8>, bytes: usize) -> Result<(), HeapError> {
            let size = super::round_to_pages(bytes);
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(base.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(HeapError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                #[allow(clippy::cast_sign_loss)]
                {
                    raw as usize
                }
            })
        }
    }
}

#[cfg(all(target_os = "windows", not(any(loom, miri))))]
mod windows {
    use super::{HeapError, NonNull, PageSource, PlatformPages};
    use std::io;

    impl PageSource for PlatformPages {
        unsafe fn acquire(min_bytes: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
            debug_assert!(align.is_power_of_two() && align >= super::BLOCK);
            let size = super::round_to_pages(min_bytes);
            // VirtualAlloc reservations are 64KiB-granular, which covers
            // every alignment the allocator requests (>= 512, <= 64KiB).
            debug_assert!(align <= 64 * 1024);
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe {
                libc::VirtualAlloc(
                    std::ptr::null_mut(),
                    size,
                    libc::MEM_RESERVE | libc::MEM_COMMIT,
                    libc::PAGE_READWRITE,
                )
            };
            match NonNull::new(ptr as *mut u8) {
                Some(p) => Ok(p),
                None => Err(HeapError::AcquireFailed(io::Error::last_os_error())),
            }
        }

        unsafe fn release(base: NonNull<u8>, _bytes: usize) -> Result<(), HeapError> {
            // MEM_RELEASE requires size 0 and the reservation base address.
            // Safety: FFI call to VirtualFree.
            if unsafe { libc::VirtualFree(base.as_ptr() as *mut libc::c_void, 0, libc::MEM_RELEASE) }
                == 0
            {
                return Err(HeapError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            // Safety: FFI call to GetSystemInfo.
            *CACHED.get_or_init(|| unsafe {
                let mut info: libc::SYSTEM_INFO = std::mem::zeroed();
                libc::GetSystemInfo(&mut info);
                info.dwPageSize as usize
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed pages (no real mmap/VirtualAlloc)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler.  Instead every zone is backed by
// a plain heap allocation.  Sufficient for testing the *synchronization*
// logic (loom) and detecting undefined behaviour in unsafe pointer code
// (Miri); actual mapping behaviour is tested by the platform implementation
// in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl PageSource for PlatformPages {
    unsafe fn acquire(min_bytes: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        if min_bytes == 0 {
            return Err(HeapError::AcquireFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size acquisition",
            )));
        }
        // Every in-crate caller requests zone alignment; the mock relies on
        // that so `release` can reconstruct the layout without a registry.
        debug_assert!(align == BLOCK);
        let size = round_to_pages(min_bytes);
        let layout = std::alloc::Layout::from_size_align(size, BLOCK)
            .map_err(|e| HeapError::AcquireFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(HeapError::OutOfMemory)
    }

    unsafe fn release(base: NonNull<u8>, bytes: usize) -> Result<(), HeapError> {
        let size = round_to_pages(bytes);
        let layout = std::alloc::Layout::from_size_align(size, BLOCK)
            .map_err(|e| HeapError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: base was allocated with the same size via `acquire`.
        unsafe { std::alloc::dealloc(base.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}
