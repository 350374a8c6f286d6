//! Executable memory for committed translations.
//!
//! Each trace gets its own anonymous mapping: created writable, filled,
//! then flipped to executable-read-only before any PC into it is
//! published. Mappings sit in the low 2 GiB so rel32 transfers reach any
//! low native target; far targets go through pinned cells instead (the
//! mangler's job, not ours).
//!
//! Nothing here persists: the cache is process-lifetime only.

use std::sync::Mutex;

use granary_x64::CachePc;

/// Why a cache operation failed.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The host refused the mapping.
    #[error("unable to map {len} bytes of code memory")]
    MapFailed {
        /// Requested length.
        len: usize,
    },
    /// The protection flip failed.
    #[error("unable to protect code region at {base:#x}")]
    ProtectFailed {
        /// Region base.
        base: CachePc,
    },
    /// The platform has no executable-memory support compiled in.
    #[error("executable memory is not supported on this platform")]
    Unsupported,
}

/// One mapped region, writable until committed.
#[derive(Debug)]
pub struct CodeRegion {
    base: *mut u8,
    len: usize,
    committed: bool,
}

unsafe impl Send for CodeRegion {}

impl CodeRegion {
    /// The region's start as a cache PC.
    pub fn base(&self) -> CachePc {
        self.base as CachePc
    }

    /// Copy `bytes` into the region and flip it executable-read-only.
    /// Returns the entry cache PC.
    pub fn commit(mut self, bytes: &[u8]) -> Result<CachePc, CacheError> {
        assert!(bytes.len() <= self.len, "commit larger than reservation");
        assert!(!self.committed);
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base, bytes.len());
        }
        protect_rx(self.base, self.len)?;
        self.committed = true;
        let base = self.base();
        log::debug!("committed {} byte(s) at {base:#x}", bytes.len());
        // Ownership of the mapping moves to the process-lifetime cache; the
        // bytes must outlive every thread that may execute them.
        core::mem::forget(self);
        Ok(base)
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        // An uncommitted reservation (a translation that failed late) is
        // returned to the host.
        if !self.committed {
            unmap(self.base, self.len);
        }
    }
}

/// The process-wide code cache: hands out regions and remembers what it
/// mapped.
#[derive(Debug, Default)]
pub struct CodeCache {
    regions: Mutex<Vec<(CachePc, usize)>>,
}

impl CodeCache {
    /// An empty cache.
    pub fn new() -> CodeCache {
        CodeCache::default()
    }

    /// Reserve a writable region large enough for `len` bytes.
    pub fn reserve(&self, len: usize) -> Result<CodeRegion, CacheError> {
        let len = len.next_multiple_of(page_size()).max(page_size());
        let base = map_rw_low(len)?;
        self.regions.lock().unwrap().push((base as CachePc, len));
        Ok(CodeRegion {
            base,
            len,
            committed: false,
        })
    }

    /// Total bytes currently mapped.
    pub fn mapped_bytes(&self) -> usize {
        self.regions.lock().unwrap().iter().map(|(_, len)| len).sum()
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }

        /// Map anonymous read-write memory in the low 2 GiB.
        fn map_rw_low(len: usize) -> Result<*mut u8, CacheError> {
            let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
            {
                flags |= libc::MAP_32BIT;
            }
            let ptr = unsafe {
                libc::mmap(
                    core::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    flags,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(CacheError::MapFailed { len });
            }
            Ok(ptr.cast())
        }

        fn protect_rx(base: *mut u8, len: usize) -> Result<(), CacheError> {
            use rustix::mm::{mprotect, MprotectFlags};
            unsafe { mprotect(base.cast(), len, MprotectFlags::READ | MprotectFlags::EXEC) }
                .map_err(|_| CacheError::ProtectFailed {
                    base: base as CachePc,
                })
        }

        fn unmap(base: *mut u8, len: usize) {
            unsafe {
                libc::munmap(base.cast(), len);
            }
        }
    } else {
        fn page_size() -> usize {
            4096
        }

        fn map_rw_low(_len: usize) -> Result<*mut u8, CacheError> {
            Err(CacheError::Unsupported)
        }

        fn protect_rx(_base: *mut u8, _len: usize) -> Result<(), CacheError> {
            Err(CacheError::Unsupported)
        }

        fn unmap(_base: *mut u8, _len: usize) {}
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn reserve_commit_roundtrip() {
        let cache = CodeCache::new();
        let region = cache.reserve(16).expect("maps");
        let base = region.base();
        // ret; int3 padding
        let pc = region.commit(&[0xC3, 0xCC, 0xCC]).expect("commits");
        assert_eq!(pc, base);
        // The committed bytes are readable at the published PC.
        let bytes = unsafe { core::slice::from_raw_parts(pc as *const u8, 3) };
        assert_eq!(bytes, &[0xC3, 0xCC, 0xCC]);
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn regions_sit_in_the_low_2gib() {
        let cache = CodeCache::new();
        let region = cache.reserve(1).expect("maps");
        assert!(region.base() < (1 << 31), "rel32-reachable cache");
        drop(region);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn committed_code_executes() {
        let cache = CodeCache::new();
        let region = cache.reserve(16).expect("maps");
        // mov eax, 0x2a; ret
        let pc = region
            .commit(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3])
            .expect("commits");
        let f: extern "C" fn() -> u32 = unsafe { core::mem::transmute(pc as usize) };
        assert_eq!(f(), 42);
    }
}
