//! Reading application code out of the running process.

use granary_codegen::cfg::CodeReader;
use granary_x64::AppPc;

/// Reads instruction bytes straight out of the process's address space.
///
/// Reads are clamped to mapped pages, so walking off the end of a mapping
/// produces a short read — which the decoder reports as truncation and the
/// trace builder turns into a clean block end — rather than a fault.
#[derive(Debug, Default)]
pub struct NativeMemory;

impl CodeReader for NativeMemory {
    fn read(&self, pc: AppPc, buf: &mut [u8]) -> usize {
        let readable = readable_prefix(pc, buf.len());
        if readable == 0 {
            return 0;
        }
        unsafe {
            core::ptr::copy_nonoverlapping(pc as *const u8, buf.as_mut_ptr(), readable);
        }
        readable
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// How many of the `len` bytes starting at `pc` sit on mapped pages.
        fn readable_prefix(pc: AppPc, len: usize) -> usize {
            let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 };
            let first = pc & !(page - 1);
            let last = (pc + len as u64 - 1) & !(page - 1);
            let num_pages = ((last - first) / page + 1) as usize;

            let mut vec = vec![0u8; num_pages];
            let rc = unsafe {
                libc::mincore(
                    first as *mut libc::c_void,
                    (num_pages as u64 * page) as usize,
                    vec.as_mut_ptr().cast(),
                )
            };
            if rc != 0 {
                // Part of the range is unmapped; retry page by page below.
                let mut ok = 0usize;
                for i in 0..num_pages {
                    let probe = unsafe {
                        libc::mincore(
                            (first + i as u64 * page) as *mut libc::c_void,
                            page as usize,
                            vec.as_mut_ptr().cast(),
                        )
                    };
                    if probe != 0 {
                        break;
                    }
                    ok += 1;
                }
                if ok == 0 {
                    return 0;
                }
                let readable_end = first + ok as u64 * page;
                return (readable_end.saturating_sub(pc) as usize).min(len);
            }
            len
        }
    } else {
        fn readable_prefix(_pc: AppPc, len: usize) -> usize {
            len
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn reads_mapped_memory() {
        let data = [0x48u8, 0x89, 0xD8, 0xC3];
        let mut buf = [0u8; 4];
        let n = NativeMemory.read(data.as_ptr() as AppPc, &mut buf);
        assert_eq!(n, 4);
        assert_eq!(buf, data);
    }

    #[test]
    fn unmapped_address_reads_nothing() {
        // Page zero is never mapped.
        let mut buf = [0u8; 8];
        assert_eq!(NativeMemory.read(0x8, &mut buf), 0);
    }
}
