//! Segment mapping
//!
//! Maps the PT_LOAD segments of a shared object into a contiguously
//! reserved address range. The range is first reserved PROT_NONE so the
//! kernel picks a hole large enough for the whole image, then each
//! segment is placed with MAP_FIXED inside it.

use std::ffi::CString;
use std::io::Error as IoError;
use std::mem;
use std::ptr;

use log::{debug, error};

use crate::constants::{PF_W, PT_LOAD};
use crate::elf::{Elf64Ehdr, Elf64Phdr};
use crate::error::{Result, SoloadError};
use crate::helpers::{page_end, page_start, prot_from_flags};

/// A manual mapping produced by `load_library`.
#[derive(Debug)]
pub struct MappedLibrary {
    pub base: usize,
    pub size: usize,
}

// ============================================================================
// File Access
// ============================================================================

struct Fd(i32);

impl Fd {
    fn open(path: &str) -> Result<Fd> {
        let c_path = CString::new(path)
            .map_err(|_| SoloadError::NotFound(format!("{path}: embedded NUL")))?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(SoloadError::NotFound(format!(
                "{path}: {}",
                IoError::last_os_error()
            )));
        }
        Ok(Fd(fd))
    }

    fn pread_exact(&self, buf: *mut u8, len: usize, offset: u64) -> bool {
        let n = unsafe { libc::pread(self.0, buf as *mut libc::c_void, len, offset as libc::off_t) };
        n == len as isize
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

// ============================================================================
// Load Span
// ============================================================================

/// Page-aligned size of the whole PT_LOAD span, plus its lowest page.
fn load_span(phdrs: &[Elf64Phdr]) -> Option<(usize, usize)> {
    let mut lo = usize::MAX;
    let mut hi = 0usize;

    for ph in phdrs {
        if ph.p_type != PT_LOAD {
            continue;
        }
        let start = ph.p_vaddr as usize;
        let end = start + ph.p_memsz as usize;
        lo = lo.min(start);
        hi = hi.max(end);
    }

    if lo == usize::MAX {
        return None;
    }
    let lo = page_start(lo);
    let hi = page_end(hi);
    Some((hi - lo, lo))
}

// ============================================================================
// Segment Placement
// ============================================================================

unsafe fn map_segment(fd: &Fd, ph: &Elf64Phdr, bias: usize) -> Result<()> {
    let seg_start = bias + ph.p_vaddr as usize;
    let seg_end = seg_start + ph.p_memsz as usize;
    let file_end = seg_start + ph.p_filesz as usize;

    let pg_start = page_start(seg_start);
    let pg_end = page_end(seg_end);
    let file_page = page_start(ph.p_offset as usize);
    let file_len = page_end(ph.p_offset as usize + ph.p_filesz as usize) - file_page;

    let mut prot = prot_from_flags(ph.p_flags);

    // A writable and executable segment is mapped without exec first and
    // upgraded afterwards, keeping W^X through the copy.
    let needs_exec_upgrade = prot & libc::PROT_WRITE != 0 && prot & libc::PROT_EXEC != 0;
    if needs_exec_upgrade {
        prot &= !libc::PROT_EXEC;
    }

    if file_len > 0 {
        let mapped = libc::mmap(
            pg_start as *mut libc::c_void,
            file_len,
            prot,
            libc::MAP_FIXED | libc::MAP_PRIVATE,
            fd.0,
            file_page as libc::off_t,
        );
        if mapped == libc::MAP_FAILED {
            return Err(SoloadError::MapFailed(format!(
                "segment at {:#x}: {}",
                pg_start,
                IoError::last_os_error()
            )));
        }
    }

    // Anonymous pages for the memsz tail past the file-backed pages
    if pg_end > pg_start + file_len {
        let bss_addr = pg_start + file_len;
        let bss_size = pg_end - bss_addr;
        let mapped = libc::mmap(
            bss_addr as *mut libc::c_void,
            bss_size,
            prot,
            libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if mapped == libc::MAP_FAILED {
            return Err(SoloadError::MapFailed(format!(
                "bss at {:#x}: {}",
                bss_addr,
                IoError::last_os_error()
            )));
        }
        ptr::write_bytes(bss_addr as *mut u8, 0, bss_size);
    }

    // Zero the slack between the end of file data and the end of its page
    // inside writable segments, so stale file bytes never leak into BSS.
    if ph.p_flags & PF_W != 0 && file_end < seg_end {
        let zero_len = (page_end(file_end) - file_end).min(seg_end - file_end);
        ptr::write_bytes(file_end as *mut u8, 0, zero_len);
    }

    if needs_exec_upgrade {
        libc::mprotect(
            pg_start as *mut libc::c_void,
            pg_end - pg_start,
            prot | libc::PROT_EXEC,
        );
    }

    Ok(())
}

// ============================================================================
// Library Loading
// ============================================================================

/// Map a shared object's loadable segments, returning the reserved range.
pub fn load_library(path: &str) -> Result<MappedLibrary> {
    let fd = Fd::open(path)?;

    let mut ehdr = mem::MaybeUninit::<Elf64Ehdr>::uninit();
    if !fd.pread_exact(
        ehdr.as_mut_ptr() as *mut u8,
        mem::size_of::<Elf64Ehdr>(),
        0,
    ) {
        return Err(SoloadError::InvalidElf(format!(
            "{path}: short read on ELF header"
        )));
    }
    let ehdr = unsafe { ehdr.assume_init() };

    let phdr_count = ehdr.e_phnum as usize;
    let mut phdrs = vec![
        Elf64Phdr {
            p_type: 0,
            p_flags: 0,
            p_offset: 0,
            p_vaddr: 0,
            p_paddr: 0,
            p_filesz: 0,
            p_memsz: 0,
            p_align: 0,
        };
        phdr_count
    ];
    let phdr_bytes = phdr_count * mem::size_of::<Elf64Phdr>();
    if !fd.pread_exact(phdrs.as_mut_ptr() as *mut u8, phdr_bytes, ehdr.e_phoff) {
        return Err(SoloadError::InvalidElf(format!(
            "{path}: short read on program headers"
        )));
    }

    let (map_size, min_vaddr) = load_span(&phdrs).ok_or_else(|| {
        SoloadError::InvalidElf(format!("{path}: no loadable segments"))
    })?;

    // Reserve the whole span; segments are placed inside with MAP_FIXED.
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            map_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(SoloadError::MapFailed(format!(
            "{path}: reserve {map_size:#x} bytes: {}",
            IoError::last_os_error()
        )));
    }
    let base = base as usize;
    let bias = base - min_vaddr;

    for ph in &phdrs {
        if ph.p_type != PT_LOAD {
            continue;
        }
        if let Err(e) = unsafe { map_segment(&fd, ph, bias) } {
            error!("{path}: {e}");
            unsafe { libc::munmap(base as *mut libc::c_void, map_size) };
            return Err(e);
        }
    }

    debug!("{path}: mapped {map_size:#x} bytes at {base:#x}");
    Ok(MappedLibrary {
        base,
        size: map_size,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PF_R;

    fn phdr(p_type: u32, vaddr: u64, memsz: u64) -> Elf64Phdr {
        Elf64Phdr {
            p_type,
            p_flags: PF_R,
            p_offset: 0,
            p_vaddr: vaddr,
            p_paddr: 0,
            p_filesz: memsz,
            p_memsz: memsz,
            p_align: 0x1000,
        }
    }

    #[test]
    fn test_load_span_covers_all_segments() {
        let ps = crate::helpers::page_size() as u64;
        let phdrs = [
            phdr(PT_LOAD, 0, ps),
            phdr(PT_LOAD, 4 * ps, ps / 2),
            phdr(2, 100 * ps, ps), // PT_DYNAMIC is ignored
        ];
        let (size, lo) = load_span(&phdrs).unwrap();
        assert_eq!(lo, 0);
        assert_eq!(size, 5 * ps as usize);
    }

    #[test]
    fn test_load_span_page_rounds_odd_bounds() {
        let ps = crate::helpers::page_size() as u64;
        let phdrs = [phdr(PT_LOAD, ps + 16, 100)];
        let (size, lo) = load_span(&phdrs).unwrap();
        assert_eq!(lo, ps as usize);
        assert_eq!(size, ps as usize);
    }

    #[test]
    fn test_load_span_requires_load_segment() {
        let phdrs = [phdr(2, 0, 0x1000)];
        assert!(load_span(&phdrs).is_none());
    }

    #[test]
    fn test_missing_file_reports_not_found() {
        let err = load_library("/nonexistent/libmissing.so").unwrap_err();
        assert!(matches!(err, SoloadError::NotFound(_)));
    }
}
