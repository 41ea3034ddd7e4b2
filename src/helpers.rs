//! Pointer-math helpers
//!
//! Every page-alignment and virtual-to-runtime conversion the loader does
//! goes through this module so the arithmetic can be audited in one place.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::constants::{PF_R, PF_W, PF_X};

// ============================================================================
// Page Math
// ============================================================================

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// System page size, queried once.
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let ps = if ps > 0 { ps as usize } else { 4096 };
    PAGE_SIZE.store(ps, Ordering::Relaxed);
    ps
}

/// Align down to the containing page boundary.
pub fn page_start(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

/// Align up to the next page boundary.
pub fn page_end(addr: usize) -> usize {
    page_start(addr + page_size() - 1)
}

// ============================================================================
// Address Conversion
// ============================================================================

/// Convert a file virtual address to its runtime address.
///
/// `bias` is the link-time address of the first mapped byte; adding
/// `base - bias` rebases any p_vaddr/d_ptr style value.
pub fn vaddr_to_runtime(base: usize, bias: u64, vaddr: u64) -> usize {
    base.wrapping_add(vaddr as usize).wrapping_sub(bias as usize)
}

/// Runtime load bias of an image: what got added to every link-time address.
pub fn load_bias(base: usize, bias: u64) -> usize {
    base.wrapping_sub(bias as usize)
}

// ============================================================================
// Protection Flags
// ============================================================================

/// mmap protection bits for a segment's p_flags.
pub fn prot_from_flags(p_flags: u32) -> i32 {
    let mut prot = 0;
    if p_flags & PF_R != 0 {
        prot |= libc::PROT_READ;
    }
    if p_flags & PF_W != 0 {
        prot |= libc::PROT_WRITE;
    }
    if p_flags & PF_X != 0 {
        prot |= libc::PROT_EXEC;
    }
    prot
}

// ============================================================================
// C String Access
// ============================================================================

/// Read a NUL-terminated string out of a byte buffer, if in bounds.
pub fn cstr_in(data: &[u8], offset: usize) -> Option<&str> {
    if offset >= data.len() {
        return None;
    }
    let tail = &data[offset..];
    let len = tail.iter().position(|&c| c == 0)?;
    std::str::from_utf8(&tail[..len]).ok()
}

/// Read a NUL-terminated string from a runtime address.
///
/// # Safety
/// `ptr` must point at a valid NUL-terminated string.
pub unsafe fn cstr_at<'a>(ptr: *const u8) -> &'a str {
    let cstr = std::ffi::CStr::from_ptr(ptr as *const libc::c_char);
    cstr.to_str().unwrap_or("")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alignment() {
        let ps = page_size();
        assert!(ps.is_power_of_two());

        assert_eq!(page_start(0), 0);
        assert_eq!(page_start(ps - 1), 0);
        assert_eq!(page_start(ps), ps);
        assert_eq!(page_start(ps + 1), ps);

        assert_eq!(page_end(0), 0);
        assert_eq!(page_end(1), ps);
        assert_eq!(page_end(ps), ps);
        assert_eq!(page_end(ps + 1), 2 * ps);
    }

    #[test]
    fn test_vaddr_conversion() {
        // base 0x7000_0000, image linked at 0x1000
        let base = 0x7000_0000usize;
        let bias = 0x1000u64;
        assert_eq!(vaddr_to_runtime(base, bias, 0x1000), base);
        assert_eq!(vaddr_to_runtime(base, bias, 0x1234), base + 0x234);
        assert_eq!(load_bias(base, bias), base - 0x1000);
    }

    #[test]
    fn test_prot_from_flags() {
        assert_eq!(prot_from_flags(PF_R), libc::PROT_READ);
        assert_eq!(
            prot_from_flags(PF_R | PF_W),
            libc::PROT_READ | libc::PROT_WRITE
        );
        assert_eq!(
            prot_from_flags(PF_R | PF_X),
            libc::PROT_READ | libc::PROT_EXEC
        );
        assert_eq!(prot_from_flags(0), 0);
    }

    #[test]
    fn test_cstr_in() {
        let data = b"hello\0world\0";
        assert_eq!(cstr_in(data, 0), Some("hello"));
        assert_eq!(cstr_in(data, 6), Some("world"));
        assert_eq!(cstr_in(data, 100), None);
        // No terminator in range
        assert_eq!(cstr_in(b"abc", 0), None);
    }
}
