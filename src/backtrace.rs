//! Unwinder visibility for manually loaded images
//!
//! The host's `dl_iterate_phdr` and `dladdr` only know about libraries
//! the system loader mapped. This registry keeps an equivalent record for
//! every image this loader maps, exposes interposed versions of both
//! functions that consult the host first and the registry second, and
//! registers `.eh_frame` data with the compiler runtime so exceptions can
//! unwind across loader boundaries.

use std::ffi::CString;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

use lazy_static::lazy_static;
use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::constants::{MAX_CUSTOM_LIBS, PT_LOAD};
use crate::elf::Elf64Phdr;
use crate::error::{Result, SoloadError};
use crate::image::ElfImage;

// ============================================================================
// Host Function Cache
// ============================================================================

type DlIterateCb =
    unsafe extern "C" fn(*mut libc::dl_phdr_info, libc::size_t, *mut libc::c_void) -> libc::c_int;
type DlIterateFn = unsafe extern "C" fn(Option<DlIterateCb>, *mut libc::c_void) -> libc::c_int;
type DladdrFn = unsafe extern "C" fn(*const libc::c_void, *mut libc::Dl_info) -> libc::c_int;
type FrameFn = unsafe extern "C" fn(*mut libc::c_void);

static HOST_INIT: Once = Once::new();
static HOST_DL_ITERATE_PHDR: AtomicUsize = AtomicUsize::new(0);
static HOST_DLADDR: AtomicUsize = AtomicUsize::new(0);
static REGISTER_FRAME: AtomicUsize = AtomicUsize::new(0);
static DEREGISTER_FRAME: AtomicUsize = AtomicUsize::new(0);

fn init_host_functions() {
    HOST_INIT.call_once(|| {
        let lookup = |name: &[u8]| -> usize {
            unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr() as *const libc::c_char) as usize }
        };
        HOST_DL_ITERATE_PHDR.store(lookup(b"dl_iterate_phdr\0"), Ordering::Relaxed);
        HOST_DLADDR.store(lookup(b"dladdr\0"), Ordering::Relaxed);
        // Weak compiler-runtime hooks; absent in hosts without unwinding
        REGISTER_FRAME.store(lookup(b"__register_frame\0"), Ordering::Relaxed);
        DEREGISTER_FRAME.store(lookup(b"__deregister_frame\0"), Ordering::Relaxed);

        if HOST_DL_ITERATE_PHDR.load(Ordering::Relaxed) == 0 {
            warn!("host dl_iterate_phdr not found");
        }
        if HOST_DLADDR.load(Ordering::Relaxed) == 0 {
            warn!("host dladdr not found");
        }
    });
}

fn host_dl_iterate_phdr() -> Option<DlIterateFn> {
    init_host_functions();
    let addr = HOST_DL_ITERATE_PHDR.load(Ordering::Relaxed);
    if addr == 0 {
        None
    } else {
        Some(unsafe { std::mem::transmute::<usize, DlIterateFn>(addr) })
    }
}

fn host_dladdr() -> Option<DladdrFn> {
    init_host_functions();
    let addr = HOST_DLADDR.load(Ordering::Relaxed);
    if addr == 0 {
        None
    } else {
        Some(unsafe { std::mem::transmute::<usize, DladdrFn>(addr) })
    }
}

fn register_frame_fn() -> Option<FrameFn> {
    init_host_functions();
    let addr = REGISTER_FRAME.load(Ordering::Relaxed);
    if addr == 0 {
        None
    } else {
        Some(unsafe { std::mem::transmute::<usize, FrameFn>(addr) })
    }
}

fn deregister_frame_fn() -> Option<FrameFn> {
    init_host_functions();
    let addr = DEREGISTER_FRAME.load(Ordering::Relaxed);
    if addr == 0 {
        None
    } else {
        Some(unsafe { std::mem::transmute::<usize, FrameFn>(addr) })
    }
}

// ============================================================================
// DWARF Pointer Decoding
// ============================================================================

pub const DW_EH_PE_ABSPTR: u8 = 0x00;
pub const DW_EH_PE_ULEB128: u8 = 0x01;
pub const DW_EH_PE_UDATA2: u8 = 0x02;
pub const DW_EH_PE_UDATA4: u8 = 0x03;
pub const DW_EH_PE_UDATA8: u8 = 0x04;
pub const DW_EH_PE_SLEB128: u8 = 0x09;
pub const DW_EH_PE_SDATA2: u8 = 0x0a;
pub const DW_EH_PE_SDATA4: u8 = 0x0b;
pub const DW_EH_PE_SDATA8: u8 = 0x0c;
pub const DW_EH_PE_PCREL: u8 = 0x10;
pub const DW_EH_PE_DATAREL: u8 = 0x30;
pub const DW_EH_PE_OMIT: u8 = 0xff;

/// Decode one DWARF-encoded pointer from `bytes` at `pos`.
///
/// `pc` is the runtime address of `bytes[pos]` (for PC-relative values)
/// and `data_base` the image base (for data-relative values). Returns the
/// decoded value and the position after it.
fn decode_dwarf_pointer(
    bytes: &[u8],
    pos: usize,
    encoding: u8,
    pc: usize,
    data_base: usize,
) -> Option<(usize, usize)> {
    if encoding == DW_EH_PE_OMIT {
        return Some((0, pos));
    }

    let (raw, next) = match encoding & 0x0f {
        DW_EH_PE_ABSPTR | DW_EH_PE_UDATA8 => {
            let v: u64 = crate::image::read_at(bytes, pos)?;
            (v as usize, pos + 8)
        }
        DW_EH_PE_UDATA2 => {
            let v: u16 = crate::image::read_at(bytes, pos)?;
            (v as usize, pos + 2)
        }
        DW_EH_PE_UDATA4 => {
            let v: u32 = crate::image::read_at(bytes, pos)?;
            (v as usize, pos + 4)
        }
        DW_EH_PE_SDATA2 => {
            let v: i16 = crate::image::read_at(bytes, pos)?;
            (v as isize as usize, pos + 2)
        }
        DW_EH_PE_SDATA4 => {
            let v: i32 = crate::image::read_at(bytes, pos)?;
            (v as isize as usize, pos + 4)
        }
        DW_EH_PE_SDATA8 => {
            let v: i64 = crate::image::read_at(bytes, pos)?;
            (v as isize as usize, pos + 8)
        }
        DW_EH_PE_ULEB128 => {
            let mut dec = crate::leb128::Leb128Decoder::new(&bytes[pos..]);
            let v = dec.decode_unsigned();
            // Recompute consumed length from the raw bytes
            let mut len = 0;
            while pos + len < bytes.len() {
                let b = bytes[pos + len];
                len += 1;
                if b & 0x80 == 0 {
                    break;
                }
            }
            (v as usize, pos + len)
        }
        other => {
            warn!("unsupported DWARF pointer encoding {other:#04x}");
            return None;
        }
    };

    let value = if raw == 0 {
        0
    } else {
        match encoding & 0x70 {
            DW_EH_PE_PCREL => raw.wrapping_add(pc),
            DW_EH_PE_DATAREL => raw.wrapping_add(data_base),
            _ => raw,
        }
    };

    Some((value, next))
}

/// Locate `.eh_frame` through an `eh_frame_hdr` blob.
///
/// Layout: version, eh_frame_ptr encoding, fde_count encoding, table
/// encoding, then the encoded eh_frame pointer itself.
fn parse_eh_frame_hdr(hdr: &[u8], hdr_runtime_addr: usize, data_base: usize) -> Option<usize> {
    if hdr.len() < 4 {
        return None;
    }
    if hdr[0] != 1 {
        warn!("unsupported eh_frame_hdr version {}", hdr[0]);
        return None;
    }

    let enc = hdr[1];
    if enc == DW_EH_PE_OMIT {
        return None;
    }

    let (value, _) = decode_dwarf_pointer(hdr, 4, enc, hdr_runtime_addr + 4, data_base)?;
    if value == 0 {
        None
    } else {
        Some(value)
    }
}

// ============================================================================
// Registry
// ============================================================================

struct LibInfo {
    /// Owning image. Valid while the slot is occupied: images are
    /// unregistered before they are dropped.
    image: *const ElfImage,
    path_c: CString,
    /// Registry-owned clone of the program-header array; `info.dlpi_phdr`
    /// points into it.
    phdrs: Box<[Elf64Phdr]>,
    info: libc::dl_phdr_info,
    eh_frame_registered: usize,
}

// Raw pointers reference heap allocations owned by the same slot plus the
// registered image, which outlives its slot.
unsafe impl Send for LibInfo {}

struct BacktraceRegistry {
    libs: [Option<LibInfo>; MAX_CUSTOM_LIBS],
}

lazy_static! {
    static ref REGISTRY: Mutex<BacktraceRegistry> = Mutex::new(BacktraceRegistry {
        libs: std::array::from_fn(|_| None),
    });
}

/// Make `image` visible to interposed phdr iteration and addr lookup.
pub fn register_library(image: &ElfImage) -> Result<()> {
    let mut reg = REGISTRY.lock();

    let slot = reg
        .libs
        .iter()
        .position(|l| l.is_none())
        .ok_or(SoloadError::OutOfRegistrySlots("backtrace libraries"))?;

    let path_c = CString::new(image.path())
        .map_err(|_| SoloadError::NotFound(format!("{}: embedded NUL", image.path())))?;
    let phdrs = image.phdrs().into_boxed_slice();

    let mut info: libc::dl_phdr_info = unsafe { std::mem::zeroed() };
    info.dlpi_addr = image.load_bias() as libc::Elf64_Addr;
    info.dlpi_name = path_c.as_ptr();
    info.dlpi_phdr = phdrs.as_ptr() as *const libc::Elf64_Phdr;
    info.dlpi_phnum = phdrs.len() as libc::Elf64_Half;
    info.dlpi_adds = 1;
    info.dlpi_subs = 0;
    if image.tls_segment().is_some() {
        info.dlpi_tls_modid = image.tls_module_id();
    }

    reg.libs[slot] = Some(LibInfo {
        image: image as *const ElfImage,
        path_c,
        phdrs,
        info,
        eh_frame_registered: 0,
    });

    debug!("registered {} for backtraces", image.path());
    Ok(())
}

/// Drop the registry record for `image`, deregistering its frames.
pub fn unregister_library(image: &ElfImage) -> bool {
    let ident = image as *const ElfImage;
    let mut reg = REGISTRY.lock();

    for slot in reg.libs.iter_mut() {
        let matches = slot.as_ref().map_or(false, |l| l.image == ident);
        if matches {
            let lib = slot.take().unwrap();
            if lib.eh_frame_registered != 0 {
                if let Some(dereg) = deregister_frame_fn() {
                    unsafe { dereg(lib.eh_frame_registered as *mut libc::c_void) };
                }
            }
            debug!("unregistered {}", image.path());
            return true;
        }
    }
    false
}

/// Hand the image's `.eh_frame` to the compiler runtime, if it exports
/// the registration hooks.
pub fn register_eh_frame(image: &ElfImage) {
    let register = match register_frame_fn() {
        Some(f) => f,
        None => return,
    };

    let eh_frame = image.eh_frame().map(|(addr, _)| addr).or_else(|| {
        let (hdr_addr, hdr_size) = image.eh_frame_hdr()?;
        let hdr = unsafe { std::slice::from_raw_parts(hdr_addr as *const u8, hdr_size) };
        parse_eh_frame_hdr(hdr, hdr_addr, image.load_bias())
    });

    let eh_frame = match eh_frame {
        Some(addr) => addr,
        None => {
            debug!("no eh_frame found for {}", image.path());
            return;
        }
    };

    unsafe { register(eh_frame as *mut libc::c_void) };

    let ident = image as *const ElfImage;
    let mut reg = REGISTRY.lock();
    for slot in reg.libs.iter_mut().flatten() {
        if slot.image == ident {
            slot.eh_frame_registered = eh_frame;
            break;
        }
    }
    debug!("registered eh_frame for {} at {eh_frame:#x}", image.path());
}

/// Undo `register_eh_frame` ahead of unregistration.
pub fn unregister_eh_frame(image: &ElfImage) {
    let dereg = match deregister_frame_fn() {
        Some(f) => f,
        None => return,
    };

    let ident = image as *const ElfImage;
    let mut reg = REGISTRY.lock();
    for slot in reg.libs.iter_mut().flatten() {
        if slot.image == ident && slot.eh_frame_registered != 0 {
            unsafe { dereg(slot.eh_frame_registered as *mut libc::c_void) };
            slot.eh_frame_registered = 0;
            break;
        }
    }
}

// ============================================================================
// Interposed Entry Points
// ============================================================================

/// Interposed `dl_iterate_phdr`: host libraries first, then every
/// registered manual mapping.
pub unsafe extern "C" fn custom_dl_iterate_phdr(
    callback: Option<DlIterateCb>,
    data: *mut libc::c_void,
) -> libc::c_int {
    let callback = match callback {
        Some(cb) => cb,
        None => return 0,
    };

    if let Some(host) = host_dl_iterate_phdr() {
        let result = host(Some(callback), data);
        if result != 0 {
            return result;
        }
    }

    let mut reg = REGISTRY.lock();
    for slot in reg.libs.iter_mut().flatten() {
        let result = callback(
            &mut slot.info,
            std::mem::size_of::<libc::dl_phdr_info>(),
            data,
        );
        if result != 0 {
            return result;
        }
    }
    0
}

/// Interposed `dladdr`: host resolution first, then a scan of the
/// registered mappings' PT_LOAD ranges.
pub unsafe extern "C" fn custom_dladdr(
    addr: *const libc::c_void,
    info: *mut libc::Dl_info,
) -> libc::c_int {
    if let Some(host) = host_dladdr() {
        if host(addr, info) != 0 {
            return 1;
        }
    }
    if info.is_null() {
        return 0;
    }

    let addr = addr as usize;
    let reg = REGISTRY.lock();

    for slot in reg.libs.iter().flatten() {
        for ph in slot.phdrs.iter() {
            if ph.p_type != PT_LOAD {
                continue;
            }
            let start = slot.info.dlpi_addr as usize + ph.p_vaddr as usize;
            let end = start + ph.p_memsz as usize;
            if addr < start || addr >= end {
                continue;
            }

            (*info).dli_fname = slot.path_c.as_ptr();
            (*info).dli_fbase = slot.info.dlpi_addr as *mut libc::c_void;
            (*info).dli_sname = ptr::null();
            (*info).dli_saddr = ptr::null_mut();

            // Slot validity guarantees the image is still alive
            let image = &*slot.image;
            if let Some((name, sym_addr)) = image.symbol_at(addr) {
                // Symbol names come from the image's string table, where
                // every entry is NUL-terminated in place.
                (*info).dli_sname = name.as_ptr() as *const libc::c_char;
                (*info).dli_saddr = sym_addr as *mut libc::c_void;
            }
            return 1;
        }
    }
    0
}

/// Report a registration failure without aborting the link.
pub fn log_registration_error(path: &str, err: &SoloadError) {
    error!("backtrace registration for {path} failed: {err}");
}

// ============================================================================
// Tests
// ============================================================================
