//! Thread-local storage for manually loaded images
//!
//! The process-wide registry assigns module ids and static-block offsets
//! to every PT_TLS segment the loader encounters. Each thread gets one
//! lazily allocated block holding all registered modules, initialized
//! from their file images and released by a pthread key destructor when
//! the thread exits.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Once;

use lazy_static::lazy_static;
use log::{debug, error, warn};
use parking_lot::RwLock;

use crate::constants::MAX_TLS_MODULES;
use crate::error::{Result, SoloadError};
use crate::helpers::page_size;
use crate::image::ElfImage;

// ============================================================================
// TLS Index
// ============================================================================

/// Two-word descriptor consumed by `__tls_get_addr` and TLSDESC stubs.
#[repr(C)]
pub struct TlsIndex {
    pub module: u64,
    pub offset: u64,
}

// ============================================================================
// Module Registry
// ============================================================================

#[derive(Clone, Copy)]
struct TlsModule {
    /// Slot id, 0 marks the slot unused.
    module_id: usize,
    align: usize,
    memsz: usize,
    filesz: usize,
    /// Offset of this module inside every per-thread block.
    offset: usize,
    /// Runtime address of the initialization image.
    init_image: usize,
    /// Identity of the owning image, for unregistration.
    owner: usize,
}

impl TlsModule {
    const fn empty() -> Self {
        Self {
            module_id: 0,
            align: 1,
            memsz: 0,
            filesz: 0,
            offset: 0,
            init_image: 0,
            owner: 0,
        }
    }
}

pub struct TlsRegistry {
    modules: [TlsModule; MAX_TLS_MODULES],
    static_size: usize,
    static_align_max: usize,
    generation: u64,
}

lazy_static! {
    static ref REGISTRY: RwLock<TlsRegistry> = RwLock::new(TlsRegistry {
        modules: [TlsModule::empty(); MAX_TLS_MODULES],
        static_size: 0,
        static_align_max: 1,
        generation: 0,
    });
}

impl TlsRegistry {
    fn register_module(
        &mut self,
        align: usize,
        memsz: usize,
        filesz: usize,
        init_image: usize,
        owner: usize,
    ) -> Result<usize> {
        let mut mod_id = 0;
        for i in 1..MAX_TLS_MODULES {
            if self.modules[i].module_id == 0 {
                mod_id = i;
                break;
            }
        }
        if mod_id == 0 {
            error!("TLS module table exhausted");
            return Err(SoloadError::OutOfRegistrySlots("tls modules"));
        }

        let align = align.max(1);
        self.static_size = (self.static_size + align - 1) & !(align - 1);

        self.modules[mod_id] = TlsModule {
            module_id: mod_id,
            align,
            memsz,
            filesz,
            offset: self.static_size,
            init_image,
            owner,
        };
        self.static_size += memsz;

        if align > self.static_align_max {
            self.static_align_max = align;
        }
        Ok(mod_id)
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Register an image's TLS segment, assigning it a module id.
///
/// Images without a PT_TLS segment are accepted as a no-op.
pub fn register_segment(image: &mut ElfImage) -> Result<()> {
    let seg = match image.tls_segment() {
        Some(seg) => *seg,
        None => return Ok(()),
    };

    let init_image =
        crate::helpers::vaddr_to_runtime(image.base(), image.bias(), seg.p_vaddr);
    let owner = image as *const ElfImage as usize;

    let mod_id = REGISTRY.write().register_module(
        if seg.p_align != 0 { seg.p_align as usize } else { 1 },
        seg.p_memsz as usize,
        seg.p_filesz as usize,
        init_image,
        owner,
    )?;

    image.set_tls_module_id(mod_id);
    debug!("registered TLS module {mod_id} for {}", image.path());
    Ok(())
}

/// Release the slot owned by `image`, if any.
pub fn unregister_segment(image: &ElfImage) {
    let owner = image as *const ElfImage as usize;
    let mut reg = REGISTRY.write();
    for i in 1..MAX_TLS_MODULES {
        if reg.modules[i].owner == owner && reg.modules[i].module_id != 0 {
            reg.modules[i] = TlsModule::empty();
            break;
        }
    }
}

/// Signal that the module layout changed since the last observation.
pub fn bump_generation() {
    let mut reg = REGISTRY.write();
    reg.generation += 1;
}

pub fn generation() -> u64 {
    REGISTRY.read().generation
}

// ============================================================================
// Per-Thread Block
// ============================================================================

static KEY_INIT: Once = Once::new();
static TLS_KEY: AtomicU32 = AtomicU32::new(0);
static BLOCK_COUNT: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn block_destructor(block: *mut libc::c_void) {
    if !block.is_null() {
        libc::free(block);
        BLOCK_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

fn tls_key() -> libc::pthread_key_t {
    KEY_INIT.call_once(|| {
        let mut key: libc::pthread_key_t = 0;
        let ret = unsafe { libc::pthread_key_create(&mut key, Some(block_destructor)) };
        if ret != 0 {
            error!("pthread_key_create failed: {ret}");
        }
        TLS_KEY.store(key, Ordering::Relaxed);
    });
    TLS_KEY.load(Ordering::Relaxed)
}

/// Number of live per-thread blocks, for diagnostics.
pub fn live_block_count() -> usize {
    BLOCK_COUNT.load(Ordering::Relaxed)
}

fn allocate_block(reg: &TlsRegistry) -> *mut u8 {
    let mut align = reg.static_align_max.max(mem::size_of::<usize>());
    if align > page_size() {
        align = page_size();
    }
    let total = reg.static_size + align;

    let mut block: *mut libc::c_void = ptr::null_mut();
    let ret = unsafe { libc::posix_memalign(&mut block, align, total) };
    if ret != 0 || block.is_null() {
        error!("failed to allocate TLS block of {total} bytes");
        return ptr::null_mut();
    }
    let block = block as *mut u8;

    unsafe { ptr::write_bytes(block, 0, total) };

    for m in reg.modules.iter().skip(1) {
        if m.module_id == 0 || m.init_image == 0 || m.filesz == 0 {
            continue;
        }
        if m.offset + m.filesz <= total {
            unsafe {
                ptr::copy_nonoverlapping(m.init_image as *const u8, block.add(m.offset), m.filesz);
            }
        } else {
            error!("TLS module {} initialization image out of bounds", m.module_id);
        }
    }

    unsafe { libc::pthread_setspecific(tls_key(), block as *const libc::c_void) };
    BLOCK_COUNT.fetch_add(1, Ordering::Relaxed);
    debug!("allocated TLS block at {block:?}, {total} bytes");
    block
}

fn block_for_thread(reg: &TlsRegistry) -> *mut u8 {
    let block = unsafe { libc::pthread_getspecific(tls_key()) } as *mut u8;
    if block.is_null() {
        allocate_block(reg)
    } else {
        block
    }
}

// ============================================================================
// Address Resolution
// ============================================================================

/// Resolve a `(module, offset)` descriptor against the calling thread's
/// block. A null descriptor resolves to the block base.
pub fn get_address(ti: *const TlsIndex) -> *mut u8 {
    let reg = REGISTRY.read();
    let block = block_for_thread(&reg);
    if block.is_null() {
        return ptr::null_mut();
    }
    if ti.is_null() {
        return block;
    }

    let (module, offset) = unsafe { ((*ti).module as usize, (*ti).offset as usize) };
    if module == 0 || module >= MAX_TLS_MODULES {
        error!("TLS module id {module} out of range");
        return ptr::null_mut();
    }
    let m = &reg.modules[module];
    if m.module_id == 0 {
        error!("TLS module {module} not registered");
        return ptr::null_mut();
    }

    let total_offset = m.offset + offset;
    if total_offset >= reg.static_size {
        error!(
            "TLS offset {total_offset} out of bounds (static size {})",
            reg.static_size
        );
        return ptr::null_mut();
    }

    unsafe { block.add(total_offset) }
}

// ============================================================================
// Index Allocation
// ============================================================================

/// Heap-allocate a descriptor for the given image symbol. The caller owns
/// the allocation and releases it with `free_index`.
pub fn allocate_index(module_id: usize, sym_value: u64, addend: i64) -> *mut TlsIndex {
    if module_id == 0 {
        warn!("allocating TLS index for an image without a TLS module");
    }
    Box::into_raw(Box::new(TlsIndex {
        module: module_id as u64,
        offset: sym_value.wrapping_add(addend as u64),
    }))
}

/// Release a descriptor produced by `allocate_index`.
///
/// # Safety
/// `ti` must come from `allocate_index` and not be freed twice.
pub unsafe fn free_index(ti: *mut TlsIndex) {
    if !ti.is_null() {
        drop(Box::from_raw(ti));
    }
}

// ============================================================================
// Exported Entry Point
// ============================================================================

/// `__tls_get_addr` with the conventional one-argument ABI, handed to
/// loaded code through relocations.
#[no_mangle]
pub extern "C" fn __tls_get_addr(ti: *mut TlsIndex) -> *mut u8 {
    get_address(ti)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // The registry is process-global; one test exercises the whole
    // lifecycle so assertions see a known slot layout.
    #[test]
    fn test_registry_lifecycle() {
        let init_a: Vec<u8> = vec![0xaa; 16];
        let init_b: Vec<u8> = vec![0xbb; 8];

        let (id_a, id_b, off_a, off_b, static_size) = {
            let mut reg = REGISTRY.write();
            let id_a = reg
                .register_module(8, 32, 16, init_a.as_ptr() as usize, 0x1001)
                .unwrap();
            let id_b = reg
                .register_module(16, 24, 8, init_b.as_ptr() as usize, 0x1002)
                .unwrap();
            let off_a = reg.modules[id_a].offset;
            let off_b = reg.modules[id_b].offset;
            (id_a, id_b, off_a, off_b, reg.static_size)
        };
        bump_generation();

        // Ids start at 1 and slots are handed out lowest-first
        assert_eq!(id_a, 1);
        assert_eq!(id_b, 2);

        // Offsets respect each module's alignment and never overlap
        assert_eq!(off_a % 8, 0);
        assert_eq!(off_b % 16, 0);
        assert!(off_b >= off_a + 32);
        assert!(off_b + 24 <= static_size);

        // A block materializes on first access and carries the init images
        let ti_a = TlsIndex {
            module: id_a as u64,
            offset: 0,
        };
        let addr_a = get_address(&ti_a);
        assert!(!addr_a.is_null());
        assert_eq!(unsafe { *addr_a }, 0xaa);

        let ti_b = TlsIndex {
            module: id_b as u64,
            offset: 0,
        };
        let addr_b = get_address(&ti_b);
        assert_eq!(unsafe { *addr_b }, 0xbb);

        // memsz tail past filesz is zeroed
        assert_eq!(unsafe { *addr_a.add(16) }, 0);

        // The block base is stable and below both modules
        let base = get_address(ptr::null());
        assert!(!base.is_null());
        assert_eq!(unsafe { base.add(off_a) }, addr_a);
        assert!(live_block_count() >= 1);

        // Out-of-range lookups fail without touching the block
        let bad = TlsIndex {
            module: 0,
            offset: 0,
        };
        assert!(get_address(&bad).is_null());
        let bad = TlsIndex {
            module: 99,
            offset: 0,
        };
        assert!(get_address(&bad).is_null());
        let bad = TlsIndex {
            module: id_b as u64,
            offset: 1 << 20,
        };
        assert!(get_address(&bad).is_null());

        // Unregistration frees the slot for the next registration
        {
            let mut reg = REGISTRY.write();
            for i in 1..MAX_TLS_MODULES {
                if reg.modules[i].owner == 0x1001 {
                    reg.modules[i] = TlsModule::empty();
                }
            }
            let id_c = reg
                .register_module(4, 4, 0, 0, 0x1003)
                .unwrap();
            assert_eq!(id_c, id_a);
            for i in 1..MAX_TLS_MODULES {
                if reg.modules[i].owner == 0x1002 || reg.modules[i].owner == 0x1003 {
                    reg.modules[i] = TlsModule::empty();
                }
            }
        }
    }

    #[test]
    fn test_index_allocation_roundtrip() {
        let ti = allocate_index(3, 0x40, 8);
        unsafe {
            assert_eq!((*ti).module, 3);
            assert_eq!((*ti).offset, 0x48);
            free_index(ti);
        }
    }
}
