//! Link orchestration
//!
//! A `Linker` owns one main image plus everything it drags in: the
//! dependency closure, the TLS descriptors handed out for TLSDESC
//! relocations, and the mappings of every manually loaded library. The
//! `link()` sequence loads dependencies, registers TLS segments, opens up
//! page protections, applies every relocation format, restores
//! protections, makes the images visible to unwinders and finally runs
//! constructors. `destroy()` and `abandon()` retrace those steps in
//! reverse.

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::mem;
use std::ptr;

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::backtrace;
use crate::constants::*;
use crate::elf::{elf_r_sym, elf_r_type, Elf64Dyn, Elf64Rel, Elf64Rela, Elf64Sym};
use crate::error::{Result, SoloadError};
use crate::helpers::{cstr_at, page_end, page_size, page_start, prot_from_flags, vaddr_to_runtime};
use crate::image::ElfImage;
use crate::leb128::Leb128Decoder;
use crate::loader;
use crate::tls::{self, TlsIndex};

// ============================================================================
// Process Arguments
// ============================================================================

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

static G_ARGC: AtomicI32 = AtomicI32::new(0);
static G_ARGV: AtomicUsize = AtomicUsize::new(0);
static G_ENVP: AtomicUsize = AtomicUsize::new(0);

/// Record the process vectors forwarded to init-array functions.
pub fn set_process_args(argc: i32, argv: *mut *mut libc::c_char, envp: *mut *mut libc::c_char) {
    G_ARGC.store(argc, Ordering::Relaxed);
    G_ARGV.store(argv as usize, Ordering::Relaxed);
    G_ENVP.store(envp as usize, Ordering::Relaxed);
}

// ============================================================================
// Loaded Dependency
// ============================================================================

pub struct LoadedDep {
    pub image: Box<ElfImage>,
    /// True when this loader mapped the library itself; false when the
    /// host's mapping was adopted.
    pub is_manual_load: bool,
    pub map_base: usize,
    pub map_size: usize,
}

// ============================================================================
// Symbol Resolution
// ============================================================================

#[derive(Clone, Copy)]
pub struct SymbolLookup {
    pub address: usize,
    /// Owning image, none when the host resolver supplied the address.
    pub image: Option<*const ElfImage>,
    pub bind: u8,
}

impl SymbolLookup {
    fn invalid() -> Self {
        Self {
            address: 0,
            image: None,
            bind: 0,
        }
    }

    fn valid(&self) -> bool {
        self.address != 0
    }

    fn is_weak(&self) -> bool {
        self.bind == STB_WEAK
    }
}

struct CacheEntry {
    address: usize,
    image: Option<*const ElfImage>,
    bind: u8,
    found: bool,
}

// ============================================================================
// TLSDESC Resolver
// ============================================================================

/// Resolver placed in TLSDESC slots. Returns the offset of the variable
/// relative to the calling thread's block base, per the descriptor ABI.
unsafe extern "C" fn dynamic_tls_resolver(ti: *mut TlsIndex) -> u64 {
    let addr = tls::get_address(ti);
    let base = tls::get_address(ptr::null());
    (addr as u64).wrapping_sub(base as u64)
}

// ============================================================================
// Relocation Table Walks
// ============================================================================

/// Walk a RELR table and report each target offset exactly once.
///
/// Address words (bit 0 clear) name a target directly and reset the
/// cursor; bitmap words (bit 0 set) apply 63 successive slots after it.
pub(crate) fn for_each_relr_offset(words: &[u64], mut f: impl FnMut(u64)) {
    let mut cursor: u64 = 0;
    for &entry in words {
        if entry & 1 == 0 {
            f(entry);
            cursor = entry + mem::size_of::<u64>() as u64;
        } else {
            let mut bitmap = entry >> 1;
            let mut bit = 0u64;
            while bitmap != 0 && bit < 63 {
                if bitmap & 1 != 0 {
                    f(cursor + bit * mem::size_of::<u64>() as u64);
                }
                bitmap >>= 1;
                bit += 1;
            }
            cursor += 63 * mem::size_of::<u64>() as u64;
        }
    }
}

/// Decode an APS2 packed relocation stream, feeding each entry to `f` as
/// `(sym_idx, type, r_offset, addend)`.
pub(crate) fn for_each_packed_reloc(
    data: &[u8],
    is_rela: bool,
    mut f: impl FnMut(u32, u32, u64, i64),
) -> Result<()> {
    if data.len() <= 4 || data[..4] != APS2_MAGIC {
        return Err(SoloadError::MalformedPackedReloc("bad APS2 magic"));
    }

    let mut dec = Leb128Decoder::new(&data[4..]);
    let num_relocs = dec.decode_unsigned();
    let mut r_offset = dec.decode() as u64;

    let mut done: u64 = 0;
    while done < num_relocs {
        let group_size = dec.decode_unsigned();
        if group_size == 0 {
            return Err(SoloadError::MalformedPackedReloc("empty relocation group"));
        }
        let group_flags = dec.decode_unsigned();

        let grouped_by_info = group_flags & RELOCATION_GROUPED_BY_INFO_FLAG != 0;
        let grouped_by_delta = group_flags & RELOCATION_GROUPED_BY_OFFSET_DELTA_FLAG != 0;
        let grouped_by_addend = group_flags & RELOCATION_GROUPED_BY_ADDEND_FLAG != 0;
        let has_addend = group_flags & RELOCATION_GROUP_HAS_ADDEND_FLAG != 0;

        if !is_rela && has_addend {
            return Err(SoloadError::MalformedPackedReloc(
                "REL-form stream carries addends",
            ));
        }

        let mut group_offset_delta: i64 = 0;
        let mut sym_idx: u32 = 0;
        let mut rtype: u32 = 0;
        let mut addend: i64 = 0;

        if grouped_by_delta {
            group_offset_delta = dec.decode();
        }
        if grouped_by_info {
            let r_info = dec.decode_unsigned();
            sym_idx = elf_r_sym(r_info);
            rtype = elf_r_type(r_info);
        }
        if is_rela && has_addend && grouped_by_addend {
            addend += dec.decode();
        }

        for _ in 0..group_size {
            if grouped_by_delta {
                r_offset = r_offset.wrapping_add(group_offset_delta as u64);
            } else {
                r_offset = r_offset.wrapping_add(dec.decode() as u64);
            }

            if !grouped_by_info {
                let r_info = dec.decode_unsigned();
                sym_idx = elf_r_sym(r_info);
                rtype = elf_r_type(r_info);
            }

            if is_rela && has_addend && !grouped_by_addend {
                addend += dec.decode();
            }

            f(sym_idx, rtype, r_offset, addend);
        }

        done += group_size;
    }

    Ok(())
}

// ============================================================================
// Dynamic Table Snapshot
// ============================================================================

#[derive(Default)]
struct RelocTables {
    rela: usize,
    rela_sz: usize,
    rela_ent: usize,
    rel: usize,
    rel_sz: usize,
    rel_ent: usize,
    relr: usize,
    relr_sz: usize,
    jmprel: usize,
    jmprel_sz: usize,
    pltrel_type: i64,
    dynsym: usize,
    dynstr: usize,
    android_reloc: usize,
    android_reloc_sz: usize,
    is_android_rela: bool,
}

// ============================================================================
// Linker
// ============================================================================

pub struct Linker {
    main_image: Option<Box<ElfImage>>,
    deps: Vec<LoadedDep>,
    main_map_size: usize,
    is_linked: bool,
    symbol_cache: Mutex<HashMap<String, CacheEntry>>,
    tls_indices: Mutex<Vec<*mut TlsIndex>>,
}

// Raw pointers reference heap allocations and process-global mappings the
// linker itself owns.
unsafe impl Send for Linker {}

impl Default for Linker {
    fn default() -> Self {
        Self::new()
    }
}

impl Linker {
    pub fn new() -> Self {
        Self {
            main_image: None,
            deps: Vec::new(),
            main_map_size: 0,
            is_linked: false,
            symbol_cache: Mutex::new(HashMap::new()),
            tls_indices: Mutex::new(Vec::new()),
        }
    }

    pub fn init(&mut self, image: Box<ElfImage>) {
        self.main_image = Some(image);
        self.deps.clear();
        self.main_map_size = 0;
        self.is_linked = false;
    }

    pub fn main_image(&self) -> Option<&ElfImage> {
        self.main_image.as_deref()
    }

    pub fn set_main_map_size(&mut self, size: usize) {
        self.main_map_size = size;
    }

    pub fn is_linked(&self) -> bool {
        self.is_linked
    }

    pub fn dependency_count(&self) -> usize {
        self.deps.len()
    }

    pub fn clear_symbol_cache(&self) {
        self.symbol_cache.lock().clear();
    }

    // ------------------------------------------------------------------
    // Library search
    // ------------------------------------------------------------------

    fn file_exists(path: &str) -> bool {
        let c_path = match CString::new(path) {
            Ok(p) => p,
            Err(_) => return false,
        };
        unsafe { libc::access(c_path.as_ptr(), libc::F_OK) == 0 }
    }

    fn find_library_path(name: &str) -> Option<String> {
        if name.starts_with('/') {
            if Self::file_exists(name) {
                return Some(name.to_string());
            }
            error!("library not found at absolute path: {name}");
            return None;
        }

        // libc++.so moved into the runtime APEX on newer systems
        if name == "libc++.so" {
            let apex = "/apex/com.android.runtime/lib64/libc++.so";
            if Self::file_exists(apex) {
                return Some(apex.to_string());
            }
            let system = "/system/lib64/libc++.so";
            if Self::file_exists(system) {
                return Some(system.to_string());
            }
        }

        for dir in LIBRARY_SEARCH_PATHS {
            let candidate = format!("{dir}{name}");
            if Self::file_exists(&candidate) {
                debug!("found library: {candidate}");
                return Some(candidate);
            }
        }

        error!("library not found: {name}");
        None
    }

    fn is_loaded(&self, path: &str) -> bool {
        if self.main_image.as_ref().map_or(false, |m| m.path() == path) {
            return true;
        }
        self.deps.iter().any(|d| d.image.path() == path)
    }

    // ------------------------------------------------------------------
    // Dependency loading
    // ------------------------------------------------------------------

    /// DT_NEEDED names of an image, preferring the runtime DT_STRTAB over
    /// the file's string table.
    fn collect_needed(image: &ElfImage, seen: &mut HashSet<String>, out: &mut Vec<String>) {
        let dyn_ptr = match image.dynamic_ptr() {
            Some(p) => p,
            None => return,
        };

        let mut strtab: Option<usize> = None;
        let mut needed_offsets = Vec::new();

        unsafe {
            let mut d = dyn_ptr;
            while (*d).d_tag != DT_NULL {
                match (*d).d_tag {
                    DT_STRTAB => {
                        strtab = Some(vaddr_to_runtime(image.base(), image.bias(), (*d).d_val));
                    }
                    DT_NEEDED => needed_offsets.push((*d).d_val),
                    _ => {}
                }
                d = d.add(1);
            }
        }

        for off in needed_offsets {
            let name = match strtab {
                Some(tab) => unsafe { cstr_at((tab + off as usize) as *const u8).to_string() },
                None => match image.dynstr_at(off as usize) {
                    Some(s) => s.to_string(),
                    None => continue,
                },
            };
            if !name.is_empty() && seen.insert(name.clone()) {
                out.push(name);
            }
        }
    }

    fn load_dependencies(&mut self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut to_load = Vec::new();

        let main = self.main_image.as_ref().expect("linker not initialized");
        Self::collect_needed(main, &mut seen, &mut to_load);

        let mut i = 0;
        while i < to_load.len() {
            let name = to_load[i].clone();
            i += 1;

            let full_path = match Self::find_library_path(&name) {
                Some(p) => p,
                None => {
                    warn!("skipping missing library: {name}");
                    continue;
                }
            };

            if self.is_loaded(&full_path) {
                continue;
            }

            let dep = match ElfImage::create(&full_path, None) {
                Ok(image) => {
                    debug!("adopted host copy of {full_path}");
                    LoadedDep {
                        image,
                        is_manual_load: false,
                        map_base: 0,
                        map_size: 0,
                    }
                }
                Err(_) => {
                    let mapping = loader::load_library(&full_path)?;
                    let image = match ElfImage::create(&full_path, Some(mapping.base)) {
                        Ok(image) => image,
                        Err(e) => {
                            unsafe {
                                libc::munmap(mapping.base as *mut libc::c_void, mapping.size);
                            }
                            return Err(e);
                        }
                    };
                    LoadedDep {
                        image,
                        is_manual_load: true,
                        map_base: mapping.base,
                        map_size: mapping.size,
                    }
                }
            };

            if dep.is_manual_load {
                Self::collect_needed(&dep.image, &mut seen, &mut to_load);
            }
            self.deps.push(dep);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Symbol resolution
    // ------------------------------------------------------------------

    fn find_symbol(&self, name: &str) -> SymbolLookup {
        let mut result = SymbolLookup::invalid();
        let mut weak_result = SymbolLookup::invalid();

        if let Some(main) = &self.main_image {
            if let Some((addr, bind)) = main.find_symbol_address(name) {
                result = SymbolLookup {
                    address: addr,
                    image: Some(&**main as *const ElfImage),
                    bind,
                };
                if bind == STB_GLOBAL {
                    return result;
                }
                if bind == STB_WEAK && !weak_result.valid() {
                    weak_result = result;
                }
            }
        }

        for dep in &self.deps {
            if let Some((addr, bind)) = dep.image.find_symbol_address(name) {
                result = SymbolLookup {
                    address: addr,
                    image: Some(&*dep.image as *const ElfImage),
                    bind,
                };
                if bind == STB_GLOBAL {
                    return result;
                }
                if bind == STB_WEAK && !weak_result.valid() {
                    weak_result = result;
                }
            }
        }

        if result.valid() && !result.is_weak() {
            return result;
        }
        if weak_result.valid() {
            debug!("using weak definition of {name}");
            return weak_result;
        }

        // Fall back to the host's resolver for libc and friends
        if let Ok(c_name) = CString::new(name) {
            let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c_name.as_ptr()) };
            if !addr.is_null() {
                debug!("resolved {name} through the host");
                return SymbolLookup {
                    address: addr as usize,
                    image: None,
                    bind: STB_GLOBAL,
                };
            }
        }

        error!("symbol not found: {name}");
        SymbolLookup::invalid()
    }

    fn find_symbol_cached(&self, name: &str) -> SymbolLookup {
        {
            let cache = self.symbol_cache.lock();
            if let Some(entry) = cache.get(name) {
                if entry.found {
                    return SymbolLookup {
                        address: entry.address,
                        image: entry.image,
                        bind: entry.bind,
                    };
                }
                return SymbolLookup::invalid();
            }
        }

        let result = self.find_symbol(name);

        self.symbol_cache.lock().insert(
            name.to_string(),
            CacheEntry {
                address: result.address,
                image: result.image,
                bind: result.bind,
                found: result.valid(),
            },
        );

        result
    }

    // ------------------------------------------------------------------
    // Relocation processing
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    unsafe fn process_relocation(
        &self,
        image: &ElfImage,
        sym_idx: u32,
        rtype: u32,
        offset: u64,
        addend: i64,
        load_bias: usize,
        dynsym: *const Elf64Sym,
        dynstr: *const u8,
        is_rela: bool,
    ) {
        let target = (load_bias + offset as usize) as *mut u64;

        match rtype {
            R_AARCH64_NONE => {}

            R_AARCH64_COPY => {
                warn!("R_AARCH64_COPY relocation not supported, skipping");
            }

            R_AARCH64_RELATIVE => {
                let a = if is_rela { addend as u64 } else { *target };
                *target = (load_bias as u64).wrapping_add(a);
            }

            R_AARCH64_IRELATIVE => {
                let a = if is_rela { addend as u64 } else { *target };
                let resolver = (load_bias as u64).wrapping_add(a);
                *target = crate::auxv::call_ifunc_resolver(resolver as usize);
            }

            R_AARCH64_GLOB_DAT
            | R_AARCH64_ABS64
            | R_AARCH64_JUMP_SLOT
            | R_AARCH64_TLS_DTPMOD
            | R_AARCH64_TLS_DTPREL
            | R_AARCH64_TLS_TPREL
            | R_AARCH64_TLSDESC => {
                let sym = ptr::read_unaligned(dynsym.add(sym_idx as usize));
                let sym_name = cstr_at(dynstr.add(sym.st_name as usize));

                let lookup = self.find_symbol_cached(sym_name);
                if !lookup.valid() {
                    error!("undefined symbol: {sym_name}");
                    return;
                }

                // Unwinders must see manually loaded images, so these two
                // always resolve to the interposed implementations.
                if sym_name == "dl_iterate_phdr" {
                    *target = backtrace::custom_dl_iterate_phdr as usize as u64;
                    return;
                }
                if sym_name == "dladdr" {
                    *target = backtrace::custom_dladdr as usize as u64;
                    return;
                }

                match rtype {
                    R_AARCH64_GLOB_DAT | R_AARCH64_JUMP_SLOT => {
                        *target = lookup.address as u64;
                    }
                    R_AARCH64_ABS64 => {
                        let a = if is_rela { addend as u64 } else { *target };
                        *target = (lookup.address as u64).wrapping_add(a);
                    }
                    R_AARCH64_TLS_DTPMOD => match lookup.image {
                        Some(owner) => {
                            let owner = &*owner;
                            *target = if owner.tls_segment().is_some() {
                                owner.tls_module_id() as u64
                            } else {
                                0
                            };
                        }
                        None => {
                            error!("TLS_DTPMOD needs a loaded image for {sym_name}");
                            *target = 0;
                        }
                    },
                    R_AARCH64_TLS_DTPREL => {
                        *target = sym.st_value.wrapping_add(addend as u64);
                    }
                    R_AARCH64_TLS_TPREL => {
                        let owner = match lookup.image {
                            Some(owner) => &*owner,
                            None => {
                                error!("TLS_TPREL needs a loaded image for {sym_name}");
                                *target = 0;
                                return;
                            }
                        };
                        let ti = TlsIndex {
                            module: owner.tls_module_id() as u64,
                            offset: sym.st_value.wrapping_add(addend as u64),
                        };
                        let block = tls::get_address(&ti);
                        if block.is_null() {
                            error!("failed to resolve thread-local {sym_name}");
                            *target = 0;
                        } else {
                            let base = tls::get_address(ptr::null());
                            *target = (block as u64).wrapping_sub(base as u64);
                        }
                    }
                    R_AARCH64_TLSDESC => {
                        let owner = match lookup.image {
                            Some(owner) => &*owner,
                            None => {
                                error!("TLSDESC needs a loaded image for {sym_name}");
                                *target = 0;
                                *target.add(1) = 0;
                                return;
                            }
                        };
                        let ti = tls::allocate_index(owner.tls_module_id(), sym.st_value, addend);
                        *target = dynamic_tls_resolver as usize as u64;
                        *target.add(1) = ti as u64;
                        self.tls_indices.lock().push(ti);
                    }
                    _ => unreachable!(),
                }
            }

            other => {
                error!("unsupported relocation type {other}");
            }
        }
    }

    fn collect_reloc_tables(image: &ElfImage) -> Option<RelocTables> {
        let dyn_ptr = image.dynamic_ptr()?;
        let mut t = RelocTables::default();

        unsafe {
            let mut d = dyn_ptr as *const Elf64Dyn;
            while (*d).d_tag != DT_NULL {
                let val = (*d).d_val;
                let runtime = vaddr_to_runtime(image.base(), image.bias(), val);
                match (*d).d_tag {
                    DT_RELA => t.rela = runtime,
                    DT_RELASZ => t.rela_sz = val as usize,
                    DT_RELAENT => t.rela_ent = val as usize,
                    DT_REL => t.rel = runtime,
                    DT_RELSZ => t.rel_sz = val as usize,
                    DT_RELENT => t.rel_ent = val as usize,
                    DT_RELR => t.relr = runtime,
                    DT_RELRSZ => t.relr_sz = val as usize,
                    DT_JMPREL => t.jmprel = runtime,
                    DT_PLTRELSZ => t.jmprel_sz = val as usize,
                    DT_PLTREL => t.pltrel_type = val as i64,
                    DT_SYMTAB => t.dynsym = runtime,
                    DT_STRTAB => t.dynstr = runtime,
                    DT_ANDROID_RELA => {
                        t.android_reloc = runtime;
                        t.is_android_rela = true;
                    }
                    DT_ANDROID_REL => t.android_reloc = runtime,
                    DT_ANDROID_RELASZ | DT_ANDROID_RELSZ => t.android_reloc_sz = val as usize,
                    DT_ANDROID_RELR => t.relr = runtime,
                    DT_ANDROID_RELRSZ => t.relr_sz = val as usize,
                    DT_ANDROID_RELRENT => {
                        if val as usize != mem::size_of::<u64>() {
                            error!("unsupported RELR entry size {val}");
                            return None;
                        }
                    }
                    _ => {}
                }
                d = d.add(1);
            }
        }

        Some(t)
    }

    fn process_relocations(&self, image: &ElfImage) {
        let t = match Self::collect_reloc_tables(image) {
            Some(t) => t,
            None => return,
        };

        if t.dynsym == 0 || t.dynstr == 0 {
            return;
        }

        let load_bias = image.load_bias();
        let dynsym = t.dynsym as *const Elf64Sym;
        let dynstr = t.dynstr as *const u8;

        // Relative-relative table
        if t.relr != 0 && t.relr_sz != 0 {
            let words = unsafe {
                std::slice::from_raw_parts(t.relr as *const u64, t.relr_sz / mem::size_of::<u64>())
            };
            for_each_relr_offset(words, |offset| unsafe {
                let target = (load_bias + offset as usize) as *mut u64;
                *target = (*target).wrapping_add(load_bias as u64);
            });
        }

        // RELA table
        if t.rela != 0 && t.rela_sz != 0 {
            let ent = if t.rela_ent != 0 {
                t.rela_ent
            } else {
                mem::size_of::<Elf64Rela>()
            };
            for i in 0..t.rela_sz / ent {
                unsafe {
                    let r = ptr::read_unaligned((t.rela + i * ent) as *const Elf64Rela);
                    self.process_relocation(
                        image,
                        elf_r_sym(r.r_info),
                        elf_r_type(r.r_info),
                        r.r_offset,
                        r.r_addend,
                        load_bias,
                        dynsym,
                        dynstr,
                        true,
                    );
                }
            }
        }

        // REL table
        if t.rel != 0 && t.rel_sz != 0 {
            let ent = if t.rel_ent != 0 {
                t.rel_ent
            } else {
                mem::size_of::<Elf64Rel>()
            };
            for i in 0..t.rel_sz / ent {
                unsafe {
                    let r = ptr::read_unaligned((t.rel + i * ent) as *const Elf64Rel);
                    self.process_relocation(
                        image,
                        elf_r_sym(r.r_info),
                        elf_r_type(r.r_info),
                        r.r_offset,
                        0,
                        load_bias,
                        dynsym,
                        dynstr,
                        false,
                    );
                }
            }
        }

        // Android packed stream
        if t.android_reloc != 0 && t.android_reloc_sz > 4 {
            let data = unsafe {
                std::slice::from_raw_parts(t.android_reloc as *const u8, t.android_reloc_sz)
            };
            let result = for_each_packed_reloc(data, t.is_android_rela, |sym, rtype, off, a| unsafe {
                self.process_relocation(
                    image,
                    sym,
                    rtype,
                    off,
                    a,
                    load_bias,
                    dynsym,
                    dynstr,
                    t.is_android_rela,
                );
            });
            if let Err(e) = result {
                error!("{}: {e}", image.path());
            }
        }

        // PLT relocations
        if t.jmprel != 0 && t.jmprel_sz != 0 {
            if t.pltrel_type == DT_RELA {
                let ent = mem::size_of::<Elf64Rela>();
                for i in 0..t.jmprel_sz / ent {
                    unsafe {
                        let r = ptr::read_unaligned((t.jmprel + i * ent) as *const Elf64Rela);
                        self.process_relocation(
                            image,
                            elf_r_sym(r.r_info),
                            elf_r_type(r.r_info),
                            r.r_offset,
                            r.r_addend,
                            load_bias,
                            dynsym,
                            dynstr,
                            true,
                        );
                    }
                }
            } else {
                let ent = mem::size_of::<Elf64Rel>();
                for i in 0..t.jmprel_sz / ent {
                    unsafe {
                        let r = ptr::read_unaligned((t.jmprel + i * ent) as *const Elf64Rel);
                        self.process_relocation(
                            image,
                            elf_r_sym(r.r_info),
                            elf_r_type(r.r_info),
                            r.r_offset,
                            0,
                            load_bias,
                            dynsym,
                            dynstr,
                            false,
                        );
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Page protections
    // ------------------------------------------------------------------

    fn make_writable(image: &ElfImage) {
        for i in 0..image.phdr_count() {
            let ph = match image.phdr(i) {
                Some(ph) => ph,
                None => continue,
            };
            if ph.p_type != PT_LOAD || ph.p_flags & PF_W != 0 {
                continue;
            }

            let seg_start = vaddr_to_runtime(image.base(), image.bias(), ph.p_vaddr);
            let start = page_start(seg_start);
            let end = page_end(seg_start + ph.p_memsz as usize);

            let mut prot = libc::PROT_READ | libc::PROT_WRITE;
            if ph.p_flags & PF_X != 0 {
                prot |= libc::PROT_EXEC;
            }

            unsafe {
                libc::mprotect(start as *mut libc::c_void, end - start, prot);
            }
        }
    }

    fn restore_protections(image: &ElfImage) {
        let mut min_addr = usize::MAX;
        let mut max_addr = 0usize;

        for i in 0..image.phdr_count() {
            let ph = match image.phdr(i) {
                Some(ph) => ph,
                None => continue,
            };
            if ph.p_type != PT_LOAD {
                continue;
            }
            let seg_start = vaddr_to_runtime(image.base(), image.bias(), ph.p_vaddr);
            let seg_end = seg_start + ph.p_memsz as usize;
            min_addr = min_addr.min(seg_start);
            max_addr = max_addr.max(seg_end);
        }

        if min_addr >= max_addr {
            return;
        }

        let start_page = page_start(min_addr);
        let end_page = page_end(max_addr);
        let pg = page_size();
        let num_pages = (end_page - start_page) / pg;
        if num_pages == 0 {
            return;
        }

        // Each page's final protection is the union of every segment
        // touching it; split pages must not lose access either way.
        let mut page_prots = vec![0i32; num_pages];
        for i in 0..image.phdr_count() {
            let ph = match image.phdr(i) {
                Some(ph) => ph,
                None => continue,
            };
            if ph.p_type != PT_LOAD {
                continue;
            }
            let prot = prot_from_flags(ph.p_flags);
            let seg_start = vaddr_to_runtime(image.base(), image.bias(), ph.p_vaddr);
            let seg_end = seg_start + ph.p_memsz as usize;

            let mut cur = page_start(seg_start);
            while cur < page_end(seg_end) {
                let idx = (cur - start_page) / pg;
                if idx < num_pages {
                    page_prots[idx] |= prot;
                }
                cur += pg;
            }
        }

        for (i, &prot) in page_prots.iter().enumerate() {
            if prot == 0 {
                continue;
            }
            let page_addr = start_page + i * pg;
            unsafe {
                libc::mprotect(page_addr as *mut libc::c_void, pg, prot);
            }
            if prot & libc::PROT_EXEC != 0 {
                flush_instruction_cache(page_addr, pg);
            }
        }
    }

    // ------------------------------------------------------------------
    // Constructors and destructors
    // ------------------------------------------------------------------

    fn call_constructors(image: &ElfImage) {
        type InitFn = unsafe extern "C" fn();
        type CtorFn =
            unsafe extern "C" fn(libc::c_int, *mut *mut libc::c_char, *mut *mut libc::c_char);

        if let Some(addr) = image.init_func() {
            debug!("calling .init for {}", image.path());
            unsafe {
                let f: InitFn = mem::transmute(addr);
                f();
            }
        }

        if let Some((array, count)) = image.init_array() {
            debug!("calling .init_array for {}", image.path());
            let argc = G_ARGC.load(Ordering::Relaxed);
            let argv = G_ARGV.load(Ordering::Relaxed) as *mut *mut libc::c_char;
            let envp = G_ENVP.load(Ordering::Relaxed) as *mut *mut libc::c_char;
            for i in 0..count {
                unsafe {
                    let entry = *((array + i * mem::size_of::<usize>()) as *const usize);
                    let f: CtorFn = mem::transmute(entry);
                    f(argc, argv, envp);
                }
            }
        }
    }

    fn call_destructors(image: &ElfImage) {
        type FiniFn = unsafe extern "C" fn();

        if let Some((array, count)) = image.fini_array() {
            for i in (0..count).rev() {
                unsafe {
                    let entry = *((array + i * mem::size_of::<usize>()) as *const usize);
                    let f: FiniFn = mem::transmute(entry);
                    f();
                }
            }
        }

        if let Some(addr) = image.fini_func() {
            unsafe {
                let f: FiniFn = mem::transmute(addr);
                f();
            }
        }
    }

    // ------------------------------------------------------------------
    // Link
    // ------------------------------------------------------------------

    pub fn link(&mut self) -> Result<()> {
        // 1. Dependency closure
        self.load_dependencies()?;

        // 2. TLS registration, then a generation bump for observers
        if let Some(main) = self.main_image.as_mut() {
            tls::register_segment(main)?;
        }
        for dep in self.deps.iter_mut() {
            tls::register_segment(&mut dep.image)?;
        }
        tls::bump_generation();

        // 3. Open read-only segments for in-place relocation
        if let Some(main) = &self.main_image {
            Self::make_writable(main);
        }
        for dep in &self.deps {
            if dep.is_manual_load {
                Self::make_writable(&dep.image);
            }
        }

        // 4. Relocations
        let targets: Vec<*const ElfImage> = {
            let mut v = Vec::new();
            if let Some(main) = &self.main_image {
                v.push(&**main as *const ElfImage);
            }
            for dep in &self.deps {
                if dep.is_manual_load {
                    v.push(&*dep.image as *const ElfImage);
                }
            }
            v
        };
        for &image in &targets {
            self.process_relocations(unsafe { &*image });
        }

        // 5. Close protections back to the segment unions
        for &image in &targets {
            Self::restore_protections(unsafe { &*image });
        }

        // 6. Unwinder visibility
        if let Some(main) = &self.main_image {
            if let Err(e) = backtrace::register_library(main) {
                backtrace::log_registration_error(main.path(), &e);
            }
            backtrace::register_eh_frame(main);
        }
        for dep in &self.deps {
            if dep.is_manual_load {
                if let Err(e) = backtrace::register_library(&dep.image) {
                    backtrace::log_registration_error(dep.image.path(), &e);
                }
                backtrace::register_eh_frame(&dep.image);
            }
        }

        // 7. Constructors, dependencies before the main image
        for dep in &self.deps {
            if dep.is_manual_load {
                Self::call_constructors(&dep.image);
            }
        }
        if let Some(main) = &self.main_image {
            Self::call_constructors(main);
        }

        self.is_linked = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn free_tls_indices(&self) {
        let mut indices = self.tls_indices.lock();
        for &ti in indices.iter() {
            unsafe { tls::free_index(ti) };
        }
        indices.clear();
    }

    /// Run finalizers, undo every registration and unmap everything.
    pub fn destroy(&mut self) {
        // Main first: its finalizers may still call into dependencies
        if let Some(main) = &self.main_image {
            if self.is_linked {
                backtrace::unregister_eh_frame(main);
                backtrace::unregister_library(main);
                Self::call_destructors(main);
            }
        }

        for dep in self.deps.iter().rev() {
            if dep.is_manual_load {
                backtrace::unregister_eh_frame(&dep.image);
                backtrace::unregister_library(&dep.image);
                Self::call_destructors(&dep.image);
            }
        }

        self.free_tls_indices();

        for dep in self.deps.iter().rev() {
            tls::unregister_segment(&dep.image);
        }
        if let Some(main) = &self.main_image {
            tls::unregister_segment(main);
        }

        for dep in &self.deps {
            if dep.is_manual_load && dep.map_size > 0 {
                unsafe {
                    libc::munmap(dep.map_base as *mut libc::c_void, dep.map_size);
                }
            }
        }
        self.deps.clear();

        if self.main_map_size > 0 {
            if let Some(main) = &self.main_image {
                unsafe {
                    libc::munmap(main.base() as *mut libc::c_void, self.main_map_size);
                }
            }
        }
        self.main_image = None;

        self.clear_symbol_cache();
        self.is_linked = false;
        self.main_map_size = 0;
    }

    /// Drop all bookkeeping but leave the mappings resident and skip
    /// finalizers, for images whose code pointers have escaped.
    pub fn abandon(&mut self) {
        for dep in &self.deps {
            if dep.is_manual_load {
                backtrace::unregister_eh_frame(&dep.image);
                backtrace::unregister_library(&dep.image);
            }
        }

        if let Some(main) = &self.main_image {
            if self.is_linked {
                backtrace::unregister_eh_frame(main);
                backtrace::unregister_library(main);
            }
        }

        self.free_tls_indices();

        for dep in self.deps.iter().rev() {
            tls::unregister_segment(&dep.image);
        }
        if let Some(main) = &self.main_image {
            tls::unregister_segment(main);
        }

        self.deps.clear();
        self.main_image = None;

        self.clear_symbol_cache();
        self.is_linked = false;
        self.main_map_size = 0;
    }
}

impl Drop for Linker {
    fn drop(&mut self) {
        if self.is_linked {
            self.destroy();
        }
    }
}

// ============================================================================
// Instruction Cache
// ============================================================================

#[cfg(target_arch = "aarch64")]
fn flush_instruction_cache(start: usize, len: usize) {
    extern "C" {
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }
    unsafe {
        __clear_cache(start as *mut libc::c_char, (start + len) as *mut libc::c_char);
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_instruction_cache(_start: usize, _len: usize) {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_sleb128(mut value: i64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let sign_clear = byte & 0x40 == 0;
            if (value == 0 && sign_clear) || (value == -1 && !sign_clear) {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
        out
    }

    fn r_info(sym: u32, rtype: u32) -> u64 {
        ((sym as u64) << 32) | rtype as u64
    }

    // ------------------------------------------------------------------
    // RELR
    // ------------------------------------------------------------------

    #[test]
    fn test_relr_address_words() {
        let words = [0x1000u64, 0x2000];
        let mut offsets = Vec::new();
        for_each_relr_offset(&words, |o| offsets.push(o));
        assert_eq!(offsets, vec![0x1000, 0x2000]);
    }

    #[test]
    fn test_relr_bitmap_words() {
        // Address word, then a bitmap applying bits 0 and 2 to the
        // following slots
        let bitmap = ((1u64 << 0) | (1 << 2)) << 1 | 1;
        let words = [0x1000u64, bitmap];
        let mut offsets = Vec::new();
        for_each_relr_offset(&words, |o| offsets.push(o));
        assert_eq!(offsets, vec![0x1000, 0x1008, 0x1018]);
    }

    #[test]
    fn test_relr_consecutive_bitmaps_advance_cursor() {
        let empty_bitmap = 1u64; // no bits, still advances 63 slots
        let one_bit = (1u64 << 1) | 1;
        let words = [0x0u64, empty_bitmap, one_bit];
        let mut offsets = Vec::new();
        for_each_relr_offset(&words, |o| offsets.push(o));
        // First word targets 0; cursor 8; empty bitmap advances to
        // 8 + 63*8 = 512; the next bitmap's bit 0 covers 512
        assert_eq!(offsets, vec![0, 512]);
    }

    // ------------------------------------------------------------------
    // APS2 packed stream
    // ------------------------------------------------------------------

    #[test]
    fn test_packed_grouped_stream() {
        let mut data = APS2_MAGIC.to_vec();
        data.extend(encode_sleb128(3)); // reloc count
        data.extend(encode_sleb128(0x1000)); // initial offset
        data.extend(encode_sleb128(3)); // group size
        data.extend(encode_sleb128(
            (RELOCATION_GROUPED_BY_INFO_FLAG
                | RELOCATION_GROUPED_BY_OFFSET_DELTA_FLAG
                | RELOCATION_GROUPED_BY_ADDEND_FLAG
                | RELOCATION_GROUP_HAS_ADDEND_FLAG) as i64,
        ));
        data.extend(encode_sleb128(8)); // offset delta
        data.extend(encode_sleb128(r_info(5, R_AARCH64_RELATIVE) as i64));
        data.extend(encode_sleb128(0x20)); // group addend

        let mut entries = Vec::new();
        for_each_packed_reloc(&data, true, |sym, rtype, off, a| {
            entries.push((sym, rtype, off, a));
        })
        .unwrap();

        assert_eq!(
            entries,
            vec![
                (5, R_AARCH64_RELATIVE, 0x1008, 0x20),
                (5, R_AARCH64_RELATIVE, 0x1010, 0x20),
                (5, R_AARCH64_RELATIVE, 0x1018, 0x20),
            ]
        );
    }

    #[test]
    fn test_packed_ungrouped_stream_accumulates_addends() {
        let mut data = APS2_MAGIC.to_vec();
        data.extend(encode_sleb128(2));
        data.extend(encode_sleb128(0x100));
        data.extend(encode_sleb128(2)); // group size
        data.extend(encode_sleb128(RELOCATION_GROUP_HAS_ADDEND_FLAG as i64));
        // entry 1: delta 0x10, info, addend +4
        data.extend(encode_sleb128(0x10));
        data.extend(encode_sleb128(r_info(1, R_AARCH64_ABS64) as i64));
        data.extend(encode_sleb128(4));
        // entry 2: delta 0x8, info, addend -1 accumulates onto 4
        data.extend(encode_sleb128(0x8));
        data.extend(encode_sleb128(r_info(2, R_AARCH64_GLOB_DAT) as i64));
        data.extend(encode_sleb128(-1));

        let mut entries = Vec::new();
        for_each_packed_reloc(&data, true, |sym, rtype, off, a| {
            entries.push((sym, rtype, off, a));
        })
        .unwrap();

        assert_eq!(
            entries,
            vec![
                (1, R_AARCH64_ABS64, 0x110, 4),
                (2, R_AARCH64_GLOB_DAT, 0x118, 3),
            ]
        );
    }

    #[test]
    fn test_packed_bad_magic_rejected() {
        let data = b"APS1\x00".to_vec();
        let err = for_each_packed_reloc(&data, true, |_, _, _, _| {}).unwrap_err();
        assert!(matches!(err, SoloadError::MalformedPackedReloc(_)));
    }

    #[test]
    fn test_packed_rel_with_addend_rejected() {
        let mut data = APS2_MAGIC.to_vec();
        data.extend(encode_sleb128(1));
        data.extend(encode_sleb128(0));
        data.extend(encode_sleb128(1));
        data.extend(encode_sleb128(RELOCATION_GROUP_HAS_ADDEND_FLAG as i64));

        let err = for_each_packed_reloc(&data, false, |_, _, _, _| {}).unwrap_err();
        assert!(matches!(err, SoloadError::MalformedPackedReloc(_)));
    }

    // ------------------------------------------------------------------
    // Library search
    // ------------------------------------------------------------------

    #[test]
    fn test_find_library_path_absolute() {
        let path = std::env::temp_dir().join(format!("soload-search-{}.so", std::process::id()));
        std::fs::write(&path, b"x").unwrap();
        let path_str = path.to_str().unwrap();

        assert_eq!(
            Linker::find_library_path(path_str),
            Some(path_str.to_string())
        );
        assert_eq!(Linker::find_library_path("/nonexistent/libnothing.so"), None);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_find_library_path_relative_miss() {
        assert_eq!(
            Linker::find_library_path("libsoload-does-not-exist.so"),
            None
        );
    }

    #[test]
    fn test_linker_starts_empty() {
        let linker = Linker::new();
        assert!(!linker.is_linked());
        assert_eq!(linker.dependency_count(), 0);
        assert!(linker.main_image().is_none());
    }
}
