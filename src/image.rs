//! ELF image parsing and symbol lookup
//!
//! An `ElfImage` owns a heap copy of the shared object's file bytes and
//! indexes the tables needed at link time: dynamic symbols, the two hash
//! tables, `.symtab` for address-to-name queries, the TLS segment, the
//! init/fini entry points and the unwind sections. All table references
//! are stored as offsets into the owned buffer; typed views are rebuilt
//! on demand with unaligned reads.

use std::mem;
use std::ptr;

use log::{debug, warn};

use crate::auxv;
use crate::constants::*;
use crate::elf::{Elf64Dyn, Elf64Ehdr, Elf64Phdr, Elf64Shdr, Elf64Sym};
use crate::error::{Result, SoloadError};
use crate::helpers::{cstr_at, cstr_in, vaddr_to_runtime};

// ============================================================================
// Name Hashes
// ============================================================================

/// SysV ELF hash of a symbol name.
pub fn elf_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for &c in name.as_bytes() {
        h = (h << 4).wrapping_add(c as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// GNU hash of a symbol name (DJB, seed 5381).
pub fn gnu_hash(name: &str) -> u32 {
    let mut h: u32 = 5381;
    for &c in name.as_bytes() {
        h = (h << 5).wrapping_add(h).wrapping_add(c as u32);
    }
    h
}

// ============================================================================
// Buffer Access
// ============================================================================

/// Read a `T` out of `data` at `off`, tolerating arbitrary alignment.
pub(crate) fn read_at<T: Copy>(data: &[u8], off: usize) -> Option<T> {
    let end = off.checked_add(mem::size_of::<T>())?;
    if end > data.len() {
        return None;
    }
    Some(unsafe { ptr::read_unaligned(data.as_ptr().add(off) as *const T) })
}

// ============================================================================
// Table Views
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct SymTable {
    off: usize,
    count: usize,
}

#[derive(Debug, Clone, Copy)]
struct SysvHash {
    nbucket: u32,
    nchain: u32,
    bucket_off: usize,
}

#[derive(Debug, Clone, Copy)]
struct GnuHash {
    nbucket: u32,
    symndx: u32,
    bloom_size: u32,
    shift2: u32,
    bloom_off: usize,
    bucket_off: usize,
    chain_off: usize,
}

/// A symbol definition found in one of the image's tables.
#[derive(Debug, Clone, Copy)]
pub struct SymbolDef {
    pub value: u64,
    pub sym_type: u8,
    pub bind: u8,
}

// ============================================================================
// ElfImage
// ============================================================================

#[derive(Debug)]
pub struct ElfImage {
    path: String,
    data: Vec<u8>,
    base: usize,
    bias: u64,

    dynsym: Option<SymTable>,
    dynstr_off: Option<usize>,

    symtab: Option<SymTable>,
    symtab_str_off: Option<usize>,

    sysv_hash: Option<SysvHash>,
    gnu_hash: Option<GnuHash>,

    tls_segment: Option<Elf64Phdr>,
    tls_mod_id: usize,

    init_func: Option<usize>,
    fini_func: Option<usize>,
    init_array: Option<(usize, usize)>,
    fini_array: Option<(usize, usize)>,

    eh_frame: Option<(usize, usize)>,
    eh_frame_hdr: Option<(usize, usize)>,
}

struct AdoptSearch {
    needle: String,
    base: usize,
    resolved: Option<String>,
}

unsafe extern "C" fn adopt_callback(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut libc::c_void,
) -> libc::c_int {
    let search = &mut *(data as *mut AdoptSearch);
    let info = &*info;
    if info.dlpi_name.is_null() {
        return 0;
    }
    let name = cstr_at(info.dlpi_name as *const u8);
    if !name.is_empty() && name.contains(&search.needle) {
        search.base = info.dlpi_addr as usize;
        search.resolved = Some(name.to_string());
        return 1;
    }
    0
}

impl ElfImage {
    /// Parse a shared object from disk.
    ///
    /// With `base` given, the image describes a mapping established by this
    /// loader. Without it, the host's loaded program headers are searched
    /// for a library whose name contains `path`; if one is found its base
    /// and canonical path are adopted, otherwise creation fails.
    pub fn create(path: &str, base: Option<usize>) -> Result<Box<ElfImage>> {
        let (base, path) = match base {
            Some(b) => (b, path.to_string()),
            None => {
                let mut search = AdoptSearch {
                    needle: path.to_string(),
                    base: 0,
                    resolved: None,
                };
                unsafe {
                    libc::dl_iterate_phdr(
                        Some(adopt_callback),
                        &mut search as *mut AdoptSearch as *mut libc::c_void,
                    );
                }
                match search.resolved {
                    Some(resolved) if search.base != 0 => {
                        debug!("adopted host mapping of {resolved} at {:#x}", search.base);
                        (search.base, resolved)
                    }
                    _ => {
                        return Err(SoloadError::NotFound(format!(
                            "{path} is not loaded in this process"
                        )))
                    }
                }
            }
        };

        let data = std::fs::read(&path)?;
        if data.len() <= mem::size_of::<Elf64Ehdr>() {
            return Err(SoloadError::InvalidElf(format!("{path}: file too small")));
        }

        let mut img = Box::new(ElfImage {
            path,
            data,
            base,
            bias: 0,
            dynsym: None,
            dynstr_off: None,
            symtab: None,
            symtab_str_off: None,
            sysv_hash: None,
            gnu_hash: None,
            tls_segment: None,
            tls_mod_id: 0,
            init_func: None,
            fini_func: None,
            init_array: None,
            fini_array: None,
            eh_frame: None,
            eh_frame_hdr: None,
        });

        img.validate_header()?;
        img.parse_sections();
        img.parse_program_headers()?;
        img.parse_dynamic();
        Ok(img)
    }

    fn header(&self) -> Elf64Ehdr {
        // Validated to be in bounds during create
        read_at::<Elf64Ehdr>(&self.data, 0).unwrap()
    }

    fn validate_header(&self) -> Result<()> {
        let eh = self.header();

        if eh.e_ident[..4] != ELF_MAGIC {
            return Err(SoloadError::InvalidElf(format!(
                "{}: bad magic",
                self.path
            )));
        }
        if eh.e_ident[EI_CLASS] != ELFCLASS64 {
            return Err(SoloadError::InvalidElf(format!(
                "{}: not a 64-bit object",
                self.path
            )));
        }
        if eh.e_ident[EI_DATA] != ELFDATA2LSB {
            return Err(SoloadError::InvalidElf(format!(
                "{}: not little-endian",
                self.path
            )));
        }
        if eh.e_ident[EI_VERSION] != 1 {
            return Err(SoloadError::InvalidElf(format!(
                "{}: bad ELF version",
                self.path
            )));
        }
        if eh.e_machine != EM_AARCH64 {
            return Err(SoloadError::InvalidElf(format!(
                "{}: machine {} is not AArch64",
                self.path, eh.e_machine
            )));
        }
        if eh.e_type != ET_DYN && eh.e_type != ET_EXEC {
            return Err(SoloadError::InvalidElf(format!(
                "{}: type {} is not DYN or EXEC",
                self.path, eh.e_type
            )));
        }
        if eh.e_phoff == 0 || eh.e_phnum == 0 {
            return Err(SoloadError::InvalidElf(format!(
                "{}: no program headers",
                self.path
            )));
        }
        let phdr_bytes = eh.e_phnum as u64 * mem::size_of::<Elf64Phdr>() as u64;
        if eh.e_phoff.checked_add(phdr_bytes).map_or(true, |end| end > self.data.len() as u64) {
            return Err(SoloadError::InvalidElf(format!(
                "{}: program header table out of bounds",
                self.path
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Section parsing
    // ------------------------------------------------------------------

    fn shdr(&self, idx: usize) -> Option<Elf64Shdr> {
        let eh = self.header();
        if eh.e_shoff == 0 || idx >= eh.e_shnum as usize {
            return None;
        }
        let shdr_bytes = eh.e_shnum as u64 * mem::size_of::<Elf64Shdr>() as u64;
        if eh.e_shoff.checked_add(shdr_bytes).map_or(true, |end| end > self.data.len() as u64) {
            return None;
        }
        read_at(&self.data, eh.e_shoff as usize + idx * mem::size_of::<Elf64Shdr>())
    }

    fn section_name(&self, sh: &Elf64Shdr) -> Option<&str> {
        let eh = self.header();
        let shstr = self.shdr(eh.e_shstrndx as usize)?;
        cstr_in(&self.data, shstr.sh_offset as usize + sh.sh_name as usize)
    }

    fn parse_sections(&mut self) {
        let eh = self.header();
        if eh.e_shoff == 0 {
            return;
        }
        let shdr_bytes = eh.e_shnum as u64 * mem::size_of::<Elf64Shdr>() as u64;
        if eh.e_shoff.checked_add(shdr_bytes).map_or(true, |end| end > self.data.len() as u64) {
            warn!("{}: section header table out of bounds, ignoring", self.path);
            return;
        }

        let mut dynsym_link = None;
        for i in 0..eh.e_shnum as usize {
            let sh = match self.shdr(i) {
                Some(sh) => sh,
                None => continue,
            };

            match sh.sh_type {
                SHT_DYNSYM => {
                    self.dynsym = Some(SymTable {
                        off: sh.sh_offset as usize,
                        count: if sh.sh_entsize != 0 {
                            (sh.sh_size / sh.sh_entsize) as usize
                        } else {
                            0
                        },
                    });
                    dynsym_link = Some(sh.sh_link as usize);
                }
                SHT_SYMTAB => {
                    if self.section_name(&sh) == Some(".symtab") {
                        self.symtab = Some(SymTable {
                            off: sh.sh_offset as usize,
                            count: if sh.sh_entsize != 0 {
                                (sh.sh_size / sh.sh_entsize) as usize
                            } else {
                                0
                            },
                        });
                        if let Some(linked) = self.shdr(sh.sh_link as usize) {
                            self.symtab_str_off = Some(linked.sh_offset as usize);
                        }
                    }
                }
                SHT_HASH => {
                    if sh.sh_size >= 2 * 4 {
                        let off = sh.sh_offset as usize;
                        if let (Some(nbucket), Some(nchain)) = (
                            read_at::<u32>(&self.data, off),
                            read_at::<u32>(&self.data, off + 4),
                        ) {
                            self.sysv_hash = Some(SysvHash {
                                nbucket,
                                nchain,
                                bucket_off: off + 8,
                            });
                        }
                    }
                }
                SHT_GNU_HASH => {
                    if sh.sh_size >= 4 * 4 {
                        let off = sh.sh_offset as usize;
                        let nbucket = read_at::<u32>(&self.data, off).unwrap_or(0);
                        let symndx = read_at::<u32>(&self.data, off + 4).unwrap_or(0);
                        let bloom_size = read_at::<u32>(&self.data, off + 8).unwrap_or(0);
                        let shift2 = read_at::<u32>(&self.data, off + 12).unwrap_or(0);
                        let bloom_off = off + 16;
                        let bucket_off = bloom_off + bloom_size as usize * 8;
                        let chain_off = bucket_off + nbucket as usize * 4;
                        if nbucket > 0 && bloom_size > 0 {
                            self.gnu_hash = Some(GnuHash {
                                nbucket,
                                symndx,
                                bloom_size,
                                shift2,
                                bloom_off,
                                bucket_off,
                                chain_off,
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(link) = dynsym_link {
            if let Some(linked) = self.shdr(link) {
                self.dynstr_off = Some(linked.sh_offset as usize);
            }
        }

        // dynsym without its string table is unusable
        if self.dynstr_off.is_none() {
            self.dynsym = None;
        }
    }

    // ------------------------------------------------------------------
    // Program header parsing
    // ------------------------------------------------------------------

    pub fn phdr_count(&self) -> usize {
        self.header().e_phnum as usize
    }

    pub fn phdr(&self, idx: usize) -> Option<Elf64Phdr> {
        let eh = self.header();
        if idx >= eh.e_phnum as usize {
            return None;
        }
        read_at(&self.data, eh.e_phoff as usize + idx * mem::size_of::<Elf64Phdr>())
    }

    /// Copy of the program-header array.
    pub fn phdrs(&self) -> Vec<Elf64Phdr> {
        (0..self.phdr_count()).filter_map(|i| self.phdr(i)).collect()
    }

    fn parse_program_headers(&mut self) -> Result<()> {
        let mut bias = None;
        let mut first_load = None;

        for i in 0..self.phdr_count() {
            let ph = self.phdr(i).unwrap();
            if ph.p_type == PT_LOAD {
                if first_load.is_none() {
                    first_load = Some(ph);
                }
                if ph.p_offset == 0 && bias.is_none() {
                    bias = Some(ph.p_vaddr);
                }
            }
        }

        self.bias = match (bias, first_load) {
            (Some(b), _) => b,
            (None, Some(ph)) => ph.p_vaddr.wrapping_sub(ph.p_offset),
            (None, None) => {
                return Err(SoloadError::InvalidElf(format!(
                    "{}: no loadable segments",
                    self.path
                )))
            }
        };

        for i in 0..self.phdr_count() {
            let ph = self.phdr(i).unwrap();
            match ph.p_type {
                PT_TLS => self.tls_segment = Some(ph),
                PT_GNU_EH_FRAME => {
                    self.eh_frame_hdr = Some((
                        vaddr_to_runtime(self.base, self.bias, ph.p_vaddr),
                        ph.p_memsz as usize,
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_dynamic(&mut self) {
        let mut init_array_addr = None;
        let mut init_array_count = 0usize;
        let mut fini_array_addr = None;
        let mut fini_array_count = 0usize;

        for d in self.dynamic_entries() {
            let runtime = vaddr_to_runtime(self.base, self.bias, d.d_val);
            match d.d_tag {
                DT_INIT => self.init_func = Some(runtime),
                DT_FINI => self.fini_func = Some(runtime),
                DT_INIT_ARRAY => init_array_addr = Some(runtime),
                DT_INIT_ARRAYSZ => init_array_count = d.d_val as usize / 8,
                DT_FINI_ARRAY => fini_array_addr = Some(runtime),
                DT_FINI_ARRAYSZ => fini_array_count = d.d_val as usize / 8,
                _ => {}
            }
        }

        self.init_array = init_array_addr.map(|a| (a, init_array_count));
        self.fini_array = fini_array_addr.map(|a| (a, fini_array_count));

        // .eh_frame location comes from section headers when present
        let eh = self.header();
        if eh.e_shoff != 0 {
            for i in 0..eh.e_shnum as usize {
                if let Some(sh) = self.shdr(i) {
                    if self.section_name(&sh) == Some(".eh_frame") {
                        self.eh_frame = Some((
                            vaddr_to_runtime(self.base, self.bias, sh.sh_addr),
                            sh.sh_size as usize,
                        ));
                    }
                }
            }
        }
    }

    /// Dynamic entries read from the file copy of PT_DYNAMIC.
    fn dynamic_entries(&self) -> Vec<Elf64Dyn> {
        let mut out = Vec::new();
        for i in 0..self.phdr_count() {
            let ph = match self.phdr(i) {
                Some(ph) => ph,
                None => continue,
            };
            if ph.p_type != PT_DYNAMIC {
                continue;
            }
            let mut off = ph.p_offset as usize;
            while let Some(d) = read_at::<Elf64Dyn>(&self.data, off) {
                if d.d_tag == DT_NULL {
                    break;
                }
                out.push(d);
                off += mem::size_of::<Elf64Dyn>();
            }
            break;
        }
        out
    }

    /// Runtime address of the mapped PT_DYNAMIC table, if any.
    pub fn dynamic_ptr(&self) -> Option<*const Elf64Dyn> {
        for i in 0..self.phdr_count() {
            let ph = self.phdr(i)?;
            if ph.p_type == PT_DYNAMIC {
                return Some(
                    vaddr_to_runtime(self.base, self.bias, ph.p_vaddr) as *const Elf64Dyn
                );
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Symbol lookup
    // ------------------------------------------------------------------

    fn dynsym_entry(&self, idx: usize) -> Option<Elf64Sym> {
        let table = self.dynsym?;
        if idx >= table.count {
            return None;
        }
        read_at(&self.data, table.off + idx * mem::size_of::<Elf64Sym>())
    }

    fn dynsym_name(&self, sym: &Elf64Sym) -> Option<&str> {
        cstr_in(&self.data, self.dynstr_off? + sym.st_name as usize)
    }

    /// String at `offset` in the file's dynamic string table.
    pub fn dynstr_at(&self, offset: usize) -> Option<&str> {
        cstr_in(&self.data, self.dynstr_off? + offset)
    }

    fn gnu_hash_lookup(&self, name: &str, hash: u32) -> Option<SymbolDef> {
        let gh = self.gnu_hash?;
        self.dynsym?;

        const BLOOM_BITS: u32 = 64;

        let bloom_idx = (hash / BLOOM_BITS) as usize % gh.bloom_size as usize;
        let bloom_word: u64 = read_at(&self.data, gh.bloom_off + bloom_idx * 8)?;
        let mask = (1u64 << (hash % BLOOM_BITS)) | (1u64 << ((hash >> gh.shift2) % BLOOM_BITS));
        if bloom_word & mask != mask {
            return None;
        }

        let bucket_idx = (hash % gh.nbucket) as usize;
        let mut sym_idx: u32 = read_at(&self.data, gh.bucket_off + bucket_idx * 4)?;
        if sym_idx < gh.symndx {
            return None;
        }

        loop {
            let chain_val: u32 =
                read_at(&self.data, gh.chain_off + (sym_idx - gh.symndx) as usize * 4)?;
            let sym = self.dynsym_entry(sym_idx as usize)?;

            if (chain_val ^ hash) >> 1 == 0
                && self.dynsym_name(&sym) == Some(name)
                && sym.st_shndx != SHN_UNDEF
            {
                return Some(SymbolDef {
                    value: sym.st_value,
                    sym_type: sym.sym_type(),
                    bind: sym.binding(),
                });
            }

            if chain_val & 1 != 0 {
                return None;
            }
            sym_idx += 1;
        }
    }

    fn elf_hash_lookup(&self, name: &str, hash: u32) -> Option<SymbolDef> {
        let hs = self.sysv_hash?;
        self.dynsym?;
        if hs.nbucket == 0 {
            return None;
        }

        let chain_off = hs.bucket_off + hs.nbucket as usize * 4;
        let mut n: u32 = read_at(&self.data, hs.bucket_off + (hash % hs.nbucket) as usize * 4)?;

        while n != STN_UNDEF {
            if n >= hs.nchain {
                return None;
            }
            let sym = self.dynsym_entry(n as usize)?;
            if self.dynsym_name(&sym) == Some(name) && sym.st_shndx != SHN_UNDEF {
                return Some(SymbolDef {
                    value: sym.st_value,
                    sym_type: sym.sym_type(),
                    bind: sym.binding(),
                });
            }
            n = read_at(&self.data, chain_off + n as usize * 4)?;
        }
        None
    }

    fn linear_lookup(&self, name: &str) -> Option<SymbolDef> {
        let table = self.symtab?;
        let str_off = self.symtab_str_off?;

        for i in 0..table.count {
            let sym: Elf64Sym = read_at(&self.data, table.off + i * mem::size_of::<Elf64Sym>())?;
            let st = sym.sym_type();
            if (st == STT_FUNC || st == STT_OBJECT)
                && sym.st_size > 0
                && sym.st_shndx != SHN_UNDEF
                && cstr_in(&self.data, str_off + sym.st_name as usize) == Some(name)
            {
                return Some(SymbolDef {
                    value: sym.st_value,
                    sym_type: st,
                    bind: sym.binding(),
                });
            }
        }
        None
    }

    /// Look up a defined symbol, trying GNU hash, then SysV hash, then a
    /// linear `.symtab` scan.
    pub fn find_symbol_offset(&self, name: &str) -> Option<SymbolDef> {
        if let Some(def) = self.gnu_hash_lookup(name, gnu_hash(name)) {
            return Some(def);
        }
        if let Some(def) = self.elf_hash_lookup(name, elf_hash(name)) {
            return Some(def);
        }
        self.linear_lookup(name)
    }

    /// Resolve a symbol to its runtime address, invoking the resolver for
    /// IFUNC symbols.
    pub fn find_symbol_address(&self, name: &str) -> Option<(usize, u8)> {
        let def = self.find_symbol_offset(name)?;
        let addr = vaddr_to_runtime(self.base, self.bias, def.value);

        if def.sym_type == STT_GNU_IFUNC {
            debug!("resolving IFUNC {name} in {}", self.path);
            let resolved = unsafe { auxv::call_ifunc_resolver(addr) };
            return Some((resolved as usize, def.bind));
        }

        Some((addr, def.bind))
    }

    /// Find the `.symtab` entry whose runtime range contains `addr`.
    pub fn symbol_at(&self, addr: usize) -> Option<(&str, usize)> {
        let table = self.symtab?;
        let str_off = self.symtab_str_off?;

        for i in 0..table.count {
            let sym: Elf64Sym = read_at(&self.data, table.off + i * mem::size_of::<Elf64Sym>())?;
            if sym.st_value == 0 || sym.st_size == 0 {
                continue;
            }
            let start = vaddr_to_runtime(self.base, self.bias, sym.st_value);
            let end = start + sym.st_size as usize;
            if addr >= start && addr < end {
                let name = cstr_in(&self.data, str_off + sym.st_name as usize)?;
                return Some((name, start));
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn bias(&self) -> u64 {
        self.bias
    }

    /// Runtime load bias: base minus the link-time start address.
    pub fn load_bias(&self) -> usize {
        crate::helpers::load_bias(self.base, self.bias)
    }

    pub fn tls_segment(&self) -> Option<&Elf64Phdr> {
        self.tls_segment.as_ref()
    }

    pub fn tls_module_id(&self) -> usize {
        self.tls_mod_id
    }

    pub fn set_tls_module_id(&mut self, id: usize) {
        self.tls_mod_id = id;
    }

    pub fn init_func(&self) -> Option<usize> {
        self.init_func
    }

    pub fn fini_func(&self) -> Option<usize> {
        self.fini_func
    }

    pub fn init_array(&self) -> Option<(usize, usize)> {
        self.init_array
    }

    pub fn fini_array(&self) -> Option<(usize, usize)> {
        self.fini_array
    }

    pub fn eh_frame(&self) -> Option<(usize, usize)> {
        self.eh_frame
    }

    pub fn eh_frame_hdr(&self) -> Option<(usize, usize)> {
        self.eh_frame_hdr
    }

    /// Log basic image facts after a successful parse.
    pub fn log_summary(&self) {
        debug!(
            "{}: base={:#x} bias={:#x} dynsym={} symtab={} tls={}",
            self.path,
            self.base,
            self.bias,
            self.dynsym.map_or(0, |t| t.count),
            self.symtab.map_or(0, |t| t.count),
            self.tls_segment.is_some(),
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    // ------------------------------------------------------------------
    // Synthetic ELF builder
    // ------------------------------------------------------------------

    fn struct_bytes<T: Copy>(value: &T) -> Vec<u8> {
        unsafe {
            std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()).to_vec()
        }
    }

    struct SectionSpec {
        name: &'static str,
        sh_type: u32,
        data: Vec<u8>,
        link: u32,
        entsize: u64,
        addr: u64,
    }

    struct ElfBuilder {
        machine: u16,
        class: u8,
        endian: u8,
        e_type: u16,
        phdrs: Vec<Elf64Phdr>,
        sections: Vec<SectionSpec>,
    }

    impl ElfBuilder {
        fn new() -> Self {
            Self {
                machine: EM_AARCH64,
                class: ELFCLASS64,
                endian: ELFDATA2LSB,
                e_type: ET_DYN,
                phdrs: vec![Elf64Phdr {
                    p_type: PT_LOAD,
                    p_flags: PF_R | PF_X,
                    p_offset: 0,
                    p_vaddr: 0,
                    p_paddr: 0,
                    p_filesz: 0x1000,
                    p_memsz: 0x1000,
                    p_align: 0x1000,
                }],
                sections: Vec::new(),
            }
        }

        fn add_section(
            &mut self,
            name: &'static str,
            sh_type: u32,
            data: Vec<u8>,
            link: u32,
            entsize: u64,
        ) -> u32 {
            self.sections.push(SectionSpec {
                name,
                sh_type,
                data,
                link,
                entsize,
                addr: 0,
            });
            self.sections.len() as u32 // null section occupies index 0
        }

        fn build(&self) -> Vec<u8> {
            let ehsize = size_of::<Elf64Ehdr>();
            let phsize = size_of::<Elf64Phdr>();
            let shsize = size_of::<Elf64Shdr>();

            // shstrtab content
            let mut shstr = vec![0u8];
            let mut name_offs = Vec::new();
            for s in &self.sections {
                name_offs.push(shstr.len() as u32);
                shstr.extend_from_slice(s.name.as_bytes());
                shstr.push(0);
            }
            let shstrtab_name_off = shstr.len() as u32;
            shstr.extend_from_slice(b".shstrtab\0");

            let phoff = ehsize;
            let mut data_off = phoff + self.phdrs.len() * phsize;

            // lay out section payloads
            let mut payload_offs = Vec::new();
            let mut payload = Vec::new();
            for s in &self.sections {
                payload_offs.push(data_off + payload.len());
                payload.extend_from_slice(&s.data);
            }
            let shstr_off = data_off + payload.len();
            payload.extend_from_slice(&shstr);
            data_off += payload.len();

            let shoff = data_off;
            let shnum = self.sections.len() + 2; // null + shstrtab

            let ehdr = Elf64Ehdr {
                e_ident: {
                    let mut id = [0u8; 16];
                    id[..4].copy_from_slice(&ELF_MAGIC);
                    id[EI_CLASS] = self.class;
                    id[EI_DATA] = self.endian;
                    id[EI_VERSION] = 1;
                    id
                },
                e_type: self.e_type,
                e_machine: self.machine,
                e_version: 1,
                e_entry: 0,
                e_phoff: phoff as u64,
                e_shoff: shoff as u64,
                e_flags: 0,
                e_ehsize: ehsize as u16,
                e_phentsize: phsize as u16,
                e_phnum: self.phdrs.len() as u16,
                e_shentsize: shsize as u16,
                e_shnum: shnum as u16,
                e_shstrndx: (shnum - 1) as u16,
            };

            let mut out = struct_bytes(&ehdr);
            for ph in &self.phdrs {
                out.extend(struct_bytes(ph));
            }
            out.extend_from_slice(&payload);

            // null section header
            let null_sh = Elf64Shdr {
                sh_name: 0,
                sh_type: 0,
                sh_flags: 0,
                sh_addr: 0,
                sh_offset: 0,
                sh_size: 0,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 0,
                sh_entsize: 0,
            };
            out.extend(struct_bytes(&null_sh));

            for (i, s) in self.sections.iter().enumerate() {
                let sh = Elf64Shdr {
                    sh_name: name_offs[i],
                    sh_type: s.sh_type,
                    sh_flags: 0,
                    sh_addr: s.addr,
                    sh_offset: payload_offs[i] as u64,
                    sh_size: s.data.len() as u64,
                    sh_link: s.link,
                    sh_info: 0,
                    sh_addralign: 1,
                    sh_entsize: s.entsize,
                };
                out.extend(struct_bytes(&sh));
            }

            let shstr_sh = Elf64Shdr {
                sh_name: shstrtab_name_off,
                sh_type: 3, // SHT_STRTAB
                sh_flags: 0,
                sh_addr: 0,
                sh_offset: shstr_off as u64,
                sh_size: shstr.len() as u64,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: 0,
            };
            out.extend(struct_bytes(&shstr_sh));

            out
        }

        fn write_temp(&self, tag: &str) -> String {
            let path = std::env::temp_dir().join(format!(
                "soload-test-{}-{}.so",
                tag,
                std::process::id()
            ));
            std::fs::write(&path, self.build()).unwrap();
            path.to_str().unwrap().to_string()
        }
    }

    fn sym_entry(name_off: u32, info: u8, shndx: u16, value: u64, size: u64) -> Vec<u8> {
        struct_bytes(&Elf64Sym {
            st_name: name_off,
            st_info: info,
            st_other: 0,
            st_shndx: shndx,
            st_value: value,
            st_size: size,
        })
    }

    const TEST_BASE: usize = 0x7100_0000;

    // ------------------------------------------------------------------
    // Hash vectors
    // ------------------------------------------------------------------

    #[test]
    fn test_hash_vectors() {
        assert_eq!(elf_hash("printf"), 0x77905a6);
        assert_eq!(gnu_hash("printf"), 0x156b8bbb);
        assert_eq!(gnu_hash(""), 0x1505);
        assert_eq!(elf_hash(""), 0);
    }

    // ------------------------------------------------------------------
    // Header validation
    // ------------------------------------------------------------------

    #[test]
    fn test_valid_minimal_elf_parses() {
        let b = ElfBuilder::new();
        let path = b.write_temp("minimal");
        let img = ElfImage::create(&path, Some(TEST_BASE)).unwrap();
        assert_eq!(img.base(), TEST_BASE);
        assert_eq!(img.bias(), 0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_bad_machine_rejected() {
        let mut b = ElfBuilder::new();
        b.machine = 0x3e; // x86-64
        let path = b.write_temp("machine");
        let err = ElfImage::create(&path, Some(TEST_BASE)).unwrap_err();
        assert!(matches!(err, SoloadError::InvalidElf(_)));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_bad_class_rejected() {
        let mut b = ElfBuilder::new();
        b.class = 1;
        let path = b.write_temp("class");
        assert!(matches!(
            ElfImage::create(&path, Some(TEST_BASE)),
            Err(SoloadError::InvalidElf(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_big_endian_rejected() {
        let mut b = ElfBuilder::new();
        b.endian = 2;
        let path = b.write_temp("endian");
        assert!(matches!(
            ElfImage::create(&path, Some(TEST_BASE)),
            Err(SoloadError::InvalidElf(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_bad_type_rejected() {
        let mut b = ElfBuilder::new();
        b.e_type = 1; // ET_REL
        let path = b.write_temp("type");
        assert!(matches!(
            ElfImage::create(&path, Some(TEST_BASE)),
            Err(SoloadError::InvalidElf(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_no_load_segment_rejected() {
        let mut b = ElfBuilder::new();
        b.phdrs[0].p_type = PT_DYNAMIC;
        let path = b.write_temp("noload");
        assert!(matches!(
            ElfImage::create(&path, Some(TEST_BASE)),
            Err(SoloadError::InvalidElf(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_bias_fallback_without_zero_offset_load() {
        let mut b = ElfBuilder::new();
        b.phdrs[0].p_offset = 0x2000;
        b.phdrs[0].p_vaddr = 0x12000;
        let path = b.write_temp("bias");
        let img = ElfImage::create(&path, Some(TEST_BASE)).unwrap();
        assert_eq!(img.bias(), 0x10000);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_tls_segment_recorded() {
        let mut b = ElfBuilder::new();
        b.phdrs.push(Elf64Phdr {
            p_type: PT_TLS,
            p_flags: PF_R,
            p_offset: 0x800,
            p_vaddr: 0x800,
            p_paddr: 0,
            p_filesz: 16,
            p_memsz: 64,
            p_align: 8,
        });
        let path = b.write_temp("tls");
        let img = ElfImage::create(&path, Some(TEST_BASE)).unwrap();
        let tls = img.tls_segment().unwrap();
        assert_eq!(tls.p_memsz, 64);
        assert_eq!(tls.p_filesz, 16);
        std::fs::remove_file(&path).ok();
    }

    // ------------------------------------------------------------------
    // Symbol lookup
    // ------------------------------------------------------------------

    fn builder_with_dynsym(names: &[&'static str]) -> (ElfBuilder, Vec<u8>, Vec<u32>) {
        // dynstr: \0 name1\0 name2\0 ...
        let mut dynstr = vec![0u8];
        let mut offs = Vec::new();
        for n in names {
            offs.push(dynstr.len() as u32);
            dynstr.extend_from_slice(n.as_bytes());
            dynstr.push(0);
        }
        (ElfBuilder::new(), dynstr, offs)
    }

    #[test]
    fn test_sysv_hash_lookup() {
        let (mut b, dynstr, offs) = builder_with_dynsym(&["add"]);

        // index 0: undefined null symbol, index 1: "add"
        let mut dynsym = sym_entry(0, 0, 0, 0, 0);
        dynsym.extend(sym_entry(
            offs[0],
            (STB_GLOBAL << 4) | STT_FUNC,
            1,
            0x123,
            8,
        ));

        // nbucket=1 nchain=2 bucket[0]=1 chain[0]=0 chain[1]=0
        let mut hash = Vec::new();
        for v in [1u32, 2, 1, 0, 0] {
            hash.extend_from_slice(&v.to_le_bytes());
        }

        let dynstr_idx = b.add_section(".dynstr", 3, dynstr, 0, 0);
        b.add_section(
            ".dynsym",
            SHT_DYNSYM,
            dynsym,
            dynstr_idx,
            size_of::<Elf64Sym>() as u64,
        );
        b.add_section(".hash", SHT_HASH, hash, 0, 4);

        let path = b.write_temp("sysv");
        let img = ElfImage::create(&path, Some(TEST_BASE)).unwrap();

        let def = img.find_symbol_offset("add").unwrap();
        assert_eq!(def.value, 0x123);
        assert_eq!(def.bind, STB_GLOBAL);
        assert_eq!(def.sym_type, STT_FUNC);

        // Runtime address applies base - bias
        let (addr, bind) = img.find_symbol_address("add").unwrap();
        assert_eq!(addr, TEST_BASE + 0x123);
        assert_eq!(bind, STB_GLOBAL);

        assert!(img.find_symbol_offset("sub").is_none());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_gnu_hash_lookup_and_bloom() {
        let (mut b, dynstr, offs) = builder_with_dynsym(&["mul"]);
        let h = gnu_hash("mul");

        let mut dynsym = sym_entry(0, 0, 0, 0, 0);
        dynsym.extend(sym_entry(
            offs[0],
            (STB_GLOBAL << 4) | STT_FUNC,
            1,
            0x456,
            8,
        ));

        // nbucket=1 symndx=1 bloom_size=1 shift2=6
        let shift2 = 6u32;
        let bloom: u64 = (1u64 << (h % 64)) | (1u64 << ((h >> shift2) % 64));
        let mut gnu = Vec::new();
        for v in [1u32, 1, 1, shift2] {
            gnu.extend_from_slice(&v.to_le_bytes());
        }
        gnu.extend_from_slice(&bloom.to_le_bytes());
        gnu.extend_from_slice(&1u32.to_le_bytes()); // bucket[0] = 1
        gnu.extend_from_slice(&(h | 1).to_le_bytes()); // chain end marker

        let dynstr_idx = b.add_section(".dynstr", 3, dynstr.clone(), 0, 0);
        b.add_section(
            ".dynsym",
            SHT_DYNSYM,
            dynsym.clone(),
            dynstr_idx,
            size_of::<Elf64Sym>() as u64,
        );
        b.add_section(".gnu.hash", SHT_GNU_HASH, gnu, 0, 0);

        let path = b.write_temp("gnu");
        let img = ElfImage::create(&path, Some(TEST_BASE)).unwrap();
        let def = img.find_symbol_offset("mul").unwrap();
        assert_eq!(def.value, 0x456);
        std::fs::remove_file(&path).ok();

        // Same table with an empty bloom filter: the chain would match but
        // the filter must short-circuit first.
        let (mut b2, dynstr2, _) = builder_with_dynsym(&["mul"]);
        let mut gnu2 = Vec::new();
        for v in [1u32, 1, 1, shift2] {
            gnu2.extend_from_slice(&v.to_le_bytes());
        }
        gnu2.extend_from_slice(&0u64.to_le_bytes());
        gnu2.extend_from_slice(&1u32.to_le_bytes());
        gnu2.extend_from_slice(&(h | 1).to_le_bytes());

        let dynstr_idx2 = b2.add_section(".dynstr", 3, dynstr2, 0, 0);
        b2.add_section(
            ".dynsym",
            SHT_DYNSYM,
            dynsym,
            dynstr_idx2,
            size_of::<Elf64Sym>() as u64,
        );
        b2.add_section(".gnu.hash", SHT_GNU_HASH, gnu2, 0, 0);

        let path2 = b2.write_temp("gnu-bloom");
        let img2 = ElfImage::create(&path2, Some(TEST_BASE)).unwrap();
        assert!(img2.gnu_hash_lookup("mul", h).is_none());
        // No other table exists, so the full lookup misses too
        assert!(img2.find_symbol_offset("mul").is_none());
        std::fs::remove_file(&path2).ok();
    }

    #[test]
    fn test_linear_symtab_lookup_and_symbol_at() {
        let mut b = ElfBuilder::new();

        let mut strtab = vec![0u8];
        let name_off = strtab.len() as u32;
        strtab.extend_from_slice(b"helper\0");

        let mut symtab = sym_entry(0, 0, 0, 0, 0);
        symtab.extend(sym_entry(
            name_off,
            (STB_LOCAL << 4) | STT_FUNC,
            1,
            0x200,
            0x40,
        ));

        let strtab_idx = b.add_section(".strtab", 3, strtab, 0, 0);
        b.add_section(
            ".symtab",
            SHT_SYMTAB,
            symtab,
            strtab_idx,
            size_of::<Elf64Sym>() as u64,
        );

        let path = b.write_temp("linear");
        let img = ElfImage::create(&path, Some(TEST_BASE)).unwrap();

        let def = img.find_symbol_offset("helper").unwrap();
        assert_eq!(def.value, 0x200);

        // Address inside [0x200, 0x240) maps back to the symbol
        let (name, start) = img.symbol_at(TEST_BASE + 0x210).unwrap();
        assert_eq!(name, "helper");
        assert_eq!(start, TEST_BASE + 0x200);

        assert!(img.symbol_at(TEST_BASE + 0x240).is_none());
        assert!(img.symbol_at(TEST_BASE + 0x1ff).is_none());
        std::fs::remove_file(&path).ok();
    }
}
