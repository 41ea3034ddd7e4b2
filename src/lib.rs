//! soload: a self-contained dynamic loader for AArch64 shared objects
//!
//! Maps an ELF shared object into the running process, resolves its
//! dependency closure, applies every relocation format eagerly, wires up
//! thread-local storage and unwind information, runs its initializers and
//! answers symbol queries, all without touching the host's `dlopen`.
//!
//! ```ignore
//! soload::set_process_args(argc, argv, envp);
//!
//! let mut loader = soload::SoLoader::new();
//! loader.load("/data/local/tmp/libtest.so")?;
//!
//! let add: extern "C" fn(i32, i32) -> i32 =
//!     unsafe { std::mem::transmute(loader.get_symbol("add").unwrap()) };
//! assert_eq!(add(10, 20), 30);
//!
//! loader.unload()?;
//! ```

pub mod auxv;
pub mod backtrace;
pub mod constants;
pub mod elf;
pub mod error;
pub mod helpers;
pub mod image;
pub mod leb128;
pub mod linker;
pub mod loader;
pub mod tls;

use std::ffi::CString;

use log::{debug, error, info, warn};

pub use error::{Result, SoloadError};
pub use linker::set_process_args;

use image::ElfImage;
use linker::Linker;

// ============================================================================
// Public Handle
// ============================================================================

/// One loaded shared object and everything linked in with it.
///
/// A handle binds to a single library at a time; `load` fails with
/// `AlreadyLoaded` until `unload` or `abandon` clears it.
pub struct SoLoader {
    lib_path: String,
    linker: Linker,
    loaded: bool,
}

impl Default for SoLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SoLoader {
    pub fn new() -> Self {
        Self {
            lib_path: String::new(),
            linker: Linker::new(),
            loaded: false,
        }
    }

    /// Map, link and initialize the library at `path`.
    pub fn load(&mut self, path: &str) -> Result<()> {
        if self.loaded {
            error!("already loaded: {}", self.lib_path);
            return Err(SoloadError::AlreadyLoaded(self.lib_path.clone()));
        }

        Self::check_regular_readable(path)?;

        info!("loading library: {path}");

        let mapping = loader::load_library(path)?;
        debug!("library mapped at {:#x}, size {:#x}", mapping.base, mapping.size);

        let image = match ElfImage::create(path, Some(mapping.base)) {
            Ok(image) => image,
            Err(e) => {
                error!("failed to parse ELF image {path}: {e}");
                unsafe {
                    libc::munmap(mapping.base as *mut libc::c_void, mapping.size);
                }
                return Err(e);
            }
        };
        image.log_summary();

        self.linker.init(image);
        self.linker.set_main_map_size(mapping.size);

        if let Err(e) = self.linker.link() {
            error!("failed to link {path}: {e}");
            self.linker.destroy();
            return Err(e);
        }

        self.lib_path = path.to_string();
        self.loaded = true;
        info!("loaded {path} at {:#x}", mapping.base);
        Ok(())
    }

    /// Run finalizers, undo registrations and release all mappings.
    pub fn unload(&mut self) -> Result<()> {
        if !self.loaded {
            warn!("no library loaded");
            return Err(SoloadError::NotFound("no library loaded".to_string()));
        }

        info!("unloading {}", self.lib_path);
        self.linker.destroy();
        self.lib_path.clear();
        self.loaded = false;
        Ok(())
    }

    /// Drop all references without running finalizers or unmapping, for
    /// libraries whose code pointers have escaped into the process.
    pub fn abandon(&mut self) -> Result<()> {
        if !self.loaded {
            warn!("no library loaded");
            return Err(SoloadError::NotFound("no library loaded".to_string()));
        }

        info!("abandoning {} without finalizers", self.lib_path);
        self.linker.abandon();
        self.lib_path.clear();
        self.loaded = false;
        Ok(())
    }

    /// Runtime address of a symbol exported by the loaded library.
    pub fn get_symbol(&self, name: &str) -> Option<*mut libc::c_void> {
        if !self.loaded {
            return None;
        }
        let image = self.linker.main_image()?;
        let (addr, _bind) = image.find_symbol_address(name)?;
        Some(addr as *mut libc::c_void)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn path(&self) -> &str {
        &self.lib_path
    }

    /// Number of dependencies the link pulled in.
    pub fn dependency_count(&self) -> usize {
        self.linker.dependency_count()
    }

    fn check_regular_readable(path: &str) -> Result<()> {
        let c_path = CString::new(path)
            .map_err(|_| SoloadError::NotFound(format!("{path}: embedded NUL")))?;

        let mut st = unsafe { std::mem::zeroed::<libc::stat>() };
        if unsafe { libc::stat(c_path.as_ptr(), &mut st) } != 0 {
            error!("library file not found: {path}");
            return Err(SoloadError::NotFound(path.to_string()));
        }
        if st.st_mode & libc::S_IFMT != libc::S_IFREG {
            error!("not a regular file: {path}");
            return Err(SoloadError::NotFound(format!("{path}: not a regular file")));
        }
        if unsafe { libc::access(c_path.as_ptr(), libc::R_OK) } != 0 {
            error!("library file not readable: {path}");
            return Err(SoloadError::NotFound(format!("{path}: not readable")));
        }
        Ok(())
    }
}

impl Drop for SoLoader {
    fn drop(&mut self) {
        if self.loaded {
            let _ = self.unload();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
