//! Loader errors

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SoloadError>;

/// Errors surfaced by the loader.
///
/// Parsing and mapping failures abort a load; relocation-level problems
/// (unresolved symbols, unsupported relocation kinds) are logged at the
/// point of occurrence and do not abort the link.
#[derive(Debug, thiserror::Error)]
pub enum SoloadError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid ELF: {0}")]
    InvalidElf(String),

    #[error("mapping failed: {0}")]
    MapFailed(String),

    #[error("registry slots exhausted: {0}")]
    OutOfRegistrySlots(&'static str),

    #[error("unresolved symbol: {0}")]
    UnresolvedSymbol(String),

    #[error("unsupported relocation type {0}")]
    UnsupportedReloc(u32),

    #[error("malformed packed relocation stream: {0}")]
    MalformedPackedReloc(&'static str),

    #[error("a library is already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
