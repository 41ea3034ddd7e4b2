//! Auxiliary vector access and IFUNC resolution

// ============================================================================
// Hardware Capabilities
// ============================================================================

pub fn hwcap() -> u64 {
    unsafe { libc::getauxval(libc::AT_HWCAP) }
}

pub fn hwcap2() -> u64 {
    unsafe { libc::getauxval(libc::AT_HWCAP2) }
}

// ============================================================================
// IFUNC Resolver Argument
// ============================================================================

/// Second argument handed to AArch64 IFUNC resolvers.
#[repr(C)]
pub struct IfuncArg {
    pub size: u64,
    pub hwcap: u64,
    pub hwcap2: u64,
}

/// Marker bit the platform sets in the first resolver argument to signal
/// that the second argument carries the extended capability record.
pub const IFUNC_ARG_HWCAP: u64 = 1 << 62;

type IfuncResolver = unsafe extern "C" fn(u64, *mut IfuncArg) -> u64;

/// Invoke an IFUNC resolver at `resolver_addr` and return the address it
/// selects.
///
/// # Safety
/// `resolver_addr` must be the mapped, relocated entry point of an IFUNC
/// resolver following the AArch64 convention.
pub unsafe fn call_ifunc_resolver(resolver_addr: usize) -> u64 {
    let mut arg = IfuncArg {
        size: std::mem::size_of::<IfuncArg>() as u64,
        hwcap: hwcap(),
        hwcap2: hwcap2(),
    };
    let resolver: IfuncResolver = std::mem::transmute(resolver_addr);
    resolver(arg.hwcap | IFUNC_ARG_HWCAP, &mut arg)
}
