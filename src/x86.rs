//! 32-bit x86 register context and code generation.

pub(crate) mod codegen;

/// Snapshot of the general-purpose registers at the moment a hooked
/// function was entered, plus the caller's return address.
///
/// Written by the generated save stub before the relay runs; field order
/// and `#[repr(C)]` are load-bearing, the stub stores by absolute field
/// addresses.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    /// Address the hooked function would have returned to.
    pub return_address: u32,
    /// The eax register.
    pub eax: u32,
    /// The ecx register.
    pub ecx: u32,
    /// The edx register.
    pub edx: u32,
    /// The ebx register.
    pub ebx: u32,
    /// The esi register.
    pub esi: u32,
    /// The edi register.
    pub edi: u32,
    /// Stack pointer at function entry, pointing at the return address.
    pub esp: u32,
    /// The ebp register.
    pub ebp: u32,
}
