//! x86-64 register context and code generation.

pub(crate) mod codegen;

/// Snapshot of the general-purpose registers at the moment a hooked
/// function was entered, plus the caller's return address.
///
/// Written by the generated save stub before the relay runs; field order
/// and `#[repr(C)]` are load-bearing, the stub stores by fixed offsets.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    /// Address the hooked function would have returned to.
    pub return_address: u64,
    /// The rax register.
    pub rax: u64,
    /// The rcx register.
    pub rcx: u64,
    /// The rdx register.
    pub rdx: u64,
    /// The rbx register.
    pub rbx: u64,
    /// Stack pointer at function entry, pointing at the return address.
    pub rsp: u64,
    /// The rbp register.
    pub rbp: u64,
    /// The rsi register.
    pub rsi: u64,
    /// The rdi register.
    pub rdi: u64,
    /// The r8 register.
    pub r8: u64,
    /// The r9 register.
    pub r9: u64,
    /// The r10 register.
    pub r10: u64,
    /// The r11 register.
    pub r11: u64,
    /// The r12 register.
    pub r12: u64,
    /// The r13 register.
    pub r13: u64,
    /// The r14 register.
    pub r14: u64,
    /// The r15 register.
    pub r15: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn layout_matches_save_stub_offsets() {
        assert_eq!(size_of::<Context>(), 136);
        assert_eq!(offset_of!(Context, return_address), 0);
        assert_eq!(offset_of!(Context, rax), 8);
        assert_eq!(offset_of!(Context, rcx), 16);
        assert_eq!(offset_of!(Context, rdx), 24);
        assert_eq!(offset_of!(Context, rbx), 32);
        assert_eq!(offset_of!(Context, rsp), 40);
        assert_eq!(offset_of!(Context, rbp), 48);
        assert_eq!(offset_of!(Context, rsi), 56);
        assert_eq!(offset_of!(Context, rdi), 64);
        assert_eq!(offset_of!(Context, r8), 72);
        assert_eq!(offset_of!(Context, r15), 128);
    }
}
