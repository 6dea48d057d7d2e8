//! Codecave allocation on Windows via a `VirtualQuery` walk.

use core::ffi::c_void;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_FREE,
    MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
};

use super::{Bound, CAVE_SIZE};

enum Probe {
    Mapped(usize),
    Busy(usize, usize),
    Fail,
}

/// Walks outward from `target` until a free region takes the allocation,
/// first upward to `bound.max`, then downward to `bound.min`.
pub(super) fn allocate_in(bound: &Bound, target: usize) -> Option<usize> {
    let start = bound.clamp(target);

    let mut cur = start;
    while cur < bound.max {
        match query_and_alloc(cur) {
            Probe::Mapped(addr) => return Some(addr),
            Probe::Busy(_, size) => cur += size.max(CAVE_SIZE),
            Probe::Fail => break,
        }
    }
    let mut cur = start;
    while cur > bound.min {
        match query_and_alloc(cur) {
            Probe::Mapped(addr) => return Some(addr),
            Probe::Busy(base, _) => cur = base.saturating_sub(CAVE_SIZE),
            Probe::Fail => break,
        }
    }
    None
}

pub(super) fn free(addr: usize, _len: usize) -> bool {
    unsafe { VirtualFree(addr as *mut c_void, 0, MEM_RELEASE) != 0 }
}

fn query_and_alloc(addr: usize) -> Probe {
    let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { core::mem::zeroed() };
    let ret = unsafe {
        VirtualQuery(
            addr as *const c_void,
            &mut mbi,
            core::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if ret == 0 {
        return Probe::Fail;
    }
    if mbi.State == MEM_FREE && mbi.RegionSize >= CAVE_SIZE {
        let mem = unsafe {
            VirtualAlloc(
                mbi.BaseAddress,
                CAVE_SIZE,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if !mem.is_null() {
            return Probe::Mapped(mem as usize);
        }
    }
    Probe::Busy(mbi.BaseAddress as usize, mbi.RegionSize)
}
