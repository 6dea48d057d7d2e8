//! Low-level memory primitives: typed reads and writes, block copy and fill,
//! page protection queries and a scoped protection override.
//!
//! Every mutating primitive takes an `unprotect` switch; when set, the
//! operation runs under a temporary read-write-execute override and the
//! previous protection is restored before returning. Writes that may land in
//! executable regions flush the instruction cache afterwards.

use crate::err::HookError;

use bitflags::bitflags;

#[cfg(unix)]
use libc::{c_void, mprotect, sysconf, _SC_PAGESIZE};

#[cfg(windows)]
use core::ffi::c_void;
#[cfg(windows)]
use windows_sys::Win32::Foundation::GetLastError;
#[cfg(windows)]
use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
#[cfg(windows)]
use windows_sys::Win32::System::Memory::{
    VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
    PAGE_WRITECOPY,
};
#[cfg(windows)]
use windows_sys::Win32::System::Threading::GetCurrentProcess;

bitflags! {
    /// Page protection flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        /// Pages may be read
        const READ = 0x1;
        /// Pages may be written
        const WRITE = 0x2;
        /// Pages may be executed
        const EXECUTE = 0x4;
    }
}

impl Protection {
    /// Read + write + execute, the override used around every code patch.
    pub const RWX: Protection = Protection::all();

    #[cfg(windows)]
    fn to_native(self) -> u32 {
        match (
            self.contains(Protection::EXECUTE),
            self.contains(Protection::WRITE),
            self.contains(Protection::READ),
        ) {
            (true, true, _) => PAGE_EXECUTE_READWRITE,
            (true, false, true) => PAGE_EXECUTE_READ,
            (true, false, false) => PAGE_EXECUTE,
            (false, true, _) => PAGE_READWRITE,
            (false, false, true) => PAGE_READONLY,
            (false, false, false) => PAGE_NOACCESS,
        }
    }

    #[cfg(windows)]
    fn from_native(native: u32) -> Protection {
        match native & 0xff {
            PAGE_READONLY => Protection::READ,
            PAGE_READWRITE | PAGE_WRITECOPY => Protection::READ | Protection::WRITE,
            PAGE_EXECUTE => Protection::EXECUTE,
            PAGE_EXECUTE_READ => Protection::EXECUTE | Protection::READ,
            PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY => Protection::all(),
            _ => Protection::empty(),
        }
    }

    #[cfg(unix)]
    fn to_native(self) -> i32 {
        let mut prot = libc::PROT_NONE;
        if self.contains(Protection::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Protection::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Protection::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// One record of the process memory map. Unix only; Windows queries regions
/// directly through `VirtualQuery`.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub(crate) struct Region {
    pub start: usize,
    pub end: usize,
    pub protect: Protection,
    pub path: Option<String>,
}

#[cfg(unix)]
pub(crate) fn regions() -> Vec<Region> {
    use regex::Regex;
    use std::io::{BufRead, BufReader};
    use std::sync::OnceLock;

    static LINE: OnceLock<Regex> = OnceLock::new();
    let line_re = LINE.get_or_init(|| {
        Regex::new(r"^([0-9a-f]+)-([0-9a-f]+)\s+([rwx-]{3})[sp]\s+\S+\s+\S+\s+\d+\s*(.*)$")
            .expect("maps line pattern")
    });

    let Ok(maps) = std::fs::File::open("/proc/self/maps") else {
        return Vec::new();
    };

    BufReader::new(maps)
        .lines()
        .map_while(Result::ok)
        .filter_map(|line| {
            let caps = line_re.captures(&line)?;
            let start = usize::from_str_radix(&caps[1], 16).ok()?;
            let end = usize::from_str_radix(&caps[2], 16).ok()?;
            let perms = &caps[3];
            let mut protect = Protection::empty();
            if perms.contains('r') {
                protect |= Protection::READ;
            }
            if perms.contains('w') {
                protect |= Protection::WRITE;
            }
            if perms.contains('x') {
                protect |= Protection::EXECUTE;
            }
            let path = caps.get(4).and_then(|m| {
                let p = m.as_str();
                (!p.is_empty()).then(|| p.to_string())
            });
            Some(Region {
                start,
                end,
                protect,
                path,
            })
        })
        .collect()
}

#[cfg(unix)]
pub(crate) fn page_size() -> usize {
    unsafe { sysconf(_SC_PAGESIZE) as usize }
}

/// Queries the current protection of the page containing `addr`.
#[cfg(unix)]
pub fn get_protect(addr: usize) -> Option<Protection> {
    regions()
        .into_iter()
        .find(|r| r.start <= addr && addr < r.end)
        .map(|r| r.protect)
}

/// Queries the current protection of the page containing `addr`.
#[cfg(windows)]
pub fn get_protect(addr: usize) -> Option<Protection> {
    let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
    let ret = unsafe {
        VirtualQuery(
            addr as *const c_void,
            &mut mbi,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    (ret != 0).then(|| Protection::from_native(mbi.Protect))
}

/// Sets the protection of `[addr, addr+len)`, returning the previous
/// protection on success or the OS error code on failure.
#[cfg(windows)]
pub fn set_protect(addr: usize, len: usize, protect: Protection) -> Result<Protection, u32> {
    let mut old: u32 = 0;
    let ret = unsafe {
        VirtualProtect(
            addr as *const c_void,
            len,
            protect.to_native(),
            &mut old,
        )
    };
    if ret == 0 {
        Err(unsafe { GetLastError() })
    } else {
        Ok(Protection::from_native(old))
    }
}

/// Sets the protection of `[addr, addr+len)`, returning the previous
/// protection on success or the OS error code on failure.
#[cfg(unix)]
pub fn set_protect(addr: usize, len: usize, protect: Protection) -> Result<Protection, u32> {
    let old = get_protect(addr).unwrap_or(Protection::READ | Protection::EXECUTE);

    let page = page_size();
    let start = addr & !(page - 1);
    let end = (addr + len + page - 1) & !(page - 1);
    let ret = unsafe { mprotect(start as *mut c_void, end - start, protect.to_native()) };
    if ret != 0 {
        let err = unsafe { *libc::__errno_location() };
        Err(err as u32)
    } else {
        Ok(old)
    }
}

/// Whether the page containing `addr` is executable.
pub fn is_executable(addr: usize) -> bool {
    get_protect(addr).is_some_and(|p| p.contains(Protection::EXECUTE))
}

/// Flushes the instruction cache for `[addr, addr+len)` after a code write.
///
/// A no-op on unix: x86 keeps the instruction cache coherent with memory
/// writes from the same core.
pub fn flush(addr: usize, len: usize) {
    #[cfg(windows)]
    unsafe {
        FlushInstructionCache(GetCurrentProcess(), addr as *const c_void, len);
    }
    #[cfg(unix)]
    {
        let _ = (addr, len);
    }
}

/// Scoped protection override: changes `[addr, addr+len)` to `protect` and
/// restores the previous protection when dropped, on every exit path.
pub struct ScopedProtect {
    addr: usize,
    len: usize,
    old: Protection,
}

impl ScopedProtect {
    /// Applies the override; fails with [`HookError::ProtectViolation`]
    /// carrying the OS error code when the change cannot be established.
    pub fn new(addr: usize, len: usize, protect: Protection) -> Result<Self, HookError> {
        let old = set_protect(addr, len, protect).map_err(HookError::ProtectViolation)?;
        Ok(Self { addr, len, old })
    }
}

impl Drop for ScopedProtect {
    fn drop(&mut self) {
        let _ = set_protect(self.addr, self.len, self.old);
        flush(self.addr, self.len);
    }
}

/// Reads a `T` at `addr`.
///
/// # Safety
///
/// `addr` must point to at least `size_of::<T>()` readable bytes.
pub unsafe fn read<T: Copy>(addr: usize) -> T {
    unsafe { std::ptr::read_unaligned(addr as *const T) }
}

/// Writes `value` at `addr`, optionally under a temporary RWX override.
///
/// # Safety
///
/// `addr` must point to `size_of::<T>()` bytes that are writable under the
/// requested protection.
pub unsafe fn write<T>(addr: usize, value: T, unprotect: bool) -> Result<(), HookError> {
    let _guard = if unprotect {
        Some(ScopedProtect::new(
            addr,
            std::mem::size_of::<T>(),
            Protection::RWX,
        )?)
    } else {
        None
    };
    unsafe { std::ptr::write_unaligned(addr as *mut T, value) };
    flush(addr, std::mem::size_of::<T>());
    Ok(())
}

/// Copies `len` bytes from `src` to `dest`, optionally under a temporary RWX
/// override at `dest`.
///
/// # Safety
///
/// Both ranges must be valid for `len` bytes and must not overlap.
pub unsafe fn copy(dest: usize, src: usize, len: usize, unprotect: bool) -> Result<(), HookError> {
    let _guard = if unprotect {
        Some(ScopedProtect::new(dest, len, Protection::RWX)?)
    } else {
        None
    };
    unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dest as *mut u8, len) };
    flush(dest, len);
    Ok(())
}

/// Fills `len` bytes at `dest` with `value`, optionally under a temporary
/// RWX override.
///
/// # Safety
///
/// `dest` must be valid for `len` bytes.
pub unsafe fn fill(dest: usize, value: u8, len: usize, unprotect: bool) -> Result<(), HookError> {
    let _guard = if unprotect {
        Some(ScopedProtect::new(dest, len, Protection::RWX)?)
    } else {
        None
    };
    unsafe { std::ptr::write_bytes(dest as *mut u8, value, len) };
    flush(dest, len);
    Ok(())
}
