//! Resolution of loaded-module base addresses, for hooking by
//! module-relative offset.

#[cfg(windows)]
use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;

#[cfg(unix)]
use crate::mem;

/// Base address of the named loaded module, or of the main executable when
/// `name` is empty. `None` when no such module is mapped.
#[cfg(unix)]
pub fn base_address(name: &str) -> Option<usize> {
    let regions = mem::regions();
    if name.is_empty() {
        // the first file-backed mapping is the main image
        return regions
            .iter()
            .find(|r| matches!(&r.path, Some(p) if p.starts_with('/')))
            .map(|r| r.start);
    }
    regions
        .iter()
        .find(|r| {
            matches!(&r.path, Some(p) if p == name
                || p.rsplit('/').next() == Some(name))
        })
        .map(|r| r.start)
}

/// Base address of the named loaded module, or of the main executable when
/// `name` is empty. `None` when no such module is loaded.
#[cfg(windows)]
pub fn base_address(name: &str) -> Option<usize> {
    let handle = if name.is_empty() {
        unsafe { GetModuleHandleW(core::ptr::null()) }
    } else {
        let wide: Vec<u16> = name.encode_utf16().chain(core::iter::once(0)).collect();
        unsafe { GetModuleHandleW(wide.as_ptr()) }
    };
    (!handle.is_null()).then_some(handle as usize)
}
