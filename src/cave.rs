//! Near allocation of executable codecaves.
//!
//! A 5-byte `jmp rel32` only reaches addresses within roughly 2 GiB of the
//! patched instruction, so the cave backing a hook has to be carved out of
//! free address space close to the target. Each platform walks the address
//! space in its own way; the [`Bound`] arithmetic is shared.

use log::debug;

use crate::err::HookError;

#[cfg(unix)]
#[path = "cave/unix.rs"]
mod os;
#[cfg(windows)]
#[path = "cave/windows.rs"]
mod os;

/// Size of one codecave allocation. A single page is far more than the
/// generated entry jump, trampoline and relay glue ever need.
pub(crate) const CAVE_SIZE: usize = 4096;

/// Address range from which a cave may be allocated so that `jmp rel32`
/// displacements in both directions stay within `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Bound {
    pub min: usize,
    pub max: usize,
}

impl Bound {
    /// The largest range reachable from `addr` by a near jump, leaving one
    /// cave of slack at the top so the whole allocation stays reachable.
    pub fn around(addr: usize) -> Self {
        let reach = i32::MAX as usize - CAVE_SIZE;
        Bound {
            min: addr.saturating_sub(reach),
            max: addr.saturating_add(reach),
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.min && addr.saturating_add(CAVE_SIZE) <= self.max
    }

    /// Clamps `addr` into the range, keeping room for one cave at the top.
    pub fn clamp(&self, addr: usize) -> usize {
        addr.clamp(self.min, self.max - CAVE_SIZE)
    }
}

/// An executable scratch allocation near a hook target, holding the entry
/// jump, the relocated prologue and the relay glue.
pub(crate) struct Codecave {
    addr: usize,
    len: usize,
    freed: bool,
}

impl Codecave {
    /// Allocates one cave within near-jump range of `target`.
    pub fn allocate_near(target: usize) -> Result<Self, HookError> {
        let bound = Bound::around(target);
        let addr = os::allocate_in(&bound, target).ok_or(HookError::AllocateCodecave)?;
        debug!("codecave of {CAVE_SIZE:#x} bytes at {addr:#x} for target {target:#x}");
        Ok(Codecave {
            addr,
            len: CAVE_SIZE,
            freed: false,
        })
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.addr as *mut u8, self.len) }
    }

    /// Returns the cave to the OS. Reports failure instead of panicking so
    /// the caller can surface it as an error.
    pub fn release(&mut self) -> bool {
        if self.freed {
            return true;
        }
        self.freed = os::free(self.addr, self.len);
        if self.freed {
            debug!("codecave at {:#x} released", self.addr);
        }
        self.freed
    }
}

impl Drop for Codecave {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_spans_near_jump_reach() {
        let b = Bound::around(0x1_0000_0000);
        assert!(b.contains(0x1_0000_0000));
        assert!(b.contains(0x1_0000_0000 + 0x4000_0000));
        assert!(!b.contains(0x2_0000_0000));
        assert!(!b.contains(0));
    }

    #[test]
    fn bound_saturates_near_address_space_edges() {
        let b = Bound::around(0x1000);
        assert_eq!(b.min, 0);
        let b = Bound::around(usize::MAX - 0x1000);
        assert_eq!(b.max, usize::MAX);
    }

    #[test]
    fn clamp_keeps_room_for_a_cave() {
        let b = Bound { min: 0x1000, max: 0x10000 };
        assert_eq!(b.clamp(0x500), 0x1000);
        assert_eq!(b.clamp(0x20000), 0x10000 - CAVE_SIZE);
        assert_eq!(b.clamp(0x8000), 0x8000);
    }

    #[test]
    fn allocation_lands_in_bound_and_is_writable() {
        let target = allocation_lands_in_bound_and_is_writable as usize;
        let mut cave = Codecave::allocate_near(target).unwrap();
        let bound = Bound::around(target);
        assert!(bound.contains(cave.addr()));

        let buf = cave.as_mut_slice();
        buf[0] = 0xc3;
        assert_eq!(unsafe { core::ptr::read(cave.addr() as *const u8) }, 0xc3);
        assert!(cave.release());
        // releasing twice is fine
        assert!(cave.release());
    }
}
