//! The hook controller: owns the patch state of one target function and
//! drives installation, removal and redirection.
//!
//! Layered hooks on one target are supported. Removing a hook that is no
//! longer the outermost patch does not tear the chain down; it parks
//! itself by nopping its cave's entry jump, so control slides through its
//! trampoline untouched until the hook is reinstalled or the outer patch
//! goes away.

use core::cell::UnsafeCell;
use core::ops::Deref;

use log::debug;

use crate::arch::{codegen, Context};
use crate::cave::Codecave;
use crate::convention::{Function, RelaySpec};
use crate::decode::{self, JMP_SIZE};
use crate::emit::{self, CALL_OPCODE, JMP_OPCODE, NOP_OPCODE};
use crate::err::HookError;
use crate::mem::{self, Protection};
use crate::module;

/// A redirection callback. Receives the hook core, through which the
/// original function remains callable, and the original arguments.
pub type HookCallback<F> =
    Box<dyn Fn(&HookCore<F>, <F as Function>::Args) -> <F as Function>::Ret>;

/// An inline hook on one function of signature `F`.
///
/// The target's first instructions are displaced into a codecave and
/// replaced with a jump; calls then reach the [`HookCallback`] set with
/// [`redirect`](Hook::redirect), or fall through to the displaced original
/// when no callback is set. Dropping an installed hook removes it.
///
/// Dropping a *parked* hook frees its codecave even though an outer hook's
/// trampoline still jumps through it; keep parked hooks alive until the
/// outer patch is gone.
///
/// ```no_run
/// use cavehook::Hook;
///
/// extern "C" fn scale(v: i32) -> i32 {
///     v * 10
/// }
///
/// # #[cfg(target_arch = "x86_64")]
/// # fn demo() {
/// let mut hook = unsafe { Hook::for_target(scale as extern "C" fn(i32) -> i32) };
/// hook.redirect(|h, (v,)| unsafe { h.call((v,)) } + 1);
/// unsafe { hook.install() }.unwrap();
/// assert_eq!(scale(2), 21);
/// # }
/// ```
pub struct Hook<F: Function> {
    // boxed so the address baked into generated code stays put
    core: Box<HookCore<F>>,
}

/// The pinned state of one hook: the generated code references it by
/// address, so it lives in a [`Box`] behind [`Hook`] and never moves.
pub struct HookCore<F: Function> {
    target: usize,
    callback: Option<HookCallback<F>>,
    prologue_size: usize,
    installed: bool,
    trampoline: usize,
    codecave: Option<Codecave>,
    original_bytes: Option<Vec<u8>>,
    usercode_jump: Option<[u8; JMP_SIZE]>,
    context: UnsafeCell<Context>,
}

impl<F: Function> Default for Hook<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Function> Hook<F> {
    /// An unbound hook. Set a target before installing.
    pub fn new() -> Self {
        Hook {
            core: Box::new(HookCore {
                target: 0,
                callback: None,
                prologue_size: 0,
                installed: false,
                trampoline: 0,
                codecave: None,
                original_bytes: None,
                usercode_jump: None,
                context: UnsafeCell::new(Context::default()),
            }),
        }
    }

    /// A hook bound to `f`, not yet installed.
    ///
    /// # Safety
    /// See [`set_target`](Hook::set_target).
    pub unsafe fn for_target(f: F) -> Self {
        let mut hook = Self::new();
        // binding an address on a fresh hook cannot fail
        let _ = unsafe { hook.set_target(f) };
        hook
    }

    /// Binds the hook to `f` and measures how many prologue bytes the
    /// patch will displace.
    ///
    /// # Safety
    /// `f`'s first instructions are read and must stay unchanged until the
    /// hook is installed.
    pub unsafe fn set_target(&mut self, f: F) -> Result<(), HookError> {
        unsafe { self.set_target_address(f.addr()) }
    }

    /// Binds the hook to a raw code address carrying signature `F`.
    ///
    /// Fails with [`AlreadyInstalled`](HookError::AlreadyInstalled) while
    /// the hook is installed or parked: a parked hook still owns its cave
    /// and patch state, and reinstalling would revive the old target.
    ///
    /// # Safety
    /// `addr` must be the start of a function of signature `F`, readable
    /// for the length of its prologue.
    pub unsafe fn set_target_address(&mut self, addr: usize) -> Result<(), HookError> {
        if self.core.installed || self.core.codecave.is_some() {
            return Err(HookError::AlreadyInstalled);
        }
        self.core.target = addr;
        self.core.prologue_size = if addr == 0 {
            0
        } else {
            unsafe { decode::prologue_len(addr, JMP_SIZE) }
        };
        Ok(())
    }

    /// Binds the hook to `module`'s base address plus `offset`. An empty
    /// module name means the main executable.
    ///
    /// # Safety
    /// Same contract as [`set_target_address`](Hook::set_target_address)
    /// for the resolved address.
    pub unsafe fn set_target_in_module(
        &mut self,
        module: &str,
        offset: usize,
    ) -> Result<(), HookError> {
        let base = module::base_address(module).ok_or(HookError::InvalidAddress)?;
        unsafe { self.set_target_address(base + offset) }
    }

    /// Sets the callback invoked in place of the target. Takes effect
    /// immediately, installed or not.
    pub fn redirect(
        &mut self,
        callback: impl Fn(&HookCore<F>, F::Args) -> F::Ret + 'static,
    ) -> &mut Self {
        self.core.callback = Some(Box::new(callback));
        self
    }

    /// Patches the target and arms the hook.
    ///
    /// # Safety
    /// No other thread may be executing the target's first instructions
    /// while they are rewritten, and the target must stay mapped for the
    /// hook's lifetime.
    pub unsafe fn install(&mut self) -> Result<(), HookError> {
        unsafe { self.core.install() }
    }

    /// Disarms the hook. Restores the original bytes when this hook is
    /// still the outermost patch on the target, otherwise parks in place
    /// to keep a newer hook's chain intact.
    ///
    /// The decision reads the target's current first instruction, so a
    /// patch written by code outside this crate can make it misjudge who
    /// owns the target.
    ///
    /// # Safety
    /// Same threading contract as [`install`](Hook::install).
    pub unsafe fn remove(&mut self) -> Result<(), HookError> {
        unsafe { self.core.remove() }
    }
}

impl<F: Function> Deref for Hook<F> {
    type Target = HookCore<F>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

impl<F: Function> Drop for Hook<F> {
    fn drop(&mut self) {
        if self.core.installed {
            let _ = unsafe { self.core.remove() };
        }
    }
}

impl<F: Function> HookCore<F> {
    /// The bound target address.
    pub fn target_address(&self) -> usize {
        self.target
    }

    /// Whether the hook currently intercepts calls.
    pub fn installed(&self) -> bool {
        self.installed
    }

    /// Entry point of the displaced original prologue, 0 while the hook
    /// has no cave.
    pub fn trampoline_address(&self) -> usize {
        self.trampoline
    }

    /// Register snapshot taken on the most recent intercepted call.
    pub fn context(&self) -> Context {
        unsafe { *self.context.get() }
    }

    /// Calls the original function, bypassing the hook.
    ///
    /// # Safety
    /// The hook must be installed or parked, so that a trampoline exists.
    pub unsafe fn call(&self, args: F::Args) -> F::Ret {
        unsafe { F::invoke(self.trampoline, args) }
    }

    pub(crate) fn callback(&self) -> Option<&HookCallback<F>> {
        self.callback.as_ref()
    }

    unsafe fn install(&mut self) -> Result<(), HookError> {
        if self.installed {
            return Err(HookError::AlreadyInstalled);
        }
        if self.target == 0 {
            return Err(HookError::InvalidAddress);
        }
        if !mem::is_executable(self.target) {
            return Err(HookError::NotExecutable);
        }
        if self.prologue_size < JMP_SIZE {
            return Err(HookError::NotEnoughSpace);
        }

        // held across every write below
        let _guard = mem::ScopedProtect::new(self.target, self.prologue_size, Protection::RWX)?;

        if let Some(cave) = &self.codecave {
            // reinstall after a park: the target patch and the cave are
            // both still live, only the entry jump was nopped out
            let Some(backup) = self.usercode_jump else {
                return Err(HookError::ReinstallHook);
            };
            if unsafe { mem::copy(cave.addr(), backup.as_ptr() as usize, JMP_SIZE, false) }
                .is_err()
            {
                return Err(HookError::ReinstallHook);
            }
            self.installed = true;
            debug!("hook on {:#x} reinstalled", self.target);
            return Ok(());
        }

        let mut cave = Codecave::allocate_near(self.target)?;
        let spec = RelaySpec {
            convention: F::CONVENTION,
            arity: F::ARITY,
            ret_size: F::ret_size(),
            relay: F::relay(),
            core: self as *mut Self as usize,
            context: self.context.get() as usize,
        };
        unsafe { codegen::emit_codecave(&mut cave, self.target, self.prologue_size, &spec)? };
        let entry = cave.addr();

        let mut backup = vec![0u8; self.prologue_size];
        if unsafe { mem::copy(backup.as_mut_ptr() as usize, self.target, self.prologue_size, false) }
            .is_err()
        {
            return Err(HookError::BackupCreating);
        }

        if unsafe { mem::read::<u8>(self.target) } == CALL_OPCODE {
            // a target opening with `call rel32` keeps its opcode; only the
            // displacement is retargeted, and the call's own destination
            // becomes the trampoline
            let disp = unsafe { mem::read::<i32>(self.target + 1) };
            self.trampoline = (self.target as i64 + JMP_SIZE as i64 + disp as i64) as usize;
        } else {
            self.trampoline = entry + JMP_SIZE;
            if unsafe { mem::write::<u8>(self.target, JMP_OPCODE, false) }.is_err() {
                return Err(HookError::WriteMemory);
            }
        }
        if unsafe { mem::write::<i32>(self.target + 1, emit::rel32(self.target, entry), false) }
            .is_err()
        {
            return Err(HookError::WriteMemory);
        }
        if self.prologue_size > JMP_SIZE {
            let tail = self.prologue_size - JMP_SIZE;
            if unsafe { mem::fill(self.target + JMP_SIZE, NOP_OPCODE, tail, false) }.is_err() {
                return Err(HookError::WriteMemory);
            }
        }

        self.codecave = Some(cave);
        self.original_bytes = Some(backup);
        self.installed = true;
        debug!(
            "hook installed at {:#x}: cave {entry:#x}, trampoline {:#x}, {} prologue bytes",
            self.target, self.trampoline, self.prologue_size
        );
        Ok(())
    }

    unsafe fn remove(&mut self) -> Result<(), HookError> {
        if !self.installed {
            return Err(HookError::AlreadyRemoved);
        }
        if self.target == 0 {
            return Err(HookError::InvalidAddress);
        }

        let _guard = mem::ScopedProtect::new(self.target, self.prologue_size, Protection::RWX)?;

        // decide between a full unload and a park by looking at who owns
        // the patch now: if the target's first instruction still leads to
        // this hook's cave, nothing was layered on top of it
        let insn = unsafe { decode::decode_at(self.target) };
        let entry = self.codecave.as_ref().map(Codecave::addr);
        for op in 0..insn.operand_count() {
            if insn.is_relative_operand(op) {
                let dest = insn.absolute_target(op).map(|d| d as usize);
                let ours = dest.is_some() && (dest == entry || dest == Some(self.trampoline));
                return if ours {
                    unsafe { self.unload() }
                } else {
                    unsafe { self.park() }
                };
            }
        }
        // no relative operand: the patch is gone entirely, restore state
        unsafe { self.unload() }
    }

    unsafe fn unload(&mut self) -> Result<(), HookError> {
        let Some(backup) = &self.original_bytes else {
            return Err(HookError::BackupRestoring);
        };
        if unsafe { mem::copy(self.target, backup.as_ptr() as usize, backup.len(), false) }.is_err()
        {
            return Err(HookError::BackupRestoring);
        }
        if let Some(cave) = self.codecave.as_mut() {
            if !cave.release() {
                return Err(HookError::DeallocateCodecave);
            }
        }
        self.codecave = None;
        self.original_bytes = None;
        self.usercode_jump = None;
        self.trampoline = 0;
        self.installed = false;
        debug!("hook removed from {:#x}", self.target);
        Ok(())
    }

    unsafe fn park(&mut self) -> Result<(), HookError> {
        let Some(cave) = &self.codecave else {
            return Err(HookError::UsercodeJumpRemove);
        };
        let entry = cave.addr();
        let mut backup = [0u8; JMP_SIZE];
        if unsafe { mem::copy(backup.as_mut_ptr() as usize, entry, JMP_SIZE, false) }.is_err() {
            return Err(HookError::BackupCreating);
        }
        if unsafe { mem::fill(entry, NOP_OPCODE, JMP_SIZE, false) }.is_err() {
            return Err(HookError::UsercodeJumpRemove);
        }
        self.usercode_jump = Some(backup);
        self.installed = false;
        debug!("hook on {:#x} parked behind a newer patch", self.target);
        Ok(())
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use std::hint::black_box;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Mutex, MutexGuard};

    // hooks rewrite live code, so the tests take turns
    static LOCK: Mutex<()> = Mutex::new(());

    fn serial() -> MutexGuard<'static, ()> {
        LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    type BinOp = extern "C" fn(i32, i32) -> i32;

    #[test]
    fn hooked_call_is_redirected_and_removal_restores() {
        let _g = serial();

        #[inline(never)]
        extern "C" fn sum_a(a: i32, b: i32) -> i32 {
            a.wrapping_add(b)
        }

        let mut hook = unsafe { Hook::for_target(sum_a as BinOp) };
        hook.redirect(|h, (a, b)| unsafe { h.call((a, b)) } * 2);
        unsafe { hook.install() }.unwrap();
        assert!(hook.installed());
        assert_eq!(sum_a(black_box(2), black_box(2)), 8);

        unsafe { hook.remove() }.unwrap();
        assert!(!hook.installed());
        assert_eq!(sum_a(black_box(2), black_box(2)), 4);
        assert_eq!(unsafe { hook.remove() }, Err(HookError::AlreadyRemoved));
    }

    #[test]
    fn install_is_rejected_while_installed() {
        let _g = serial();

        #[inline(never)]
        extern "C" fn sum_b(a: i32, b: i32) -> i32 {
            a.wrapping_add(b)
        }

        let mut hook = unsafe { Hook::for_target(sum_b as BinOp) };
        unsafe { hook.install() }.unwrap();
        assert_eq!(unsafe { hook.install() }, Err(HookError::AlreadyInstalled));
        unsafe { hook.remove() }.unwrap();
    }

    #[test]
    fn hook_without_callback_passes_through() {
        let _g = serial();

        #[inline(never)]
        extern "C" fn sum_c(a: i32, b: i32) -> i32 {
            a.wrapping_add(b)
        }

        let mut hook = unsafe { Hook::for_target(sum_c as BinOp) };
        unsafe { hook.install() }.unwrap();
        assert_eq!(sum_c(black_box(3), black_box(4)), 7);
        // the interception still happened: the context was filled in
        let ctx = hook.context();
        assert_ne!(ctx.return_address, 0);
        assert_ne!(ctx.rsp, 0);
        unsafe { hook.remove() }.unwrap();
    }

    #[test]
    fn redirect_swaps_callbacks_without_reinstalling() {
        let _g = serial();

        #[inline(never)]
        extern "C" fn sum_d(a: i32, b: i32) -> i32 {
            a.wrapping_add(b)
        }

        let mut hook = unsafe { Hook::for_target(sum_d as BinOp) };
        hook.redirect(|_, _| 100);
        unsafe { hook.install() }.unwrap();
        assert_eq!(sum_d(black_box(1), black_box(1)), 100);

        hook.redirect(|_, _| 200);
        assert_eq!(sum_d(black_box(1), black_box(1)), 200);
        unsafe { hook.remove() }.unwrap();
        assert_eq!(sum_d(black_box(1), black_box(1)), 2);
    }

    #[test]
    fn layered_hooks_survive_inner_removal() {
        let _g = serial();

        #[inline(never)]
        extern "C" fn sum_e(a: i32, b: i32) -> i32 {
            a.wrapping_add(b)
        }

        static INNER_CALLS: AtomicU32 = AtomicU32::new(0);
        static OUTER_CALLS: AtomicU32 = AtomicU32::new(0);
        INNER_CALLS.store(0, Ordering::SeqCst);
        OUTER_CALLS.store(0, Ordering::SeqCst);

        let mut inner = unsafe { Hook::for_target(sum_e as BinOp) };
        inner.redirect(|h, (a, b)| {
            INNER_CALLS.fetch_add(1, Ordering::SeqCst);
            (unsafe { h.call((a, b)) }) * 2
        });
        let mut outer = unsafe { Hook::for_target(sum_e as BinOp) };
        outer.redirect(|h, (a, b)| {
            OUTER_CALLS.fetch_add(1, Ordering::SeqCst);
            (unsafe { h.call((a, b)) }) + 1
        });

        unsafe { inner.install() }.unwrap();
        unsafe { outer.install() }.unwrap();
        // outer wraps inner wraps the original
        assert_eq!(sum_e(black_box(1), black_box(1)), 5);
        assert_eq!(INNER_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(OUTER_CALLS.load(Ordering::SeqCst), 1);

        // the inner hook is not the outermost patch, so it parks and the
        // outer hook keeps working through its trampoline
        unsafe { inner.remove() }.unwrap();
        assert!(!inner.installed());
        assert_eq!(sum_e(black_box(1), black_box(1)), 3);
        assert_eq!(INNER_CALLS.load(Ordering::SeqCst), 1);

        // reinstalling a parked hook revives it in place
        unsafe { inner.install() }.unwrap();
        assert_eq!(sum_e(black_box(1), black_box(1)), 5);
        assert_eq!(INNER_CALLS.load(Ordering::SeqCst), 2);

        // the outer hook is outermost, removing it restores the inner
        // hook's patch
        unsafe { outer.remove() }.unwrap();
        assert_eq!(sum_e(black_box(1), black_box(1)), 4);
        assert_eq!(INNER_CALLS.load(Ordering::SeqCst), 3);

        unsafe { inner.remove() }.unwrap();
        assert_eq!(sum_e(black_box(1), black_box(1)), 2);
    }

    #[test]
    fn large_struct_return_goes_through_the_hidden_pointer() {
        let _g = serial();

        #[repr(C)]
        #[derive(Clone, Copy, PartialEq, Eq, Debug)]
        struct Triple {
            a: u64,
            b: u64,
            c: u64,
        }

        #[inline(never)]
        extern "C" fn make_triple(x: u64) -> Triple {
            Triple {
                a: x,
                b: x.wrapping_add(1),
                c: x.wrapping_add(2),
            }
        }

        let mut hook = unsafe { Hook::for_target(make_triple as extern "C" fn(u64) -> Triple) };
        hook.redirect(|h, (x,)| {
            let mut t = unsafe { h.call((x,)) };
            t.c = 99;
            t
        });
        unsafe { hook.install() }.unwrap();
        assert_eq!(make_triple(black_box(5)), Triple { a: 5, b: 6, c: 99 });
        unsafe { hook.remove() }.unwrap();
        assert_eq!(make_triple(black_box(5)), Triple { a: 5, b: 6, c: 7 });
    }

    #[test]
    fn call_opening_target_keeps_its_opcode() {
        let _g = serial();

        #[inline(never)]
        extern "C" fn sum_i(a: i32, b: i32) -> i32 {
            a.wrapping_add(b)
        }

        // a target whose first instruction is `call rel32` into the body
        let mut thunk = Codecave::allocate_near(sum_i as usize).unwrap();
        let entry = thunk.addr();
        {
            let code = thunk.as_mut_slice();
            code[0] = CALL_OPCODE;
            code[1..5].copy_from_slice(&emit::rel32(entry, sum_i as usize).to_le_bytes());
            // ret
            code[5] = 0xc3;
        }
        let f: BinOp = unsafe { core::mem::transmute(entry) };
        assert_eq!(f(black_box(2), black_box(2)), 4);

        let mut hook: Hook<BinOp> = Hook::new();
        unsafe { hook.set_target_address(entry) }.unwrap();
        hook.redirect(|h, (a, b)| (unsafe { h.call((a, b)) }) * 2);
        unsafe { hook.install() }.unwrap();
        // the call opcode stays, only its displacement is retargeted, and
        // the trampoline is the call's original destination
        assert_eq!(unsafe { mem::read::<u8>(entry) }, CALL_OPCODE);
        assert_eq!(hook.trampoline_address(), sum_i as usize);
        assert_eq!(f(black_box(2), black_box(2)), 8);

        unsafe { hook.remove() }.unwrap();
        assert_eq!(f(black_box(2), black_box(2)), 4);
    }

    #[test]
    fn dropping_an_installed_hook_unpatches() {
        let _g = serial();

        #[inline(never)]
        extern "C" fn sum_f(a: i32, b: i32) -> i32 {
            a.wrapping_add(b)
        }

        {
            let mut hook = unsafe { Hook::for_target(sum_f as BinOp) };
            hook.redirect(|_, _| -1);
            unsafe { hook.install() }.unwrap();
            assert_eq!(sum_f(black_box(1), black_box(2)), -1);
        }
        assert_eq!(sum_f(black_box(1), black_box(2)), 3);
    }

    #[test]
    fn install_preconditions_are_checked_in_order() {
        let _g = serial();

        let mut unbound: Hook<BinOp> = Hook::new();
        assert_eq!(unsafe { unbound.install() }, Err(HookError::InvalidAddress));

        static DATA: [u8; 64] = [0x90; 64];
        let mut on_data: Hook<BinOp> = Hook::new();
        unsafe { on_data.set_target_address(DATA.as_ptr() as usize) }.unwrap();
        assert_eq!(unsafe { on_data.install() }, Err(HookError::NotExecutable));
    }

    #[test]
    fn missing_module_is_an_invalid_address() {
        let mut hook: Hook<BinOp> = Hook::new();
        assert_eq!(
            unsafe { hook.set_target_in_module("no-such-module-49f2.so", 0x10) },
            Err(HookError::InvalidAddress)
        );
    }

    #[test]
    fn rebinding_an_installed_hook_is_rejected() {
        let _g = serial();

        #[inline(never)]
        extern "C" fn sum_g(a: i32, b: i32) -> i32 {
            a.wrapping_add(b)
        }

        let mut hook = unsafe { Hook::for_target(sum_g as BinOp) };
        unsafe { hook.install() }.unwrap();
        assert_eq!(
            unsafe { hook.set_target(sum_g as BinOp) },
            Err(HookError::AlreadyInstalled)
        );
        unsafe { hook.remove() }.unwrap();
    }

    #[test]
    fn rebinding_a_parked_hook_is_rejected() {
        let _g = serial();

        #[inline(never)]
        extern "C" fn sum_h(a: i32, b: i32) -> i32 {
            a.wrapping_add(b)
        }

        let mut inner = unsafe { Hook::for_target(sum_h as BinOp) };
        let mut outer = unsafe { Hook::for_target(sum_h as BinOp) };
        unsafe { inner.install() }.unwrap();
        unsafe { outer.install() }.unwrap();

        // removal under the outer patch parks, keeping the cave alive
        unsafe { inner.remove() }.unwrap();
        assert!(!inner.installed());
        assert_eq!(
            unsafe { inner.set_target(sum_h as BinOp) },
            Err(HookError::AlreadyInstalled)
        );

        unsafe { inner.install() }.unwrap();
        unsafe { outer.remove() }.unwrap();
        unsafe { inner.remove() }.unwrap();
        assert_eq!(sum_h(black_box(1), black_box(2)), 3);
    }
}
