//! Calling conventions, the target ABI, and the typed [`Function`] trait
//! that ties a hooked signature to its relay.
//!
//! Every hook is parameterized by the fn-pointer type of its target. The
//! [`Function`] impl for that type supplies the pieces the code generator
//! cannot know generically: the arity, the convention, the size of the
//! return value, and the address of a monomorphized relay that unpacks the
//! raw arguments and forwards them to the hook's dispatcher.

use crate::hook::HookCore;

/// How the hooked function receives its arguments and who cleans the stack.
///
/// On x86-64 only [`Cdecl`](CallingConvention::Cdecl) exists (the platform
/// register convention); the other variants matter on 32-bit x86.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// Stack arguments, caller cleans.
    Cdecl,
    /// Stack arguments, callee cleans.
    Stdcall,
    /// `this` in `ecx`, remaining arguments on the stack, callee cleans.
    Thiscall,
    /// First two arguments in `ecx`/`edx`, rest on the stack, callee cleans.
    Fastcall,
}

/// The platform register convention, fixed at compile time by the build
/// target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    /// x86-64 System V (unix).
    SystemV,
    /// x86-64 Microsoft.
    Win64,
    /// 32-bit x86, where the per-function [`CallingConvention`] rules.
    X86,
}

impl Abi {
    /// The ABI of the running process.
    pub const fn current() -> Abi {
        if cfg!(target_arch = "x86") {
            Abi::X86
        } else if cfg!(windows) {
            Abi::Win64
        } else {
            Abi::SystemV
        }
    }

    /// Integer argument registers in assignment order, by x86 register
    /// encoding.
    #[cfg(target_arch = "x86_64")]
    pub(crate) fn arg_registers(self) -> &'static [u8] {
        match self {
            // rdi, rsi, rdx, rcx, r8, r9
            Abi::SystemV => &[7, 6, 2, 1, 8, 9],
            // rcx, rdx, r8, r9
            Abi::Win64 => &[1, 2, 8, 9],
            Abi::X86 => &[],
        }
    }

    /// Stack bytes the caller must reserve below its arguments.
    #[cfg(target_arch = "x86_64")]
    pub(crate) fn shadow_space(self) -> usize {
        match self {
            Abi::Win64 => 32,
            _ => 0,
        }
    }

    /// Whether a return value of `ret_size` bytes travels through a hidden
    /// pointer argument instead of registers.
    pub(crate) fn uses_sret(self, ret_size: usize) -> bool {
        match self {
            Abi::SystemV => ret_size > 16,
            Abi::Win64 => !matches!(ret_size, 0 | 1 | 2 | 4 | 8),
            Abi::X86 => ret_size > 8,
        }
    }
}

/// A hookable fn-pointer signature.
///
/// Implemented for `extern` fn pointers up to a fixed arity; the impls are
/// generated per convention and tie the signature to a matching relay. The
/// trait is unsafe because the code generator trusts `CONVENTION`, `ARITY`
/// and `relay()` to describe the machine-level signature exactly.
pub unsafe trait Function: Copy + 'static {
    /// The argument list as a tuple.
    type Args;
    /// The return type.
    type Ret: 'static;

    /// Convention the target is called with.
    const CONVENTION: CallingConvention;
    /// Number of declared arguments.
    const ARITY: usize;

    /// Size of the return value in bytes.
    fn ret_size() -> usize {
        core::mem::size_of::<Self::Ret>()
    }

    /// Address of the monomorphized relay for this signature. The generated
    /// glue calls it with the hook core prepended to the original arguments.
    fn relay() -> usize;

    /// Address of this function pointer.
    fn addr(self) -> usize;

    /// Calls `addr` as a function of this signature.
    ///
    /// # Safety
    /// `addr` must point to executable code with exactly this signature.
    unsafe fn invoke(addr: usize, args: Self::Args) -> Self::Ret;
}

/// Everything the code generator needs to wire a cave to a relay.
pub(crate) struct RelaySpec {
    pub convention: CallingConvention,
    pub arity: usize,
    pub ret_size: usize,
    /// Address of the monomorphized relay.
    pub relay: usize,
    /// Address of the hook core, prepended as the relay's first argument.
    pub core: usize,
    /// Address of the hook's register context.
    pub context: usize,
}

/// Runs the hook's callback, or falls through to the trampoline when no
/// callback is set.
unsafe fn dispatch<F: Function>(core: *const HookCore<F>, args: F::Args) -> F::Ret {
    let core = unsafe { &*core };
    match core.callback() {
        Some(callback) => callback(core, args),
        None => unsafe { core.call(args) },
    }
}

#[cfg(target_arch = "x86_64")]
macro_rules! impl_function {
    ($arity:expr $(, $t:ident $a:ident)*) => {
        unsafe impl<R: 'static $(, $t: 'static)*> Function for extern "C" fn($($t),*) -> R {
            type Args = ($($t,)*);
            type Ret = R;

            const CONVENTION: CallingConvention = CallingConvention::Cdecl;
            const ARITY: usize = $arity;

            fn relay() -> usize {
                unsafe extern "C" fn relay<R: 'static $(, $t: 'static)*>(
                    core: *const HookCore<extern "C" fn($($t),*) -> R>,
                    $($a: $t),*
                ) -> R {
                    unsafe { dispatch(core, ($($a,)*)) }
                }
                relay::<R $(, $t)*> as usize
            }

            fn addr(self) -> usize {
                self as usize
            }

            unsafe fn invoke(addr: usize, args: Self::Args) -> R {
                let f: Self = unsafe { core::mem::transmute(addr) };
                let ($($a,)*) = args;
                f($($a),*)
            }
        }
    };
}

#[cfg(target_arch = "x86_64")]
mod impls {
    use super::*;

    impl_function!(0);
    impl_function!(1, A0 a0);
    impl_function!(2, A0 a0, A1 a1);
    impl_function!(3, A0 a0, A1 a1, A2 a2);
    impl_function!(4, A0 a0, A1 a1, A2 a2, A3 a3);
    impl_function!(5, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4);
}

/// Wrapper that forces the hook core onto the stack in a fastcall relay,
/// leaving `ecx` and `edx` free for the target's own register arguments.
#[cfg(target_arch = "x86")]
#[repr(C)]
pub struct FastcallSlot<F: Function> {
    pub(crate) core: *const HookCore<F>,
}

#[cfg(target_arch = "x86")]
macro_rules! impl_function_x86 {
    ($fnconv:literal, $relayconv:literal, $variant:ident, $arity:expr $(, $t:ident $a:ident)*) => {
        unsafe impl<R: 'static $(, $t: 'static)*> Function for extern $fnconv fn($($t),*) -> R {
            type Args = ($($t,)*);
            type Ret = R;

            const CONVENTION: CallingConvention = CallingConvention::$variant;
            const ARITY: usize = $arity;

            fn relay() -> usize {
                unsafe extern $relayconv fn relay<R: 'static $(, $t: 'static)*>(
                    core: *const HookCore<extern $fnconv fn($($t),*) -> R>,
                    $($a: $t),*
                ) -> R {
                    unsafe { dispatch(core, ($($a,)*)) }
                }
                relay::<R $(, $t)*> as usize
            }

            fn addr(self) -> usize {
                self as usize
            }

            unsafe fn invoke(addr: usize, args: Self::Args) -> R {
                let f: Self = unsafe { core::mem::transmute(addr) };
                let ($($a,)*) = args;
                f($($a),*)
            }
        }
    };
}

#[cfg(target_arch = "x86")]
macro_rules! impl_function_fastcall {
    ($arity:expr $(, $t:ident $a:ident)*) => {
        unsafe impl<R: 'static $(, $t: 'static)*> Function for extern "fastcall" fn($($t),*) -> R {
            type Args = ($($t,)*);
            type Ret = R;

            const CONVENTION: CallingConvention = CallingConvention::Fastcall;
            const ARITY: usize = $arity;

            fn relay() -> usize {
                unsafe extern "fastcall" fn relay<R: 'static $(, $t: 'static)*>(
                    slot: FastcallSlot<extern "fastcall" fn($($t),*) -> R>,
                    $($a: $t),*
                ) -> R {
                    unsafe { dispatch(slot.core, ($($a,)*)) }
                }
                relay::<R $(, $t)*> as usize
            }

            fn addr(self) -> usize {
                self as usize
            }

            unsafe fn invoke(addr: usize, args: Self::Args) -> R {
                let f: Self = unsafe { core::mem::transmute(addr) };
                let ($($a,)*) = args;
                f($($a),*)
            }
        }
    };
}

#[cfg(target_arch = "x86")]
mod impls {
    use super::*;

    impl_function_x86!("C", "C", Cdecl, 0);
    impl_function_x86!("C", "C", Cdecl, 1, A0 a0);
    impl_function_x86!("C", "C", Cdecl, 2, A0 a0, A1 a1);
    impl_function_x86!("C", "C", Cdecl, 3, A0 a0, A1 a1, A2 a2);
    impl_function_x86!("C", "C", Cdecl, 4, A0 a0, A1 a1, A2 a2, A3 a3);
    impl_function_x86!("C", "C", Cdecl, 5, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4);
    impl_function_x86!("C", "C", Cdecl, 6, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5);
    impl_function_x86!("C", "C", Cdecl, 7, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6);

    impl_function_x86!("stdcall", "stdcall", Stdcall, 0);
    impl_function_x86!("stdcall", "stdcall", Stdcall, 1, A0 a0);
    impl_function_x86!("stdcall", "stdcall", Stdcall, 2, A0 a0, A1 a1);
    impl_function_x86!("stdcall", "stdcall", Stdcall, 3, A0 a0, A1 a1, A2 a2);
    impl_function_x86!("stdcall", "stdcall", Stdcall, 4, A0 a0, A1 a1, A2 a2, A3 a3);
    impl_function_x86!("stdcall", "stdcall", Stdcall, 5, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4);
    impl_function_x86!("stdcall", "stdcall", Stdcall, 6, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5);
    impl_function_x86!("stdcall", "stdcall", Stdcall, 7, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6);

    // the receiver in ecx counts as the first argument, so arity starts at 1
    impl_function_x86!("thiscall", "stdcall", Thiscall, 1, A0 a0);
    impl_function_x86!("thiscall", "stdcall", Thiscall, 2, A0 a0, A1 a1);
    impl_function_x86!("thiscall", "stdcall", Thiscall, 3, A0 a0, A1 a1, A2 a2);
    impl_function_x86!("thiscall", "stdcall", Thiscall, 4, A0 a0, A1 a1, A2 a2, A3 a3);
    impl_function_x86!("thiscall", "stdcall", Thiscall, 5, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4);
    impl_function_x86!("thiscall", "stdcall", Thiscall, 6, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5);
    impl_function_x86!("thiscall", "stdcall", Thiscall, 7, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6);

    impl_function_fastcall!(0);
    impl_function_fastcall!(1, A0 a0);
    impl_function_fastcall!(2, A0 a0, A1 a1);
    impl_function_fastcall!(3, A0 a0, A1 a1, A2 a2);
    impl_function_fastcall!(4, A0 a0, A1 a1, A2 a2, A3 a3);
    impl_function_fastcall!(5, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4);
    impl_function_fastcall!(6, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5);
    impl_function_fastcall!(7, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_abi_matches_target() {
        #[cfg(all(target_arch = "x86_64", not(windows)))]
        assert_eq!(Abi::current(), Abi::SystemV);
        #[cfg(all(target_arch = "x86_64", windows))]
        assert_eq!(Abi::current(), Abi::Win64);
        #[cfg(target_arch = "x86")]
        assert_eq!(Abi::current(), Abi::X86);
    }

    #[test]
    fn sret_rules() {
        assert!(!Abi::SystemV.uses_sret(16));
        assert!(Abi::SystemV.uses_sret(17));
        assert!(!Abi::Win64.uses_sret(8));
        assert!(Abi::Win64.uses_sret(12));
        assert!(Abi::Win64.uses_sret(3));
        assert!(!Abi::X86.uses_sret(8));
        assert!(Abi::X86.uses_sret(12));
        assert!(!Abi::SystemV.uses_sret(0));
        assert!(!Abi::Win64.uses_sret(0));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn signature_metadata() {
        extern "C" fn sub(a: i32, b: i32) -> i32 {
            a - b
        }
        type F = extern "C" fn(i32, i32) -> i32;
        assert_eq!(<F as Function>::ARITY, 2);
        assert_eq!(<F as Function>::ret_size(), 4);
        assert_eq!(<F as Function>::CONVENTION, CallingConvention::Cdecl);
        assert_ne!(<F as Function>::relay(), 0);

        let f: F = sub;
        let r = unsafe { F::invoke(f.addr(), (7, 3)) };
        assert_eq!(r, 4);
    }
}
