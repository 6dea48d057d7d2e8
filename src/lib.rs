/*!
This crate provides typed inline hooking of `x86` and `x86-64` functions in
the running process.

A hook displaces the first instructions of a target function into an
executable codecave allocated nearby, patches the target with a 5-byte
relative jump, and routes every call through a relay that knows the
target's exact signature. The callback receives the original arguments as
a tuple and can call the displaced original through the hook's trampoline.

# Installation

This crate works with Cargo. Add it to your `Cargo.toml` like so:

```toml
[dependencies]
cavehook = "0.1"
```

# Hooking a function

Assume we have a function whose result we want to adjust:

```rust
extern "C" fn foo(x: u64) -> u64 {
    x * x
}

assert_eq!(foo(5), 25);
```

Now let's hook it so that it returns `x*x+3`:

```no_run
use cavehook::Hook;

# extern "C" fn foo(x: u64) -> u64 { x * x }
# #[cfg(target_arch = "x86_64")]
# fn demo() {
let mut hook = unsafe { Hook::for_target(foo as extern "C" fn(u64) -> u64) };
hook.redirect(|h, (x,)| unsafe { h.call((x,)) } + 3);
unsafe { hook.install() }.unwrap();

assert_eq!(foo(5), 28);

unsafe { hook.remove() }.unwrap();
assert_eq!(foo(5), 25);
# }
```

The callback sees every call to `foo` from anywhere in the process, not
only calls through a pointer. A hook with no callback is a pure observer:
calls pass through unchanged, but the caller's registers and return
address are captured in the hook's [`Context`] on every call.

Several hooks may be layered on the same target; each one wraps the next.
Hooks may also be removed in any order. A hook that is no longer the
outermost patch parks itself instead of tearing the chain down, and comes
back to life when installed again.

On 32-bit x86, `extern "stdcall"`, `extern "thiscall"` and
`extern "fastcall"` targets are supported alongside `extern "C"`.

# Notes

This crate rewrites live code and is not thread-safe: no other thread may
execute a target while its patch is written or removed. As Rust runs
tests in parallel, hooking tests should serialize themselves or run with
`--test-threads=1`.
*/

#![warn(missing_docs)]

mod cave;
mod decode;
mod emit;
mod hook;
mod mem;

pub mod convention;
pub mod module;

mod err;

#[cfg(target_arch = "x86_64")]
pub mod x64;
#[cfg(target_arch = "x86_64")]
pub(crate) use x64 as arch;

#[cfg(target_arch = "x86")]
pub mod x86;
#[cfg(target_arch = "x86")]
pub(crate) use x86 as arch;

pub use arch::Context;
pub use convention::{Abi, CallingConvention, Function};
pub use err::HookError;
pub use hook::{Hook, HookCallback, HookCore};
pub use mem::Protection;
