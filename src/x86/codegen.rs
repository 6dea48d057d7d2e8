//! Cave layout for 32-bit x86 hooks.
//!
//! Same shape as the x86-64 generator: entry jump, relocated prologue,
//! context save, then convention-specific glue that prepends the hook core
//! to the original stack arguments before entering the relay.
//!
//! Relocation is simpler here. Without RIP-relative addressing only near
//! calls and jumps carry position-dependent operands, so those two get
//! their displacements rewritten and every other instruction is copied
//! byte for byte. A short `jmp` widens to the near form in the process.

use crate::cave::Codecave;
use crate::convention::{Abi, CallingConvention, RelaySpec};
use crate::decode::{self, JMP_SIZE};
use crate::emit::{Emitter, CALL_OPCODE, JMP_OPCODE};
use crate::err::HookError;

/// Matches both the near (`0xe9`) and short (`0xeb`) unconditional jumps.
const JMP_OPCODE_MASK: u8 = 0xfd;

// field offsets within super::Context
const CTX_RETURN_ADDRESS: u32 = 0;
const CTX_EAX: u32 = 4;
const CTX_ECX: u32 = 8;
const CTX_EDX: u32 = 12;
const CTX_EBX: u32 = 16;
const CTX_ESI: u32 = 20;
const CTX_EDI: u32 = 24;
const CTX_ESP: u32 = 28;
const CTX_EBP: u32 = 32;

/// Fills `cave` with the entry jump, trampoline and relay glue for a hook
/// on `target`.
///
/// # Safety
/// `target..target+prologue_size` must hold the decodable instructions the
/// prologue scan found there.
pub(crate) unsafe fn emit_codecave(
    cave: &mut Codecave,
    target: usize,
    prologue_size: usize,
    spec: &RelaySpec,
) -> Result<(), HookError> {
    let base = cave.addr();
    unsafe { emit_into(cave.as_mut_slice(), base, target, prologue_size, spec) }
}

unsafe fn emit_into(
    buf: &mut [u8],
    base: usize,
    target: usize,
    prologue_size: usize,
    spec: &RelaySpec,
) -> Result<(), HookError> {
    // walk the target's current bytes: another hook's patch may sit there,
    // and its jump plus nop fill relocates like any other prologue
    let (insns, decoded) = unsafe { decode::decode_prologue(target, prologue_size) };
    if decoded != prologue_size {
        return Err(HookError::RelocatePrologue);
    }

    let mut e = Emitter::new(buf, base);

    // entry jump, patched to the save stub once its position is known
    e.jmp_rel32(base);

    let mut offset = 0usize;
    for insn in &insns {
        if insn.opcode_byte() == CALL_OPCODE {
            let dest = insn.absolute_target(0).ok_or(HookError::RelocatePrologue)?;
            e.call_rel32(dest as usize);
        } else if insn.opcode_byte() & JMP_OPCODE_MASK == JMP_OPCODE {
            let dest = insn.absolute_target(0).ok_or(HookError::RelocatePrologue)?;
            e.jmp_rel32(dest as usize);
        } else {
            let raw =
                unsafe { core::slice::from_raw_parts((target + offset) as *const u8, insn.len()) };
            e.bytes(raw);
        }
        offset += insn.len();
    }
    e.jmp_rel32(target + prologue_size);

    let save = e.pos();
    e.patch_u32(1, (save - JMP_SIZE) as u32);

    let ctx = spec.context as u32;
    save_context(&mut e, ctx);
    push_hook_object(&mut e, ctx, spec);
    call_relay(&mut e, ctx, spec);
    Ok(())
}

/// `mov [moffs32], eax` has its own one-byte form; every other register
/// stores through the `89 /r` disp32 encoding.
fn mov_eax_to(e: &mut Emitter, addr: u32) {
    e.bytes(&[0xa3]);
    e.u32(addr);
}

fn mov_reg_to(e: &mut Emitter, modrm: u8, addr: u32) {
    e.bytes(&[0x89, modrm]);
    e.u32(addr);
}

fn save_context(e: &mut Emitter, ctx: u32) {
    mov_eax_to(e, ctx + CTX_EAX);
    mov_reg_to(e, 0x1d, ctx + CTX_EBX);
    mov_reg_to(e, 0x0d, ctx + CTX_ECX);
    mov_reg_to(e, 0x15, ctx + CTX_EDX);
    mov_reg_to(e, 0x35, ctx + CTX_ESI);
    mov_reg_to(e, 0x3d, ctx + CTX_EDI);
    mov_reg_to(e, 0x2d, ctx + CTX_EBP);
    // esp still points at the return address, its value at function entry
    mov_reg_to(e, 0x25, ctx + CTX_ESP);
    // pop eax
    e.bytes(&[0x58]);
    mov_eax_to(e, ctx + CTX_RETURN_ADDRESS);
}

/// Prepends the hook core to the stack arguments. A hidden return pointer
/// stays on top of the stack where the callee expects it, and a thiscall
/// receiver moves from `ecx` onto the stack for the stdcall relay.
fn push_hook_object(e: &mut Emitter, _ctx: u32, spec: &RelaySpec) {
    let sret = Abi::X86.uses_sret(spec.ret_size);
    if sret {
        // pop edx               the hidden return pointer
        e.bytes(&[0x5a]);
    }
    if spec.convention == CallingConvention::Thiscall {
        // push ecx
        e.bytes(&[0x51]);
    }
    // push core
    e.bytes(&[0x68]);
    e.u32(spec.core as u32);
    if sret {
        // push edx
        e.bytes(&[0x52]);
    }
}

fn call_relay(e: &mut Emitter, ctx: u32, spec: &RelaySpec) {
    if spec.convention == CallingConvention::Cdecl {
        e.call_rel32(spec.relay);
        // add esp, 4            discard the pushed core, caller cleans the rest
        e.bytes(&[0x83, 0xc4, 0x04]);
        // jmp [context.return_address]
        e.bytes(&[0xff, 0x25]);
        e.u32(ctx + CTX_RETURN_ADDRESS);
    } else {
        // the callee-clean relay pops everything we pushed and returns
        // straight to the original caller, so hand it the saved return
        // address still sitting in eax
        e.bytes(&[0x50]);
        e.jmp_rel32(spec.relay);
    }
}
