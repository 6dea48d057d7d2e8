//! Cave layout for x86-64 hooks.
//!
//! A generated cave has four parts, laid out back to back:
//!
//! ```text
//! entry:      jmp save            ; 5 bytes, nopped out while parked
//! trampoline: <relocated prologue>
//!             jmp target+prologue_size
//! save:       <store registers into the context>
//!             <shift argument registers, prepend the hook core>
//!             call relay
//!             jmp [context.return_address]
//! ```
//!
//! The prologue is relocated with iced's block encoder, which rewrites
//! RIP-relative operands for the trampoline's new address. The cave sits
//! within near-jump range of the target, so every displacement fits.

use iced_x86::{BlockEncoder, BlockEncoderOptions, Instruction, InstructionBlock};

use crate::cave::Codecave;
use crate::convention::{Abi, CallingConvention, RelaySpec};
use crate::decode::{self, JMP_SIZE};
use crate::emit::Emitter;
use crate::err::HookError;

const RAX: u8 = 0;
const RCX: u8 = 1;
const RSP: u8 = 4;

// field offsets within super::Context
const CTX_RETURN_ADDRESS: u32 = 0;
const CTX_RAX: u32 = 8;
const CTX_RSP: u32 = 40;

/// Context offset of a register, by x86 encoding number.
fn ctx_offset(reg: u8) -> u32 {
    match reg {
        0 => CTX_RAX,
        1 => 16,  // rcx
        2 => 24,  // rdx
        3 => 32,  // rbx
        4 => CTX_RSP,
        5 => 48,  // rbp
        6 => 56,  // rsi
        7 => 64,  // rdi
        r => 72 + 8 * (r as u32 - 8),
    }
}

/// `mov [rax + disp], src`
fn mov_reg_to_ctx(e: &mut Emitter, disp: u32, src: u8) {
    let rex = 0x48 | (u8::from(src >= 8) << 2);
    if disp < 0x80 {
        e.bytes(&[rex, 0x89, 0x40 | ((src & 7) << 3), disp as u8]);
    } else {
        e.bytes(&[rex, 0x89, 0x80 | ((src & 7) << 3)]);
        e.u32(disp);
    }
}

/// `mov dst, [rax + disp]`
fn mov_ctx_to_reg(e: &mut Emitter, dst: u8, disp: u32) {
    let rex = 0x48 | (u8::from(dst >= 8) << 2);
    if disp < 0x80 {
        e.bytes(&[rex, 0x8b, 0x40 | ((dst & 7) << 3), disp as u8]);
    } else {
        e.bytes(&[rex, 0x8b, 0x80 | ((dst & 7) << 3)]);
        e.u32(disp);
    }
}

/// `mov dst, src`
fn mov_reg_to_reg(e: &mut Emitter, dst: u8, src: u8) {
    let rex = 0x48 | (u8::from(src >= 8) << 2) | u8::from(dst >= 8);
    e.bytes(&[rex, 0x89, 0xc0 | ((src & 7) << 3) | (dst & 7)]);
}

/// `mov reg, imm64`
fn mov_imm64(e: &mut Emitter, reg: u8, imm: u64) {
    e.bytes(&[0x48 | u8::from(reg >= 8), 0xb8 + (reg & 7)]);
    e.u64(imm);
}

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
    // the platform register convention is the only one on x86-64
    if spec.convention != CallingConvention::Cdecl {
        return Err(HookError::UnsupportedSignature);
    }

    let abi = Abi::current();
    let regs = abi.arg_registers();
    let sret = abi.uses_sret(spec.ret_size);
    // prepending the core costs one register slot, an sret pointer another
    let first = usize::from(sret);
    if first + spec.arity + 1 > regs.len() {
        return Err(HookError::UnsupportedSignature);
    }

    // walk the target's current bytes: another hook's patch may sit there,
    // and its jump plus nop fill relocates like any other prologue
    let (insns, decoded) = unsafe { decode::decode_prologue(target, prologue_size) };
    if decoded != prologue_size {
        return Err(HookError::RelocatePrologue);
    }
    let block: Vec<Instruction> = insns.iter().map(|i| *i.instruction()).collect();
    let relocated = BlockEncoder::encode(
        decode::BITNESS,
        InstructionBlock::new(&block, (base + JMP_SIZE) as u64),
        BlockEncoderOptions::NONE,
    )
    .map_err(|_| HookError::RelocatePrologue)?;

    let mut e = Emitter::new(buf, base);

    // entry jump, patched to the save stub once its position is known
    e.jmp_rel32(base);
    e.bytes(&relocated.code_buffer);
    e.jmp_rel32(target + prologue_size);

    let save = e.pos();
    e.patch_u32(1, (save - JMP_SIZE) as u32);

    // push rax                     rax becomes the context scratch base
    // mov rax, context
    e.bytes(&[0x50]);
    mov_imm64(&mut e, RAX, spec.context as u64);
    for reg in (1..=3).chain(5..=15) {
        mov_reg_to_ctx(&mut e, ctx_offset(reg), reg);
    }
    // pop rcx                      the rax pushed above
    e.bytes(&[0x59]);
    mov_reg_to_ctx(&mut e, CTX_RAX, RCX);
    // rsp is back at its entry value here, pointing at the return address
    mov_reg_to_ctx(&mut e, CTX_RSP, RSP);
    // pop rcx                      the caller's return address
    e.bytes(&[0x59]);
    mov_reg_to_ctx(&mut e, CTX_RETURN_ADDRESS, RCX);
    mov_ctx_to_reg(&mut e, RCX, ctx_offset(RCX));

    // slide the argument registers up one slot and put the core first,
    // keeping an sret pointer in slot zero where the ABI demands it
    for i in (first..first + spec.arity).rev() {
        mov_reg_to_reg(&mut e, regs[i + 1], regs[i]);
    }
    mov_imm64(&mut e, regs[first], spec.core as u64);

    // with the return address popped the stack is 16-byte aligned, so the
    // call below hands the relay a conventional frame
    let shadow = abi.shadow_space();
    if shadow > 0 {
        e.bytes(&[0x48, 0x83, 0xec, shadow as u8]);
    }
    mov_imm64(&mut e, RAX, spec.relay as u64);
    // call rax
    e.bytes(&[0xff, 0xd0]);
    if shadow > 0 {
        e.bytes(&[0x48, 0x83, 0xc4, shadow as u8]);
    }

    // mov rcx, &context.return_address
    // jmp [rcx]
    mov_imm64(&mut e, RCX, (spec.context as u64) + CTX_RETURN_ADDRESS as u64);
    e.bytes(&[0xff, 0x21]);
    Ok(())
}
