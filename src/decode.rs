//! Single-instruction decoding and prologue-length resolution.
//!
//! The hook engine never walks more than a handful of instructions: enough
//! whole instructions at the target to cover the jump patch, and one
//! instruction at removal time to find out who currently owns the patch.

use iced_x86::{Decoder, DecoderOptions, Instruction, OpKind};

/// Size of a near `jmp rel32`, the minimal patch this engine writes.
pub const JMP_SIZE: usize = 5;

/// Longest legal x86 instruction.
pub(crate) const MAX_INSN_LEN: usize = 15;

#[cfg(target_arch = "x86_64")]
pub(crate) const BITNESS: u32 = 64;
#[cfg(target_arch = "x86")]
pub(crate) const BITNESS: u32 = 32;

/// One decoded instruction with the operand metadata the controller needs.
pub struct Insn {
    inner: Instruction,
    opcode_byte: u8,
}

impl Insn {
    /// Instruction length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// The first code byte, what the controller compares against the CALL
    /// and JMP opcodes.
    pub fn opcode_byte(&self) -> u8 {
        self.opcode_byte
    }

    /// Number of operands.
    pub fn operand_count(&self) -> usize {
        self.inner.op_count() as usize
    }

    /// Whether operand `op` carries an IP-relative reference (a near branch
    /// displacement or a RIP-relative memory operand).
    pub fn is_relative_operand(&self, op: usize) -> bool {
        match self.inner.op_kind(op as u32) {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => true,
            OpKind::Memory => self.inner.is_ip_rel_memory_operand(),
            _ => false,
        }
    }

    /// Absolute destination of relative operand `op`, already resolved
    /// against the instruction's runtime address.
    pub fn absolute_target(&self, op: usize) -> Option<u64> {
        match self.inner.op_kind(op as u32) {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Some(self.inner.near_branch_target())
            }
            OpKind::Memory if self.inner.is_ip_rel_memory_operand() => {
                Some(self.inner.ip_rel_memory_address())
            }
            _ => None,
        }
    }

    #[cfg(target_arch = "x86_64")]
    pub(crate) fn instruction(&self) -> &Instruction {
        &self.inner
    }
}

fn decode_one(code: &[u8], ip: u64) -> Insn {
    let mut decoder = Decoder::new(BITNESS, code, DecoderOptions::NONE);
    decoder.set_ip(ip);
    let inner = decoder.decode();
    Insn {
        inner,
        opcode_byte: code[0],
    }
}

/// Decodes the single instruction at `addr`.
///
/// # Safety
///
/// `addr` must point to readable memory holding at least one whole
/// instruction (up to 15 bytes are examined).
pub unsafe fn decode_at(addr: usize) -> Insn {
    let code = unsafe { std::slice::from_raw_parts(addr as *const u8, MAX_INSN_LEN) };
    decode_one(code, addr as u64)
}

/// Decodes whole instructions at `addr` until at least `min` bytes are
/// covered. Returns the instructions and the total byte length, which never
/// splits an instruction and is therefore `>= min` for any valid stream.
///
/// # Safety
///
/// `addr` must be the start of a valid instruction stream of at least
/// `min + 15` readable bytes. An unbounded or invalid stream is assumed not
/// to occur for real executable targets.
pub unsafe fn decode_prologue(addr: usize, min: usize) -> (Vec<Insn>, usize) {
    let code = unsafe { std::slice::from_raw_parts(addr as *const u8, min + MAX_INSN_LEN) };
    let mut insns = Vec::new();
    let mut len = 0usize;
    while len < min {
        let insn = decode_one(&code[len..], (addr + len) as u64);
        len += insn.len();
        insns.push(insn);
    }
    (insns, len)
}

/// Byte length of the smallest whole-instruction run at `addr` covering at
/// least `min` bytes.
///
/// # Safety
///
/// Same preconditions as [`decode_prologue`].
pub unsafe fn prologue_len(addr: usize, min: usize) -> usize {
    unsafe { decode_prologue(addr, min) }.1
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;

    // Fixtures carry 0xCC padding so the decoder may look past the
    // interesting bytes.

    #[test]
    fn resolver_accumulates_whole_instructions() {
        // push rbp; mov rbp, rsp; sub rsp, 0x10; ret
        let code: [u8; 24] = [
            0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x10, 0xc3, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc,
            0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc,
        ];
        // 1 + 3 = 4 < 5, so the 4-byte sub is pulled in as well.
        assert_eq!(unsafe { prologue_len(code.as_ptr() as usize, 5) }, 8);
    }

    #[test]
    fn resolver_exact_fit() {
        // five one-byte pushes
        let code: [u8; 20] = [
            0x53, 0x53, 0x53, 0x53, 0x53, 0xc3, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc,
            0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc,
        ];
        assert_eq!(unsafe { prologue_len(code.as_ptr() as usize, 5) }, 5);
    }

    #[test]
    fn resolver_never_splits_a_long_first_instruction() {
        // mov rax, imm64 is 10 bytes; the run must cover all of it.
        let code: [u8; 25] = [
            0x48, 0xb8, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xc3, 0xcc, 0xcc, 0xcc,
            0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc,
        ];
        let (insns, len) = unsafe { decode_prologue(code.as_ptr() as usize, 5) };
        assert_eq!(len, 10);
        assert_eq!(insns.len(), 1);
    }

    #[test]
    fn relative_jump_operand_resolves_absolute_target() {
        // jmp @+0x10 from the fixture's own address
        let code: [u8; 15] = [
            0xe9, 0x10, 0x00, 0x00, 0x00, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc,
            0xcc,
        ];
        let addr = code.as_ptr() as usize;
        let insn = unsafe { decode_at(addr) };
        assert_eq!(insn.len(), 5);
        assert_eq!(insn.opcode_byte(), 0xe9);
        assert!(insn.is_relative_operand(0));
        assert_eq!(insn.absolute_target(0), Some(addr as u64 + 5 + 0x10));
    }

    #[test]
    fn direct_call_operand_resolves_absolute_target() {
        // call @-0x20
        let code: [u8; 15] = [
            0xe8, 0xe0, 0xff, 0xff, 0xff, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc,
            0xcc,
        ];
        let addr = code.as_ptr() as usize;
        let insn = unsafe { decode_at(addr) };
        assert_eq!(insn.opcode_byte(), 0xe8);
        assert!(insn.is_relative_operand(0));
        assert_eq!(insn.absolute_target(0), Some(addr as u64 + 5 - 0x20));
    }

    #[test]
    fn register_moves_have_no_relative_operands() {
        // mov rax, rbx
        let code: [u8; 15] = [
            0x48, 0x89, 0xd8, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc,
            0xcc,
        ];
        let insn = unsafe { decode_at(code.as_ptr() as usize) };
        for op in 0..insn.operand_count() {
            assert!(!insn.is_relative_operand(op));
        }
    }

    #[test]
    fn rip_relative_memory_operand_is_relative() {
        // mov rax, [rip + 1]
        let code: [u8; 22] = [
            0x48, 0x8b, 0x05, 0x01, 0x00, 0x00, 0x00, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc,
            0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc,
        ];
        let addr = code.as_ptr() as usize;
        let insn = unsafe { decode_at(addr) };
        let rel = (0..insn.operand_count()).find(|&op| insn.is_relative_operand(op));
        assert_eq!(rel.and_then(|op| insn.absolute_target(op)), Some(addr as u64 + 8));
    }
}
