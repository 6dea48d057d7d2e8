//! Raw machine-code emission into a codecave buffer.
//!
//! The emitter is the one place byte encoding happens; the generators above
//! it deal in operations (emit a jump, move a register, pad with nops) and
//! never in raw displacement math.

/// `nop`
pub(crate) const NOP_OPCODE: u8 = 0x90;
/// Near `call rel32`
pub(crate) const CALL_OPCODE: u8 = 0xe8;
/// Near `jmp rel32`
pub(crate) const JMP_OPCODE: u8 = 0xe9;

/// Cursor over a code buffer that tracks the runtime address of the next
/// emitted byte, so relative displacements can be computed in place.
pub(crate) struct Emitter<'a> {
    buf: &'a mut [u8],
    base: usize,
    pos: usize,
}

impl<'a> Emitter<'a> {
    /// `base` is the runtime address of `buf[0]`.
    pub fn new(buf: &'a mut [u8], base: usize) -> Self {
        Self { buf, base, pos: 0 }
    }

    /// Runtime address of the next byte to be emitted.
    pub fn addr(&self) -> usize {
        self.base + self.pos
    }

    /// Offset of the next byte from the buffer start.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn bytes(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    pub fn u32(&mut self, value: u32) {
        self.bytes(&value.to_le_bytes());
    }

    #[cfg(target_arch = "x86_64")]
    pub fn u64(&mut self, value: u64) {
        self.bytes(&value.to_le_bytes());
    }

    /// `jmp rel32` to `dest`, displacement relative to the emitted
    /// instruction's own end.
    pub fn jmp_rel32(&mut self, dest: usize) {
        let rel = rel32(self.addr(), dest);
        self.bytes(&[JMP_OPCODE]);
        self.u32(rel as u32);
    }

    /// `call rel32` to `dest`.
    #[cfg(target_arch = "x86")]
    pub fn call_rel32(&mut self, dest: usize) {
        let rel = rel32(self.addr(), dest);
        self.bytes(&[CALL_OPCODE]);
        self.u32(rel as u32);
    }

    /// Overwrites 4 previously emitted bytes at `pos`, used to resolve a
    /// forward jump once its destination is known.
    pub fn patch_u32(&mut self, pos: usize, value: u32) {
        self.buf[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Displacement of `dest` relative to the end of a 5-byte instruction
/// starting at `from`. On 32-bit targets the displacement wraps mod 2^32
/// and reaches the whole address space; on 64-bit it must fit in `i32`,
/// which near-cave allocation guarantees.
pub(crate) fn rel32(from: usize, dest: usize) -> i32 {
    let rel = dest as i64 - (from as i64 + 5);
    #[cfg(target_arch = "x86_64")]
    debug_assert!(
        i32::try_from(rel).is_ok(),
        "rel32 displacement out of range: {rel:#x}"
    );
    rel as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_and_backward_displacements() {
        assert_eq!(rel32(0x1000, 0x1005), 0);
        assert_eq!(rel32(0x1000, 0x1015), 0x10);
        assert_eq!(rel32(0x1000, 0x0fe0), -0x25);
    }

    #[cfg(all(target_arch = "x86_64", debug_assertions))]
    #[test]
    #[should_panic(expected = "out of range")]
    fn rel32_rejects_unreachable_displacements() {
        rel32(0, i32::MAX as usize + 0x1000);
    }

    #[test]
    fn jmp_encodes_at_current_address() {
        let mut buf = [0u8; 16];
        let mut e = Emitter::new(&mut buf, 0x40_0000);
        e.bytes(&[NOP_OPCODE; 3]);
        e.jmp_rel32(0x40_0000);
        // jmp from 0x400003 back to 0x400000: disp = -8
        assert_eq!(buf[..8], [0x90, 0x90, 0x90, 0xe9, 0xf8, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn patch_resolves_forward_jump() {
        let mut buf = [0u8; 16];
        let mut e = Emitter::new(&mut buf, 0x40_0000);
        e.jmp_rel32(0x40_0000); // placeholder
        e.bytes(&[NOP_OPCODE; 4]);
        let label = e.pos();
        e.patch_u32(1, (label - 5) as u32);
        assert_eq!(buf[..5], [0xe9, 0x04, 0x00, 0x00, 0x00]);
    }
}
