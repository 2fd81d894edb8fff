//! Instruction prefix byte decoding.

use crate::cpu::instr::{OpSize, Rep};

bitflags! {
    /// Bitmask of raw instruction prefixes.
    ///
    /// Segment overrides, `lock` and `wait` are collected but have no effect:
    /// the address space is flat and there's only one processor.
    pub struct RawPrefixes: u16 {
        /// `0xF0`
        const LOCK       = 0x0100;
        /// `0x9B` - `wait`/`fwait`. Behaves like a prefix since there is no
        /// FPU to wait for.
        const WAIT       = 0x0200;
        /// `0xF2` - `repne`/`repnz`.
        const REPNE      = 0x0400;
        /// `0xF3` - `rep` or `repe`, depending on the instruction.
        const REP_REPE   = 0x0800;
        /// `0x26`
        const OVERRIDE_ES = 0x0010;
        /// `0x2E` - Use CS instead of the instruction's default segment.
        ///
        /// This prefix doubles as a "not taken" branch hint.
        const OVERRIDE_CS = 0x0020;
        /// `0x36`
        const OVERRIDE_SS = 0x0040;
        /// `0x3E` - Use DS instead of the instruction's default segment.
        ///
        /// This prefix doubles as a "taken" branch hint.
        const OVERRIDE_DS = 0x0080;
        /// `0x64`
        const OVERRIDE_FS = 0x0001;
        /// `0x65`
        const OVERRIDE_GS = 0x0002;
        /// `0x66` - Operand size override.
        ///
        /// In 32-bit mode, this changes the size of register operands back to
        /// 16-bit registers.
        const OVERRIDE_OPERAND = 0x0004;
        /// `0x67` - Address size override.
        ///
        /// In 32-bit mode, this changes the interpretation of the Mod-Reg-R/M
        /// byte back to what it is in 16-bit mode, with all consequences.
        const OVERRIDE_ADDRESS = 0x0008;
    }
}

impl RawPrefixes {
    /// Decodes a prefix byte and merges it with `self`.
    ///
    /// Returns `Ok` when the byte is a valid prefix, and `Err` if not.
    ///
    /// `rep` and `repne` are mutually exclusive, the one that comes last wins.
    pub fn decode(self, prefix: u8) -> Result<Self, Self> {
        let reps = RawPrefixes::REP_REPE | RawPrefixes::REPNE;
        Ok(match prefix {
            0xF3 => (self - reps) | RawPrefixes::REP_REPE,
            0xF2 => (self - reps) | RawPrefixes::REPNE,
            0xF0 => self | RawPrefixes::LOCK,
            0x9B => self | RawPrefixes::WAIT,
            0x2E => self | RawPrefixes::OVERRIDE_CS,
            0x36 => self | RawPrefixes::OVERRIDE_SS,
            0x3E => self | RawPrefixes::OVERRIDE_DS,
            0x26 => self | RawPrefixes::OVERRIDE_ES,
            0x64 => self | RawPrefixes::OVERRIDE_FS,
            0x65 => self | RawPrefixes::OVERRIDE_GS,
            0x66 => self | RawPrefixes::OVERRIDE_OPERAND,
            0x67 => self | RawPrefixes::OVERRIDE_ADDRESS,
            _ => return Err(self),
        })
    }

    /// Determine the operand size, given the size bit from the opcode.
    ///
    /// If `size_bit == true`, the size is 32 bits, or 16 bits with an operand
    /// size override. If `size_bit == false`, it is 8 bits and the override has
    /// no effect.
    pub fn size(&self, size_bit: bool) -> OpSize {
        match (size_bit, self.contains(RawPrefixes::OVERRIDE_OPERAND)) {
            (false, _) => OpSize::Bits8,
            (true, false) => OpSize::Bits32,
            (true, true) => OpSize::Bits16,
        }
    }

    /// Whether memory operands use 16-bit addressing.
    pub fn addr16(&self) -> bool {
        self.contains(RawPrefixes::OVERRIDE_ADDRESS)
    }

    /// Returns the repeat prefix in effect, if any.
    pub fn rep(&self) -> Option<Rep> {
        if self.contains(RawPrefixes::REP_REPE) {
            Some(Rep::WhileEqual)
        } else if self.contains(RawPrefixes::REPNE) {
            Some(Rep::WhileNotEqual)
        } else {
            None
        }
    }
}
