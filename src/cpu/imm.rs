//! Immediate value manipulation.
//!
//! An immediate is an 8-, 16- or 32-bit value encoded in the instruction
//! stream. Displacements are not immediates; they are folded into
//! `Addressing` by the decoder.

use crate::cpu::instr::OpSize;

use std::fmt;

/// An 8, 16 or 32-bit immediate value.
///
/// Note that while `Immediate` only stores signed values, whether the sign is
/// meaningful depends on the operation performed on the values.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Immediate {
    Imm8(i8),
    Imm16(i16),
    Imm32(i32),
}

impl Immediate {
    /// Truncates `value` to an immediate of the given size.
    pub fn new(value: u32, size: OpSize) -> Immediate {
        match size {
            OpSize::Bits8 => Immediate::Imm8(value as i8),
            OpSize::Bits16 => Immediate::Imm16(value as i16),
            OpSize::Bits32 => Immediate::Imm32(value as i32),
        }
    }

    /// Sign-extend or truncate the immediate to a different size.
    pub fn sign_ext_to(&self, size: OpSize) -> Immediate {
        Immediate::new(self.sign_extended() as u32, size)
    }

    /// Zero-extend or truncate the immediate to a different size.
    pub fn zero_ext_to(&self, size: OpSize) -> Immediate {
        Immediate::new(self.zero_extended(), size)
    }

    /// Returns the sign-extended immediate value as an `i32`.
    pub fn sign_extended(&self) -> i32 {
        match *self {
            Immediate::Imm8(imm) => imm.into(),
            Immediate::Imm16(imm) => imm.into(),
            Immediate::Imm32(imm) => imm,
        }
    }

    /// Returns the zero-extended immediate value as a `u32`.
    pub fn zero_extended(&self) -> u32 {
        match *self {
            Immediate::Imm8(imm) => (imm as u8).into(),
            Immediate::Imm16(imm) => (imm as u16).into(),
            Immediate::Imm32(imm) => imm as u32,
        }
    }

    /// Returns the size of the immediate value.
    pub fn size(&self) -> OpSize {
        match self {
            Immediate::Imm8(_) => OpSize::Bits8,
            Immediate::Imm16(_) => OpSize::Bits16,
            Immediate::Imm32(_) => OpSize::Bits32,
        }
    }
}

impl From<u8> for Immediate {
    fn from(imm: u8) -> Self {
        Immediate::Imm8(imm as i8)
    }
}

impl From<u16> for Immediate {
    fn from(imm: u16) -> Self {
        Immediate::Imm16(imm as i16)
    }
}

impl From<u32> for Immediate {
    fn from(imm: u32) -> Self {
        Immediate::Imm32(imm as i32)
    }
}

/// Prints the unsigned value in hexadecimal, as wide as the immediate.
impl fmt::LowerHex for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.zero_extended(), f)
    }
}

/// Prints the signed decimal value of the immediate.
impl fmt::Display for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.sign_extended(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension() {
        let imm = Immediate::from(0xF0u8);
        assert_eq!(imm.sign_extended(), -16);
        assert_eq!(imm.zero_extended(), 0xF0);
        assert_eq!(imm.sign_ext_to(OpSize::Bits32), Immediate::Imm32(-16));
        assert_eq!(imm.sign_ext_to(OpSize::Bits16).zero_extended(), 0xFFF0);
        assert_eq!(imm.zero_ext_to(OpSize::Bits32).zero_extended(), 0xF0);
        assert_eq!(Immediate::new(0x1234_5678, OpSize::Bits16), Immediate::Imm16(0x5678));
        assert_eq!(format!("{:#x}", Immediate::Imm8(-1)), "0xff");
    }
}
