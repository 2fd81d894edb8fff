//! x86 status flag (`EFLAGS`) structures and utilities.
//!
//! Note that we don't model all flags in the register. The important ones are
//! those read and written by instructions. `AF` has a bit assigned so that
//! `pushf`/`popf` round-trip it, but no instruction ever computes it.

bitflags! {
    /// A bitmask carrying any combination of x86 status flags.
    ///
    /// The bit positions match those in `EFLAGS`, so the raw value can be
    /// pushed and popped as-is.
    pub struct Flags: u32 {
        /// Carry flag.
        const CF = 1 << 0;
        /// Parity flag.
        ///
        /// Set when the low byte of a result has an even number of 1-bits.
        const PF = 1 << 2;
        /// Adjust flag (or Auxiliary Carry Flag). Never computed.
        const AF = 1 << 4;
        /// Zero flag.
        ///
        /// Set to whether the result of an operation consists entirely of
        /// 0-bits.
        const ZF = 1 << 6;
        /// Sign flag.
        const SF = 1 << 7;
        /// Trap flag.
        const TF = 1 << 8;
        /// Interrupt enable flag.
        const IF = 1 << 9;
        /// Direction flag. When set, string instructions walk downwards.
        const DF = 1 << 10;
        /// Overflow.
        const OF = 1 << 11;
        /// CPUID availability. Cleared after every instruction, so guests
        /// probing for `cpuid` find it missing.
        const ID = 1 << 21;

        /// Flags written by the arithmetic instructions.
        const ARITH = Self::CF.bits | Self::PF.bits | Self::AF.bits
            | Self::ZF.bits | Self::SF.bits | Self::OF.bits;
    }
}

impl Flags {
    /// Returns the `SF`/`ZF`/`PF` flags describing a `width`-byte result.
    pub fn for_result(result: u32, width: u32) -> Flags {
        let bits = width * 8;
        let mask = if bits == 32 { !0 } else { (1u32 << bits) - 1 };
        let value = result & mask;

        let mut flags = Flags::empty();
        flags.set(Flags::SF, value >> (bits - 1) & 1 != 0);
        flags.set(Flags::ZF, value == 0);
        flags.set(Flags::PF, (value as u8).count_ones() % 2 == 0);
        flags
    }
}
