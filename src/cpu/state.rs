//! x86 processor state.

use crate::cpu::instr::{OpSize, Register};
use crate::cpu::Flags;

use std::fmt;

/// Names of the general purpose registers, in encoding order.
pub const REGISTER_NAMES: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];

/// CPU state consisting of the emulated registers.
///
/// The general purpose registers are stored in their encoding order (`EAX`,
/// `ECX`, `EDX`, `EBX`, `ESP`, `EBP`, `ESI`, `EDI`), so the 3-bit register
/// numbers found in instructions index `regs` directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    regs: [u32; 8],
    eip: u32,
    flags: Flags,
}

impl State {
    /// Create a new state with all registers and flags cleared.
    ///
    /// # Parameters
    ///
    /// * `eip`: Initial value for `eip` (address of the first instruction).
    /// * `esp`: Initial value for the stack pointer. Should normally point just
    ///   behind the allocated stack memory.
    pub fn new(eip: u32, esp: u32) -> Self {
        let mut regs = [0; 8];
        regs[Register::ESP.index()] = esp;
        Self {
            regs,
            eip,
            flags: Flags::empty(),
        }
    }

    /// Reads a register, or part of one. Narrow registers are zero-extended.
    pub fn get(&self, reg: Register) -> u32 {
        let full = self.regs[reg.index()];
        match reg {
            Register::Low8(_) => full & 0xFF,
            Register::High8(_) => (full >> 8) & 0xFF,
            Register::Word(_) => full & 0xFFFF,
            Register::Dword(_) => full,
        }
    }

    /// Writes (part of) a register.
    ///
    /// Only the bits covered by `reg` are replaced, the rest of the underlying
    /// 32-bit register keeps its value. Excess bits of `value` are ignored.
    pub fn set(&mut self, reg: Register, value: u32) {
        let full = &mut self.regs[reg.index()];
        *full = match reg {
            Register::Low8(_) => (*full & 0xFFFF_FF00) | (value & 0xFF),
            Register::High8(_) => (*full & 0xFFFF_00FF) | (value & 0xFF) << 8,
            Register::Word(_) => (*full & 0xFFFF_0000) | (value & 0xFFFF),
            Register::Dword(_) => value,
        };
    }

    /// Returns all 8 general purpose registers in encoding order.
    pub fn regs(&self) -> &[u32; 8] {
        &self.regs
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: Flags) {
        self.flags = flags;
    }

    /// Sets or clears `flags` depending on `value`.
    pub fn update_flags(&mut self, flags: Flags, value: bool) {
        self.flags.set(flags, value);
    }

    /// Replaces the flags in `mask` with those in `values`.
    pub fn replace_flags(&mut self, mask: Flags, values: Flags) {
        self.flags = (self.flags - mask) | (values & mask);
    }

    /// Returns the raw `EFLAGS` value.
    ///
    /// Bit 1 is reserved and always reads as 1.
    pub fn eflags(&self) -> u32 {
        self.flags.bits() | 0b10
    }

    /// Loads the raw `EFLAGS` value. Unmodeled bits are discarded.
    pub fn set_eflags(&mut self, raw: u32) {
        self.flags = Flags::from_bits_truncate(raw);
    }
}

macro_rules! accessors {
    (
        $reg:ident: [ $getter32:ident/$setter32:ident, $getter16:ident/$setter16:ident ]
    ) => {
        pub fn $getter32(&self) -> u32 { self.get(Register::$reg) }
        pub fn $setter32(&mut self, value: u32) { self.set(Register::$reg, value); }
        pub fn $getter16(&self) -> u16 { self.get(Register::$reg.with_size(OpSize::Bits16)) as u16 }
        pub fn $setter16(&mut self, value: u16) { self.set(Register::$reg.with_size(OpSize::Bits16), value.into()); }
    };
    (
        $reg:ident: [ $getter32:ident/$setter32:ident, $getter16:ident/$setter16:ident, $getter8h:ident/$setter8h:ident, $getter8l:ident/$setter8l:ident ]
    ) => {
        accessors!($reg: [$getter32/$setter32, $getter16/$setter16]);
        pub fn $getter8h(&self) -> u8 { self.get(Register::High8(Register::$reg.index() as u8)) as u8 }
        pub fn $setter8h(&mut self, value: u8) { self.set(Register::High8(Register::$reg.index() as u8), value.into()); }
        pub fn $getter8l(&self) -> u8 { self.get(Register::$reg.with_size(OpSize::Bits8)) as u8 }
        pub fn $setter8l(&mut self, value: u8) { self.set(Register::$reg.with_size(OpSize::Bits8), value.into()); }
    };
}

impl State {
    accessors!(EAX: [eax/set_eax, ax/set_ax, ah/set_ah, al/set_al]);
    accessors!(EBX: [ebx/set_ebx, bx/set_bx, bh/set_bh, bl/set_bl]);
    accessors!(ECX: [ecx/set_ecx, cx/set_cx, ch/set_ch, cl/set_cl]);
    accessors!(EDX: [edx/set_edx, dx/set_dx, dh/set_dh, dl/set_dl]);
    accessors!(ESI: [esi/set_esi, si/set_si]);
    accessors!(EDI: [edi/set_edi, di/set_di]);
    accessors!(EBP: [ebp/set_ebp, bp/set_bp]);
    accessors!(ESP: [esp/set_esp, sp/set_sp]);

    pub fn eip(&self) -> u32 { self.eip }
    pub fn set_eip(&mut self, value: u32) { self.eip = value; }
}

/// Prints a register dump, as shown when the guest faults.
impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, (name, value)) in REGISTER_NAMES.iter().zip(&self.regs).enumerate() {
            let sep = if i % 4 == 3 { "\n" } else { " " };
            write!(f, "{}={:08X}{}", name.to_uppercase(), value, sep)?;
        }
        write!(f, "EIP={:08X} EFLAGS={:08X} [", self.eip, self.eflags())?;
        let named = [
            (Flags::CF, "CF"), (Flags::PF, "PF"), (Flags::AF, "AF"), (Flags::ZF, "ZF"),
            (Flags::SF, "SF"), (Flags::DF, "DF"), (Flags::OF, "OF"),
        ];
        let mut first = true;
        for (flag, name) in named.iter() {
            if self.flags.contains(*flag) {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        f.write_str("]")
    }
}
