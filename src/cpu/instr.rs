//! Decoded x86 instruction representation.

pub use crate::cpu::imm::Immediate;
use crate::cpu::disasm::print_instr;
use crate::cpu::Flags;

use std::fmt;

/// A decoded x86 instruction.
///
/// Instructions are described by an operation (`op`), an operand size and up
/// to three operands. Which operands are present and how they are used depends
/// on `op`; see the documentation of the `Op` variants. As a rule of thumb,
/// `dest` is the operand that is written (and possibly read), `src` is only
/// read, and `extra` carries a third operand such as the immediate of
/// `imul r, r/m, imm` or the count of `shld`.
///
/// Relative branch targets are resolved by the decoder: the `src` operand of a
/// relative `jmp`, `jcc`, `call` or `loop` is the absolute target address.
///
/// `Instr` implements `Display`, which prints an Intel-syntax disassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instr {
    pub op: Op,
    /// Operand size of the operation.
    pub size: OpSize,
    pub dest: Option<Operand>,
    pub src: Option<Operand>,
    pub extra: Option<Operand>,
    /// Repeat prefix. Only kept for string operations.
    pub rep: Option<Rep>,
    /// Whether 16-bit addressing is used.
    ///
    /// Besides memory operands, this selects `SI`/`DI`/`CX` over `ESI`/`EDI`/
    /// `ECX` for string operations and `loop`.
    pub addr16: bool,
    /// Encoded length of the instruction in bytes, including prefixes.
    pub len: u32,
}

impl Instr {
    /// Creates an instruction without operands.
    pub fn new(op: Op, size: OpSize) -> Self {
        Self {
            op,
            size,
            dest: None,
            src: None,
            extra: None,
            rep: None,
            addr16: false,
            len: 0,
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut s = String::new();
        print_instr(self, &mut s);
        f.write_str(&s)
    }
}

/// The operation performed by an instruction.
///
/// Operand conventions are given per variant. Unless noted otherwise, flags are
/// neither read nor written.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Op {
    /// `dest = dest <op> src`. `cmp` only sets flags.
    Alu(AluOp),
    /// Sets flags for `dest & src`.
    Test,
    /// `dest += 1`, leaving `CF` alone.
    Inc,
    /// `dest -= 1`, leaving `CF` alone.
    Dec,
    /// `dest = !dest`.
    Not,
    /// `dest = 0 - dest`.
    Neg,
    /// Unsigned widening multiply of the accumulator by `src`.
    Mul,
    /// Signed widening multiply of the accumulator by `src`.
    Imul,
    /// Truncating signed multiply: `dest = src * extra`, or `dest = dest * src`
    /// if there is no `extra`.
    ImulTrunc,
    /// Unsigned divide of the double-width accumulator by `src`.
    Div,
    /// `dest = dest <op> src`, where `src` is the 8-bit count.
    Shift(ShiftOp),
    /// `shld`/`shrd`: shifts `dest` by `extra`, filling in bits from `src`.
    DoubleShift { left: bool },
    /// `dest = src`.
    Mov,
    /// `dest = zero_extend(src)`.
    MovZx,
    /// `dest = sign_extend(src)`.
    MovSx,
    /// `dest = address of src`.
    Lea,
    /// Swaps `dest` and `src`.
    Xchg,
    /// `dest = cond ? 1 : 0`.
    SetCc(ConditionCode),
    /// Relative conditional branch to `src`.
    Jcc(ConditionCode),
    /// Counter-driven relative branch to `src`.
    Loop(LoopKind),
    /// Pushes `src`.
    Push,
    /// Pops into `dest`.
    Pop,
    Pusha,
    Popa,
    Pushf,
    Popf,
    /// String operation, possibly repeated.
    Str(StrOp),
    /// Relative near call to `src`.
    Call,
    /// Relative jump to `src`.
    Jump,
    /// Indirect near call through the register or memory operand `src`.
    CallAbs,
    /// Indirect jump through the register or memory operand `src`.
    JumpAbs,
    /// Near return. `src` is the stack adjustment of `ret imm16`, if any.
    Retn,
    /// `mov esp, ebp; pop ebp`.
    Leave,
    /// Software interrupt with the vector in `src`.
    Int,
    /// Raises interrupt 4 if `OF` is set.
    Into,
    Iret,
    /// `cbw`/`cwde`: sign-extends the lower half of the accumulator.
    Cbw,
    /// `cwd`/`cdq`: sign-extends the accumulator into `DX`/`EDX`.
    Cwd,
    Sahf,
    Lahf,
    /// Reads the port `src` into the accumulator `dest`.
    In,
    /// Writes the accumulator `src` to port `dest`.
    Out,
    Hlt,
    /// Complements `CF`.
    Cmc,
    SetFlag(Flags),
    ClearFlag(Flags),
    /// `nop`, including the long forms with an ignored operand.
    Nop,
    /// x87 instruction. Decoded so that it can be skipped, but not executed.
    Fpu,
}

impl Op {
    /// Returns the mnemonic of the operation, not considering operand size.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::Alu(op) => op.mnemonic(),
            Op::Test => "test",
            Op::Inc => "inc",
            Op::Dec => "dec",
            Op::Not => "not",
            Op::Neg => "neg",
            Op::Mul => "mul",
            Op::Imul | Op::ImulTrunc => "imul",
            Op::Div => "div",
            Op::Shift(op) => op.mnemonic(),
            Op::DoubleShift { left: true } => "shld",
            Op::DoubleShift { left: false } => "shrd",
            Op::Mov => "mov",
            Op::MovZx => "movzx",
            Op::MovSx => "movsx",
            Op::Lea => "lea",
            Op::Xchg => "xchg",
            Op::SetCc(cc) => SETCC_MNEMONICS[*cc as usize],
            Op::Jcc(cc) => JCC_MNEMONICS[*cc as usize],
            Op::Loop(LoopKind::Loop) => "loop",
            Op::Loop(LoopKind::Loope) => "loope",
            Op::Loop(LoopKind::Loopne) => "loopne",
            Op::Loop(LoopKind::Jcxz) => "jecxz",
            Op::Push => "push",
            Op::Pop => "pop",
            Op::Pusha => "pusha",
            Op::Popa => "popa",
            Op::Pushf => "pushf",
            Op::Popf => "popf",
            Op::Str(op) => op.mnemonic(),
            Op::Call | Op::CallAbs => "call",
            Op::Jump | Op::JumpAbs => "jmp",
            Op::Retn => "ret",
            Op::Leave => "leave",
            Op::Int => "int",
            Op::Into => "into",
            Op::Iret => "iret",
            Op::Cbw => "cbw",
            Op::Cwd => "cwd",
            Op::Sahf => "sahf",
            Op::Lahf => "lahf",
            Op::In => "in",
            Op::Out => "out",
            Op::Hlt => "hlt",
            Op::Cmc => "cmc",
            Op::SetFlag(flag) if *flag == Flags::CF => "stc",
            Op::SetFlag(flag) if *flag == Flags::DF => "std",
            Op::SetFlag(_) => "sti",
            Op::ClearFlag(flag) if *flag == Flags::CF => "clc",
            Op::ClearFlag(flag) if *flag == Flags::DF => "cld",
            Op::ClearFlag(_) => "cli",
            Op::Nop => "nop",
            Op::Fpu => "(fpu)",
        }
    }
}

static JCC_MNEMONICS: [&str; 16] = [
    "jo", "jno", "jc", "jnc", "jz", "jnz", "jbe", "ja",
    "js", "jns", "jp", "jnp", "jl", "jge", "jle", "jg",
];

static SETCC_MNEMONICS: [&str; 16] = [
    "seto", "setno", "setc", "setnc", "setz", "setnz", "setbe", "seta",
    "sets", "setns", "setp", "setnp", "setl", "setge", "setle", "setg",
];

/// Repeat prefix of a string instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Rep {
    /// `0xF3` - `rep`/`repe`. `cmps`/`scas` stop once `ZF` is clear.
    WhileEqual,
    /// `0xF2` - `repne`. `cmps`/`scas` stop once `ZF` is set.
    WhileNotEqual,
}

/// A decoded operand, usually from a Mod-Reg-R/M byte and the following bytes.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Operand {
    /// The operand is the value inside a register, or the register itself.
    Reg(Register),

    /// Immediate value.
    Imm(Immediate),

    /// The operand is stored in memory.
    Mem(MemoryLocation),
}

impl Operand {
    pub fn size(&self) -> OpSize {
        match self {
            Operand::Reg(reg) => reg.size(),
            Operand::Imm(imm) => imm.size(),
            Operand::Mem(mem) => mem.size,
        }
    }
}

impl From<Register> for Operand {
    fn from(reg: Register) -> Self {
        Operand::Reg(reg)
    }
}

impl From<Immediate> for Operand {
    fn from(imm: Immediate) -> Self {
        Operand::Imm(imm)
    }
}

impl From<MemoryLocation> for Operand {
    fn from(mem: MemoryLocation) -> Self {
        Operand::Mem(mem)
    }
}

/// A location in the flat virtual address space.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MemoryLocation {
    /// The operand's size. Since we only store an address, we wouldn't know
    /// this if we didn't store it.
    pub size: OpSize,
    /// The addressing mode used to calculate the memory address.
    pub addressing: Addressing,
}

/// Effective address computation for memory operands.
///
/// The address is `base + index * scale + disp`, where `base` and `index`
/// stand for the values of those registers (or 0 if absent). The sum is
/// truncated to 16 bits when `addr16` is set.
///
/// In 16-bit mode, `base` and `index` are 16-bit registers and `scale` is
/// always 1.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Addressing {
    pub base: Option<Register>,
    pub index: Option<Register>,
    /// 1, 2, 4 or 8.
    pub scale: u8,
    /// Sign-extended displacement.
    pub disp: i32,
    pub addr16: bool,
}

impl Addressing {
    /// Displacement-only addressing of a fixed address.
    pub fn absolute(virt_addr: u32, addr16: bool) -> Self {
        Addressing {
            base: None,
            index: None,
            scale: 1,
            disp: virt_addr as i32,
            addr16,
        }
    }
}

/// Operand or operation size (in 32-bit mode).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpSize {
    Bits8,
    Bits16,
    Bits32,
}

impl OpSize {
    /// Size in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            OpSize::Bits8 => 1,
            OpSize::Bits16 => 2,
            OpSize::Bits32 => 4,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }

    /// Mask selecting the bits of a value of this size.
    pub fn mask(self) -> u32 {
        match self {
            OpSize::Bits8 => 0xFF,
            OpSize::Bits16 => 0xFFFF,
            OpSize::Bits32 => 0xFFFF_FFFF,
        }
    }

    /// Mask selecting the sign bit.
    pub fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Sign-extends the low `self` bits of `value` to 32 bits.
    pub fn sign_extend(self, value: u32) -> u32 {
        match self {
            OpSize::Bits8 => value as i8 as u32,
            OpSize::Bits16 => value as i16 as u32,
            OpSize::Bits32 => value,
        }
    }
}

impl fmt::Display for OpSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            OpSize::Bits8 => "byte",
            OpSize::Bits16 => "word",
            OpSize::Bits32 => "dword",
        })
    }
}

/// A general purpose register, or part of one.
///
/// The contained number is the index of the full 32-bit register in encoding
/// order (0 = `EAX` ... 7 = `EDI`). `High8` is only valid for registers 0-3.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Register {
    /// Bits 0-7 (`AL`, `CL`, `DL`, `BL`).
    Low8(u8),
    /// Bits 8-15 (`AH`, `CH`, `DH`, `BH`).
    High8(u8),
    /// Bits 0-15 (`AX` ... `DI`).
    Word(u8),
    /// The full register (`EAX` ... `EDI`).
    Dword(u8),
}

impl Register {
    pub const EAX: Register = Register::Dword(0);
    pub const ECX: Register = Register::Dword(1);
    pub const EDX: Register = Register::Dword(2);
    pub const EBX: Register = Register::Dword(3);
    pub const ESP: Register = Register::Dword(4);
    pub const EBP: Register = Register::Dword(5);
    pub const ESI: Register = Register::Dword(6);
    pub const EDI: Register = Register::Dword(7);
    pub const AL: Register = Register::Low8(0);
    pub const CL: Register = Register::Low8(1);
    pub const AH: Register = Register::High8(0);
    pub const DX: Register = Register::Word(2);

    /// Convert a 3-bit register encoding to the register, given the register
    /// size.
    ///
    /// For 8-bit operands, numbers 4-7 encode the high bytes of registers 0-3
    /// (`AH`, `CH`, `DH`, `BH`), not the low bytes of `ESP`...`EDI`.
    pub fn from_encoding(num: u8, size: OpSize) -> Register {
        let num = num & 0b111;
        match size {
            OpSize::Bits8 if num >= 4 => Register::High8(num - 4),
            OpSize::Bits8 => Register::Low8(num),
            OpSize::Bits16 => Register::Word(num),
            OpSize::Bits32 => Register::Dword(num),
        }
    }

    /// Returns the `AL`/`AX`/`EAX` register of the given size.
    pub fn accumulator(size: OpSize) -> Register {
        Register::from_encoding(0, size)
    }

    /// Index of the underlying 32-bit register.
    pub fn index(self) -> usize {
        match self {
            Register::Low8(n) | Register::High8(n) | Register::Word(n) | Register::Dword(n) => {
                usize::from(n & 0b111)
            }
        }
    }

    pub fn size(self) -> OpSize {
        match self {
            Register::Low8(_) | Register::High8(_) => OpSize::Bits8,
            Register::Word(_) => OpSize::Bits16,
            Register::Dword(_) => OpSize::Bits32,
        }
    }

    /// Returns the low part of the same register with a different size.
    pub fn with_size(self, size: OpSize) -> Register {
        let num = self.index() as u8;
        match size {
            OpSize::Bits8 => Register::Low8(num),
            OpSize::Bits16 => Register::Word(num),
            OpSize::Bits32 => Register::Dword(num),
        }
    }

    pub fn name(self) -> &'static str {
        const LOW8: [&str; 8] = ["al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil"];
        const HIGH8: [&str; 4] = ["ah", "ch", "dh", "bh"];
        const WORD: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
        const DWORD: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];

        match self {
            Register::Low8(_) => LOW8[self.index()],
            Register::High8(_) => HIGH8[self.index() & 0b11],
            Register::Word(_) => WORD[self.index()],
            Register::Dword(_) => DWORD[self.index()],
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Specifies the operation to perform for ALU instructions.
///
/// All of these share a common encoding (but might have a shorter aliased
/// encoding in some cases):
///
/// ```notrust
/// +-----------------+
/// | 0 0 A A A 0 D S |
/// +-----------------+
/// ```
///
/// Where:
///
/// * `A`: Value of `AluOp` (3-bit ALU operation).
/// * `D`: Direction bit (0 = Reg field is the source, 1 = Reg field is the
///   destination).
/// * `S`: Size bit (0 = 8-bit operands, 1 = 16- or 32-bit operands).
///
/// The immediate forms `0x80`-`0x83` put the `AluOp` in the Reg field of the
/// Mod-Reg-R/M byte instead.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum AluOp {
    Add = 0,
    Or = 1,
    /// Add with carry.
    Adc = 2,
    /// Subtract with borrow.
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    /// Set `EFLAGS` like `sub` would, but do not change `dest`.
    Cmp = 7,
}

impl AluOp {
    pub fn mnemonic(self) -> &'static str {
        ["add", "or", "adc", "sbb", "and", "sub", "xor", "cmp"][self as usize]
    }
}

/// Shift instruction group opcode.
///
/// Stored in the `Reg` field of the Mod-Reg-R/M byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum ShiftOp {
    Rol = 0,
    Ror = 1,
    /// Rotate left through carry.
    Rcl = 2,
    /// Rotate right through carry.
    Rcr = 3,
    Shl = 4,
    Shr = 5,
    /// Same as `Shl`.
    Sal = 6,
    Sar = 7,
}

impl ShiftOp {
    pub fn mnemonic(self) -> &'static str {
        ["rol", "ror", "rcl", "rcr", "shl", "shr", "shl", "sar"][self as usize]
    }
}

/// A condition for conditional branches and `setcc`.
///
/// The discriminant is set according to the x86 instruction encoding. Condition
/// codes are encoded in 4 bits, and odd codes negate the even code before them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ConditionCode {
    /// OF=1
    Overflow = 0x0,
    /// OF=0
    NotOverflow = 0x1,
    /// CF=1
    ///
    /// Aka "below".
    Carry = 0x2,
    /// CF=0
    ///
    /// Aka "above or equal".
    NotCarry = 0x3,
    /// ZF=1
    Equal = 0x4,
    /// ZF=0
    ///
    /// Aka "not zero".
    NotEqual = 0x5,
    /// CF=1 or ZF=1
    BelowOrEqual = 0x6,
    /// CF=0 and ZF=0
    Above = 0x7,
    /// SF=1
    Sign = 0x8,
    /// SF=0
    NotSign = 0x9,
    /// PF=1
    ///
    /// Aka "parity even".
    Parity = 0xA,
    /// PF=0
    ///
    /// Aka "parity odd".
    NotParity = 0xB,
    /// SF!=OF
    Less = 0xC,
    /// SF=OF
    GreaterOrEqual = 0xD,
    /// ZF=1 or SF!=OF
    LessOrEqual = 0xE,
    /// ZF=0 and SF=OF
    Greater = 0xF,
}

impl ConditionCode {
    /// Checks the condition against a set of status flags.
    pub fn eval(self, flags: Flags) -> bool {
        let sf_ne_of = flags.contains(Flags::SF) != flags.contains(Flags::OF);
        let holds = match (self as u8) >> 1 {
            0 => flags.contains(Flags::OF),
            1 => flags.contains(Flags::CF),
            2 => flags.contains(Flags::ZF),
            3 => flags.intersects(Flags::CF | Flags::ZF),
            4 => flags.contains(Flags::SF),
            5 => flags.contains(Flags::PF),
            6 => sf_ne_of,
            _ => flags.contains(Flags::ZF) || sf_ne_of,
        };

        holds != (self as u8 & 1 != 0)
    }
}

/// Counter-driven branches (`0xE0`-`0xE3`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoopKind {
    /// Decrement the counter, branch if it's not 0 and `ZF` is clear.
    Loopne,
    /// Decrement the counter, branch if it's not 0 and `ZF` is set.
    Loope,
    /// Decrement the counter, branch if it's not 0.
    Loop,
    /// Branch if the counter is 0, without decrementing it.
    Jcxz,
}

/// "String" operation for data movement (more like batch memory operation).
///
/// Sources are read from `(e)si` and destinations written at `(e)di`. After
/// each element, the used index registers move by the element size: upwards
/// if `DF` is clear, downwards if it is set.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StrOp {
    /// Move string within memory.
    Movs,
    /// Compare `[esi]` with `[edi]`, setting flags like `cmp`.
    Cmps,
    /// Store string data from `al`/`ax`/`eax` to memory at `edi`.
    Stos,
    /// Load string from memory at `esi` into `al`/`ax`/`eax`.
    Lods,
    /// Compare the accumulator with `[edi]`, setting flags like `cmp`.
    Scas,
}

impl StrOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            StrOp::Movs => "movs",
            StrOp::Cmps => "cmps",
            StrOp::Stos => "stos",
            StrOp::Lods => "lods",
            StrOp::Scas => "scas",
        }
    }

    /// Whether the operation compares and thus sets flags.
    pub fn compares(self) -> bool {
        match self {
            StrOp::Cmps | StrOp::Scas => true,
            _ => false,
        }
    }
}
