//! x86 instruction decoder.
//!
//! Decoding is split into two steps. First, the opcode byte(s) are looked up
//! in a table that describes the instruction's *shape*: which bytes follow the
//! opcode, where the operands come from, and the (possibly still unresolved)
//! operation. Then the generic part of the decoder reads the Mod-Reg-R/M byte,
//! SIB byte, displacement and immediate described by the shape and assembles
//! the final `Instr`.
//!
//! Operations of opcode groups like `0x80`-`0x83` are only known once the Reg
//! field of the Mod-Reg-R/M byte has been read. The table stores a `Group` for
//! those, which is refined into an `Op` by `Group::resolve`.

use crate::cpu::instr::*;
use crate::cpu::prefix::RawPrefixes;
use crate::cpu::Flags;
use crate::memory::{MemoryError, VirtualMemory};

use num_traits::FromPrimitive;

use std::error::Error;
use std::fmt;

/// Maximum length of an instruction, including prefixes.
const MAX_INSTR_LEN: u32 = 15;

/// x86 machine instruction decoder.
#[derive(Debug)]
pub struct Decoder<'a, M: VirtualMemory> {
    /// Virtual address of the next byte that will be loaded from memory.
    pos: u32,
    /// Length of the currently decoded instruction.
    len: u32,
    prefixes: RawPrefixes,
    mem: &'a M,
}

impl<'a, M: VirtualMemory> Decoder<'a, M> {
    /// Creates a new instruction decoder.
    ///
    /// # Parameters
    ///
    /// * `mem`: The virtual memory to read from.
    /// * `pc`: The virtual address at which to start decoding.
    pub fn new(mem: &'a M, pc: u32) -> Self {
        Self {
            pos: pc,
            len: 0,
            prefixes: RawPrefixes::empty(),
            mem,
        }
    }

    /// Returns the value of the program counter, the virtual address of the
    /// first byte of the next instruction we're going to decode.
    ///
    /// This is incremented as `decode_next` is called.
    pub fn current_address(&self) -> u32 {
        self.pos
    }

    /// Read and decode the next instruction in the stream.
    ///
    /// If this returns an error, the decoder's address most likely points into
    /// the middle of the instruction and the decoder should not be used for
    /// further instruction decoding.
    pub fn decode_next(&mut self) -> Result<Instr, DecoderError> {
        self.len = 0;
        self.prefixes = RawPrefixes::empty();

        let mut byte = self.read()?;
        loop {
            match self.prefixes.decode(byte) {
                Ok(prefixes) => self.prefixes = prefixes,
                Err(_) => break,
            }
            byte = self.read()?;
        }

        let shape = if byte == 0x0F {
            let byte = self.read()?;
            shape_0f(byte).ok_or_else(|| DecoderError::ud(format!("opcode 0x0F {:#04X}", byte)))?
        } else {
            shape(byte).ok_or_else(|| DecoderError::ud(format!("opcode {:#04X}", byte)))?
        };

        let instr = self.decode_shape(byte, shape)?;
        trace!("decoded {} ({} bytes)", instr, instr.len);
        Ok(instr)
    }

    fn decode_shape(&mut self, opcode: u8, shape: Shape) -> Result<Instr, DecoderError> {
        let addr16 = self.prefixes.addr16();
        let size = match shape.width {
            Width::Byte => OpSize::Bits8,
            Width::Full => self.prefixes.size(true),
        };
        let mut imm_kind = shape.imm;

        let modrm = if shape.form.has_modrm() {
            Some(ModRegRm(self.read()?))
        } else {
            None
        };

        let op = match (shape.kind, modrm) {
            (Kind::Op(op), _) => op,
            (Kind::Group(group), Some(modrm)) => {
                let op = group.resolve(modrm.reg())?;
                if group == Group::Unary && op == Op::Test {
                    imm_kind = ImmKind::Full;
                }
                op
            }
            (Kind::Group(_), None) => unreachable!("opcode group without Mod-Reg-R/M byte"),
        };

        let mut instr = Instr::new(op, size);
        instr.addr16 = addr16;

        match shape.form {
            Form::None | Form::Imm | Form::Rel => {}
            Form::RmReg => {
                let modrm = expect_modrm(modrm);
                instr.dest = Some(self.read_rm(modrm, size)?);
                instr.src = Some(modrm.reg_operand(size));
            }
            Form::RegRm => {
                let modrm = expect_modrm(modrm);
                instr.src = Some(self.read_rm(modrm, size)?);
                instr.dest = Some(modrm.reg_operand(size));
            }
            Form::RegRmFrom(src_size) => {
                // movzx/movsx: dest is 16 or 32 bits, src has a fixed size
                let modrm = expect_modrm(modrm);
                instr.src = Some(self.read_rm(modrm, src_size)?);
                instr.dest = Some(modrm.reg_operand(size));
            }
            Form::Rm => {
                let modrm = expect_modrm(modrm);
                instr.dest = Some(self.read_rm(modrm, size)?);
            }
            Form::Acc => {
                instr.dest = Some(Register::accumulator(size).into());
            }
            Form::OpReg => {
                instr.dest = Some(Register::from_encoding(opcode, size).into());
            }
            Form::AccOpReg => {
                instr.dest = Some(Register::accumulator(size).into());
                instr.src = Some(Register::from_encoding(opcode, size).into());
            }
            Form::Moffs { to_acc } => {
                let addr = if addr16 { self.read_u16()?.into() } else { self.read_u32()? };
                let mem = Operand::Mem(MemoryLocation {
                    size,
                    addressing: Addressing::absolute(addr, addr16),
                });
                let acc = Register::accumulator(size).into();
                if to_acc {
                    instr.dest = Some(acc);
                    instr.src = Some(mem);
                } else {
                    instr.dest = Some(mem);
                    instr.src = Some(acc);
                }
            }
            Form::PortIn => {
                instr.dest = Some(Register::accumulator(size).into());
                if imm_kind == ImmKind::None {
                    instr.src = Some(Register::DX.into());
                }
            }
            Form::PortOut => {
                if imm_kind == ImmKind::None {
                    instr.dest = Some(Register::DX.into());
                } else {
                    instr.dest = Some(self.read_imm(ImmKind::Raw8, size)?.into());
                    imm_kind = ImmKind::None;
                }
                instr.src = Some(Register::accumulator(size).into());
            }
        }

        if imm_kind != ImmKind::None {
            let imm: Operand = match imm_kind {
                ImmKind::Cl => Register::CL.into(),
                _ => self.read_imm(imm_kind, size)?.into(),
            };

            if shape.form == Form::Rel {
                // relative targets are resolved against the next instruction
                let offset = match imm {
                    Operand::Imm(imm) => imm.sign_extended() as u32,
                    _ => 0,
                };
                let mut target = self.pos.wrapping_add(offset);
                if size == OpSize::Bits16 {
                    target &= 0xFFFF;
                }
                instr.src = Some(Immediate::Imm32(target as i32).into());
            } else if instr.src.is_none() {
                instr.src = Some(imm);
            } else {
                instr.extra = Some(imm);
            }
        }

        // Ops that only read their single operand take it as `src`.
        match instr.op {
            Op::Push | Op::CallAbs | Op::JumpAbs | Op::Mul | Op::Imul | Op::Div | Op::Nop | Op::Fpu => {
                if instr.src.is_none() {
                    instr.src = instr.dest.take();
                }
            }
            Op::Lea => match instr.src {
                Some(Operand::Mem(_)) => {}
                _ => return Err(DecoderError::ud("use of `lea` with non-memory operand")),
            },
            Op::Str(_) => instr.rep = self.prefixes.rep(),
            _ => {}
        }

        instr.size = size;
        instr.len = self.len;
        Ok(instr)
    }

    /// Read a single byte from the instruction stream.
    fn read(&mut self) -> Result<u8, DecoderError> {
        if self.len == MAX_INSTR_LEN {
            // This would read the 16th byte, hitting the length limit.
            return Err(DecoderError::ud(format!(
                "instruction length {} exceeds limit of {} bytes",
                self.len + 1,
                MAX_INSTR_LEN
            )));
        }

        let b = self.mem.load(self.pos)?;
        self.pos = self.pos.wrapping_add(1);
        self.len += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16, DecoderError> {
        Ok(u16::from_le_bytes([self.read()?, self.read()?]))
    }

    fn read_u32(&mut self) -> Result<u32, DecoderError> {
        Ok(u32::from_le_bytes([self.read()?, self.read()?, self.read()?, self.read()?]))
    }

    fn read_imm(&mut self, kind: ImmKind, size: OpSize) -> Result<Immediate, DecoderError> {
        Ok(match kind {
            ImmKind::Full => match size {
                OpSize::Bits8 => self.read()?.into(),
                OpSize::Bits16 => self.read_u16()?.into(),
                OpSize::Bits32 => self.read_u32()?.into(),
            },
            ImmKind::Byte => Immediate::from(self.read()?).sign_ext_to(size),
            ImmKind::Raw8 => self.read()?.into(),
            ImmKind::Word => self.read_u16()?.into(),
            ImmKind::One => Immediate::Imm8(1),
            ImmKind::Three => Immediate::Imm8(3),
            ImmKind::None | ImmKind::Cl => unreachable!("no immediate bytes for {:?}", kind),
        })
    }

    /// Reads the operand specified by the Mod and R/M fields, along with any
    /// SIB byte and displacement.
    fn read_rm(&mut self, modrm: ModRegRm, size: OpSize) -> Result<Operand, DecoderError> {
        if modrm.mode() == 0b11 {
            return Ok(Register::from_encoding(modrm.rm(), size).into());
        }

        let addressing = if self.prefixes.addr16() {
            self.read_addressing16(modrm)?
        } else {
            self.read_addressing32(modrm)?
        };
        Ok(MemoryLocation { size, addressing }.into())
    }

    fn read_addressing32(&mut self, modrm: ModRegRm) -> Result<Addressing, DecoderError> {
        let mode = modrm.mode();
        let (base, index, scale) = if modrm.rm() == 0b100 {
            let sib = Sib(self.read()?);
            (sib.base(), sib.index(), sib.scale())
        } else {
            (modrm.rm(), None, 1)
        };

        // Base 0b101 with Mod 00 means "no base, disp32 follows". This holds
        // for the R/M field and the SIB base field alike.
        let base = if mode == 0b00 && base == 0b101 {
            None
        } else {
            Some(Register::Dword(base))
        };

        let disp = match (mode, base) {
            (0b00, None) => self.read_u32()? as i32,
            (0b00, Some(_)) => 0,
            (0b01, _) => self.read()? as i8 as i32,
            _ => self.read_u32()? as i32,
        };

        Ok(Addressing { base, index, scale, disp, addr16: false })
    }

    fn read_addressing16(&mut self, modrm: ModRegRm) -> Result<Addressing, DecoderError> {
        const BX: Register = Register::Word(3);
        const BP: Register = Register::Word(5);
        const SI: Register = Register::Word(6);
        const DI: Register = Register::Word(7);

        let mode = modrm.mode();
        let (base, index) = match modrm.rm() {
            0 => (Some(BX), Some(SI)),
            1 => (Some(BX), Some(DI)),
            2 => (Some(BP), Some(SI)),
            3 => (Some(BP), Some(DI)),
            4 => (Some(SI), None),
            5 => (Some(DI), None),
            6 if mode == 0b00 => (None, None),
            6 => (Some(BP), None),
            _ => (Some(BX), None),
        };

        let disp = match (mode, base) {
            (0b00, None) => i32::from(self.read_u16()?),
            (0b00, Some(_)) => 0,
            (0b01, _) => self.read()? as i8 as i32,
            _ => i32::from(self.read_u16()? as i16),
        };

        Ok(Addressing { base, index, scale: 1, disp, addr16: true })
    }
}

fn expect_modrm(modrm: Option<ModRegRm>) -> ModRegRm {
    match modrm {
        Some(modrm) => modrm,
        None => unreachable!("form requires a Mod-Reg-R/M byte"),
    }
}

/// Decoding shape of an opcode.
#[derive(Debug, Copy, Clone)]
struct Shape {
    kind: Kind,
    width: Width,
    form: Form,
    imm: ImmKind,
}

impl Shape {
    fn new(kind: Kind, width: Width, form: Form, imm: ImmKind) -> Option<Self> {
        Some(Shape { kind, width, form, imm })
    }
}

/// The operation, possibly deferred until the Mod-Reg-R/M byte is known.
#[derive(Debug, Copy, Clone)]
enum Kind {
    Op(Op),
    Group(Group),
}

/// Opcode groups whose operation is selected by the Reg field.
#[derive(Debug, Copy, Clone, PartialEq)]
enum Group {
    /// `0x80`-`0x83`
    Arith,
    /// `0xC0`, `0xC1`, `0xD0`-`0xD3`
    Shift,
    /// `0xF6`, `0xF7`
    Unary,
    /// `0xFE`, `0xFF`. `0xFE` only allows `inc`/`dec`.
    Misc { byte: bool },
    /// Single-operation groups that require a Reg field of 0 (`pop r/m`,
    /// `mov r/m, imm`).
    Zero(Op),
}

impl Group {
    fn resolve(self, reg: u8) -> Result<Op, DecoderError> {
        Ok(match self {
            Group::Arith => match AluOp::from_u8(reg) {
                Some(op) => Op::Alu(op),
                None => unreachable!("3-bit Reg field"),
            },
            Group::Shift => match ShiftOp::from_u8(reg) {
                Some(op) => Op::Shift(op),
                None => unreachable!("3-bit Reg field"),
            },
            Group::Unary => match reg {
                0 | 1 => Op::Test,
                2 => Op::Not,
                3 => Op::Neg,
                4 => Op::Mul,
                5 => Op::Imul,
                6 => Op::Div,
                _ => return Err(DecoderError::ud("idiv is not supported")),
            },
            Group::Misc { byte } => match reg {
                0 => Op::Inc,
                1 => Op::Dec,
                _ if byte => return Err(DecoderError::ud(format!("0xFE group with Reg field {}", reg))),
                2 => Op::CallAbs,
                3 => return Err(DecoderError::ud("far call")),
                4 => Op::JumpAbs,
                5 => return Err(DecoderError::ud("far jump")),
                6 => Op::Push,
                _ => return Err(DecoderError::ud("0xFF group with Reg field 7")),
            },
            Group::Zero(op) => {
                if reg != 0 {
                    return Err(DecoderError::ud(format!("{} with non-0 Reg field", op.mnemonic())));
                }
                op
            }
        })
    }
}

/// Operand width: 8 bits, or 16/32 bits depending on the operand size prefix.
#[derive(Debug, Copy, Clone)]
enum Width {
    Byte,
    Full,
}

/// Which bytes follow the opcode and where the operands are taken from.
#[derive(Debug, Copy, Clone, PartialEq)]
enum Form {
    /// No operands (apart from an immediate).
    None,
    /// `dest` is the R/M operand, `src` the Reg field.
    RmReg,
    /// `dest` is the Reg field, `src` the R/M operand.
    RegRm,
    /// Like `RegRm`, with a fixed R/M operand size.
    RegRmFrom(OpSize),
    /// Single R/M operand.
    Rm,
    /// `dest` is the accumulator.
    Acc,
    /// `dest` is the register encoded in the low 3 opcode bits.
    OpReg,
    /// `dest` is the accumulator, `src` the register from the opcode.
    AccOpReg,
    /// Accumulator and a memory offset following the opcode.
    Moffs { to_acc: bool },
    /// Accumulator and a port (8-bit immediate or `DX`).
    PortIn,
    PortOut,
    /// Single immediate operand.
    Imm,
    /// Relative branch whose offset is the immediate.
    Rel,
}

impl Form {
    fn has_modrm(self) -> bool {
        match self {
            Form::RmReg | Form::RegRm | Form::RegRmFrom(_) | Form::Rm => true,
            _ => false,
        }
    }
}

/// Immediate following the opcode and addressing bytes.
#[derive(Debug, Copy, Clone, PartialEq)]
enum ImmKind {
    None,
    /// Operand-sized immediate.
    Full,
    /// 8-bit immediate, sign-extended to the operand size.
    Byte,
    /// 8-bit immediate used as-is (shift counts, ports, vectors).
    Raw8,
    /// 16-bit immediate (`ret imm16`).
    Word,
    /// Implied constant 1 (`0xD0`/`0xD1` shifts).
    One,
    /// Implied vector 3 (`int3`).
    Three,
    /// Implied `CL` register (shift counts).
    Cl,
}

/// Looks up the shape of a one-byte opcode.
fn shape(byte: u8) -> Option<Shape> {
    use self::Form as F;
    use self::ImmKind as I;
    use self::Width::{Byte, Full};

    let op = |op| Kind::Op(op);
    let group = |group| Kind::Group(group);
    // bit 0 of most opcodes selects 8-bit operands
    let width = if byte & 1 == 0 { Byte } else { Full };
    let alu = || AluOp::from_u8((byte >> 3) & 0b111).map(Op::Alu);
    let cond = || ConditionCode::from_u8(byte & 0x0F);

    match byte {
        _ if bitpat!(0 0 _ _ _ 0 0 _)(byte) => Shape::new(op(alu()?), width, F::RmReg, I::None),
        _ if bitpat!(0 0 _ _ _ 0 1 _)(byte) => Shape::new(op(alu()?), width, F::RegRm, I::None),
        _ if bitpat!(0 0 _ _ _ 1 0 _)(byte) => Shape::new(op(alu()?), width, F::Acc, I::Full),
        0x40..=0x47 => Shape::new(op(Op::Inc), Full, F::OpReg, I::None),
        0x48..=0x4F => Shape::new(op(Op::Dec), Full, F::OpReg, I::None),
        0x50..=0x57 => Shape::new(op(Op::Push), Full, F::OpReg, I::None),
        0x58..=0x5F => Shape::new(op(Op::Pop), Full, F::OpReg, I::None),
        0x60 => Shape::new(op(Op::Pusha), Full, F::None, I::None),
        0x61 => Shape::new(op(Op::Popa), Full, F::None, I::None),
        0x68 => Shape::new(op(Op::Push), Full, F::Imm, I::Full),
        0x69 => Shape::new(op(Op::ImulTrunc), Full, F::RegRm, I::Full),
        0x6A => Shape::new(op(Op::Push), Full, F::Imm, I::Byte),
        0x6B => Shape::new(op(Op::ImulTrunc), Full, F::RegRm, I::Byte),
        0x70..=0x7F => Shape::new(op(Op::Jcc(cond()?)), Byte, F::Rel, I::Byte),
        0x80 | 0x82 => Shape::new(group(Group::Arith), Byte, F::Rm, I::Full),
        0x81 => Shape::new(group(Group::Arith), Full, F::Rm, I::Full),
        0x83 => Shape::new(group(Group::Arith), Full, F::Rm, I::Byte),
        0x84 | 0x85 => Shape::new(op(Op::Test), width, F::RmReg, I::None),
        0x86 | 0x87 => Shape::new(op(Op::Xchg), width, F::RmReg, I::None),
        0x88 | 0x89 => Shape::new(op(Op::Mov), width, F::RmReg, I::None),
        0x8A | 0x8B => Shape::new(op(Op::Mov), width, F::RegRm, I::None),
        0x8D => Shape::new(op(Op::Lea), Full, F::RegRm, I::None),
        0x8F => Shape::new(group(Group::Zero(Op::Pop)), Full, F::Rm, I::None),
        0x90 => Shape::new(op(Op::Nop), Full, F::None, I::None),
        0x91..=0x97 => Shape::new(op(Op::Xchg), Full, F::AccOpReg, I::None),
        0x98 => Shape::new(op(Op::Cbw), Full, F::None, I::None),
        0x99 => Shape::new(op(Op::Cwd), Full, F::None, I::None),
        0x9C => Shape::new(op(Op::Pushf), Full, F::None, I::None),
        0x9D => Shape::new(op(Op::Popf), Full, F::None, I::None),
        0x9E => Shape::new(op(Op::Sahf), Byte, F::None, I::None),
        0x9F => Shape::new(op(Op::Lahf), Byte, F::None, I::None),
        0xA0 | 0xA1 => Shape::new(op(Op::Mov), width, F::Moffs { to_acc: true }, I::None),
        0xA2 | 0xA3 => Shape::new(op(Op::Mov), width, F::Moffs { to_acc: false }, I::None),
        0xA4 | 0xA5 => Shape::new(op(Op::Str(StrOp::Movs)), width, F::None, I::None),
        0xA6 | 0xA7 => Shape::new(op(Op::Str(StrOp::Cmps)), width, F::None, I::None),
        0xA8 | 0xA9 => Shape::new(op(Op::Test), width, F::Acc, I::Full),
        0xAA | 0xAB => Shape::new(op(Op::Str(StrOp::Stos)), width, F::None, I::None),
        0xAC | 0xAD => Shape::new(op(Op::Str(StrOp::Lods)), width, F::None, I::None),
        0xAE | 0xAF => Shape::new(op(Op::Str(StrOp::Scas)), width, F::None, I::None),
        0xB0..=0xB7 => Shape::new(op(Op::Mov), Byte, F::OpReg, I::Full),
        0xB8..=0xBF => Shape::new(op(Op::Mov), Full, F::OpReg, I::Full),
        0xC0 | 0xC1 => Shape::new(group(Group::Shift), width, F::Rm, I::Raw8),
        0xC2 => Shape::new(op(Op::Retn), Full, F::Imm, I::Word),
        0xC3 => Shape::new(op(Op::Retn), Full, F::None, I::None),
        0xC6 | 0xC7 => Shape::new(group(Group::Zero(Op::Mov)), width, F::Rm, I::Full),
        0xC9 => Shape::new(op(Op::Leave), Full, F::None, I::None),
        0xCC => Shape::new(op(Op::Int), Byte, F::Imm, I::Three),
        0xCD => Shape::new(op(Op::Int), Byte, F::Imm, I::Raw8),
        0xCE => Shape::new(op(Op::Into), Byte, F::None, I::None),
        0xCF => Shape::new(op(Op::Iret), Full, F::None, I::None),
        0xD0 | 0xD1 => Shape::new(group(Group::Shift), width, F::Rm, I::One),
        0xD2 | 0xD3 => Shape::new(group(Group::Shift), width, F::Rm, I::Cl),
        0xD8..=0xDF => Shape::new(op(Op::Fpu), Full, F::Rm, I::None),
        0xE0 => Shape::new(op(Op::Loop(LoopKind::Loopne)), Byte, F::Rel, I::Byte),
        0xE1 => Shape::new(op(Op::Loop(LoopKind::Loope)), Byte, F::Rel, I::Byte),
        0xE2 => Shape::new(op(Op::Loop(LoopKind::Loop)), Byte, F::Rel, I::Byte),
        0xE3 => Shape::new(op(Op::Loop(LoopKind::Jcxz)), Byte, F::Rel, I::Byte),
        0xE4 | 0xE5 => Shape::new(op(Op::In), width, F::PortIn, I::Raw8),
        0xE6 | 0xE7 => Shape::new(op(Op::Out), width, F::PortOut, I::Raw8),
        0xE8 => Shape::new(op(Op::Call), Full, F::Rel, I::Full),
        0xE9 => Shape::new(op(Op::Jump), Full, F::Rel, I::Full),
        0xEB => Shape::new(op(Op::Jump), Byte, F::Rel, I::Byte),
        0xEC | 0xED => Shape::new(op(Op::In), width, F::PortIn, I::None),
        0xEE | 0xEF => Shape::new(op(Op::Out), width, F::PortOut, I::None),
        0xF4 => Shape::new(op(Op::Hlt), Byte, F::None, I::None),
        0xF5 => Shape::new(op(Op::Cmc), Byte, F::None, I::None),
        0xF6 | 0xF7 => Shape::new(group(Group::Unary), width, F::Rm, I::None),
        0xF8 => Shape::new(op(Op::ClearFlag(Flags::CF)), Byte, F::None, I::None),
        0xF9 => Shape::new(op(Op::SetFlag(Flags::CF)), Byte, F::None, I::None),
        0xFA => Shape::new(op(Op::ClearFlag(Flags::IF)), Byte, F::None, I::None),
        0xFB => Shape::new(op(Op::SetFlag(Flags::IF)), Byte, F::None, I::None),
        0xFC => Shape::new(op(Op::ClearFlag(Flags::DF)), Byte, F::None, I::None),
        0xFD => Shape::new(op(Op::SetFlag(Flags::DF)), Byte, F::None, I::None),
        0xFE => Shape::new(group(Group::Misc { byte: true }), Byte, F::Rm, I::None),
        0xFF => Shape::new(group(Group::Misc { byte: false }), Full, F::Rm, I::None),
        _ => None,
    }
}

/// Looks up the shape of a two-byte opcode (`0x0F` followed by `byte`).
fn shape_0f(byte: u8) -> Option<Shape> {
    use self::Form as F;
    use self::ImmKind as I;
    use self::Width::{Byte, Full};

    let op = |op| Kind::Op(op);
    let cond = || ConditionCode::from_u8(byte & 0x0F);

    match byte {
        0x1F => Shape::new(op(Op::Nop), Full, F::Rm, I::None),
        0x80..=0x8F => Shape::new(op(Op::Jcc(cond()?)), Full, F::Rel, I::Full),
        0x90..=0x9F => Shape::new(op(Op::SetCc(cond()?)), Byte, F::Rm, I::None),
        0xA4 => Shape::new(op(Op::DoubleShift { left: true }), Full, F::RmReg, I::Raw8),
        0xA5 => Shape::new(op(Op::DoubleShift { left: true }), Full, F::RmReg, I::Cl),
        0xAC => Shape::new(op(Op::DoubleShift { left: false }), Full, F::RmReg, I::Raw8),
        0xAD => Shape::new(op(Op::DoubleShift { left: false }), Full, F::RmReg, I::Cl),
        0xAF => Shape::new(op(Op::ImulTrunc), Full, F::RegRm, I::None),
        0xB6 => Shape::new(op(Op::MovZx), Full, F::RegRmFrom(OpSize::Bits8), I::None),
        0xB7 => Shape::new(op(Op::MovZx), Full, F::RegRmFrom(OpSize::Bits16), I::None),
        0xBE => Shape::new(op(Op::MovSx), Full, F::RegRmFrom(OpSize::Bits8), I::None),
        0xBF => Shape::new(op(Op::MovSx), Full, F::RegRmFrom(OpSize::Bits16), I::None),
        _ => None,
    }
}

/// A Mod-Reg-R/M byte (also called Mod-R/M).
///
/// This is used by many opcodes to define their source and destination operands
/// and, if present, follows right after the opcode bytes.
#[derive(Debug, Copy, Clone)]
struct ModRegRm(u8);

impl ModRegRm {
    /// The `Mod` field. `0b11` selects a register operand, the other values
    /// select memory operands with no, 8-bit or 16/32-bit displacement.
    fn mode(self) -> u8 {
        self.0 >> 6
    }

    /// Gets the raw value of the `Reg` field.
    ///
    /// This is used to encode ALU opcodes that take an immediate, for example.
    fn reg(self) -> u8 {
        (self.0 >> 3) & 0b111
    }

    fn rm(self) -> u8 {
        self.0 & 0b111
    }

    /// The register specified in the `Reg` field, given the operand size.
    fn reg_operand(self, size: OpSize) -> Operand {
        Register::from_encoding(self.reg(), size).into()
    }
}

/// A Scaled Index Byte (SIB).
#[derive(Debug, Copy, Clone)]
struct Sib(u8);

impl Sib {
    /// 1, 2, 4 or 8
    fn scale(self) -> u8 {
        1 << (self.0 >> 6)
    }

    /// The index register, or `None` if the index field is `0b100` (which
    /// would encode `ESP`).
    fn index(self) -> Option<Register> {
        match (self.0 >> 3) & 0b111 {
            0b100 => None,
            index => Some(Register::Dword(index)),
        }
    }

    /// Raw base field. `0b101` means "no base" when `Mod` is `0b00`.
    fn base(self) -> u8 {
        self.0 & 0b111
    }
}

/// Error type returned by the decoder.
///
/// This can either be an actual instruction encoding problem, which would be
/// equivalent to the CPU raising `#UD` at that point, or a memory access
/// violation while fetching instruction bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderError {
    /// Memory error while reading machine code bytes.
    Memory(MemoryError),
    /// Undefined or unsupported instruction (`#UD`).
    Undefined(String),
}

impl DecoderError {
    #[cold]
    pub(crate) fn ud<S: AsRef<str>>(why: S) -> Self {
        DecoderError::Undefined(why.as_ref().to_string())
    }
}

impl From<MemoryError> for DecoderError {
    #[cold]
    fn from(e: MemoryError) -> Self {
        DecoderError::Memory(e)
    }
}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecoderError::Memory(e) => write!(f, "instruction fetch failed: {}", e),
            DecoderError::Undefined(why) => write!(f, "undefined instruction: {}", why),
        }
    }
}

impl Error for DecoderError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SparseMemory;

    fn mem_with(rawstr: &str) -> SparseMemory {
        let bytes: Vec<_> = rawstr.split_whitespace()
            .map(|hexstr| u8::from_str_radix(hexstr, 16).unwrap())
            .collect();

        let mut mem = SparseMemory::new();
        mem.allocate(0, bytes.len() as u32);
        mem.write(&bytes, 0);
        mem
    }

    fn decode(rawstr: &str) -> Result<Instr, DecoderError> {
        let mem = mem_with(rawstr);
        let mut dec = Decoder::new(&mem, 0);
        dec.decode_next()
    }

    fn decodes_as(rawstr: &str, printed: &str) {
        let inst = decode(rawstr).unwrap();
        assert_eq!(inst.to_string(), printed);
        assert_eq!(inst.len as usize, rawstr.split_whitespace().count(), "length of {}", printed);
    }

    /// Combined decoder and printer test. Don't forget to add tests using
    /// negative displacements and offsets too, those are hard to get right!
    #[test]
    fn disassemble_smoke() {
        decodes_as("8D 44 08 0F", "lea eax,[eax+ecx+0xf]");
        decodes_as("8D 44 08 FE", "lea eax,[eax+ecx-0x2]");
        decodes_as("73 02", "jnc 0x00000004");
        decodes_as("99", "cdq");
        decodes_as("66 99", "cwd");
        decodes_as("98", "cwde");
        decodes_as("33 F6", "xor esi,esi");
        decodes_as("83 E0 F0", "and eax,0xfffffff0");
        decodes_as("83 C0 01", "add eax,1");
        decodes_as("89 01", "mov [ecx],eax");
        decodes_as("68 9B D8 04 00", "push dword 0x4d89b");
        decodes_as("6A FC", "push dword 0xfffffffc");
        decodes_as("5F", "pop edi");
        decodes_as("C3", "ret");
        decodes_as("C2 10 00", "ret 16");
        decodes_as("81 78 08 00 00 FE FF", "cmp dword [eax+0x8],0xfffe0000");
        decodes_as("81 78 ff 00 00 FE FF", "cmp dword [eax-0x1],0xfffe0000");
        decodes_as("8D BD 00 F4 FF FF", "lea edi,[ebp-0xc00]");
        decodes_as("6b 84 8b ab 00 00 00 02", "imul eax,[ebx+ecx*4+0xab],2");
        decodes_as("85 C0", "test eax,eax");
        decodes_as("C1 E9 02", "shr ecx,2");
        decodes_as("D1 E0", "shl eax,1");
        decodes_as("D3 F8", "sar eax,cl");
        decodes_as("FF 74 24 04", "push dword [esp+0x4]");
        decodes_as("F3 AB", "rep stosd");
        decodes_as("F2 AE", "repne scasb");
        decodes_as("F3 A6", "repe cmpsb");
        decodes_as("C9", "leave");
        decodes_as("C7 45 F4 40 00 00 00", "mov dword [ebp-0xc],0x40");
        decodes_as("0F AF 45 E8", "imul eax,[ebp-0x18]");
        decodes_as("0F 95 C1", "setnz cl");
        decodes_as("0F 84 AE 00 00 00", "jz 0x000000B4");
        decodes_as("FF 24 85 C1 D7 15 00", "jmp dword [eax*4+0x15d7c1]");
        decodes_as("64 0F B6 05 24 00 00 00", "movzx eax,byte [0x24]");
        decodes_as("0F BF C8", "movsx ecx,ax");
        decodes_as("A8 82", "test al,0x82");
        decodes_as("B4 12", "mov ah,0x12");
        decodes_as("88 E0", "mov al,ah");
        decodes_as("A1 00 10 00 00", "mov eax,[0x1000]");
        decodes_as("A2 00 10 00 00", "mov [0x1000],al");
        decodes_as("0F A4 C2 04", "shld edx,eax,4");
        decodes_as("0F AD C2", "shrd edx,eax,cl");
        decodes_as("F7 E1", "mul ecx");
        decodes_as("F6 C3 01", "test bl,0x1");
        decodes_as("E2 FE", "loop 0x00000000");
        decodes_as("E8 FB FF FF FF", "call 0x00000000");
        decodes_as("CD 40", "int 0x40");
        decodes_as("CC", "int 0x3");
        decodes_as("E4 60", "in al,0x60");
        decodes_as("EE", "out dx,al");
        decodes_as("E7 80", "out 0x80,eax");
        decodes_as("93", "xchg eax,ebx");
        decodes_as("8F 00", "pop dword [eax]");
        decodes_as("DD 45 F8", "(fpu) dword [ebp-0x8]");
        decodes_as("0F 1F 44 00 00", "nop dword [eax+eax]");
    }

    #[test]
    fn sixteen_bit_addressing() {
        decodes_as("67 8B 00", "mov eax,[bx+si]");
        decodes_as("67 8B 46 FE", "mov eax,[bp-0x2]");
        decodes_as("67 8B 06 34 12", "mov eax,[0x1234]");
        decodes_as("67 8B 87 00 80", "mov eax,[bx-0x8000]");
        decodes_as("66 8B 07", "mov ax,[edi]");
    }

    #[test]
    fn sib_without_base() {
        let instr = decode("8B 04 25 78 56 34 12").unwrap();
        match instr.src {
            Some(Operand::Mem(MemoryLocation { addressing, .. })) => {
                assert_eq!(addressing.base, None);
                assert_eq!(addressing.index, None);
                assert_eq!(addressing.disp, 0x1234_5678);
            }
            other => panic!("unexpected operand {:?}", other),
        }

        // mod=01 keeps EBP as base
        decodes_as("8B 44 25 08", "mov eax,[ebp+0x8]");
    }

    #[test]
    fn deferred_groups() {
        decodes_as("80 38 07", "cmp byte [eax],0x7");
        decodes_as("F7 D8", "neg eax");
        decodes_as("FE C0", "inc al");
        decodes_as("FF D0", "call eax");
        decodes_as("D0 C8", "ror al,1");

        assert!(matches!(decode("F7 F9"), Err(DecoderError::Undefined(_))));
        assert!(matches!(decode("FF 1D 00 00 00 00"), Err(DecoderError::Undefined(_))));
        assert!(matches!(decode("FF 2D 00 00 00 00"), Err(DecoderError::Undefined(_))));
        assert!(matches!(decode("FF 38"), Err(DecoderError::Undefined(_))));
        assert!(matches!(decode("FE 10"), Err(DecoderError::Undefined(_))));
        assert!(matches!(decode("C7 48 00 00 00 00 00"), Err(DecoderError::Undefined(_))));
        assert!(matches!(decode("8D C0"), Err(DecoderError::Undefined(_))));
    }

    #[test]
    fn undefined_opcodes() {
        assert!(matches!(decode("0F 0B"), Err(DecoderError::Undefined(_))));
        assert!(matches!(decode("0F A2"), Err(DecoderError::Undefined(_))));
        assert!(matches!(decode("27"), Err(DecoderError::Undefined(_))));
        assert!(matches!(decode("9A 00 00 00 00 00 00"), Err(DecoderError::Undefined(_))));
    }

    #[test]
    fn truncated_instruction() {
        // `mov eax, imm32` running into an unmapped page
        let mut mem = SparseMemory::new();
        mem.allocate(0, 0x1000);
        mem.write(&[0xB8, 0x05, 0x00], 0xFFD);
        let mut dec = Decoder::new(&mem, 0xFFD);
        assert!(matches!(dec.decode_next(), Err(DecoderError::Memory(_))));
    }

    #[test]
    fn length_limit() {
        decodes_as(
            "66 66 66 66 66 66 66 66 66 66 66 66 66 66 99",
            "cwd"
        );
        decode(
            "66 66 66 66 66 66 66 66 66 66 66 66 66 66 66 99"
        ).unwrap_err();
    }
}
