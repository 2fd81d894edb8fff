//! Instruction disassembler and pretty printer.
//!
//! Prints Intel syntax. Memory operands get an explicit `byte`/`word`/`dword`
//! annotation when no register operand determines their size.

use crate::cpu::instr::*;

use termcolor::{Color, ColorSpec, WriteColor};

use std::io;

/// Trait for assembly printing contexts.
///
/// This can be implemented to color specific parts of an instruction.
pub trait AsmPrinter {
    /// Print an instruction mnemonic/name, including prefixes like `rep`.
    fn print_mnemonic(&mut self, mnemonic: &str);

    /// Prints a register operand (or part of an operand).
    fn print_register(&mut self, name: &str);

    /// Prints an immediate operand.
    fn print_immediate(&mut self, imm: &str);

    /// Prints an address or an address offset of an operand.
    fn print_addr_or_offset(&mut self, addr: &str);

    /// Prints a jump or call target.
    fn print_jump_target(&mut self, target: &str);

    /// Print a string of symbol characters like `&,[]+ `.
    fn print_symbols(&mut self, sym: &str);
}

/// Prints the instruction to a string, without formatting.
impl AsmPrinter for String {
    fn print_mnemonic(&mut self, mnemonic: &str) {
        self.push_str(mnemonic);
    }

    fn print_register(&mut self, name: &str) {
        self.push_str(name);
    }

    fn print_immediate(&mut self, imm: &str) {
        self.push_str(imm);
    }

    fn print_addr_or_offset(&mut self, addr: &str) {
        self.push_str(addr);
    }

    fn print_jump_target(&mut self, target: &str) {
        self.push_str(target);
    }

    fn print_symbols(&mut self, sym: &str) {
        self.push_str(sym);
    }
}

/// Prints colored disassembly to a terminal.
///
/// The printer methods can't fail, so the first I/O error is stored and
/// returned by `finish`.
pub struct TermPrinter<W: WriteColor> {
    out: W,
    error: Option<io::Error>,
}

impl<W: WriteColor> TermPrinter<W> {
    pub fn new(out: W) -> Self {
        Self { out, error: None }
    }

    fn colored(&mut self, color: Option<Color>, bold: bool, s: &str) {
        if self.error.is_some() {
            return;
        }

        let mut spec = ColorSpec::new();
        spec.set_fg(color).set_bold(bold);
        let result = self.out.set_color(&spec)
            .and_then(|()| self.out.write_all(s.as_bytes()))
            .and_then(|()| self.out.reset());
        if let Err(e) = result {
            self.error = Some(e);
        }
    }

    /// Returns the writer, or the first error that occurred while printing.
    pub fn finish(self) -> io::Result<W> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.out),
        }
    }
}

impl<W: WriteColor> AsmPrinter for TermPrinter<W> {
    fn print_mnemonic(&mut self, mnemonic: &str) {
        self.colored(None, true, mnemonic);
    }

    fn print_register(&mut self, name: &str) {
        self.colored(Some(Color::Cyan), false, name);
    }

    fn print_immediate(&mut self, imm: &str) {
        self.colored(Some(Color::Yellow), false, imm);
    }

    fn print_addr_or_offset(&mut self, addr: &str) {
        self.colored(Some(Color::Green), false, addr);
    }

    fn print_jump_target(&mut self, target: &str) {
        self.colored(Some(Color::Magenta), true, target);
    }

    fn print_symbols(&mut self, sym: &str) {
        self.colored(None, false, sym);
    }
}

/// Printer hint for immediates: decimal or hexadecimal.
#[derive(Copy, Clone, PartialEq)]
enum ImmReprHint {
    Dec,
    Hex,
    /// Absolute branch target.
    Target,
}

pub fn print_instr<P: AsmPrinter>(instr: &Instr, p: &mut P) {
    p.print_mnemonic(&mnemonic(instr));

    let operands: Vec<&Operand> = match instr.op {
        // accumulator and counter operands are implied
        Op::Str(_) | Op::Mul | Op::Imul | Op::Div => instr.src.iter().collect(),
        _ => instr.dest.iter().chain(&instr.src).chain(&instr.extra).collect(),
    };
    if operands.is_empty() {
        return;
    }

    let hint = match instr.op {
        Op::Alu(AluOp::Add) | Op::Alu(AluOp::Adc) | Op::Alu(AluOp::Sub) | Op::Alu(AluOp::Sbb)
        | Op::ImulTrunc | Op::Shift(_) | Op::DoubleShift { .. } | Op::Retn => ImmReprHint::Dec,
        Op::Jcc(_) | Op::Loop(_) | Op::Jump | Op::Call => ImmReprHint::Target,
        _ => ImmReprHint::Hex,
    };
    let has_reg = operands.iter().any(|op| match op {
        Operand::Reg(_) => true,
        _ => false,
    });
    let sized_mem = !has_reg || instr.op == Op::MovZx || instr.op == Op::MovSx;
    let sized_imm = instr.op == Op::Push;

    p.print_symbols(" ");
    for (i, op) in operands.iter().enumerate() {
        if i != 0 {
            p.print_symbols(",");
        }

        match op {
            Operand::Reg(reg) => p.print_register(reg.name()),
            Operand::Imm(imm) => {
                if sized_imm {
                    p.print_immediate(&format!("{} ", imm.size()));
                }
                match hint {
                    ImmReprHint::Dec => p.print_immediate(&imm.to_string()),
                    ImmReprHint::Hex => p.print_immediate(&format!("{:#x}", imm)),
                    ImmReprHint::Target => p.print_jump_target(&format!("{:#010X}", imm.zero_extended())),
                }
            }
            Operand::Mem(mem) => {
                if sized_mem {
                    p.print_immediate(&format!("{} ", mem.size));
                }
                print_addressing(&mem.addressing, p);
            }
        }
    }
}

fn mnemonic(instr: &Instr) -> String {
    let dword = instr.size == OpSize::Bits32;
    let base = match instr.op {
        Op::Cbw if dword => "cwde",
        Op::Cwd if dword => "cdq",
        Op::Pusha if dword => "pushad",
        Op::Popa if dword => "popad",
        Op::Pushf if dword => "pushfd",
        Op::Popf if dword => "popfd",
        Op::Iret if dword => "iretd",
        Op::Loop(LoopKind::Jcxz) if instr.addr16 => "jcxz",
        op => op.mnemonic(),
    };

    match instr.op {
        Op::Str(op) => {
            let rep = match instr.rep {
                Some(Rep::WhileEqual) if op.compares() => "repe ",
                Some(Rep::WhileEqual) => "rep ",
                Some(Rep::WhileNotEqual) => "repne ",
                None => "",
            };
            let suffix = match instr.size {
                OpSize::Bits8 => "b",
                OpSize::Bits16 => "w",
                OpSize::Bits32 => "d",
            };
            format!("{}{}{}", rep, base, suffix)
        }
        _ => base.to_string(),
    }
}

fn print_addressing<P: AsmPrinter>(addr: &Addressing, p: &mut P) {
    p.print_symbols("[");

    let mut first = true;
    if let Some(base) = addr.base {
        p.print_register(base.name());
        first = false;
    }
    if let Some(index) = addr.index {
        if !first {
            p.print_symbols("+");
        }
        p.print_register(index.name());
        if addr.scale > 1 {
            p.print_symbols("*");
            p.print_addr_or_offset(&addr.scale.to_string());
        }
        first = false;
    }

    if first {
        let disp = if addr.addr16 { addr.disp as u32 & 0xFFFF } else { addr.disp as u32 };
        p.print_addr_or_offset(&format!("{:#x}", disp));
    } else if addr.disp != 0 {
        p.print_symbols(if addr.disp > 0 { "+" } else { "-" });
        p.print_addr_or_offset(&format!("{:#x}", (addr.disp as i64).abs()));
    }

    p.print_symbols("]");
}
