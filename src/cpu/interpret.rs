//! x86 interpreter.
//!
//! Every step fetches and decodes one instruction at `eip`, resolves its
//! operands, performs the operation and writes the result back. Arithmetic is
//! evaluated on 64-bit accumulators so that carry and overflow can be derived
//! the same way for every operand size.
//!
//! Anything the interpreter cannot do by itself (software interrupts, calls
//! into imported library functions, port I/O) is handed to a `Hooks`
//! implementation.

use crate::cpu::decode::{Decoder, DecoderError};
use crate::cpu::instr::*;
use crate::cpu::operand::{self, index_register};
use crate::cpu::{ExecutionEngine, Flags, State};
use crate::memory::{MemoryError, VirtualMemory};
use crate::utils::Opaque;

use std::error::Error;
use std::fmt;

/// The software interrupt vector of the guest's system call gate.
pub const SYSCALL_VECTOR: u8 = 0x40;

/// Callback invoked after every executed instruction.
pub type Tracer = Box<dyn FnMut(&State, &Instr)>;

/// Interpreter switches.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Apply the stack adjustment encoded in `ret imm16`.
    ///
    /// Off by default: the immediate is decoded, but `esp` is only advanced
    /// past the return address.
    pub ret_pops_imm: bool,
}

/// Result of a step that did not fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// The guest can continue running.
    Running,
    /// The guest asked to terminate with the given exit code.
    Exited(u32),
    /// `hlt` was executed.
    Halted,
}

/// What to do after a hook has run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HookAction {
    /// Continue executing.
    ///
    /// After an import call, the return address and `pop` further bytes of
    /// arguments are removed from the stack (callee-cleans-up calling
    /// conventions). `pop` is ignored for system calls.
    Continue { pop: u32 },
    /// Terminate the guest with an exit code.
    Exit(u32),
}

impl HookAction {
    pub const CONTINUE: HookAction = HookAction::Continue { pop: 0 };
}

/// Trap handlers invoked by the interpreter.
///
/// All methods have defaults that reject the trap, so implementations only
/// need to provide the parts they support.
pub trait Hooks<M: VirtualMemory> {
    /// Returns whether execution at `addr` is intercepted by `import_call`
    /// instead of being decoded.
    fn is_trapped(&self, _addr: u32) -> bool {
        false
    }

    /// Runs the library function trapped at `addr`.
    ///
    /// Called with `esp` pointing at the return address of the call.
    fn import_call(&mut self, addr: u32, _state: &mut State, _mem: &mut M) -> Result<HookAction, HookError> {
        Err(HookError::NoImport(addr))
    }

    /// Handles `int 0x40`. The system call number and arguments are taken from
    /// the register file, which may be modified in place.
    fn syscall(&mut self, _state: &mut State, _mem: &mut M) -> Result<HookAction, HookError> {
        Err(HookError::UnhandledInterrupt(SYSCALL_VECTOR))
    }

    /// Reads a `size`-wide value from an I/O port.
    fn port_in(&mut self, port: u16, _size: OpSize) -> Result<u32, HookError> {
        Err(HookError::NoPortHandler(port))
    }

    /// Writes a `size`-wide value to an I/O port.
    fn port_out(&mut self, port: u16, _size: OpSize, _value: u32) -> Result<(), HookError> {
        Err(HookError::NoPortHandler(port))
    }
}

/// Hooks that reject every trap.
#[derive(Debug, Default)]
pub struct NoHooks;

impl<M: VirtualMemory> Hooks<M> for NoHooks {}

/// An x86 interpreter operating on a virtual memory `M`.
#[derive(Debug)]
pub struct Interpreter<M: VirtualMemory, H: Hooks<M> = NoHooks> {
    state: State,
    mem: M,
    hooks: H,
    options: Options,
    tracer: Option<Opaque<Tracer>>,
}

impl<M: VirtualMemory, H: Hooks<M>> Interpreter<M, H> {
    /// Creates a new interpreter.
    ///
    /// # Parameters
    ///
    /// * `mem`: The virtual memory space to operate on.
    /// * `hooks`: Trap handlers.
    /// * `eip`: Initial value of the `eip` register. Points to the first
    ///   instruction that will be executed.
    /// * `esp`: Initial stack pointer value. Usually points at the first
    ///   address behind the allocated stack.
    pub fn new(mem: M, hooks: H, eip: u32, esp: u32) -> Self {
        Self {
            state: State::new(eip, esp),
            mem,
            hooks,
            options: Options::default(),
            tracer: None,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    /// Installs a callback that is invoked after every executed instruction.
    pub fn set_tracer(&mut self, tracer: Tracer) {
        self.tracer = Some(Opaque(tracer));
    }

    /// Fetch, decode and execute the next instruction.
    ///
    /// On error, `eip` is left pointing at the first byte of the faulting
    /// instruction.
    pub fn step(&mut self) -> Result<Status, InterpreterError> {
        let addr = self.state.eip();
        match self.step_at(addr) {
            Ok(status) => Ok(status),
            Err(cause) => {
                self.state.set_eip(addr);
                if let Cause::Trap(e) = &cause {
                    error!("trap handler failed at {:#010X}: {}", addr, e);
                }
                Err(InterpreterError {
                    addr,
                    state: self.state.clone(),
                    cause,
                })
            }
        }
    }

    fn step_at(&mut self, addr: u32) -> Result<Status, Cause> {
        if self.hooks.is_trapped(addr) {
            let status = self.trap_import(addr)?;
            self.state.update_flags(Flags::ID, false);
            return Ok(status);
        }

        let instr = Decoder::new(&self.mem, addr).decode_next()?;
        trace!("{:#010X}: {}", addr, instr);
        self.state.set_eip(addr.wrapping_add(instr.len));

        let status = self.execute(&instr)?;
        self.state.update_flags(Flags::ID, false);

        if let Some(tracer) = &mut self.tracer {
            (tracer.0)(&self.state, &instr);
        }
        Ok(status)
    }

    /// Runs the import hook, then returns to the caller like `ret` would.
    fn trap_import(&mut self, addr: u32) -> Result<Status, Cause> {
        match self.hooks.import_call(addr, &mut self.state, &mut self.mem)? {
            HookAction::Continue { pop } => {
                let ret = operand::pop(&mut self.state, &self.mem, OpSize::Bits32)?;
                let esp = self.state.esp().wrapping_add(pop);
                self.state.set_esp(esp);
                self.state.set_eip(ret);
                Ok(Status::Running)
            }
            HookAction::Exit(code) => Ok(Status::Exited(code)),
        }
    }

    fn read(&self, operand: &Operand) -> Result<u32, MemoryError> {
        operand::read(&self.state, &self.mem, operand)
    }

    fn write(&mut self, operand: &Operand, value: u32) -> Result<(), MemoryError> {
        operand::write(&mut self.state, &mut self.mem, operand, value)
    }

    fn push(&mut self, value: u32, size: OpSize) -> Result<(), MemoryError> {
        operand::push(&mut self.state, &mut self.mem, value, size)
    }

    fn pop(&mut self, size: OpSize) -> Result<u32, MemoryError> {
        operand::pop(&mut self.state, &self.mem, size)
    }

    /// Execute a decoded instruction and perform its side effects.
    ///
    /// `eip` already points to the next instruction.
    fn execute(&mut self, instr: &Instr) -> Result<Status, Cause> {
        let size = instr.size;

        match instr.op {
            Op::Alu(op) => {
                let dest = required(&instr.dest)?;
                let lhs = self.read(dest)?;
                let rhs = self.read(required(&instr.src)?)?;
                let res = self.alu(op, size, lhs, rhs);
                if op != AluOp::Cmp {
                    self.write(dest, res)?;
                }
            }
            Op::Test => {
                let lhs = self.read(required(&instr.dest)?)?;
                let rhs = self.read(required(&instr.src)?)?;
                self.alu(AluOp::And, size, lhs, rhs);
            }
            Op::Inc | Op::Dec => {
                let dest = required(&instr.dest)?;
                let value = self.read(dest)?;
                // like add/sub, but CF survives
                let cf = self.state.flags().contains(Flags::CF);
                let op = if instr.op == Op::Inc { AluOp::Add } else { AluOp::Sub };
                let res = self.alu(op, size, value, 1);
                self.state.update_flags(Flags::CF, cf);
                self.write(dest, res)?;
            }
            Op::Not => {
                let dest = required(&instr.dest)?;
                let value = self.read(dest)?;
                self.write(dest, !value)?;
            }
            Op::Neg => {
                let dest = required(&instr.dest)?;
                let value = self.read(dest)?;
                let res = self.alu(AluOp::Sub, size, 0, value);
                self.state.update_flags(Flags::CF, value & size.mask() != 0);
                self.write(dest, res)?;
            }
            Op::Mul | Op::Imul => {
                let src = self.read(required(&instr.src)?)?;
                self.widening_mul(size, src, instr.op == Op::Imul);
            }
            Op::ImulTrunc => {
                let dest = required(&instr.dest)?;
                let (a, b) = match &instr.extra {
                    Some(extra) => (self.read(required(&instr.src)?)?, self.read(extra)?),
                    None => (self.read(dest)?, self.read(required(&instr.src)?)?),
                };
                let full = i64::from(size.sign_extend(a) as i32) * i64::from(size.sign_extend(b) as i32);
                let res = full as u32 & size.mask();
                let overflow = i64::from(size.sign_extend(res) as i32) != full;
                self.state.update_flags(Flags::CF | Flags::OF, overflow);
                self.write(dest, res)?;
            }
            Op::Div => {
                let src = self.read(required(&instr.src)?)?;
                self.divide(size, src)?;
            }
            Op::Shift(op) => {
                let dest = required(&instr.dest)?;
                let value = self.read(dest)?;
                let count = self.read(required(&instr.src)?)? & 0x1F;
                if count != 0 {
                    let res = self.shift(op, size, value, count);
                    self.write(dest, res)?;
                }
            }
            Op::DoubleShift { left } => {
                let dest = required(&instr.dest)?;
                let value = self.read(dest)?;
                let fill = self.read(required(&instr.src)?)?;
                let count = self.read(required(&instr.extra)?)? & 0x1F;
                if count != 0 {
                    let res = self.double_shift(left, size, value, fill, count);
                    self.write(dest, res)?;
                }
            }
            Op::Mov | Op::MovZx => {
                let value = self.read(required(&instr.src)?)?;
                self.write(required(&instr.dest)?, value)?;
            }
            Op::MovSx => {
                let src = required(&instr.src)?;
                let value = src.size().sign_extend(self.read(src)?);
                self.write(required(&instr.dest)?, value)?;
            }
            Op::Lea => {
                let addr = match required(&instr.src)? {
                    Operand::Mem(loc) => operand::effective_address(&self.state, &loc.addressing),
                    _ => return Err(DecoderError::ud("use of `lea` with non-memory operand").into()),
                };
                self.write(required(&instr.dest)?, addr)?;
            }
            Op::Xchg => {
                let (dest, src) = (required(&instr.dest)?, required(&instr.src)?);
                let (a, b) = (self.read(dest)?, self.read(src)?);
                self.write(dest, b)?;
                self.write(src, a)?;
            }
            Op::SetCc(cc) => {
                let value = cc.eval(self.state.flags()) as u32;
                self.write(required(&instr.dest)?, value)?;
            }
            Op::Jcc(cc) => {
                if cc.eval(self.state.flags()) {
                    let target = self.read(required(&instr.src)?)?;
                    self.state.set_eip(target);
                }
            }
            Op::Loop(kind) => {
                let counter = index_register(Register::ECX, instr.addr16);
                let count = self.state.get(counter);
                let zf = self.state.flags().contains(Flags::ZF);
                let taken = if kind == LoopKind::Jcxz {
                    count == 0
                } else {
                    let count = count.wrapping_sub(1);
                    self.state.set(counter, count);
                    let count = count & counter.size().mask();
                    count != 0 && match kind {
                        LoopKind::Loope => zf,
                        LoopKind::Loopne => !zf,
                        _ => true,
                    }
                };
                if taken {
                    let target = self.read(required(&instr.src)?)?;
                    self.state.set_eip(target);
                }
            }
            Op::Push => {
                // `push esp` pushes the value from before the push
                let value = self.read(required(&instr.src)?)?;
                self.push(value, size)?;
            }
            Op::Pop => {
                // the destination address is computed with the incremented
                // esp, as on hardware
                let esp = self.state.esp();
                let value = self.pop(size)?;
                if let Err(e) = self.write(required(&instr.dest)?, value) {
                    self.state.set_esp(esp);
                    return Err(e.into());
                }
            }
            Op::Pusha => {
                // the original esp is pushed
                let regs = *self.state.regs();
                operand::push_all(&mut self.state, &mut self.mem, &regs, size)?;
            }
            Op::Popa => {
                let values = operand::pop_all(&mut self.state, &self.mem, 8, size)?;
                for (i, value) in (0..8).rev().zip(values) {
                    if i != Register::ESP.index() {
                        self.state.set(Register::Dword(i as u8).with_size(size), value);
                    }
                }
            }
            Op::Pushf => {
                let eflags = self.state.eflags();
                self.push(eflags, size)?;
            }
            Op::Popf => {
                let value = self.pop(size)?;
                let eflags = (self.state.eflags() & !size.mask()) | value;
                self.state.set_eflags(eflags);
            }
            Op::Str(op) => self.string_op(op, instr)?,
            Op::Call => {
                let target = self.read(required(&instr.src)?)?;
                let ret = self.state.eip();
                self.push(ret, size)?;
                self.state.set_eip(target);
            }
            Op::CallAbs => {
                // read the target before the push changes esp
                let target = self.read(required(&instr.src)?)?;
                let ret = self.state.eip();
                self.push(ret, size)?;
                self.state.set_eip(target);
            }
            Op::Jump | Op::JumpAbs => {
                let target = self.read(required(&instr.src)?)?;
                self.state.set_eip(target);
            }
            Op::Retn => {
                let ret = self.pop(size)?;
                self.state.set_eip(ret);
                if let Some(imm) = &instr.src {
                    let bytes = self.read(imm)?;
                    if self.options.ret_pops_imm {
                        let esp = self.state.esp().wrapping_add(bytes);
                        self.state.set_esp(esp);
                    } else if bytes != 0 {
                        warn!("not popping {} bytes of `ret {}`", bytes, bytes);
                    }
                }
            }
            Op::Leave => {
                // nothing is committed until the saved frame pointer is read
                let bp = Register::EBP.with_size(size);
                let mut state = self.state.clone();
                state.set(Register::ESP.with_size(size), state.get(bp));
                let value = operand::pop(&mut state, &self.mem, size)?;
                state.set(bp, value);
                self.state = state;
            }
            Op::Int => {
                let vector = self.read(required(&instr.src)?)? as u8;
                return self.interrupt(vector);
            }
            Op::Into => {
                if self.state.flags().contains(Flags::OF) {
                    return self.interrupt(4);
                }
            }
            Op::Iret => {
                // eip, cs, eflags
                let frame = operand::pop_all(&mut self.state, &self.mem, 3, size)?;
                let (eip, eflags) = (frame[0], frame[2]);
                self.state.set_eip(eip);
                let eflags = (self.state.eflags() & !size.mask()) | eflags;
                self.state.set_eflags(eflags);
            }
            Op::Cbw => {
                let half = match size {
                    OpSize::Bits16 => OpSize::Bits8,
                    _ => OpSize::Bits16,
                };
                let value = half.sign_extend(self.state.get(Register::accumulator(half)));
                self.state.set(Register::accumulator(size), value);
            }
            Op::Cwd => {
                let acc = self.state.get(Register::accumulator(size));
                let ext = if acc & size.sign_bit() != 0 { !0 } else { 0 };
                self.state.set(Register::EDX.with_size(size), ext);
            }
            Op::Sahf => {
                let mask = Flags::SF | Flags::ZF | Flags::AF | Flags::PF | Flags::CF;
                let ah = Flags::from_bits_truncate(u32::from(self.state.ah()));
                self.state.replace_flags(mask, ah);
            }
            Op::Lahf => {
                let mask = Flags::SF | Flags::ZF | Flags::AF | Flags::PF | Flags::CF;
                let ah = (self.state.flags() & mask).bits() | 0b10;
                self.state.set_ah(ah as u8);
            }
            Op::In => {
                let port = self.read(required(&instr.src)?)? as u16;
                let value = self.hooks.port_in(port, size)?;
                self.write(required(&instr.dest)?, value)?;
            }
            Op::Out => {
                let port = self.read(required(&instr.dest)?)? as u16;
                let value = self.read(required(&instr.src)?)?;
                self.hooks.port_out(port, size, value)?;
            }
            Op::Hlt => return Ok(Status::Halted),
            Op::Cmc => {
                let cf = self.state.flags().contains(Flags::CF);
                self.state.update_flags(Flags::CF, !cf);
            }
            Op::SetFlag(flag) => self.state.update_flags(flag, true),
            Op::ClearFlag(flag) => self.state.update_flags(flag, false),
            Op::Nop => {}
            Op::Fpu => warn!("ignoring x87 instruction at {:#010X}", self.state.eip().wrapping_sub(instr.len)),
        }

        Ok(Status::Running)
    }

    fn interrupt(&mut self, vector: u8) -> Result<Status, Cause> {
        if vector != SYSCALL_VECTOR {
            return Err(HookError::UnhandledInterrupt(vector).into());
        }

        match self.hooks.syscall(&mut self.state, &mut self.mem)? {
            HookAction::Continue { .. } => Ok(Status::Running),
            HookAction::Exit(code) => Ok(Status::Exited(code)),
        }
    }

    /// Computes an ALU operation and updates the flags accordingly.
    ///
    /// `lhs` and `rhs` are truncated to `size` first. Returns the truncated
    /// result.
    fn alu(&mut self, op: AluOp, size: OpSize, lhs: u32, rhs: u32) -> u32 {
        let mask = size.mask();
        let (a, b) = (u64::from(lhs & mask), u64::from(rhs & mask));
        let carry_in = u64::from(self.state.flags().contains(Flags::CF));

        let (wide, overflow) = match op {
            AluOp::Add | AluOp::Adc => {
                let wide = a + b + if op == AluOp::Adc { carry_in } else { 0 };
                // operands agree in sign, result doesn't
                (wide, !(a ^ b) & (a ^ wide))
            }
            AluOp::Sub | AluOp::Sbb | AluOp::Cmp => {
                let wide = a.wrapping_sub(b).wrapping_sub(if op == AluOp::Sbb { carry_in } else { 0 });
                (wide, (a ^ b) & (a ^ wide))
            }
            AluOp::And => (a & b, 0),
            AluOp::Or => (a | b, 0),
            AluOp::Xor => (a ^ b, 0),
        };

        let res = wide as u32 & mask;
        let mut flags = Flags::for_result(res, size.bytes());
        flags.set(Flags::CF, wide >> size.bits() & 1 != 0);
        flags.set(Flags::OF, overflow & u64::from(size.sign_bit()) != 0);
        self.state.replace_flags(Flags::CF | Flags::OF | Flags::SF | Flags::ZF | Flags::PF, flags);
        res
    }

    /// `mul`/`imul` with a single operand: multiplies the accumulator and
    /// stores the double-width result in `AX`, `DX:AX` or `EDX:EAX`.
    fn widening_mul(&mut self, size: OpSize, src: u32, signed: bool) {
        let acc = self.state.get(Register::accumulator(size));
        let product = if signed {
            let a = i64::from(size.sign_extend(acc) as i32);
            let b = i64::from(size.sign_extend(src) as i32);
            (a * b) as u64
        } else {
            u64::from(acc & size.mask()) * u64::from(src & size.mask())
        };

        let low = product as u32 & size.mask();
        let high = (product >> size.bits()) as u32 & size.mask();
        let overflow = if signed {
            // the upper half is more than a sign extension of the lower half
            (size.sign_extend(low) as i32 as i64) != product as i64
        } else {
            high != 0
        };

        match size {
            OpSize::Bits8 => self.state.set_ax(product as u16),
            _ => {
                self.state.set(Register::accumulator(size), low);
                self.state.set(Register::EDX.with_size(size), high);
            }
        }
        self.state.update_flags(Flags::CF | Flags::OF, overflow);
    }

    /// Unsigned `div`: divides `AX`, `DX:AX` or `EDX:EAX` by `divisor`.
    fn divide(&mut self, size: OpSize, divisor: u32) -> Result<(), ArithmeticError> {
        let divisor = u64::from(divisor & size.mask());
        if divisor == 0 {
            return Err(ArithmeticError::DivideByZero);
        }

        let dividend = match size {
            OpSize::Bits8 => u64::from(self.state.ax()),
            _ => {
                let high = u64::from(self.state.get(Register::EDX.with_size(size)));
                let low = u64::from(self.state.get(Register::accumulator(size)));
                high << size.bits() | low
            }
        };

        let quotient = dividend / divisor;
        let remainder = dividend % divisor;
        if quotient > u64::from(size.mask()) {
            return Err(ArithmeticError::QuotientOverflow);
        }

        match size {
            OpSize::Bits8 => {
                self.state.set_al(quotient as u8);
                self.state.set_ah(remainder as u8);
            }
            _ => {
                self.state.set(Register::accumulator(size), quotient as u32);
                self.state.set(Register::EDX.with_size(size), remainder as u32);
            }
        }
        Ok(())
    }

    /// Performs a shift or rotate by a non-zero, already masked `count` and
    /// updates the flags.
    fn shift(&mut self, op: ShiftOp, size: OpSize, value: u32, count: u32) -> u32 {
        let bits = size.bits();
        let mask = size.mask();
        let value = value & mask;
        let msb = |v: u32| v & size.sign_bit() != 0;
        let cf_in = self.state.flags().contains(Flags::CF);

        let (res, cf, of) = match op {
            ShiftOp::Shl | ShiftOp::Sal => {
                let wide = u64::from(value) << count;
                let res = wide as u32 & mask;
                let cf = wide >> bits & 1 != 0;
                (res, cf, msb(res) != cf)
            }
            ShiftOp::Shr => {
                let cf = u64::from(value) >> (count - 1) & 1 != 0;
                let res = (u64::from(value) >> count) as u32;
                (res, cf, msb(value))
            }
            ShiftOp::Sar => {
                let signed = i64::from(size.sign_extend(value) as i32);
                let cf = signed >> (count - 1) & 1 != 0;
                let res = (signed >> count) as u32 & mask;
                (res, cf, false)
            }
            ShiftOp::Rol => {
                let res = rotate_left(value.into(), count % bits, bits) as u32;
                let cf = res & 1 != 0;
                (res, cf, msb(res) != cf)
            }
            ShiftOp::Ror => {
                let res = rotate_left(value.into(), (bits - count % bits) % bits, bits) as u32;
                let cf = msb(res);
                (res, cf, msb(res) != msb(res << 1))
            }
            ShiftOp::Rcl | ShiftOp::Rcr => {
                // rotate through a `bits + 1` wide value with CF on top
                let wide = u64::from(value) | u64::from(cf_in) << bits;
                let n = count % (bits + 1);
                let n = if op == ShiftOp::Rcl { n } else { (bits + 1 - n) % (bits + 1) };
                let rotated = rotate_left(wide, n, bits + 1);
                let res = rotated as u32 & mask;
                let cf = rotated >> bits & 1 != 0;
                let of = if op == ShiftOp::Rcl { msb(res) != cf } else { msb(value) != cf_in };
                (res, cf, of)
            }
        };

        let mut flags = self.state.flags();
        flags.set(Flags::CF, cf);
        if count == 1 {
            flags.set(Flags::OF, of);
        }
        match op {
            ShiftOp::Shl | ShiftOp::Sal | ShiftOp::Shr | ShiftOp::Sar => {
                flags = (flags - (Flags::SF | Flags::ZF | Flags::PF)) | Flags::for_result(res, size.bytes());
            }
            _ => {}
        }
        self.state.set_flags(flags);
        res
    }

    /// `shld`/`shrd` by a non-zero, already masked `count`.
    fn double_shift(&mut self, left: bool, size: OpSize, value: u32, fill: u32, count: u32) -> u32 {
        let bits = size.bits();
        let mask = u128::from(size.mask());
        let (value, fill) = (u128::from(value) & mask, u128::from(fill) & mask);

        let (res, cf) = if left {
            let wide = (value << bits | fill) << count;
            ((wide >> bits) & mask, wide >> (2 * bits) & 1 != 0)
        } else {
            let wide = fill << bits | value;
            ((wide >> count) & mask, wide >> (count - 1) & 1 != 0)
        };
        let res = res as u32;

        let mut flags = (self.state.flags() - (Flags::SF | Flags::ZF | Flags::PF))
            | Flags::for_result(res, size.bytes());
        flags.set(Flags::CF, cf);
        if count == 1 {
            let sign = u128::from(size.sign_bit());
            flags.set(Flags::OF, (u128::from(res) ^ value) & sign != 0);
        }
        self.state.set_flags(flags);
        res
    }

    /// Runs a string instruction, including all repetitions.
    fn string_op(&mut self, op: StrOp, instr: &Instr) -> Result<(), Cause> {
        let size = instr.size;
        let si = index_register(Register::ESI, instr.addr16);
        let di = index_register(Register::EDI, instr.addr16);
        let cx = index_register(Register::ECX, instr.addr16);
        let acc = Register::accumulator(size);
        let delta = if self.state.flags().contains(Flags::DF) {
            size.bytes().wrapping_neg()
        } else {
            size.bytes()
        };

        let mut iterations = 0u32;
        loop {
            if instr.rep.is_some() && self.state.get(cx) == 0 {
                break;
            }

            let (src, dst) = (self.state.get(si), self.state.get(di));
            match op {
                StrOp::Movs => {
                    let value = operand::load(&self.mem, src, size)?;
                    operand::store(&mut self.mem, dst, size, value)?;
                }
                StrOp::Cmps => {
                    let lhs = operand::load(&self.mem, src, size)?;
                    let rhs = operand::load(&self.mem, dst, size)?;
                    self.alu(AluOp::Cmp, size, lhs, rhs);
                }
                StrOp::Stos => {
                    let value = self.state.get(acc);
                    operand::store(&mut self.mem, dst, size, value)?;
                }
                StrOp::Lods => {
                    let value = operand::load(&self.mem, src, size)?;
                    self.state.set(acc, value);
                }
                StrOp::Scas => {
                    let lhs = self.state.get(acc);
                    let rhs = operand::load(&self.mem, dst, size)?;
                    self.alu(AluOp::Cmp, size, lhs, rhs);
                }
            }

            match op {
                StrOp::Movs | StrOp::Cmps => {
                    self.state.set(si, src.wrapping_add(delta));
                    self.state.set(di, dst.wrapping_add(delta));
                }
                StrOp::Stos | StrOp::Scas => self.state.set(di, dst.wrapping_add(delta)),
                StrOp::Lods => self.state.set(si, src.wrapping_add(delta)),
            }
            iterations += 1;

            let rep = match instr.rep {
                Some(rep) => rep,
                None => break,
            };
            let count = self.state.get(cx).wrapping_sub(1);
            self.state.set(cx, count);

            if op.compares() {
                let zf = self.state.flags().contains(Flags::ZF);
                match rep {
                    Rep::WhileEqual if !zf => break,
                    Rep::WhileNotEqual if zf => break,
                    _ => {}
                }
            }
        }

        if instr.rep.is_some() {
            trace!("{} repeated {} times", instr, iterations);
        }
        Ok(())
    }
}

impl<M: VirtualMemory, H: Hooks<M>> ExecutionEngine for Interpreter<M, H> {
    type Memory = M;
    type Error = InterpreterError;

    fn state(&mut self) -> &mut State {
        &mut self.state
    }

    fn memory(&mut self) -> &mut M {
        &mut self.mem
    }

    fn step(&mut self) -> Result<Status, InterpreterError> {
        Interpreter::step(self)
    }
}

/// Rotates the low `width` bits of `value` left by `n < width`.
fn rotate_left(value: u64, n: u32, width: u32) -> u64 {
    let mask = (1u64 << width) - 1;
    if n == 0 {
        value & mask
    } else {
        ((value << n) | (value >> (width - n))) & mask
    }
}

/// Returns the operand the decoder is required to provide.
fn required(operand: &Option<Operand>) -> Result<&Operand, Cause> {
    operand.as_ref().ok_or_else(|| DecoderError::ud("missing operand").into())
}

/// `#DE` conditions raised by `div`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArithmeticError {
    DivideByZero,
    /// The quotient does not fit into the destination register.
    QuotientOverflow,
}

impl fmt::Display for ArithmeticError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ArithmeticError::DivideByZero => f.write_str("division by zero"),
            ArithmeticError::QuotientOverflow => f.write_str("quotient too large for destination"),
        }
    }
}

impl Error for ArithmeticError {}

/// Failure reported by (or on behalf of) a trap handler.
#[derive(Debug, Clone, PartialEq)]
pub enum HookError {
    /// The handler failed.
    Failed(String),
    /// Software interrupt with no handler.
    UnhandledInterrupt(u8),
    /// Execution reached a trapped address with no function behind it.
    NoImport(u32),
    /// Port I/O without a handler.
    NoPortHandler(u16),
    /// The handler accessed unbacked guest memory.
    Memory(MemoryError),
}

impl HookError {
    #[cold]
    pub fn failed<S: Into<String>>(msg: S) -> Self {
        HookError::Failed(msg.into())
    }
}

impl From<MemoryError> for HookError {
    fn from(e: MemoryError) -> Self {
        HookError::Memory(e)
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HookError::Failed(msg) => f.write_str(msg),
            HookError::UnhandledInterrupt(vector) => write!(f, "unhandled interrupt {:#04X}", vector),
            HookError::NoImport(addr) => write!(f, "no import bound to {:#010X}", addr),
            HookError::NoPortHandler(port) => write!(f, "no handler for I/O port {:#06X}", port),
            HookError::Memory(e) => write!(f, "guest memory access failed: {}", e),
        }
    }
}

impl Error for HookError {}

/// The fault class of an `InterpreterError`.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause {
    /// The instruction could not be fetched or decoded.
    Decode(DecoderError),
    /// An operand access touched unbacked memory.
    Memory(MemoryError),
    Arithmetic(ArithmeticError),
    /// A trap handler reported failure.
    Trap(HookError),
}

impl From<DecoderError> for Cause {
    fn from(e: DecoderError) -> Self {
        Cause::Decode(e)
    }
}

impl From<MemoryError> for Cause {
    fn from(e: MemoryError) -> Self {
        Cause::Memory(e)
    }
}

impl From<ArithmeticError> for Cause {
    fn from(e: ArithmeticError) -> Self {
        Cause::Arithmetic(e)
    }
}

impl From<HookError> for Cause {
    fn from(e: HookError) -> Self {
        Cause::Trap(e)
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Cause::Decode(e) => write!(f, "{}", e),
            Cause::Memory(e) => write!(f, "{}", e),
            Cause::Arithmetic(e) => write!(f, "{}", e),
            Cause::Trap(e) => write!(f, "{}", e),
        }
    }
}

/// A fatal fault while executing an instruction.
#[derive(Debug, Clone)]
pub struct InterpreterError {
    /// Address of the first byte (including prefixes) of the faulting
    /// instruction.
    pub addr: u32,
    /// Processor state at the time of the fault, with `eip` set to `addr`.
    pub state: State,
    pub cause: Cause,
}

impl fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} at {:#010X}", self.cause, self.addr)
    }
}

impl Error for InterpreterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            Cause::Decode(e) => Some(e),
            Cause::Memory(e) => Some(e),
            Cause::Arithmetic(e) => Some(e),
            Cause::Trap(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SparseMemory;

    const STACK_TOP: u32 = 0x10_0000;

    fn bytes(rawstr: &str) -> Vec<u8> {
        rawstr.split_whitespace()
            .map(|hexstr| u8::from_str_radix(hexstr, 16).unwrap())
            .collect()
    }

    /// Places code at address 0 and a 4 KiB stack below `STACK_TOP`.
    fn interp_with_hooks<H: Hooks<SparseMemory>>(code: &str, hooks: H) -> Interpreter<SparseMemory, H> {
        let code = bytes(code);
        let mut mem = SparseMemory::new();
        mem.allocate(0, code.len() as u32);
        mem.write(&code, 0);
        mem.allocate(STACK_TOP - 0x1000, 0x1000);
        Interpreter::new(mem, hooks, 0, STACK_TOP)
    }

    fn interp(code: &str) -> Interpreter<SparseMemory> {
        interp_with_hooks(code, NoHooks)
    }

    fn run_steps<H: Hooks<SparseMemory>>(interp: &mut Interpreter<SparseMemory, H>, steps: usize) {
        for _ in 0..steps {
            assert_eq!(interp.step().unwrap(), Status::Running);
        }
    }

    fn flags(interp: &Interpreter<SparseMemory, impl Hooks<SparseMemory>>) -> Flags {
        interp.state().flags() & Flags::ARITH
    }

    #[test]
    fn mov_imm() {
        let mut interp = interp("B8 05 00 00 00");
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 5);
        assert_eq!(interp.state().eip(), 5);
    }

    #[test]
    fn add_carry_and_overflow() {
        let mut interp = interp("83 C0 01 83 C0 01");
        interp.state_mut().set_eax(0xFFFF_FFFF);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 0);
        assert_eq!(flags(&interp), Flags::ZF | Flags::CF | Flags::PF);

        interp.state_mut().set_eax(0x7FFF_FFFF);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 0x8000_0000);
        assert_eq!(flags(&interp), Flags::OF | Flags::SF | Flags::PF);
    }

    #[test]
    fn push_pop() {
        let mut interp = interp("6A 2A 58");
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().esp(), STACK_TOP - 4);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 0x2A);
        assert_eq!(interp.state().esp(), STACK_TOP);
    }

    #[test]
    fn undefined_two_byte_opcode() {
        // nop; ud2 with a prefix in front
        let mut interp = interp("90 66 0F 0B");
        run_steps(&mut interp, 1);
        let before = interp.state().clone();
        let err = interp.step().unwrap_err();
        assert_eq!(err.addr, 1);
        assert_eq!(err.state, before);
        assert!(matches!(err.cause, Cause::Decode(DecoderError::Undefined(_))));
        assert_eq!(interp.state().eip(), 1);
    }

    #[test]
    fn unmapped_operand_faults_without_side_effects() {
        // add [0x5000], eax
        let mut interp = interp("01 05 00 50 00 00");
        interp.state_mut().set_eax(1);
        let before = interp.state().clone();
        let err = interp.step().unwrap_err();
        assert_eq!(err.addr, 0);
        assert!(matches!(err.cause, Cause::Memory(MemoryError::Unmapped { addr: 0x5000, size: 4 })));
        assert_eq!(interp.state(), &before);
    }

    #[test]
    fn sub_cmp_flags() {
        // sub eax, ebx; cmp al, 0x80; sbb ecx, ecx
        let mut interp = interp("29 D8 3C 80 19 C9");
        interp.state_mut().set_eax(1);
        interp.state_mut().set_ebx(2);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 0xFFFF_FFFF);
        assert_eq!(flags(&interp), Flags::CF | Flags::SF | Flags::PF);

        // 0xFF - 0x80 = 0x7F: no borrow, no signed overflow
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 0xFFFF_FFFF);
        assert_eq!(flags(&interp), Flags::empty());

        interp.state_mut().update_flags(Flags::CF, true);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().ecx(), 0xFFFF_FFFF);
    }

    #[test]
    fn signed_overflow_on_sub() {
        // cmp eax, 1 with eax = i32::MIN
        let mut interp = interp("83 F8 01");
        interp.state_mut().set_eax(0x8000_0000);
        run_steps(&mut interp, 1);
        assert_eq!(flags(&interp), Flags::OF | Flags::PF);
    }

    #[test]
    fn inc_dec_preserve_carry() {
        // stc; inc al; dec ecx
        let mut interp = interp("F9 FE C0 49");
        interp.state_mut().set_eax(0x12FF);
        run_steps(&mut interp, 2);
        assert_eq!(interp.state().eax(), 0x1200);
        assert_eq!(flags(&interp), Flags::CF | Flags::ZF | Flags::PF);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().ecx(), 0xFFFF_FFFF);
        assert_eq!(flags(&interp), Flags::CF | Flags::SF | Flags::PF);
    }

    #[test]
    fn logic_clears_carry() {
        // stc; xor eax, eax
        let mut interp = interp("F9 31 C0");
        interp.state_mut().set_eax(0x1234);
        run_steps(&mut interp, 2);
        assert_eq!(interp.state().eax(), 0);
        assert_eq!(flags(&interp), Flags::ZF | Flags::PF);
    }

    #[test]
    fn neg() {
        let mut interp = interp("F7 D8 F7 D8");
        interp.state_mut().set_eax(5);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 0xFFFF_FFFB);
        assert!(interp.state().flags().contains(Flags::CF));

        interp.state_mut().set_eax(0);
        run_steps(&mut interp, 1);
        assert!(!interp.state().flags().contains(Flags::CF));
        assert!(interp.state().flags().contains(Flags::ZF));
    }

    #[test]
    fn shifts() {
        // shl eax, 1; shr eax, 4; sar bl, cl; rol dx, 4
        let mut interp = interp("D1 E0 C1 E8 04 D2 FB 66 C1 C2 04");
        interp.state_mut().set_eax(0x8000_0001);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 2);
        assert!(interp.state().flags().contains(Flags::CF | Flags::OF));

        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 0);
        assert!(interp.state().flags().contains(Flags::ZF));
        assert!(!interp.state().flags().contains(Flags::CF));

        interp.state_mut().set_ebx(0x80);
        interp.state_mut().set_ecx(0x21); // masked to 1
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().bl(), 0xC0);

        interp.state_mut().set_edx(0xAAAA_1234);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().edx(), 0xAAAA_2341);
    }

    #[test]
    fn shift_by_zero_changes_nothing() {
        // shl eax, cl
        let mut interp = interp("D3 E0");
        interp.state_mut().set_eax(0x1234);
        interp.state_mut().set_ecx(0x20);
        interp.state_mut().set_flags(Flags::CF | Flags::OF);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 0x1234);
        assert_eq!(flags(&interp), Flags::CF | Flags::OF);
    }

    #[test]
    fn rotate_through_carry() {
        // stc; rcl al, 1; rcr al, 1
        let mut interp = interp("F9 D0 D0 D0 D8");
        interp.state_mut().set_eax(0x80);
        run_steps(&mut interp, 2);
        assert_eq!(interp.state().al(), 0x01);
        assert!(interp.state().flags().contains(Flags::CF));
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().al(), 0x80);
        assert!(interp.state().flags().contains(Flags::CF));
    }

    #[test]
    fn double_shift() {
        // shld eax, edx, 8; shrd eax, edx, cl
        let mut interp = interp("0F A4 D0 08 0F AD D0");
        interp.state_mut().set_eax(0x1122_3344);
        interp.state_mut().set_edx(0xAABB_CCDD);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 0x2233_44AA);
        assert!(interp.state().flags().contains(Flags::CF));

        interp.state_mut().set_ecx(4);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 0xD223_344A);
    }

    #[test]
    fn multiply() {
        // mul ecx; imul eax, ecx, -2; imul bl
        let mut interp = interp("F7 E1 6B C1 FE F6 EB");
        interp.state_mut().set_eax(0x8000_0000);
        interp.state_mut().set_ecx(4);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 0);
        assert_eq!(interp.state().edx(), 2);
        assert!(interp.state().flags().contains(Flags::CF | Flags::OF));

        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 0xFFFF_FFF8);
        assert!(!interp.state().flags().contains(Flags::CF));

        interp.state_mut().set_eax(0xFFFF_FFFE);
        interp.state_mut().set_ebx(3);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().ax(), 0xFFFA);
        assert!(!interp.state().flags().contains(Flags::OF));
    }

    #[test]
    fn divide() {
        // div ecx; div bl; div ecx
        let mut interp = interp("F7 F1 F6 F3 F7 F1");
        interp.state_mut().set_edx(1);
        interp.state_mut().set_eax(5);
        interp.state_mut().set_ecx(2);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 0x8000_0002);
        assert_eq!(interp.state().edx(), 1);

        interp.state_mut().set_eax(0x1234_0107);
        interp.state_mut().set_ebx(0x10);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 0x1234_0710);

        interp.state_mut().set_ecx(0);
        let err = interp.step().unwrap_err();
        assert_eq!(err.addr, 4);
        assert_eq!(err.cause, Cause::Arithmetic(ArithmeticError::DivideByZero));
    }

    #[test]
    fn quotient_overflow() {
        let mut interp = interp("F6 F1");
        interp.state_mut().set_eax(0x100);
        interp.state_mut().set_ecx(1);
        let err = interp.step().unwrap_err();
        assert_eq!(err.cause, Cause::Arithmetic(ArithmeticError::QuotientOverflow));
    }

    #[test]
    fn call_and_ret() {
        // 0: call 8; 5: hlt; ... 8: ret 4
        let mut interp = interp("E8 03 00 00 00 F4 90 90 C2 04 00");
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eip(), 8);
        assert_eq!(interp.state().esp(), STACK_TOP - 4);
        assert_eq!(interp.mem().load_u32(STACK_TOP - 4).unwrap(), 5);

        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eip(), 5);
        // the immediate is not applied by default
        assert_eq!(interp.state().esp(), STACK_TOP);
        assert_eq!(interp.step().unwrap(), Status::Halted);
    }

    #[test]
    fn ret_pops_imm_option() {
        let mut interp = interp("E8 03 00 00 00 F4 90 90 C2 04 00");
        interp.options_mut().ret_pops_imm = true;
        run_steps(&mut interp, 2);
        assert_eq!(interp.state().esp(), STACK_TOP + 4);
    }

    #[test]
    fn indirect_call_and_leave() {
        // push ebp; mov ebp, esp; call eax; leave; hlt
        let mut interp = interp("55 89 E5 FF D0 C9 F4");
        interp.state_mut().set_eax(5);
        interp.state_mut().set_ebp(0x1234);
        run_steps(&mut interp, 3);
        assert_eq!(interp.state().eip(), 5);
        assert_eq!(interp.state().esp(), STACK_TOP - 8);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().ebp(), 0x1234);
        assert_eq!(interp.state().esp(), STACK_TOP);
    }

    #[test]
    fn conditional_branches() {
        // cmp eax, ebx; jl +2; mov al, 1; jge +0
        let mut interp = interp("39 D8 7C 02 B0 01 7D 00");
        interp.state_mut().set_eax(0xFFFF_FFFF);
        interp.state_mut().set_ebx(1);
        run_steps(&mut interp, 2);
        assert_eq!(interp.state().eip(), 6);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eip(), 8);
    }

    #[test]
    fn loops() {
        // mov ecx, 3; inc eax; loop -3; jecxz +0
        let mut interp = interp("B9 03 00 00 00 40 E2 FD E3 00");
        run_steps(&mut interp, 1 + 3 * 2 + 1);
        assert_eq!(interp.state().eax(), 3);
        assert_eq!(interp.state().ecx(), 0);
        assert_eq!(interp.state().eip(), 10);
    }

    #[test]
    fn rep_movs_and_stos() {
        let mut interp = interp("F3 A4 F3 AB");
        interp.mem_mut().allocate(0x2000, 0x100);
        interp.mem_mut().write(b"hello", 0x2000);
        interp.state_mut().set_esi(0x2000);
        interp.state_mut().set_edi(0x2080);
        interp.state_mut().set_ecx(5);
        run_steps(&mut interp, 1);
        let mut buf = [0; 5];
        interp.mem().read(&mut buf, 0x2080);
        assert_eq!(&buf, b"hello");
        assert_eq!(interp.state().ecx(), 0);
        assert_eq!(interp.state().esi(), 0x2005);
        assert_eq!(interp.state().edi(), 0x2085);

        interp.state_mut().set_eax(0x0101_0101);
        interp.state_mut().set_edi(0x2000);
        interp.state_mut().set_ecx(2);
        run_steps(&mut interp, 1);
        assert_eq!(interp.mem().load_u32(0x2004).unwrap(), 0x0101_0101);
        assert_eq!(interp.mem().load(0x2008).unwrap(), b'\0');
    }

    #[test]
    fn repne_scas_strlen() {
        // repne scasb, with std/cld around it
        let mut interp = interp("FC F2 AE");
        interp.mem_mut().allocate(0x2000, 0x10);
        interp.mem_mut().write(b"abc\0", 0x2000);
        interp.state_mut().set_edi(0x2000);
        interp.state_mut().set_ecx(0xFFFF_FFFF);
        run_steps(&mut interp, 2);
        assert_eq!(interp.state().edi(), 0x2004);
        assert_eq!(!interp.state().ecx() - 1, 3);
        assert!(interp.state().flags().contains(Flags::ZF));
    }

    #[test]
    fn repe_cmps_stops_on_mismatch() {
        let mut interp = interp("F3 A6");
        interp.mem_mut().allocate(0x2000, 0x100);
        interp.mem_mut().write(b"abcd", 0x2000);
        interp.mem_mut().write(b"abxd", 0x2080);
        interp.state_mut().set_esi(0x2000);
        interp.state_mut().set_edi(0x2080);
        interp.state_mut().set_ecx(4);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().ecx(), 1);
        assert_eq!(interp.state().esi(), 0x2003);
        assert!(!interp.state().flags().contains(Flags::ZF));
    }

    #[test]
    fn string_ops_walk_down_with_df() {
        // std; lodsd
        let mut interp = interp("FD AD");
        interp.mem_mut().allocate(0x2000, 0x10);
        interp.mem_mut().store_u32(0x2008, 0xCAFE_BABE).unwrap();
        interp.state_mut().set_esi(0x2008);
        run_steps(&mut interp, 2);
        assert_eq!(interp.state().eax(), 0xCAFE_BABE);
        assert_eq!(interp.state().esi(), 0x2004);
    }

    #[test]
    fn pusha_popa() {
        let mut interp = interp("60 31 C0 61");
        interp.state_mut().set_eax(1);
        interp.state_mut().set_edi(7);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().esp(), STACK_TOP - 32);
        assert_eq!(interp.mem().load_u32(STACK_TOP - 20).unwrap(), STACK_TOP);

        // popa does not restore esp from the stack
        interp.mem_mut().store_u32(STACK_TOP - 20, 0xDEAD).unwrap();
        run_steps(&mut interp, 2);
        assert_eq!(interp.state().eax(), 1);
        assert_eq!(interp.state().edi(), 7);
        assert_eq!(interp.state().esp(), STACK_TOP);
    }

    #[test]
    fn pusha_overflowing_stack() {
        let low = STACK_TOP - 0x1000;
        let mut interp = interp("60");
        interp.state_mut().set_esp(low + 12);
        interp.state_mut().set_eax(0x1111_1111);

        let err = interp.step().unwrap_err();
        assert_eq!(err.addr, 0);
        assert_eq!(err.state.esp(), low + 12);
        assert_eq!(interp.state().esp(), low + 12);
        assert_eq!(interp.state().eip(), 0);
        for offset in (0..12).step_by(4) {
            assert_eq!(interp.mem().load_u32(low + offset).unwrap(), 0);
        }
    }

    #[test]
    fn popa_past_stack_top() {
        let mut interp = interp("61");
        interp.state_mut().set_esp(STACK_TOP - 16);
        interp.state_mut().set_eax(5);
        interp.state_mut().set_edi(6);
        interp.mem_mut().store_u32(STACK_TOP - 16, 0xAAAA).unwrap();

        let err = interp.step().unwrap_err();
        assert_eq!(err.state.esp(), STACK_TOP - 16);
        assert_eq!(interp.state().esp(), STACK_TOP - 16);
        assert_eq!(interp.state().edi(), 6);
        assert_eq!(interp.state().eax(), 5);
    }

    #[test]
    fn leave_with_unmapped_frame() {
        let mut interp = interp("C9");
        interp.state_mut().set_ebp(0x5000_0000);

        let err = interp.step().unwrap_err();
        assert_eq!(err.state.esp(), STACK_TOP);
        assert_eq!(interp.state().esp(), STACK_TOP);
        assert_eq!(interp.state().ebp(), 0x5000_0000);
        assert_eq!(interp.state().eip(), 0);
    }

    #[test]
    fn iret_with_short_frame() {
        let mut interp = interp("CF");
        interp.state_mut().set_esp(STACK_TOP - 8);
        interp.state_mut().set_flags(Flags::CF);

        let err = interp.step().unwrap_err();
        assert_eq!(err.state.esp(), STACK_TOP - 8);
        assert_eq!(interp.state().esp(), STACK_TOP - 8);
        assert_eq!(interp.state().eip(), 0);
        assert_eq!(interp.state().flags(), Flags::CF);
    }

    #[test]
    fn call_with_unmapped_stack() {
        let low = STACK_TOP - 0x1000;
        let mut interp = interp("E8 10 00 00 00");
        interp.state_mut().set_esp(low);

        let err = interp.step().unwrap_err();
        assert_eq!(err.addr, 0);
        assert_eq!(interp.state().esp(), low);
        assert_eq!(interp.state().eip(), 0);
    }

    #[test]
    fn pushf_popf_lahf_sahf() {
        // stc; pushfd; clc; popfd; lahf; mov ah, 0x40; sahf
        let mut interp = interp("F9 9C F8 9D 9F B4 40 9E");
        run_steps(&mut interp, 4);
        assert!(interp.state().flags().contains(Flags::CF));
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().ah(), 0x03);
        run_steps(&mut interp, 2);
        assert_eq!(flags(&interp), Flags::ZF);
    }

    #[test]
    fn id_flag_is_cleared_every_step() {
        let mut interp = interp("90");
        interp.state_mut().set_flags(Flags::ID | Flags::CF);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().flags(), Flags::CF);
    }

    #[test]
    fn sign_and_zero_extension() {
        // movsx eax, bl; movzx ecx, bl; cwde; cdq
        let mut interp = interp("0F BE C3 0F B6 CB 98 99");
        interp.state_mut().set_ebx(0x80);
        run_steps(&mut interp, 2);
        assert_eq!(interp.state().eax(), 0xFFFF_FF80);
        assert_eq!(interp.state().ecx(), 0x80);

        interp.state_mut().set_eax(0xFFFF_8000);
        run_steps(&mut interp, 2);
        assert_eq!(interp.state().eax(), 0xFFFF_8000);
        assert_eq!(interp.state().edx(), 0xFFFF_FFFF);
    }

    #[test]
    fn lea_xchg_setcc() {
        // lea eax, [ebx+ecx*2+1]; xchg eax, ecx; test eax, eax; setz dl
        let mut interp = interp("8D 44 4B 01 91 85 C0 0F 94 C2");
        interp.state_mut().set_ebx(0x10);
        interp.state_mut().set_ecx(0);
        interp.state_mut().set_edx(0xFFFF_FFFF);
        run_steps(&mut interp, 4);
        assert_eq!(interp.state().ecx(), 0x11);
        assert_eq!(interp.state().eax(), 0);
        assert_eq!(interp.state().edx(), 0xFFFF_FF01);
    }

    #[test]
    fn high_byte_registers() {
        // mov ah, 0x12; add ch, ah
        let mut interp = interp("B4 12 00 E5");
        interp.state_mut().set_eax(0xAABB_CCDD);
        interp.state_mut().set_ecx(0x0000_0100);
        run_steps(&mut interp, 2);
        assert_eq!(interp.state().eax(), 0xAABB_12DD);
        assert_eq!(interp.state().ecx(), 0x0000_1300);
    }

    #[test]
    fn pop_into_memory_uses_incremented_esp() {
        // push 7; pop dword [esp-4]
        let mut interp = interp("6A 07 8F 44 24 FC");
        run_steps(&mut interp, 2);
        assert_eq!(interp.state().esp(), STACK_TOP);
        assert_eq!(interp.mem().load_u32(STACK_TOP - 4).unwrap(), 7);
    }

    #[derive(Default)]
    struct Recorder {
        syscalls: Vec<u32>,
        port_writes: Vec<(u16, u32)>,
    }

    impl Hooks<SparseMemory> for Recorder {
        fn is_trapped(&self, addr: u32) -> bool {
            addr == 0x100
        }

        fn import_call(&mut self, _addr: u32, state: &mut State, mem: &mut SparseMemory) -> Result<HookAction, HookError> {
            let arg = mem.load_u32(state.esp() + 4)?;
            state.set_eax(arg * 2);
            Ok(HookAction::Continue { pop: 4 })
        }

        fn syscall(&mut self, state: &mut State, _mem: &mut SparseMemory) -> Result<HookAction, HookError> {
            self.syscalls.push(state.eax());
            match state.eax() {
                2 => Ok(HookAction::Exit(0)),
                _ => Ok(HookAction::CONTINUE),
            }
        }

        fn port_out(&mut self, port: u16, _size: OpSize, value: u32) -> Result<(), HookError> {
            self.port_writes.push((port, value));
            Ok(())
        }
    }

    #[test]
    fn syscall_gate() {
        // mov eax, 5; int 0x40; mov eax, 2; int 0x40
        let mut interp = interp_with_hooks("B8 05 00 00 00 CD 40 B8 02 00 00 00 CD 40", Recorder::default());
        run_steps(&mut interp, 3);
        assert_eq!(interp.step().unwrap(), Status::Exited(0));
        assert_eq!(interp.hooks().syscalls, vec![5, 2]);
    }

    #[test]
    fn import_trap_pops_arguments() {
        // push 21; call [0x200] (holding 0x100); hlt
        let mut interp = interp_with_hooks("6A 15 FF 15 00 02 00 00 F4", Recorder::default());
        interp.mem_mut().allocate(0x100, 0x104);
        interp.mem_mut().store_u32(0x200, 0x100).unwrap();
        run_steps(&mut interp, 2);
        assert_eq!(interp.state().eip(), 0x100);
        run_steps(&mut interp, 1);
        assert_eq!(interp.state().eax(), 42);
        assert_eq!(interp.state().eip(), 8);
        assert_eq!(interp.state().esp(), STACK_TOP);
        assert_eq!(interp.run().unwrap(), Status::Halted);
    }

    #[test]
    fn unhandled_interrupts_and_ports() {
        // out dx, al; int3
        let mut interp = interp_with_hooks("EE CC", Recorder::default());
        interp.state_mut().set_edx(0x3F8);
        interp.state_mut().set_eax(0x41);
        run_steps(&mut interp, 1);
        assert_eq!(interp.hooks().port_writes, vec![(0x3F8, 0x41)]);
        let err = interp.step().unwrap_err();
        assert_eq!(err.cause, Cause::Trap(HookError::UnhandledInterrupt(3)));

        // in al, 0x60 without a handler
        let mut interp = self::interp("E4 60");
        let err = interp.step().unwrap_err();
        assert_eq!(err.cause, Cause::Trap(HookError::NoPortHandler(0x60)));
    }

    #[test]
    fn into_only_traps_on_overflow() {
        let mut interp = interp("CE CE");
        run_steps(&mut interp, 1);
        interp.state_mut().update_flags(Flags::OF, true);
        let err = interp.step().unwrap_err();
        assert_eq!(err.cause, Cause::Trap(HookError::UnhandledInterrupt(4)));
    }

    #[test]
    fn tracer_sees_every_instruction() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let mut interp = interp("90 40 F4");
        interp.set_tracer(Box::new(move |state: &State, instr: &Instr| {
            log.borrow_mut().push((state.eip(), instr.to_string()));
        }));
        assert_eq!(interp.run().unwrap(), Status::Halted);
        assert_eq!(&*seen.borrow(), &[
            (1, "nop".to_string()),
            (2, "inc eax".to_string()),
            (3, "hlt".to_string()),
        ]);
    }
}
