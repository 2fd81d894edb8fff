//! Operand resolution and write-back.
//!
//! Turns decoded operand descriptors into values using the current register
//! file, and stores results back to registers or memory. Values are passed
//! around as `u32`s holding the zero-extended operand bits; callers that need
//! signed values use `OpSize::sign_extend`.

use crate::cpu::instr::{Addressing, OpSize, Operand, Register};
use crate::cpu::State;
use crate::memory::{MemoryError, VirtualMemory};

/// Computes the effective address of a memory operand.
///
/// `base + index * scale + disp`, wrapping at 32 bits, or truncated to 16 bits
/// if the operand uses 16-bit addressing.
pub fn effective_address(state: &State, addressing: &Addressing) -> u32 {
    let base = addressing.base.map_or(0, |reg| state.get(reg));
    let index = addressing.index.map_or(0, |reg| state.get(reg));
    let addr = base
        .wrapping_add(index.wrapping_mul(u32::from(addressing.scale)))
        .wrapping_add(addressing.disp as u32);

    if addressing.addr16 {
        addr & 0xFFFF
    } else {
        addr
    }
}

/// Loads a `size`-wide value from memory.
pub fn load<M: VirtualMemory>(mem: &M, addr: u32, size: OpSize) -> Result<u32, MemoryError> {
    Ok(match size {
        OpSize::Bits8 => mem.load(addr)?.into(),
        OpSize::Bits16 => mem.load_u16(addr)?.into(),
        OpSize::Bits32 => mem.load_u32(addr)?,
    })
}

/// Stores the low `size` bits of `value` to memory.
pub fn store<M: VirtualMemory>(mem: &mut M, addr: u32, size: OpSize, value: u32) -> Result<(), MemoryError> {
    match size {
        OpSize::Bits8 => mem.store(addr, value as u8),
        OpSize::Bits16 => mem.store_u16(addr, value as u16),
        OpSize::Bits32 => mem.store_u32(addr, value),
    }
}

/// Reads the value of an operand, zero-extended to 32 bits.
pub fn read<M: VirtualMemory>(state: &State, mem: &M, operand: &Operand) -> Result<u32, MemoryError> {
    match operand {
        Operand::Reg(reg) => Ok(state.get(*reg)),
        Operand::Imm(imm) => Ok(imm.zero_extended()),
        Operand::Mem(loc) => load(mem, effective_address(state, &loc.addressing), loc.size),
    }
}

/// Writes `value` to a register or memory operand.
///
/// Only the low bits matching the operand size are stored. Register writes
/// narrower than 32 bits leave the rest of the register alone.
pub fn write<M: VirtualMemory>(
    state: &mut State,
    mem: &mut M,
    operand: &Operand,
    value: u32,
) -> Result<(), MemoryError> {
    match operand {
        Operand::Reg(reg) => {
            state.set(*reg, value);
            Ok(())
        }
        Operand::Mem(loc) => {
            let addr = effective_address(state, &loc.addressing);
            store(mem, addr, loc.size, value)
        }
        Operand::Imm(_) => unreachable!("decoder produced an immediate destination"),
    }
}

/// Pushes a 16- or 32-bit value onto the stack.
///
/// `ESP` is only updated once the store succeeded.
pub fn push<M: VirtualMemory>(state: &mut State, mem: &mut M, value: u32, size: OpSize) -> Result<(), MemoryError> {
    let esp = state.esp().wrapping_sub(size.bytes());
    store(mem, esp, size, value)?;
    state.set_esp(esp);
    Ok(())
}

/// Pops a 16- or 32-bit value off the stack.
pub fn pop<M: VirtualMemory>(state: &mut State, mem: &M, size: OpSize) -> Result<u32, MemoryError> {
    let esp = state.esp();
    let value = load(mem, esp, size)?;
    state.set_esp(esp.wrapping_add(size.bytes()));
    Ok(value)
}

/// Pushes `values` in order with a single store.
///
/// Either the whole frame is written and `ESP` moves, or nothing changes.
pub fn push_all<M: VirtualMemory>(state: &mut State, mem: &mut M, values: &[u32], size: OpSize) -> Result<(), MemoryError> {
    let width = size.bytes() as usize;
    let mut frame = vec![0; values.len() * width];
    // the last value pushed ends up at the lowest address
    for (slot, value) in frame.chunks_mut(width).zip(values.iter().rev()) {
        slot.copy_from_slice(&value.to_le_bytes()[..width]);
    }
    let esp = state.esp().wrapping_sub(frame.len() as u32);
    mem.write_checked(&frame, esp)?;
    state.set_esp(esp);
    Ok(())
}

/// Pops `count` values, in the order `pop` would return them.
///
/// `ESP` is left alone if any of them can't be read.
pub fn pop_all<M: VirtualMemory>(state: &mut State, mem: &M, count: usize, size: OpSize) -> Result<Vec<u32>, MemoryError> {
    let width = size.bytes() as usize;
    let esp = state.esp();
    let mut frame = vec![0; count * width];
    mem.read_checked(&mut frame, esp)?;
    state.set_esp(esp.wrapping_add(frame.len() as u32));
    Ok(frame
        .chunks(width)
        .map(|slot| {
            let mut buf = [0; 4];
            buf[..width].copy_from_slice(slot);
            u32::from_le_bytes(buf)
        })
        .collect())
}

/// Returns the register used as the string source index, destination index or
/// counter, depending on the address size.
pub fn index_register(reg: Register, addr16: bool) -> Register {
    if addr16 {
        reg.with_size(OpSize::Bits16)
    } else {
        reg
    }
}
