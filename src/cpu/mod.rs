//! Emulation of a 32-bit x86 CPU running user-space code.

mod prefix;
mod flags;
mod state;
pub mod decode;
pub mod disasm;
pub mod instr;
pub mod interpret;
pub mod operand;
pub mod imm;

pub use self::flags::Flags;
pub use self::interpret::Status;
pub use self::state::{State, REGISTER_NAMES};

use crate::memory::VirtualMemory;

/// Trait for CPU implementations / executors.
pub trait ExecutionEngine {
    type Memory: VirtualMemory;
    type Error;

    /// Get a reference to the CPU's state.
    fn state(&mut self) -> &mut State;

    /// Get a reference to the memory.
    fn memory(&mut self) -> &mut Self::Memory;

    /// Executes the next instruction, then returns control back to the caller.
    fn step(&mut self) -> Result<Status, Self::Error>;

    /// Executes instructions until the guest exits or halts.
    ///
    /// Any error returned by `step` is returned to the caller. A guest that
    /// never terminates makes this loop forever.
    fn run(&mut self) -> Result<Status, Self::Error> {
        loop {
            match self.step()? {
                Status::Running => {}
                status => return Ok(status),
            }
        }
    }
}
