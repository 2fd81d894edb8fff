//! `kernel32.dll` functions. All of them are `stdcall`.

use crate::cpu::interpret::HookError;
use crate::kernel::types::*;
use crate::kernel::Syscall;
use crate::memory::VirtualMemory;

impl<'a, M: VirtualMemory> Syscall<'a, M> {
    /// `SetUnhandledExceptionFilter`: there are no exceptions to filter.
    /// Returns the (absent) previous filter.
    pub fn set_unhandled_exception_filter(&mut self, (_filter,): (u32,)) -> Result<u32, HookError> {
        Ok(0)
    }

    /// `GetModuleHandleA`: no module handles are handed out.
    pub fn get_module_handle_a(&mut self, (_name,): (GuestPtr<u8>,)) -> Result<u32, HookError> {
        Ok(0)
    }

    /// `ExitProcess`
    pub fn exit_process(&mut self, (code,): (u32,)) -> Result<Exit, HookError> {
        self.process.files.flush(0);
        Ok(Exit(code))
    }
}
