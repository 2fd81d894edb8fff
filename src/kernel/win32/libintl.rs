//! `libintl3.dll` (GNU gettext). No message catalogs are available, so
//! every message is left untranslated.

use crate::cpu::interpret::HookError;
use crate::kernel::types::*;
use crate::kernel::Syscall;
use crate::memory::VirtualMemory;

impl<'a, M: VirtualMemory> Syscall<'a, M> {
    pub fn bindtextdomain(&mut self, (_domain, _dir): (GuestPtr<u8>, GuestPtr<u8>)) -> Result<GuestPtr<u8>, HookError> {
        Ok(GuestPtr::NULL)
    }

    pub fn textdomain(&mut self, (_domain,): (GuestPtr<u8>,)) -> Result<GuestPtr<u8>, HookError> {
        Ok(GuestPtr::NULL)
    }

    /// Returns `msgid` itself.
    pub fn gettext(&mut self, (msgid,): (GuestPtr<u8>,)) -> Result<GuestPtr<u8>, HookError> {
        Ok(msgid)
    }
}
